//! WebSocket sessions, producers, listener and reconnecting client for the relay.
//!
//! This crate carries everything that happens on a live connection: the
//! upgrade handshake, the per-connection outbound queue, the receive and send
//! loops, the role-specific reactions, the periodic producers and the two
//! top-level drivers (server accept loop and reconnecting client).
//!
//! ## Features
//!
//! - **Listener**: sequential accept loop with its own HTTP upgrade parsing
//! - **Reconnecting client**: fixed-delay retry forever
//! - **Sessions**: independent receive and send loops per connection
//! - **Outbound queue**: ordered per producer, optionally bounded
//! - **Trace sink**: injected, internally serialized operator output
//!
//! ## Example
//!
//! ```rust,no_run
//! use relay_session::{ClientConfig, ConsoleSink, Listener, ListenerConfig, ReconnectingClient, WsConnector};
//! use std::sync::Arc;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let trace = Arc::new(ConsoleSink);
//!
//! // Server side
//! let listener = Listener::new(ListenerConfig::default(), trace.clone());
//! tokio::spawn(async move { listener.run().await });
//!
//! // Client side
//! let client = ReconnectingClient::new(
//!     WsConnector::new("ws://127.0.0.1:22122/wsDemo"),
//!     ClientConfig::default(),
//!     trace,
//! );
//! client.run().await;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod client;
pub mod handshake;
pub mod link;
pub mod listener;
pub mod producer;
pub mod queue;
pub mod reactor;
pub mod session;
pub mod trace;
pub mod transport;

pub use client::{ClientConfig, ClientError, Connector, DriverState, ReconnectingClient, WsConnector};
pub use handshake::{accept_upgrade, HandshakeError};
pub use link::{Link, LinkState, LinkStats};
pub use listener::{Listener, ListenerConfig};
pub use producer::{HeartbeatProducer, TelemetrySimulator};
pub use queue::{Enqueued, OutboundQueue, OverflowPolicy, QueueClosed, QueueConfig};
pub use reactor::{ClientPolicy, ClientReactor, Reactor, ServerPolicy, ServerReactor};
pub use session::{Session, SessionError};
pub use trace::{ConsoleSink, MemorySink, TraceSink, TracingSink};
pub use transport::{check_url, FrameError, TransportError};
