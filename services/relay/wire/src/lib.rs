//! Message model and binary frame codec for the relay.
//!
//! Every application message travels as exactly one binary WebSocket frame.
//! The frame starts with a little-endian discriminator so a receiver can
//! dispatch before parsing the case fields.
//!
//! ## Wire Format
//!
//! ```text
//! +----------------------+----------------------------+
//! | u16 kind (LE)        | 1 heartbeat, 2 temperature,|
//! |                      | 3 led command              |
//! +----------------------+----------------------------+
//! | body                 | CBOR map of the case fields|
//! |                      | (empty for heartbeat)      |
//! +----------------------+----------------------------+
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod codec;
pub mod error;
pub mod message;

// Re-export main types
pub use codec::{decode, encode, peek_kind};
pub use error::WireError;
pub use message::{LedState, Message, MessageKind, KIND_SIZE};
