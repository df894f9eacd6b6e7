//! Reconnecting client driver.
//!
//! The driver cycles `Disconnected -> Connecting -> Open -> Disconnected`
//! forever. Each successful connect runs one client session plus its
//! heartbeat producer; any failure or close is followed by a fixed delay
//! before the next attempt.

use crate::link::Link;
use crate::producer::HeartbeatProducer;
use crate::queue::QueueConfig;
use crate::reactor::{ClientPolicy, ClientReactor};
use crate::session::{Session, SessionError};
use crate::trace::TraceSink;
use crate::transport::{connect_ws, TransportError};
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

/// Opens a fresh WebSocket for each connection attempt
#[async_trait]
pub trait Connector: Send + Sync {
    /// Underlying byte stream
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// Attempt one connection
    async fn connect(&self) -> Result<WebSocketStream<Self::Stream>, TransportError>;

    /// Where attempts go, for trace output
    fn target(&self) -> &str;
}

/// Connects to a `ws://` URL
#[derive(Debug, Clone)]
pub struct WsConnector {
    url: String,
}

impl WsConnector {
    /// Connector for `url`
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl Connector for WsConnector {
    type Stream = MaybeTlsStream<TcpStream>;

    async fn connect(&self) -> Result<WebSocketStream<Self::Stream>, TransportError> {
        connect_ws(&self.url).await
    }

    fn target(&self) -> &str {
        &self.url
    }
}

/// Driver state as seen by observers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverState {
    /// Between attempts
    Disconnected,
    /// Handshake in progress
    Connecting,
    /// Session running
    Open,
}

impl fmt::Display for DriverState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DriverState::Disconnected => write!(f, "disconnected"),
            DriverState::Connecting => write!(f, "connecting"),
            DriverState::Open => write!(f, "open"),
        }
    }
}

/// Client settings
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClientConfig {
    /// Interval between heartbeats while open
    pub heartbeat_interval: Duration,
    /// Pause after a failed or closed connection
    pub reconnect_delay: Duration,
    /// LED command trigger
    pub policy: ClientPolicy,
    /// Outbound queue profile
    pub queue: QueueConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(1),
            reconnect_delay: Duration::from_secs(1),
            policy: ClientPolicy::default(),
            queue: QueueConfig::default(),
        }
    }
}

/// How one attempt ended
#[derive(Error, Debug)]
pub enum ClientError {
    /// Could not open the WebSocket
    #[error(transparent)]
    Connect(#[from] TransportError),

    /// Session ended abnormally
    #[error(transparent)]
    Session(#[from] SessionError),
}

/// Client that reconnects forever
pub struct ReconnectingClient<C> {
    connector: C,
    config: ClientConfig,
    trace: Arc<dyn TraceSink>,
    state: watch::Sender<DriverState>,
}

impl<C: Connector> ReconnectingClient<C> {
    /// Create a driver; no connection is attempted until [`run`](Self::run)
    pub fn new(connector: C, config: ClientConfig, trace: Arc<dyn TraceSink>) -> Self {
        let (state, _) = watch::channel(DriverState::Disconnected);
        Self {
            connector,
            config,
            trace,
            state,
        }
    }

    /// Current driver state
    pub fn state(&self) -> DriverState {
        *self.state.borrow()
    }

    /// Subscribe to driver state changes
    pub fn subscribe(&self) -> watch::Receiver<DriverState> {
        self.state.subscribe()
    }

    fn set_state(&self, next: DriverState) {
        self.state.send_if_modified(|state| {
            let changed = *state != next;
            *state = next;
            changed
        });
        debug!("Client driver is now {}", next);
    }

    /// One connect attempt; returns after the resulting session has ended
    pub async fn run_once(&self) -> Result<(), ClientError> {
        self.set_state(DriverState::Connecting);
        self.trace.trace_line(&format!("Connect({})", self.connector.target()));

        let socket = match self.connector.connect().await {
            Ok(socket) => socket,
            Err(e) => {
                warn!("{}", e);
                self.trace.trace_line(&format!("Exception: {e}"));
                self.set_state(DriverState::Disconnected);
                return Err(e.into());
            }
        };

        self.trace.trace_line("Connected");
        self.set_state(DriverState::Open);

        let link = Arc::new(Link::new(self.config.queue, 0.0));
        link.mark_open();
        info!("Connected to {} as link {}", self.connector.target(), link.id());

        let session = Session::new(link.clone(), ClientReactor::new(self.config.policy), self.trace.clone());
        let heartbeat = HeartbeatProducer::new(self.config.heartbeat_interval);
        let (result, _) = tokio::join!(session.run(socket), heartbeat.run(&link));

        self.trace.trace_line("WebSocket closed.");
        self.set_state(DriverState::Disconnected);
        if let Err(e) = &result {
            self.trace.trace_line(&format!("Exception: {e}"));
        }
        result.map_err(ClientError::from)
    }

    /// Connect, run, wait, repeat; never returns
    pub async fn run(&self) {
        let delay = self.config.reconnect_delay.as_secs_f64();
        let unit = if delay == 1.0 { "second" } else { "seconds" };
        loop {
            if let Err(e) = self.run_once().await {
                debug!("Attempt against {} ended: {}", self.connector.target(), e);
            }
            self.trace
                .trace_line(&format!("Waiting {delay} {unit} and connecting again"));
            tokio::time::sleep(self.config.reconnect_delay).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::listener::{Listener, ListenerConfig};
    use crate::trace::MemorySink;
    use crate::transport::listen_tcp;
    use futures::StreamExt;
    use std::net::{Ipv4Addr, SocketAddr};
    use std::sync::Mutex;
    use tokio::io::{duplex, DuplexStream};
    use tokio::time::{timeout, Instant};
    use tokio_tungstenite::tungstenite::protocol::Role;
    use tokio_tungstenite::tungstenite::Error as WsError;

    /// Fails a fixed number of times, then hands out sockets whose peer
    /// closes immediately
    struct FlakyConnector {
        failures: usize,
        attempts: Mutex<Vec<Instant>>,
    }

    impl FlakyConnector {
        fn new(failures: usize) -> Self {
            Self {
                failures,
                attempts: Mutex::new(Vec::new()),
            }
        }

        fn attempts(&self) -> Vec<Instant> {
            self.attempts.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Connector for Arc<FlakyConnector> {
        type Stream = DuplexStream;

        async fn connect(&self) -> Result<WebSocketStream<DuplexStream>, TransportError> {
            let attempt = {
                let mut attempts = self.attempts.lock().unwrap();
                attempts.push(Instant::now());
                attempts.len()
            };
            if attempt <= self.failures {
                return Err(TransportError::Connect {
                    url: self.target().to_string(),
                    source: WsError::ConnectionClosed,
                });
            }

            let (local, remote) = duplex(16 * 1024);
            let mut remote = WebSocketStream::from_raw_socket(remote, Role::Server, None).await;
            tokio::spawn(async move {
                let _ = remote.close(None).await;
                while let Some(Ok(_)) = remote.next().await {}
            });
            Ok(WebSocketStream::from_raw_socket(local, Role::Client, None).await)
        }

        fn target(&self) -> &str {
            "ws://flaky/wsDemo"
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_after_failures() {
        let connector = Arc::new(FlakyConnector::new(3));
        let sink = Arc::new(MemorySink::new());
        let client = ReconnectingClient::new(connector.clone(), ClientConfig::default(), sink.clone());

        let driver = tokio::spawn(async move { client.run().await });
        tokio::time::sleep(Duration::from_millis(5500)).await;
        driver.abort();

        let attempts = connector.attempts();
        assert!(attempts.len() >= 5, "only {} attempts", attempts.len());
        for pair in attempts.windows(2) {
            assert!(pair[1] - pair[0] >= Duration::from_secs(1));
        }

        let successes = attempts.len() - 3;
        assert_eq!(sink.count("Connected"), successes);
        assert_eq!(sink.count("WebSocket closed."), successes);
        assert_eq!(sink.count("Connect(ws://flaky/wsDemo)"), attempts.len());
        assert!(sink.count("Waiting 1 second and connecting again") >= attempts.len() - 1);
    }

    #[tokio::test]
    async fn test_failed_attempt_returns_to_disconnected() {
        let connector = Arc::new(FlakyConnector::new(1));
        let client = ReconnectingClient::new(connector, ClientConfig::default(), Arc::new(MemorySink::new()));

        let err = client.run_once().await.unwrap_err();
        assert!(matches!(err, ClientError::Connect(TransportError::Connect { .. })));
        assert_eq!(client.state(), DriverState::Disconnected);
    }

    #[tokio::test]
    async fn test_client_commands_hot_server() {
        let sink = Arc::new(MemorySink::new());
        let tcp = listen_tcp(SocketAddr::from((Ipv4Addr::LOCALHOST, 0))).await.unwrap();
        let addr = tcp.local_addr().unwrap();
        let listener = Listener::new(
            ListenerConfig {
                telemetry_interval: Duration::from_millis(50),
                base_temperature: 95.0,
                ..Default::default()
            },
            sink.clone(),
        );
        tokio::spawn(async move { listener.serve(tcp).await });

        let client = Arc::new(ReconnectingClient::new(
            WsConnector::new(format!("ws://{addr}/wsDemo")),
            ClientConfig::default(),
            sink.clone(),
        ));
        let mut state = client.subscribe();
        let driver = {
            let client = client.clone();
            tokio::spawn(async move { client.run().await })
        };

        timeout(Duration::from_secs(5), state.wait_for(|state| *state == DriverState::Open))
            .await
            .unwrap()
            .unwrap();
        timeout(Duration::from_secs(5), async {
            while sink.count("Receive LED [Pin: 12  State: On]") == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        assert!(sink.count("Receive Temperature: ") >= 1);
        assert!(sink.count("LEDMessage: [12 On]") >= 1);
        driver.abort();
    }
}
