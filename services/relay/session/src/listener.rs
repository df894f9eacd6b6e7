//! Server accept loop.
//!
//! Connections are accepted and upgraded one at a time; every upgraded
//! connection then runs its server session and telemetry simulator on a
//! spawned task, independent of the accept loop and of each other.

use crate::handshake::{accept_upgrade, HandshakeError};
use crate::link::Link;
use crate::producer::TelemetrySimulator;
use crate::queue::QueueConfig;
use crate::reactor::{ServerPolicy, ServerReactor};
use crate::session::Session;
use crate::trace::TraceSink;
use crate::transport::{listen_tcp, TransportError};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};

/// Listener settings
#[derive(Clone, Debug)]
pub struct ListenerConfig {
    /// Address to bind
    pub addr: SocketAddr,
    /// Upgrade path, e.g. `wsDemo`
    pub path: String,
    /// Limit for reading and answering one upgrade request
    pub handshake_timeout: Duration,
    /// Interval between simulated temperature readings
    pub telemetry_interval: Duration,
    /// Upper bound of one random temperature step
    pub telemetry_range: f64,
    /// Temperature every new link starts from
    pub base_temperature: f64,
    /// LED gating and heartbeat echo
    pub policy: ServerPolicy,
    /// Outbound queue profile for every link
    pub queue: QueueConfig,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from(([0, 0, 0, 0], 22122)),
            path: "wsDemo".to_string(),
            handshake_timeout: Duration::from_secs(10),
            telemetry_interval: Duration::from_secs(1),
            telemetry_range: 5.0,
            base_temperature: 70.0,
            policy: ServerPolicy::default(),
            queue: QueueConfig::default(),
        }
    }
}

/// Accepts WebSocket upgrades and serves each as a server session
pub struct Listener {
    config: ListenerConfig,
    trace: Arc<dyn TraceSink>,
}

impl Listener {
    /// Create a listener; nothing is bound until [`run`](Self::run)
    pub fn new(config: ListenerConfig, trace: Arc<dyn TraceSink>) -> Self {
        Self { config, trace }
    }

    /// Bind the configured address and accept forever
    pub async fn run(&self) -> Result<(), TransportError> {
        let listener = listen_tcp(self.config.addr).await?;
        self.serve(listener).await;
        Ok(())
    }

    /// Accept forever on an already bound socket
    pub async fn serve(&self, listener: TcpListener) {
        match listener.local_addr() {
            Ok(addr) => info!("Listening on http://{}/{}", addr, self.config.path.trim_start_matches('/')),
            Err(e) => warn!("Listening on unknown address: {}", e),
        }

        let mut requests: u64 = 0;
        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    let e = TransportError::Accept(e);
                    error!("{}", e);
                    self.trace.trace_line(&format!("Exception: {e}"));
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    continue;
                }
            };
            debug!("Accepted TCP connection from {}", peer);

            let socket = match timeout(self.config.handshake_timeout, accept_upgrade(stream, &self.config.path)).await {
                Ok(Ok(socket)) => socket,
                Ok(Err(HandshakeError::Rejected { status, reason })) => {
                    warn!("Rejected request from {} with {}: {}", peer, status, reason);
                    continue;
                }
                Ok(Err(e)) => {
                    warn!("Handshake with {} failed: {}", peer, e);
                    continue;
                }
                Err(_) => {
                    warn!("Handshake with {} timed out after {:?}", peer, self.config.handshake_timeout);
                    continue;
                }
            };

            requests += 1;
            self.trace.trace_line(&format!("Requests processed: {requests}"));

            let link = Arc::new(Link::new(self.config.queue, self.config.base_temperature));
            link.mark_open();
            info!("Connection from {} is link {}", peer, link.id());

            let simulator = TelemetrySimulator::new(self.config.telemetry_interval, self.config.telemetry_range);
            tokio::spawn(serve_connection(
                socket,
                link,
                ServerReactor::new(self.config.policy),
                simulator,
                self.trace.clone(),
            ));
        }
    }
}

async fn serve_connection(
    socket: WebSocketStream<TcpStream>,
    link: Arc<Link>,
    reactor: ServerReactor,
    simulator: TelemetrySimulator,
    trace: Arc<dyn TraceSink>,
) {
    let session = Session::new(link.clone(), reactor, trace.clone());
    let (result, _) = tokio::join!(session.run(socket), simulator.run(&link, trace.as_ref()));
    if let Err(e) = result {
        warn!("Link {} ended with error: {}", link.id(), e);
        trace.trace_line(&format!("Exception: {e}"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::MemorySink;
    use crate::transport::{connect_ws, decode_frame, encode_frame, ClientStream};
    use futures::{SinkExt, StreamExt};
    use relay_wire::{LedState, Message};
    use std::net::Ipv4Addr;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn start(config: ListenerConfig) -> (SocketAddr, Arc<MemorySink>) {
        let sink = Arc::new(MemorySink::new());
        let tcp = listen_tcp(SocketAddr::from((Ipv4Addr::LOCALHOST, 0))).await.unwrap();
        let addr = tcp.local_addr().unwrap();
        let listener = Listener::new(config, sink.clone());
        tokio::spawn(async move { listener.serve(tcp).await });
        (addr, sink)
    }

    async fn next_message(socket: &mut ClientStream) -> Message {
        let frame = timeout(Duration::from_secs(5), socket.next()).await.unwrap().unwrap().unwrap();
        decode_frame(&frame).unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_client_receives_telemetry() {
        let config = ListenerConfig {
            telemetry_interval: Duration::from_millis(20),
            ..Default::default()
        };
        let (addr, sink) = start(config).await;

        let mut socket = connect_ws(&format!("ws://{addr}/wsDemo")).await.unwrap();
        let first = next_message(&mut socket).await;
        let second = next_message(&mut socket).await;

        match (first, second) {
            (Message::Temperature { value: a }, Message::Temperature { value: b }) => {
                assert!(a >= 70.0 && b >= a);
            }
            other => panic!("expected temperatures, got {other:?}"),
        }
        assert_eq!(sink.count("Requests processed: 1"), 1);
        socket.close(None).await.unwrap();
    }

    #[tokio::test]
    async fn test_led_command_gated_by_temperature() {
        let config = ListenerConfig {
            telemetry_interval: Duration::from_secs(3600),
            base_temperature: 95.0,
            ..Default::default()
        };
        let (addr, sink) = start(config).await;
        let mut socket = connect_ws(&format!("ws://{addr}/wsDemo")).await.unwrap();

        // The first reading goes out on open and pushes the link above 95.
        assert!(matches!(next_message(&mut socket).await, Message::Temperature { value } if value >= 95.0));

        let command = Message::LedCommand { pin: 12, state: LedState::On };
        socket.send(encode_frame(&command)).await.unwrap();
        assert_eq!(next_message(&mut socket).await, command);

        // Temperature is back at 70 now, so this one is dropped and the
        // heartbeat echo is the next thing to arrive.
        socket.send(encode_frame(&command)).await.unwrap();
        socket.send(encode_frame(&Message::Heartbeat)).await.unwrap();
        assert_eq!(next_message(&mut socket).await, Message::Heartbeat);

        assert_eq!(sink.count("LEDMessage: [12 On]"), 1);
        socket.close(None).await.unwrap();
    }

    #[tokio::test]
    async fn test_bad_requests_do_not_stop_accepting() {
        let (addr, sink) = start(ListenerConfig::default()).await;

        let mut plain = TcpStream::connect(addr).await.unwrap();
        plain.write_all(b"GET /wsDemo HTTP/1.1\r\nHost: localhost\r\n\r\n").await.unwrap();
        let mut response = String::new();
        timeout(Duration::from_secs(5), plain.read_to_string(&mut response))
            .await
            .unwrap()
            .unwrap();
        assert!(response.starts_with("HTTP/1.1 400"));

        let wrong_path = connect_ws(&format!("ws://{addr}/elsewhere")).await;
        assert!(matches!(wrong_path, Err(TransportError::Connect { .. })));

        let mut socket = connect_ws(&format!("ws://{addr}/wsDemo")).await.unwrap();
        timeout(Duration::from_secs(5), async {
            while sink.count("Requests processed") == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(sink.count("Requests processed: 1"), 1);
        socket.close(None).await.unwrap();
    }

    #[tokio::test]
    async fn test_stalled_handshake_times_out() {
        let config = ListenerConfig {
            handshake_timeout: Duration::from_millis(100),
            ..Default::default()
        };
        let (addr, sink) = start(config).await;

        let mut stalled = TcpStream::connect(addr).await.unwrap();
        let mut socket = timeout(Duration::from_secs(5), connect_ws(&format!("ws://{addr}/wsDemo")))
            .await
            .unwrap()
            .unwrap();

        let mut leftover = Vec::new();
        let read = timeout(Duration::from_secs(5), stalled.read_to_end(&mut leftover)).await.unwrap();
        assert!(matches!(read, Ok(0)) || read.is_err());

        timeout(Duration::from_secs(5), async {
            while sink.count("Requests processed") == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(sink.count("Requests processed: 1"), 1);
        socket.close(None).await.unwrap();
    }
}
