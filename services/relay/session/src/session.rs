//! Duplex session over one WebSocket.
//!
//! A session runs two loops against the same [`Link`]: the receive loop
//! decodes inbound frames and hands them to the role's [`Reactor`], the send
//! loop drains the link's outbound queue onto the socket. Whichever side
//! notices the end of the connection first moves the link out of `Open`,
//! which stops the other loop. The socket is released once both have
//! finished.

use crate::link::Link;
use crate::reactor::Reactor;
use crate::trace::TraceSink;
use crate::transport::{decode_frame, encode_frame, FrameError};
use futures::{Sink, SinkExt, Stream, StreamExt};
use relay_wire::Message;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::{self, Message as WsMessage};
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, trace, warn};

/// Why a session ended abnormally
#[derive(Error, Debug)]
pub enum SessionError {
    /// Peer sent something that is not a valid message
    #[error(transparent)]
    Protocol(#[from] FrameError),

    /// Socket failure
    #[error("transport error: {0}")]
    Transport(#[from] tungstenite::Error),
}

/// One connection's receive and send loops
pub struct Session<R> {
    link: Arc<Link>,
    reactor: R,
    trace: Arc<dyn TraceSink>,
}

impl<R: Reactor> Session<R> {
    /// Create a session for `link`
    pub fn new(link: Arc<Link>, reactor: R, trace: Arc<dyn TraceSink>) -> Self {
        Self { link, reactor, trace }
    }

    /// The link this session drives
    pub fn link(&self) -> &Arc<Link> {
        &self.link
    }

    /// Run both loops until the connection ends, then release the socket.
    ///
    /// The link is `Closed` when this returns, whatever the outcome.
    pub async fn run<S>(&self, socket: WebSocketStream<S>) -> Result<(), SessionError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let id = self.link.id();
        info!("Starting session {}", id);

        let (mut sink, mut stream) = socket.split();
        let (received, sent) = tokio::join!(self.receive_loop(&mut stream), self.send_loop(&mut sink));

        self.link.mark_closed();
        drop(stream);
        drop(sink);
        debug!("Session {} released its socket", id);

        info!("Session {} ended. Stats: {:?}", id, self.link.stats());
        received.and(sent)
    }

    /// Apply the role reaction to one inbound message and queue any reply
    pub async fn handle_message(&self, message: Message) {
        trace!("Link {} received {}", self.link.id(), message);

        let Some(reply) = self.reactor.react(&self.link, message, self.trace.as_ref()) else {
            return;
        };
        tokio::select! {
            pushed = self.link.queue().push(reply) => {
                if pushed.is_err() {
                    debug!("Link {} closed before {} reply was queued", self.link.id(), reply.kind());
                }
            }
            _ = self.link.closed() => {
                debug!("Link {} closing; dropped {} reply", self.link.id(), reply.kind());
            }
        }
    }

    async fn receive_loop<St>(&self, stream: &mut St) -> Result<(), SessionError>
    where
        St: Stream<Item = Result<WsMessage, tungstenite::Error>> + Unpin,
    {
        loop {
            let next = tokio::select! {
                _ = self.link.closed() => return Ok(()),
                next = stream.next() => next,
            };

            let frame = match next {
                Some(Ok(frame)) => frame,
                Some(Err(e)) => {
                    warn!("Link {} read failed: {}", self.link.id(), e);
                    self.link.begin_close();
                    return Err(SessionError::Transport(e));
                }
                None => {
                    debug!("Link {} stream ended", self.link.id());
                    self.link.begin_close();
                    return Ok(());
                }
            };

            // tungstenite answers pings itself
            if frame.is_ping() || frame.is_pong() {
                continue;
            }

            match decode_frame(&frame) {
                Ok(Some(message)) => {
                    self.link.record_in(frame.len());
                    self.handle_message(message).await;
                }
                Ok(None) => {
                    debug!("Link {} closed by peer", self.link.id());
                    self.link.begin_close();
                    return Ok(());
                }
                Err(e) => {
                    warn!("Link {} dropped: {}", self.link.id(), e);
                    self.link.close_with(e.close_frame());
                    return Err(e.into());
                }
            }
        }
    }

    async fn send_loop<Si>(&self, sink: &mut Si) -> Result<(), SessionError>
    where
        Si: Sink<WsMessage, Error = tungstenite::Error> + Unpin,
    {
        let result = loop {
            let message = tokio::select! {
                biased;
                _ = self.link.closed() => break Ok(()),
                message = self.link.queue().pop() => match message {
                    Some(message) => message,
                    None => break Ok(()),
                },
            };

            let frame = encode_frame(&message);
            let len = frame.len();
            if let Err(e) = sink.send(frame).await {
                warn!("Link {} write failed: {}", self.link.id(), e);
                self.link.begin_close();
                break Err(SessionError::Transport(e));
            }
            self.link.record_out(len);
        };

        if result.is_ok() {
            let farewell = match self.link.take_close_frame() {
                Some(frame) => sink.send(WsMessage::Close(Some(frame))).await,
                None => sink.close().await,
            };
            if let Err(e) = farewell {
                debug!("Link {} close handshake incomplete: {}", self.link.id(), e);
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::LinkState;
    use crate::queue::QueueConfig;
    use crate::reactor::{ClientReactor, ServerReactor};
    use crate::trace::MemorySink;
    use relay_wire::LedState;
    use std::io;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::task::{Context, Poll};
    use std::time::Duration;
    use tokio::io::{duplex, DuplexStream, ReadBuf};
    use tokio::time::timeout;
    use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
    use tokio_tungstenite::tungstenite::protocol::Role;

    /// Duplex half that counts how often it is dropped
    struct Tracked {
        inner: DuplexStream,
        drops: Arc<AtomicUsize>,
    }

    impl Drop for Tracked {
        fn drop(&mut self) {
            self.drops.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl AsyncRead for Tracked {
        fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
            Pin::new(&mut self.get_mut().inner).poll_read(cx, buf)
        }
    }

    impl AsyncWrite for Tracked {
        fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
            Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
        }

        fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Pin::new(&mut self.get_mut().inner).poll_flush(cx)
        }

        fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
        }
    }

    async fn socket_pair() -> (WebSocketStream<Tracked>, WebSocketStream<DuplexStream>, Arc<AtomicUsize>) {
        let (local, remote) = duplex(64 * 1024);
        let drops = Arc::new(AtomicUsize::new(0));
        let local = Tracked { inner: local, drops: drops.clone() };
        let local = WebSocketStream::from_raw_socket(local, Role::Server, None).await;
        let remote = WebSocketStream::from_raw_socket(remote, Role::Client, None).await;
        (local, remote, drops)
    }

    fn session<R: Reactor>(reactor: R, temperature: f64) -> Session<R> {
        let link = Arc::new(Link::new(QueueConfig::default(), temperature));
        link.mark_open();
        Session::new(link, reactor, Arc::new(MemorySink::new()))
    }

    async fn drain(peer: &mut WebSocketStream<DuplexStream>) {
        while let Some(Ok(_)) = peer.next().await {}
    }

    #[tokio::test]
    async fn test_peer_close_stops_both_loops() {
        let (local, mut peer, drops) = socket_pair().await;
        let session = session(ServerReactor::default(), 70.0);

        let (result, _) = timeout(
            Duration::from_secs(5),
            async {
                tokio::join!(session.run(local), async {
                    peer.close(None).await.unwrap();
                    drain(&mut peer).await;
                })
            },
        )
        .await
        .unwrap();

        assert!(result.is_ok());
        assert_eq!(drops.load(Ordering::SeqCst), 1);
        assert_eq!(session.link().state(), LinkState::Closed);
        assert!(session.link().queue().is_closed());
    }

    #[tokio::test]
    async fn test_queued_messages_sent_in_order() {
        let (local, mut peer, _drops) = socket_pair().await;
        let session = session(ServerReactor::default(), 70.0);
        let sent = [
            Message::Temperature { value: 71.0 },
            Message::Heartbeat,
            Message::Temperature { value: 72.5 },
        ];
        for message in sent {
            session.link().queue().push(message).await.unwrap();
        }

        let (result, received) = timeout(
            Duration::from_secs(5),
            async {
                tokio::join!(session.run(local), async {
                    let mut received = Vec::new();
                    while received.len() < sent.len() {
                        let frame = peer.next().await.unwrap().unwrap();
                        received.push(decode_frame(&frame).unwrap().unwrap());
                    }
                    peer.close(None).await.unwrap();
                    drain(&mut peer).await;
                    received
                })
            },
        )
        .await
        .unwrap();

        assert!(result.is_ok());
        assert_eq!(received, sent);
        assert_eq!(session.link().stats().frames_out, 3);
    }

    #[tokio::test]
    async fn test_reply_goes_back_on_same_link() {
        let (local, mut peer, _drops) = socket_pair().await;
        let session = session(ClientReactor::default(), 0.0);

        let (result, reply) = timeout(
            Duration::from_secs(5),
            async {
                tokio::join!(session.run(local), async {
                    peer.send(encode_frame(&Message::Temperature { value: 92.0 })).await.unwrap();
                    let frame = peer.next().await.unwrap().unwrap();
                    peer.close(None).await.unwrap();
                    drain(&mut peer).await;
                    decode_frame(&frame).unwrap()
                })
            },
        )
        .await
        .unwrap();

        assert!(result.is_ok());
        assert_eq!(reply, Some(Message::LedCommand { pin: 12, state: LedState::On }));
        assert_eq!(session.link().stats().frames_in, 1);
    }

    #[tokio::test]
    async fn test_unknown_kind_closes_with_protocol_error() {
        let (local, mut peer, drops) = socket_pair().await;
        let session = session(ServerReactor::default(), 70.0);

        let (result, close) = timeout(
            Duration::from_secs(5),
            async {
                tokio::join!(session.run(local), async {
                    peer.send(WsMessage::Binary(bytes::Bytes::from_static(&[0x09, 0x00]))).await.unwrap();
                    let close = peer.next().await.unwrap().unwrap();
                    drain(&mut peer).await;
                    close
                })
            },
        )
        .await
        .unwrap();

        assert!(matches!(result, Err(SessionError::Protocol(FrameError::Wire(_)))));
        match close {
            WsMessage::Close(Some(frame)) => assert_eq!(frame.code, CloseCode::Protocol),
            other => panic!("expected close frame, got {other:?}"),
        }
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_text_frame_closes_with_unsupported() {
        let (local, mut peer, _drops) = socket_pair().await;
        let session = session(ServerReactor::default(), 70.0);

        let (result, close) = timeout(
            Duration::from_secs(5),
            async {
                tokio::join!(session.run(local), async {
                    peer.send(WsMessage::text("hello")).await.unwrap();
                    let close = peer.next().await.unwrap().unwrap();
                    drain(&mut peer).await;
                    close
                })
            },
        )
        .await
        .unwrap();

        assert!(matches!(result, Err(SessionError::Protocol(FrameError::Text))));
        match close {
            WsMessage::Close(Some(frame)) => assert_eq!(frame.code, CloseCode::Unsupported),
            other => panic!("expected close frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_peer_vanishing_ends_session() {
        let (local, peer, drops) = socket_pair().await;
        let session = session(ServerReactor::default(), 70.0);
        drop(peer);

        let result = timeout(Duration::from_secs(5), session.run(local)).await.unwrap();
        assert!(result.is_ok() || matches!(result, Err(SessionError::Transport(_))));
        assert_eq!(session.link().state(), LinkState::Closed);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }
}
