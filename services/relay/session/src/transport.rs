//! WebSocket transport for relay sessions.
//!
//! This module maps between transport frames and application messages and
//! provides the plain TCP listener and the WebSocket dialer.

use relay_wire::{Message, WireError};
use std::net::SocketAddr;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::{self, Message as WsMessage, Utf8Bytes};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::debug;

/// Client-side socket produced by [`connect_ws`]
pub type ClientStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Transport failures
#[derive(Error, Debug)]
pub enum TransportError {
    /// Could not bind the listen address
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// Requested address
        addr: SocketAddr,
        /// Underlying error
        source: std::io::Error,
    },

    /// Accepting a TCP connection failed
    #[error("accept failed: {0}")]
    Accept(#[source] std::io::Error),

    /// URL cannot be turned into a WebSocket request
    #[error("invalid WebSocket URL {url:?}: {source}")]
    InvalidUrl {
        /// Offending URL
        url: String,
        /// Underlying error
        source: tungstenite::Error,
    },

    /// Opening the WebSocket failed
    #[error("connect to {url} failed: {source}")]
    Connect {
        /// Target URL
        url: String,
        /// Underlying error
        source: tungstenite::Error,
    },
}

/// Inbound frame that cannot be turned into a message
#[derive(Error, Debug)]
pub enum FrameError {
    /// Binary frame with a bad discriminator or body
    #[error("protocol error: {0}")]
    Wire(#[from] WireError),

    /// Text frame on a binary-only channel
    #[error("expected binary frame, got text")]
    Text,
}

impl FrameError {
    /// Close frame announcing this error to the peer
    pub fn close_frame(&self) -> CloseFrame {
        match self {
            FrameError::Wire(_) => CloseFrame {
                code: CloseCode::Protocol,
                reason: Utf8Bytes::from_static("malformed message"),
            },
            FrameError::Text => CloseFrame {
                code: CloseCode::Unsupported,
                reason: Utf8Bytes::from_static("expected binary frame"),
            },
        }
    }
}

/// Turn a data frame into a message.
///
/// Returns `Ok(None)` for a close frame (or any other non-data frame), which
/// tells the caller the connection is ending.
pub fn decode_frame(frame: &WsMessage) -> Result<Option<Message>, FrameError> {
    match frame {
        WsMessage::Binary(payload) => Ok(Some(relay_wire::decode(payload)?)),
        WsMessage::Text(_) => Err(FrameError::Text),
        WsMessage::Close(close) => {
            debug!("Received close frame: {:?}", close);
            Ok(None)
        }
        WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_) => Ok(None),
    }
}

/// Wrap a message into one binary frame
pub fn encode_frame(message: &Message) -> WsMessage {
    WsMessage::Binary(relay_wire::encode(message))
}

/// Create a TCP listener bound to the given address
pub async fn listen_tcp(addr: SocketAddr) -> Result<TcpListener, TransportError> {
    TcpListener::bind(addr)
        .await
        .map_err(|source| TransportError::Bind { addr, source })
}

/// Check that `url` is a `ws://` or `wss://` URL a client request can be built from
pub fn check_url(url: &str) -> Result<(), TransportError> {
    let invalid = |source| TransportError::InvalidUrl {
        url: url.to_string(),
        source,
    };
    let request = url.into_client_request().map_err(invalid)?;
    match request.uri().scheme_str() {
        Some("ws") | Some("wss") => Ok(()),
        _ => Err(invalid(tungstenite::Error::Url(tungstenite::error::UrlError::UnsupportedUrlScheme))),
    }
}

/// Open a WebSocket to `url`
pub async fn connect_ws(url: &str) -> Result<ClientStream, TransportError> {
    let (stream, response) = tokio_tungstenite::connect_async(url)
        .await
        .map_err(|source| TransportError::Connect {
            url: url.to_string(),
            source,
        })?;
    debug!("WebSocket handshake with {} answered {}", url, response.status());
    Ok(stream)
}
