//! Server side of the WebSocket upgrade.
//!
//! The listener reads the HTTP request head itself so it can answer
//! anything that is not a proper upgrade for the configured path with a
//! client-error status instead of silently dropping the socket. The head is
//! parsed with `httparse`; the 101 answer and its accept key come from
//! tungstenite's server handshake.

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_tungstenite::tungstenite::handshake::server::{create_response, write_response, Request, Response};
use tokio_tungstenite::tungstenite::http::{header, StatusCode, Version};
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, trace};

/// Largest accepted request head, terminating blank line included
pub const MAX_REQUEST_HEAD: usize = 8 * 1024;

const MAX_HEADERS: usize = 64;

/// Why an upgrade did not happen
#[derive(Error, Debug)]
pub enum HandshakeError {
    /// Socket failure while reading or answering
    #[error("handshake i/o: {0}")]
    Io(#[from] std::io::Error),

    /// Peer closed before sending a full request head
    #[error("connection closed before request head")]
    Eof,

    /// Request answered with a client-error status
    #[error("rejected with {status}: {reason}")]
    Rejected {
        /// Status sent back
        status: StatusCode,
        /// What was wrong with the request
        reason: String,
    },
}

type Rejection = (StatusCode, String);

fn rejection(status: StatusCode, reason: impl Into<String>) -> Rejection {
    (status, reason.into())
}

/// `/wsDemo/` and `wsDemo` both become `/wsDemo`
pub fn normalize_path(path: &str) -> String {
    format!("/{}", path.trim_matches('/'))
}

/// Parse the bytes read so far as an upgrade request for `expected_path`.
///
/// Returns `Ok(None)` while the head is still incomplete.
pub fn parse_request(buf: &[u8], expected_path: &str) -> Result<Option<Request>, Rejection> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut raw = httparse::Request::new(&mut headers);

    let head_len = match raw.parse(buf) {
        Ok(httparse::Status::Partial) if buf.len() >= MAX_REQUEST_HEAD => {
            return Err(rejection(StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE, "request head too large"));
        }
        Ok(httparse::Status::Partial) => return Ok(None),
        Ok(httparse::Status::Complete(len)) => len,
        Err(httparse::Error::TooManyHeaders) => {
            return Err(rejection(StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE, "too many headers"));
        }
        Err(e) => return Err(rejection(StatusCode::BAD_REQUEST, format!("malformed request head: {e}"))),
    };

    if head_len > MAX_REQUEST_HEAD {
        return Err(rejection(StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE, "request head too large"));
    }
    if buf.len() > head_len {
        return Err(rejection(StatusCode::BAD_REQUEST, "data after request head"));
    }

    if raw.method != Some("GET") {
        return Err(rejection(StatusCode::METHOD_NOT_ALLOWED, "upgrade requires GET"));
    }
    let target = raw.path.unwrap_or_default();
    if normalize_path(target.split('?').next().unwrap_or_default()) != normalize_path(expected_path) {
        return Err(rejection(StatusCode::NOT_FOUND, "unknown path"));
    }
    if raw.version != Some(1) {
        return Err(rejection(StatusCode::BAD_REQUEST, "upgrade requires HTTP/1.1"));
    }

    let mut builder = Request::builder().method("GET").uri(target).version(Version::HTTP_11);
    for field in raw.headers.iter() {
        builder = builder.header(field.name, field.value);
    }
    builder
        .body(())
        .map(Some)
        .map_err(|e| rejection(StatusCode::BAD_REQUEST, format!("invalid request: {e}")))
}

fn rejection_response(status: StatusCode) -> Result<Vec<u8>, tokio_tungstenite::tungstenite::Error> {
    let mut builder = Response::builder()
        .status(status)
        .header(header::CONNECTION, "close")
        .header(header::CONTENT_LENGTH, "0");
    if status == StatusCode::METHOD_NOT_ALLOWED {
        builder = builder.header(header::ALLOW, "GET");
    }

    let mut out = Vec::new();
    write_response(&mut out, &builder.body(())?)?;
    Ok(out)
}

async fn reject<S>(stream: &mut S, (status, reason): Rejection) -> HandshakeError
where
    S: AsyncWrite + Unpin,
{
    let written = async {
        let response = rejection_response(status).map_err(std::io::Error::other)?;
        stream.write_all(&response).await?;
        stream.shutdown().await
    };
    if let Err(e) = written.await {
        debug!("Failed to deliver {} response: {}", status, e);
    }
    HandshakeError::Rejected { status, reason }
}

async fn read_request<S>(stream: &mut S, path: &str) -> Result<Result<Request, Rejection>, HandshakeError>
where
    S: AsyncRead + Unpin,
{
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];
    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(HandshakeError::Eof);
        }
        buf.extend_from_slice(&chunk[..n]);
        trace!("Read {} bytes of request head, {} total", n, buf.len());

        match parse_request(&buf, path) {
            Ok(Some(request)) => return Ok(Ok(request)),
            Ok(None) => {}
            Err(denied) => return Ok(Err(denied)),
        }
    }
}

/// Run the server side of the upgrade on `stream`.
///
/// On success the socket is switched to WebSocket framing; on a bad request
/// the rejection status has already been written when this returns.
pub async fn accept_upgrade<S>(mut stream: S, path: &str) -> Result<WebSocketStream<S>, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let request = match read_request(&mut stream, path).await? {
        Ok(request) => request,
        Err(denied) => return Err(reject(&mut stream, denied).await),
    };

    let answer = create_response(&request).and_then(|response| {
        let mut out = Vec::new();
        write_response(&mut out, &response)?;
        Ok(out)
    });
    let answer = match answer {
        Ok(answer) => answer,
        Err(e) => return Err(reject(&mut stream, rejection(StatusCode::BAD_REQUEST, e.to_string())).await),
    };

    stream.write_all(&answer).await?;
    stream.flush().await?;

    Ok(WebSocketStream::from_raw_socket(stream, Role::Server, None).await)
}
