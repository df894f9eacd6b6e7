//! Encoding and decoding of one [`Message`] to and from one binary frame.
//!
//! The codec is stateless; framing boundaries are owned by the transport.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::trace;

use crate::message::{LedState, Message, MessageKind, KIND_SIZE};
use crate::WireError;

#[derive(Serialize, Deserialize)]
struct TemperatureBody {
    value: f64,
}

#[derive(Serialize, Deserialize)]
struct LedBody {
    pin: i32,
    state: LedState,
}

/// Encode a message into a single frame payload
pub fn encode(message: &Message) -> Bytes {
    let mut buf = BytesMut::with_capacity(32);
    buf.put_u16_le(message.kind() as u16);

    let mut writer = (&mut buf).writer();
    match *message {
        Message::Heartbeat => {}
        Message::Temperature { value } => write_body(&mut writer, &TemperatureBody { value }),
        Message::LedCommand { pin, state } => write_body(&mut writer, &LedBody { pin, state }),
    }

    buf.freeze()
}

fn write_body<W: std::io::Write, T: Serialize>(writer: &mut W, body: &T) {
    // The bodies are plain structs and the sink is an in-memory buffer.
    ciborium::into_writer(body, writer).expect("CBOR body encode into memory should never fail");
}

/// Read the discriminator without touching the body
pub fn peek_kind(frame: &[u8]) -> Result<MessageKind, WireError> {
    if frame.len() < KIND_SIZE {
        return Err(WireError::Incomplete(frame.len()));
    }
    MessageKind::try_from(u16::from_le_bytes([frame[0], frame[1]]))
}

/// Decode a single frame payload into a message
pub fn decode(frame: &[u8]) -> Result<Message, WireError> {
    let kind = peek_kind(frame)?;
    let mut body = &frame[KIND_SIZE..];
    trace!("decoding {} frame with {} body bytes", kind, body.len());

    let message = match kind {
        MessageKind::Heartbeat => Message::Heartbeat,
        MessageKind::Temperature => {
            let TemperatureBody { value } = read_body(kind, &mut body)?;
            Message::Temperature { value }
        }
        MessageKind::LedCommand => {
            let LedBody { pin, state } = read_body(kind, &mut body)?;
            Message::LedCommand { pin, state }
        }
    };

    if body.has_remaining() {
        return Err(WireError::Trailing(body.remaining()));
    }
    Ok(message)
}

fn read_body<T: DeserializeOwned>(kind: MessageKind, body: &mut &[u8]) -> Result<T, WireError> {
    ciborium::from_reader(body).map_err(|e| WireError::Body {
        kind: kind.name(),
        reason: e.to_string(),
    })
}
