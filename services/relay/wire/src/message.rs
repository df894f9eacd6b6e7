//! Application messages exchanged between the telemetry server and the client.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::WireError;

/// Discriminator size in bytes
pub const KIND_SIZE: usize = 2;

/// Message discriminator carried in the first two bytes of every frame.
///
/// Value 0 is reserved and never valid on the wire.
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// Liveness signal
    Heartbeat = 1,
    /// Sensor reading
    Temperature = 2,
    /// LED actuation command
    LedCommand = 3,
}

impl MessageKind {
    /// Short name used in logs and errors
    pub fn name(self) -> &'static str {
        match self {
            MessageKind::Heartbeat => "heartbeat",
            MessageKind::Temperature => "temperature",
            MessageKind::LedCommand => "led",
        }
    }
}

impl TryFrom<u16> for MessageKind {
    type Error = WireError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(MessageKind::Heartbeat),
            2 => Ok(MessageKind::Temperature),
            3 => Ok(MessageKind::LedCommand),
            _ => Err(WireError::Kind(value)),
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Requested LED output level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LedState {
    /// Drive the pin high
    On,
    /// Drive the pin low
    Off,
}

impl fmt::Display for LedState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LedState::On => f.write_str("On"),
            LedState::Off => f.write_str("Off"),
        }
    }
}

/// One application message; exactly one per transport frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Message {
    /// Liveness only, no payload
    Heartbeat,
    /// Synthetic sensor reading
    Temperature {
        /// Reading in degrees
        value: f64,
    },
    /// Actuation instruction
    LedCommand {
        /// GPIO pin number
        pin: i32,
        /// Requested level
        state: LedState,
    },
}

impl Message {
    /// Discriminator for this message
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Heartbeat => MessageKind::Heartbeat,
            Message::Temperature { .. } => MessageKind::Temperature,
            Message::LedCommand { .. } => MessageKind::LedCommand,
        }
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Message::Heartbeat => f.write_str("Heartbeat"),
            Message::Temperature { value } => write!(f, "Temperature({value})"),
            Message::LedCommand { pin, state } => write!(f, "LED [Pin: {pin}  State: {state}]"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_values_are_stable() {
        assert_eq!(MessageKind::Heartbeat as u16, 1);
        assert_eq!(MessageKind::Temperature as u16, 2);
        assert_eq!(MessageKind::LedCommand as u16, 3);
    }

    #[test]
    fn test_kind_rejects_reserved_and_unknown() {
        assert_eq!(MessageKind::try_from(0), Err(WireError::Kind(0)));
        assert_eq!(MessageKind::try_from(4), Err(WireError::Kind(4)));
    }

    #[test]
    fn test_display() {
        let led = Message::LedCommand { pin: 12, state: LedState::On };
        assert_eq!(led.to_string(), "LED [Pin: 12  State: On]");
        assert_eq!(Message::Heartbeat.to_string(), "Heartbeat");
    }
}
