//! Wire protocol error types.

use thiserror::Error;

/// Wire protocol errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    /// Frame too short to hold a discriminator
    #[error("incomplete frame: {0} bytes")]
    Incomplete(usize),

    /// Unknown message discriminator
    #[error("unknown message kind {0}")]
    Kind(u16),

    /// Body could not be decoded for the announced kind
    #[error("malformed {kind} body: {reason}")]
    Body {
        /// Kind named by the discriminator
        kind: &'static str,
        /// Decoder failure description
        reason: String,
    },

    /// Bytes left over after the body
    #[error("{0} trailing bytes after body")]
    Trailing(usize),
}
