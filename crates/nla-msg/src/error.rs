//! Error types for the event model

use crate::opcode::Group;
use thiserror::Error;

/// Errors raised while building, decoding or validating envelopes
#[derive(Debug, Error)]
pub enum MsgError {
    /// Message type outside the seven supported groups
    #[error("unsupported message type: {0}")]
    UnsupportedType(u16),

    /// Payload kind does not match the group of the message type
    #[error("payload mismatch for type {msg_type}: expected {expected}, found {found}")]
    PayloadMismatch {
        msg_type: u16,
        expected: Group,
        found: Group,
    },

    #[error("invalid MAC address format: {0}")]
    InvalidMacAddress(String),

    #[error("invalid IP prefix format: {0}")]
    InvalidIpPrefix(String),

    /// Envelope could not be decoded from its JSON form
    #[error("decode error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Error returned by a handler that could not process an envelope
///
/// Handlers run inside the node manager fan-out, which logs the error and
/// keeps delivering the same envelope to the remaining services.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("rejected: {0}")]
    Rejected(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

/// Result type alias for event model operations
pub type Result<T> = std::result::Result<T, MsgError>;
