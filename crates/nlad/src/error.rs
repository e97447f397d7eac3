//! Error types for nlad

use nla_msg::{MsgError, NodeId};
use thiserror::Error;

/// Errors that can occur in nlad
#[derive(Debug, Error)]
pub enum NladError {
    /// Netlink socket error (subscribe, read or write)
    #[error("Netlink error: {0}")]
    Netlink(String),

    /// Malformed envelope or unsupported message type
    #[error("Message error: {0}")]
    Message(#[from] MsgError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Cluster API protocol violation
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A slave with this node id is already connected
    #[error("Node already connected: nid {0}")]
    DuplicateNode(NodeId),

    /// Subscriber limit reached
    #[error("Too many subscribers (max {0})")]
    TooManySubscribers(usize),

    /// A peer did not answer or drain in time
    #[error("Timed out: {0}")]
    Timeout(&'static str),

    /// The operation was abandoned because the process is stopping
    #[error("Shutting down")]
    Shutdown,

    /// Receiving side of an internal queue is gone
    #[error("Channel closed: {0}")]
    ChannelClosed(&'static str),

    /// Service failed to start
    #[error("Service {name} failed to start: {reason}")]
    ServiceStart { name: &'static str, reason: String },

    /// Frame could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for nlad operations
pub type Result<T> = std::result::Result<T, NladError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = NladError::DuplicateNode(NodeId(3));
        assert_eq!(err.to_string(), "Node already connected: nid 3");

        let err = NladError::ServiceStart {
            name: "slave",
            reason: "no client".into(),
        };
        assert_eq!(err.to_string(), "Service slave failed to start: no client");
    }

    #[test]
    fn test_timeout_display() {
        assert_eq!(NladError::Timeout("welcome").to_string(), "Timed out: welcome");
    }

    #[test]
    fn test_from_msg_error() {
        let err: NladError = MsgError::UnsupportedType(32).into();
        assert!(matches!(err, NladError::Message(_)));
        assert!(err.to_string().contains("unsupported message type: 32"));
    }

    #[test]
    fn test_from_io_error() {
        let io = std::io::Error::new(std::io::ErrorKind::AddrInUse, "in use");
        let err: NladError = io.into();
        assert!(matches!(err, NladError::Io(_)));
    }
}
