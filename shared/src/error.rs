//! Error taxonomy shared by the client and server transports

use crate::connection_id::ConnectionId;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum NetError {
    /// Marker mismatch or a buffer too short to hold the marker
    #[error("malformed frame")]
    MalformedFrame,

    /// Record length on the stream exceeds the allowed frame size
    #[error("frame of {0} bytes exceeds the maximum frame length")]
    FrameTooLarge(usize),

    #[error("connection {0} is not connected")]
    NotConnected(ConnectionId),

    /// Client side: there is no live connection to the server
    #[error("not connected to the server")]
    Disconnected,

    /// Backpressure signal: the bounded outbound queue has no free slot
    #[error("outgoing queue full")]
    OutgoingQueueFull,

    /// The sender worker is gone and nothing drains the queue anymore
    #[error("outgoing queue closed")]
    QueueClosed,

    #[error("outgoing queue capacity must be in (0, 1000), got {0}")]
    InvalidQueueCapacity(usize),

    #[error("failed to encode envelope: {0}")]
    Encode(#[source] bincode::Error),

    #[error("failed to decode envelope: {0}")]
    Decode(#[source] bincode::Error),

    #[error("transport failed to start: {0}")]
    StartupFailed(#[source] std::io::Error),

    #[error("service failed")]
    ServiceFailed,

    #[error("timed out waiting for service to terminate")]
    ShutdownTimeout,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl NetError {
    /// Errors that the producer should log and move past
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            NetError::NotConnected(_)
                | NetError::Disconnected
                | NetError::OutgoingQueueFull
                | NetError::Encode(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, NetError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backpressure_errors_are_recoverable() {
        assert!(NetError::OutgoingQueueFull.is_recoverable());
        assert!(NetError::NotConnected(ConnectionId::new()).is_recoverable());
        assert!(!NetError::MalformedFrame.is_recoverable());
        assert!(!NetError::ShutdownTimeout.is_recoverable());
    }

    #[test]
    fn test_error_messages() {
        assert_eq!(NetError::MalformedFrame.to_string(), "malformed frame");
        assert_eq!(
            NetError::InvalidQueueCapacity(0).to_string(),
            "outgoing queue capacity must be in (0, 1000), got 0"
        );
    }
}
