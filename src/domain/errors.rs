use crate::domain::models::Side;
use thiserror::Error;

/// Failures reported by the radio transport.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Bluetooth adapter not available")]
    AdapterNotAvailable,

    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Service discovery failed: {0}")]
    DiscoveryFailed(String),

    #[error("Characteristic not found: {characteristic}")]
    CharacteristicNotFound { characteristic: String },

    #[error("Subscription failed: {0}")]
    SubscriptionFailed(String),

    #[error("Write failed: {0}")]
    WriteFailed(String),

    #[error("Scan failed: {0}")]
    ScanFailed(String),

    #[error("Transport error: {0}")]
    Other(String),
}

/// Telemetry payload could not be decoded.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("unexpected frame length: expected {expected} bytes, got {actual}")]
    UnexpectedLength { expected: usize, actual: usize },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectError {
    #[error("peripheral {0} already has a session")]
    AlreadyConnected(String),

    #[error("session capacity exceeded (max {max})")]
    CapacityExceeded { max: usize },

    #[error("{0} side is already assigned to another session")]
    SideTaken(Side),

    #[error("connection was cancelled before it became ready")]
    Cancelled,

    #[error("transport failure: {0}")]
    TransportFailure(#[source] TransportError),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    #[error("no ready session to sync")]
    NoSession,

    #[error("sync write failed: {0}")]
    WriteFailed(#[source] TransportError),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TelemetryError {
    #[error("session {0} is not ready")]
    NotReady(String),

    #[error("failed to monitor telemetry: {0}")]
    MonitorFailed(#[source] TransportError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DecodeError::UnexpectedLength {
            expected: 220,
            actual: 12,
        };
        assert_eq!(
            err.to_string(),
            "unexpected frame length: expected 220 bytes, got 12"
        );

        let err = ConnectError::CapacityExceeded { max: 2 };
        assert_eq!(err.to_string(), "session capacity exceeded (max 2)");

        let err = ConnectError::SideTaken(Side::Left);
        assert_eq!(
            err.to_string(),
            "left side is already assigned to another session"
        );

        let err = SyncError::WriteFailed(TransportError::WriteFailed("gatt 0x0e".to_string()));
        assert_eq!(err.to_string(), "sync write failed: Write failed: gatt 0x0e");
    }
}
