//! # Error Types
//!
//! Custom error types for the SkyPulse session layer using `thiserror`.
//!
//! Validation and busy errors are returned before any state change. Timeout and
//! link errors move the connection to `Failed`, which recovers to `Idle` on its own.
//! Nothing in here is fatal to the process.

use thiserror::Error;

use crate::session::connection::ConnectionState;

/// Main error type for the SkyPulse session layer
#[derive(Debug, Error)]
pub enum GcsError {
    /// Empty or invalid request arguments (port selection, takeoff altitude)
    #[error("Invalid input: {0}")]
    InputValidation(String),

    /// A connect was requested while another attempt is still in flight
    #[error("Connection busy: cannot connect while {0}")]
    Busy(ConnectionState),

    /// No liveness confirmation arrived within the connect window
    #[error("Connection timeout after {0} ms")]
    Timeout(u64),

    /// The link reported failure for connect, disconnect or a command
    #[error("Link error: {0}")]
    Link(String),

    /// Command issued while not connected, or a flight precondition is unmet
    #[error("Not ready: {0}")]
    NotReady(String),

    /// Malformed or unexpected event payload; logged and discarded
    #[error("Discarded event: {0}")]
    TransientEvent(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] toml::de::Error),

    /// Serial port open or enumeration failures
    #[error("Serial error: {0}")]
    Serial(String),

    /// JSON payload errors (events, settings files)
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The session task has stopped and can no longer answer requests
    #[error("Session closed")]
    SessionClosed,
}

/// Result type alias for the SkyPulse session layer
pub type Result<T> = std::result::Result<T, GcsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_busy_message_names_state() {
        let err = GcsError::Busy(ConnectionState::Connecting);
        assert_eq!(err.to_string(), "Connection busy: cannot connect while connecting");
    }

    #[test]
    fn test_timeout_message_contains_timeout() {
        let err = GcsError::Timeout(30_000);
        assert!(err.to_string().to_lowercase().contains("timeout"));
    }

    #[test]
    fn test_json_error_converts() {
        let json_err = serde_json::from_str::<u32>("not json").unwrap_err();
        let err: GcsError = json_err.into();
        assert!(matches!(err, GcsError::Json(_)));
    }
}
