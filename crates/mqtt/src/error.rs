//! Error types for the managed MQTT session and the request correlator.
//!
//! `TransferError` is the unified error for everything that can go wrong while
//! building the client, publishing, subscribing or waiting on a correlated
//! response. `FatalError` is the narrower set of conditions after which the
//! session cannot continue and the process is expected to exit.
//!
//! # Error Categories
//!
//! **Configuration** (caught at startup):
//! - `ClientSetup`: TLS material or client options could not be assembled
//! - `ConfigError`: validation failures in `MqttConfig`
//!
//! **Per request** (returned to the caller of `send_command`):
//! - `Timeout`: no matching response before the deadline
//! - `Cancelled`: the shutdown signal fired while waiting
//! - `InvalidResponse`: the response carried neither `result` nor `error`
//! - `DuplicateRequestId`: a correlation id was already pending
//!
//! **Runtime** (transport):
//! - `ClientTransfer`, `ClientConnection`, `ConnectionState`, `Io`
//!
//! **Fatal**:
//! - `Fatal`: wraps a `FatalError` produced by the connection manager

use std::time::Duration;

use thiserror::Error;

/// Conditions under which the session gives up for good.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FatalError {
    /// The initial connect failed on every attempt of its retry budget.
    #[error("unable to connect to the MQTT broker after {attempts} attempts: {reason}")]
    ConnectRetriesExhausted { attempts: u32, reason: String },

    /// The broker connection was lost and not re-established in time.
    #[error("reconnect watchdog expired: no MQTT connection for {} seconds", .waited.as_secs())]
    ReconnectTimeout { waited: Duration },

    /// The transport stopped retrying on its own (bad credentials, TLS, ...).
    #[error("MQTT connection lost and the client is not reconnecting: {reason}")]
    ConnectionAbandoned { reason: String },
}

/// The unified error type for MQTT transfer operations.
#[derive(Debug, Error)]
pub enum TransferError {
    /// A payload could not be encoded.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// A payload could not be decoded.
    #[error("Deserialization error: {0}")]
    Deserialization(String),

    /// MQTT client initialization failed.
    ///
    /// Usually a missing or unreadable certificate file, or a client id
    /// template that could not be expanded.
    #[error("Client setup error: {0}")]
    ClientSetup(String),

    /// Configuration validation failed.
    #[error("Configuration error: {0}")]
    ConfigError(#[from] validator::ValidationErrors),

    /// The local client could not queue a request (event loop gone).
    #[error("Client transfer error: {0}")]
    ClientTransfer(#[from] rumqttc::ClientError),

    /// Network-level connection error from the event loop.
    ///
    /// Boxed to keep the enum small.
    #[error("Client connection error: {0}")]
    ClientConnection(#[from] Box<rumqttc::ConnectionError>),

    /// MQTT state machine violation reported by rumqttc.
    #[error("Client connection state error: {0}")]
    ConnectionState(#[from] rumqttc::StateError),

    /// Certificate loading and other file access.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The transport double or another non-rumqttc transport failed.
    #[error("Transport error: {0}")]
    Transport(String),

    /// No response with a matching identifier arrived before the deadline.
    #[error("request timed out: method={method} id={id}")]
    Timeout { method: String, id: String },

    /// The shutdown signal fired while the request was waiting.
    #[error("operation cancelled: method={method} id={id}")]
    Cancelled { method: String, id: String },

    /// The response carried neither a `result` nor an `error` member.
    #[error("invalid command response: {0}")]
    InvalidResponse(String),

    /// A correlation identifier was registered twice.
    #[error("request id already pending: {0}")]
    DuplicateRequestId(String),

    /// The session failed and will not recover.
    #[error(transparent)]
    Fatal(#[from] FatalError),
}

impl TransferError {
    /// Returns true for the per-request timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, TransferError::Timeout { .. })
    }

    /// Returns true when the request was abandoned because of shutdown.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, TransferError::Cancelled { .. })
    }
}

impl From<rumqttc::ConnectionError> for TransferError {
    fn from(value: rumqttc::ConnectionError) -> Self {
        TransferError::ClientConnection(Box::new(value))
    }
}

impl From<serde_json::Error> for TransferError {
    fn from(value: serde_json::Error) -> Self {
        TransferError::Serialization(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_names_method_and_id() {
        let err = TransferError::Timeout {
            method: "get_temp".into(),
            id: "42".into(),
        };
        assert_eq!(err.to_string(), "request timed out: method=get_temp id=42");
        assert!(err.is_timeout());
        assert!(!err.is_cancelled());
    }

    #[test]
    fn test_cancelled_is_distinct_from_timeout() {
        let err = TransferError::Cancelled {
            method: "get_temp".into(),
            id: "42".into(),
        };
        assert!(err.is_cancelled());
        assert!(!err.is_timeout());
        assert!(err.to_string().starts_with("operation cancelled"));
    }

    #[test]
    fn test_fatal_display() {
        let err = FatalError::ReconnectTimeout {
            waited: Duration::from_secs(600),
        };
        assert_eq!(
            err.to_string(),
            "reconnect watchdog expired: no MQTT connection for 600 seconds"
        );

        let wrapped = TransferError::from(err.clone());
        assert_eq!(wrapped.to_string(), err.to_string());
    }

    #[test]
    fn test_connection_error_is_boxed() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let err = TransferError::from(rumqttc::ConnectionError::Io(io));
        assert!(matches!(err, TransferError::ClientConnection(_)));
    }
}
