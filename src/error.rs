//! Error types for the SDS control plane
//!
//! Provides structured error types for request intake, the resource ledger,
//! remote dispatch, and cross-cluster replication.

use thiserror::Error;

/// Unified error type for the control plane
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Request Errors
    // =========================================================================
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Resource not found: {kind}/{id}")]
    NotFound { kind: String, id: String },

    #[error("Resource already exists: {kind}/{id}")]
    AlreadyExists { kind: String, id: String },

    #[error("Operation already in flight for {kind}/{id}: {operation}")]
    Conflict {
        kind: String,
        id: String,
        operation: String,
    },

    #[error("Invalid status transition for {kind}/{id}: {from} -> {to}")]
    InvalidTransition {
        kind: String,
        id: String,
        from: String,
        to: String,
    },

    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    // =========================================================================
    // Remote Executor Errors
    // =========================================================================
    #[error("Executor connection failed: {endpoint}: {reason}")]
    ExecutorConnect { endpoint: String, reason: String },

    #[error("Executor not connected")]
    ExecutorNotConnected,

    #[error("Executor operation failed: {operation}: {reason}")]
    ExecutorOperation { operation: String, reason: String },

    #[error("Executor HTTP error: {0}")]
    ExecutorHttp(#[from] reqwest::Error),

    // =========================================================================
    // Replication Errors
    // =========================================================================
    #[error("Remote session failed: {host}: {reason}")]
    Transport { host: String, reason: String },

    #[error("Replication step failed on {side} cluster: {step}: {reason}")]
    ReplicationStep {
        side: String,
        step: String,
        reason: String,
    },

    #[error("Credential error: {0}")]
    Credential(String),

    // =========================================================================
    // Parse Errors
    // =========================================================================
    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("YAML parse error: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    // =========================================================================
    // IO Errors
    // =========================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Error taxonomy surfaced to callers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed input or invalid target state
    BadRequest,
    /// Unknown resource id
    NotFound,
    /// Another mutating operation holds the resource
    Conflict,
    /// Ledger or backend failure
    InternalServer,
    /// Session or connect failure to an agent or replication peer
    Transport,
}

impl ErrorKind {
    /// Short machine-readable code used in API error bodies
    pub fn code(&self) -> &'static str {
        match self {
            ErrorKind::BadRequest => "bad_request",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Conflict => "conflict",
            ErrorKind::InternalServer => "internal_error",
            ErrorKind::Transport => "transport_error",
        }
    }
}

impl Error {
    /// Classify this error into the caller-facing taxonomy
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::BadRequest(_)
            | Error::InvalidTransition { .. }
            | Error::AlreadyExists { .. } => ErrorKind::BadRequest,

            Error::NotFound { .. } => ErrorKind::NotFound,

            Error::Conflict { .. } => ErrorKind::Conflict,

            Error::ExecutorConnect { .. } | Error::Transport { .. } => ErrorKind::Transport,

            Error::Internal(_)
            | Error::Configuration(_)
            | Error::ExecutorNotConnected
            | Error::ExecutorOperation { .. }
            | Error::ExecutorHttp(_)
            | Error::ReplicationStep { .. }
            | Error::Credential(_)
            | Error::JsonParse(_)
            | Error::YamlParse(_)
            | Error::Io(_) => ErrorKind::InternalServer,
        }
    }

    /// Shorthand for a not-found error
    pub fn not_found(kind: &str, id: &str) -> Self {
        Error::NotFound {
            kind: kind.to_string(),
            id: id.to_string(),
        }
    }

    /// Check if this error was caused by a remote peer being unreachable
    pub fn is_transport(&self) -> bool {
        self.kind() == ErrorKind::Transport
    }
}

/// Result type alias for the control plane
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        let err = Error::BadRequest("size must be positive".into());
        assert_eq!(err.kind(), ErrorKind::BadRequest);

        let err = Error::not_found("Volume", "vol-1");
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(err.to_string(), "Resource not found: Volume/vol-1");

        let err = Error::Conflict {
            kind: "Volume".into(),
            id: "vol-1".into(),
            operation: "extend".into(),
        };
        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert_eq!(err.kind().code(), "conflict");
    }

    #[test]
    fn test_transport_classification() {
        let err = Error::Transport {
            host: "10.0.0.2:22".into(),
            reason: "connection refused".into(),
        };
        assert!(err.is_transport());

        let err = Error::ReplicationStep {
            side: "primary".into(),
            step: "demote".into(),
            reason: "exit status 1".into(),
        };
        assert!(!err.is_transport());
        assert_eq!(err.kind(), ErrorKind::InternalServer);
    }

    #[test]
    fn test_json_errors_are_internal() {
        let err: Error = serde_json::from_slice::<u64>(b"not json")
            .unwrap_err()
            .into();
        assert_eq!(err.kind(), ErrorKind::InternalServer);
    }
}
