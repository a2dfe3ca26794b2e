//! Error types for replication operations
//!
//! Every failure the engine can produce is a [`ReplicationError`]. The
//! variants follow the replication taxonomy: authentication failures are
//! split into fatal and retryable, network failures are always retryable,
//! and integrity or checkpoint failures are never retried automatically.

pub mod handlers;

use serde::{Deserialize, Serialize};
use std::fmt;

pub type Result<T> = std::result::Result<T, ReplicationError>;

/// Whether an authentication failure can be retried
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthFailure {
    /// Bad credentials or missing permissions
    Fatal,
    /// The token service could not be reached or answered with a server error
    Retryable,
}

impl fmt::Display for AuthFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthFailure::Fatal => f.write_str("fatal"),
            AuthFailure::Retryable => f.write_str("retryable"),
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ReplicationError {
    /// Authentication against a registry endpoint failed
    #[error("Authentication error ({kind}) for {endpoint}: {message}")]
    Auth {
        endpoint: String,
        kind: AuthFailure,
        message: String,
    },

    /// Transport level failure, always retryable
    #[error("Network error: {0}")]
    Network(String),

    /// Bytes received did not hash to the declared digest
    #[error("Digest mismatch: expected {expected}, computed {actual}")]
    DigestMismatch { expected: String, actual: String },

    /// The referenced repository, manifest or blob does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// A trigger was skipped or queued because a run is already active
    #[error("Job {job_id} already has an active run")]
    SchedulerConflict { job_id: String },

    /// Checkpoint records are inconsistent; resuming would be a guess
    #[error("Checkpoint corruption at {key}: {reason}")]
    CheckpointCorruption { key: String, reason: String },

    /// Registry answered with an unexpected status
    #[error("Registry error (status {status}): {message}")]
    Registry { status: u16, message: String },

    #[error("Invalid digest: {0}")]
    InvalidDigest(String),

    #[error("Invalid image reference: {0}")]
    InvalidReference(String),

    #[error("Invalid schedule expression: {0}")]
    InvalidSchedule(String),

    /// Manifest document could not be interpreted
    #[error("Manifest error: {0}")]
    Manifest(String),

    /// Key-value persistence failed
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Operation was cancelled through its cancellation token
    #[error("Operation cancelled")]
    Cancelled,

    /// Backend does not offer the requested capability
    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    /// A worker task panicked or the engine reached an impossible state
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Serializable summary of [`ReplicationError`] used in job outcomes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    AuthFatal,
    AuthRetryable,
    Network,
    DigestMismatch,
    NotFound,
    SchedulerConflict,
    CheckpointCorruption,
    Registry,
    InvalidInput,
    Manifest,
    Storage,
    Configuration,
    Cancelled,
    Unsupported,
    Io,
    Internal,
}

impl ReplicationError {
    pub fn auth_fatal(endpoint: impl Into<String>, message: impl Into<String>) -> Self {
        ReplicationError::Auth {
            endpoint: endpoint.into(),
            kind: AuthFailure::Fatal,
            message: message.into(),
        }
    }

    pub fn auth_retryable(endpoint: impl Into<String>, message: impl Into<String>) -> Self {
        ReplicationError::Auth {
            endpoint: endpoint.into(),
            kind: AuthFailure::Retryable,
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            ReplicationError::Auth {
                kind: AuthFailure::Fatal,
                ..
            } => ErrorKind::AuthFatal,
            ReplicationError::Auth {
                kind: AuthFailure::Retryable,
                ..
            } => ErrorKind::AuthRetryable,
            ReplicationError::Network(_) => ErrorKind::Network,
            ReplicationError::DigestMismatch { .. } => ErrorKind::DigestMismatch,
            ReplicationError::NotFound(_) => ErrorKind::NotFound,
            ReplicationError::SchedulerConflict { .. } => ErrorKind::SchedulerConflict,
            ReplicationError::CheckpointCorruption { .. } => ErrorKind::CheckpointCorruption,
            ReplicationError::Registry { .. } => ErrorKind::Registry,
            ReplicationError::InvalidDigest(_)
            | ReplicationError::InvalidReference(_)
            | ReplicationError::InvalidSchedule(_) => ErrorKind::InvalidInput,
            ReplicationError::Manifest(_) | ReplicationError::Serialization(_) => {
                ErrorKind::Manifest
            }
            ReplicationError::Storage(_) => ErrorKind::Storage,
            ReplicationError::Configuration(_) => ErrorKind::Configuration,
            ReplicationError::Cancelled => ErrorKind::Cancelled,
            ReplicationError::Unsupported(_) => ErrorKind::Unsupported,
            ReplicationError::Io(_) => ErrorKind::Io,
            ReplicationError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Transient failures worth another attempt after a backoff
    pub fn is_retryable(&self) -> bool {
        match self {
            ReplicationError::Network(_) => true,
            ReplicationError::Auth { kind, .. } => *kind == AuthFailure::Retryable,
            ReplicationError::Registry { status, .. } => {
                *status == 408 || *status == 429 || *status >= 500
            }
            _ => false,
        }
    }

    /// Failures that abort a whole job run rather than a single image
    pub fn aborts_run(&self) -> bool {
        matches!(
            self,
            ReplicationError::Auth {
                kind: AuthFailure::Fatal,
                ..
            }
        )
    }
}

impl From<std::io::Error> for ReplicationError {
    fn from(err: std::io::Error) -> Self {
        ReplicationError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for ReplicationError {
    fn from(err: serde_json::Error) -> Self {
        ReplicationError::Serialization(err.to_string())
    }
}

impl From<reqwest::Error> for ReplicationError {
    fn from(err: reqwest::Error) -> Self {
        handlers::NetworkErrorHandler::handle_network_error(&err, "registry request")
    }
}

impl From<url::ParseError> for ReplicationError {
    fn from(err: url::ParseError) -> Self {
        ReplicationError::Configuration(format!("invalid URL: {}", err))
    }
}

impl From<std::string::FromUtf8Error> for ReplicationError {
    fn from(err: std::string::FromUtf8Error) -> Self {
        ReplicationError::Serialization(format!("UTF-8 conversion error: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_classification() {
        assert!(ReplicationError::Network("reset".into()).is_retryable());
        assert!(ReplicationError::auth_retryable("r", "503").is_retryable());
        assert!(!ReplicationError::auth_fatal("r", "denied").is_retryable());
        assert!(
            ReplicationError::Registry {
                status: 503,
                message: "busy".into()
            }
            .is_retryable()
        );
        assert!(
            !ReplicationError::DigestMismatch {
                expected: "a".into(),
                actual: "b".into()
            }
            .is_retryable()
        );
    }

    #[test]
    fn test_only_fatal_auth_aborts_run() {
        assert!(ReplicationError::auth_fatal("r", "denied").aborts_run());
        assert!(!ReplicationError::NotFound("repo".into()).aborts_run());
        assert!(!ReplicationError::auth_retryable("r", "503").aborts_run());
    }
}
