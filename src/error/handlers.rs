//! Standardized mapping from HTTP failures to replication errors

use crate::error::ReplicationError;
use reqwest::StatusCode;

/// Standard error handler for HTTP responses
pub struct HttpErrorHandler;

impl HttpErrorHandler {
    /// Map a non-success registry response to the replication taxonomy
    pub fn handle_registry_error(
        status: StatusCode,
        error_text: &str,
        operation: &str,
        endpoint: &str,
    ) -> ReplicationError {
        match status.as_u16() {
            401 => ReplicationError::auth_fatal(
                endpoint,
                format!("unauthorized to perform {}: {}", operation, error_text),
            ),
            403 => ReplicationError::auth_fatal(
                endpoint,
                format!(
                    "forbidden: insufficient permissions for {}: {}",
                    operation, error_text
                ),
            ),
            404 => ReplicationError::NotFound(format!("{} on {}: {}", operation, endpoint, error_text)),
            400 if error_text.contains("DIGEST_INVALID") => ReplicationError::DigestMismatch {
                expected: operation.to_string(),
                actual: "rejected by registry".to_string(),
            },
            408 | 429 | 500..=599 => ReplicationError::Registry {
                status: status.as_u16(),
                message: format!("{} failed on {}: {}", operation, endpoint, error_text),
            },
            code => ReplicationError::Registry {
                status: code,
                message: format!("{} failed (status {}): {}", operation, status, error_text),
            },
        }
    }

    /// Map a token service response: client errors are credential problems,
    /// server errors may clear up on their own
    pub fn handle_auth_error(status: StatusCode, error_text: &str, endpoint: &str) -> ReplicationError {
        let message = match status.as_u16() {
            400 => "Invalid token request parameters".to_string(),
            401 => "Invalid credentials provided".to_string(),
            403 => "Access denied - insufficient permissions".to_string(),
            404 => "Authentication endpoint not found".to_string(),
            _ => format!("Authentication failed (status {}): {}", status, error_text),
        };

        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            ReplicationError::auth_retryable(endpoint, message)
        } else {
            ReplicationError::auth_fatal(endpoint, message)
        }
    }
}

/// Network error categorization and handling
pub struct NetworkErrorHandler;

impl NetworkErrorHandler {
    /// Categorize and format network errors with helpful context
    pub fn handle_network_error(error: &reqwest::Error, context: &str) -> ReplicationError {
        if let Some(status) = error.status() {
            return HttpErrorHandler::handle_registry_error(status, &error.to_string(), context, "");
        }

        if error.is_timeout() {
            ReplicationError::Network(format!("{} timeout: {}", context, error))
        } else if error.is_connect() {
            ReplicationError::Network(format!("Connection error during {}: {}", context, error))
        } else if error.is_decode() {
            ReplicationError::Serialization(format!("{} response decode error: {}", context, error))
        } else if error.to_string().contains("certificate") {
            ReplicationError::Network(format!(
                "TLS certificate error during {}: {}",
                context, error
            ))
        } else {
            ReplicationError::Network(format!("{} network error: {}", context, error))
        }
    }
}
