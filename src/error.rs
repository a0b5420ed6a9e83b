//! Error types for mailbox-miner
//!
//! This module provides the error taxonomy shared by every component:
//! - Request validation and credential failures (surface synchronously)
//! - Transient protocol and broker failures (logged, never fatal to a run)
//! - HTTP status code mapping for API integration
//! - Structured `{message, code, errors?}` response bodies

use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;

/// Result type alias for mailbox-miner operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for mailbox-miner
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed request or invalid connection settings
    #[error("validation error: {message}")]
    Validation {
        /// Human-readable description of the problem
        message: String,
        /// Individual field problems, when several were found
        errors: Vec<FieldError>,
    },

    /// Bad credentials or rejected OAuth token. Fatal to a mining run, never retried.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// IMAP protocol or connection error affecting a single job or folder
    #[error("IMAP error: {0}")]
    Protocol(String),

    /// Message broker append/read/publish failure
    #[error("broker error: {0}")]
    Broker(String),

    /// Unknown or already reaped mining task
    #[error("mining task not found: {0}")]
    NotFound(String),

    /// Configuration error with context about which setting is invalid
    #[error("configuration error: {message}")]
    Config {
        /// Human-readable error message describing the configuration issue
        message: String,
        /// The configuration key that caused the error (e.g., "mining.chunk_size")
        key: Option<String>,
    },

    /// Operation exceeded its deadline (connect, authenticate)
    #[error("timed out: {0}")]
    Timeout(String),

    /// Shutdown in progress - not accepting new mining tasks
    #[error("shutdown in progress: not accepting new mining tasks")]
    ShuttingDown,

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Network error talking to an OAuth provider
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// API server error
    #[error("API server error: {0}")]
    ApiServerError(String),

    /// Other error
    #[error("{0}")]
    Other(String),
}

/// A single field-level validation problem
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct FieldError {
    /// Offending field (e.g. "port")
    pub field: String,
    /// What is wrong with it
    pub message: String,
}

impl Error {
    /// Shorthand for a validation error without field details
    pub fn validation(message: impl Into<String>) -> Self {
        Error::Validation {
            message: message.into(),
            errors: Vec::new(),
        }
    }

    /// Shorthand for a validation error listing offending fields
    pub fn invalid_fields(message: impl Into<String>, errors: Vec<FieldError>) -> Self {
        Error::Validation {
            message: message.into(),
            errors,
        }
    }

    /// Whether this error means the mailbox credentials were rejected.
    ///
    /// The fetcher relies on this to decide if a failed job must cancel the
    /// whole run: only `Authentication` qualifies.
    pub fn is_authentication(&self) -> bool {
        matches!(self, Error::Authentication(_))
    }
}

impl From<async_imap::error::Error> for Error {
    fn from(err: async_imap::error::Error) -> Self {
        use async_imap::error::Error as ImapError;
        match err {
            ImapError::No(ref msg) | ImapError::Bad(ref msg)
                if looks_like_auth_failure(msg) =>
            {
                Error::Authentication(msg.clone())
            }
            other => Error::Protocol(other.to_string()),
        }
    }
}

/// Servers report credential problems inside free-form NO/BAD responses.
fn looks_like_auth_failure(message: &str) -> bool {
    let upper = message.to_ascii_uppercase();
    upper.contains("AUTHENTICATIONFAILED")
        || upper.contains("AUTHENTICATE FAILED")
        || upper.contains("INVALID CREDENTIALS")
        || upper.contains("LOGIN FAILED")
}

/// API error response format
///
/// # Example JSON Response
///
/// ```json
/// {
///   "message": "validation error: folders must not be empty",
///   "code": "validation_error",
///   "errors": [{ "field": "folders", "message": "must not be empty" }]
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ApiError {
    /// Human-readable error message
    pub message: String,

    /// Machine-readable error code (e.g., "not_found", "validation_error")
    pub code: String,

    /// Field-level problems for validation failures
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub errors: Option<Vec<FieldError>>,
}

impl ApiError {
    /// Create a new API error with code and message
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: code.into(),
            errors: None,
        }
    }

    /// Create a "not found" error
    pub fn not_found(resource: impl Into<String>) -> Self {
        Self::new("not_found", format!("{} not found", resource.into()))
    }

    /// Create an "unauthorized" error
    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new("unauthorized", message)
    }
}

/// Convert errors to HTTP status codes for API responses
pub trait ToHttpStatus {
    /// Get the HTTP status code for this error
    fn status_code(&self) -> u16;

    /// Get the machine-readable error code
    fn error_code(&self) -> &str;
}

impl ToHttpStatus for Error {
    fn status_code(&self) -> u16 {
        match self {
            // 400 Bad Request - Client error (invalid input)
            Error::Validation { .. } => 400,
            Error::Config { .. } => 400,

            // 401 Unauthorized - mailbox credentials rejected
            Error::Authentication(_) => 401,

            // 404 Not Found
            Error::NotFound(_) => 404,

            // 500 Internal Server Error - Server-side issues
            Error::Io(_) => 500,
            Error::Serialization(_) => 500,
            Error::ApiServerError(_) => 500,
            Error::Other(_) => 500,

            // 502 Bad Gateway - External service errors
            Error::Protocol(_) => 502,
            Error::Broker(_) => 502,
            Error::Network(_) => 502,

            // 503 Service Unavailable
            Error::ShuttingDown => 503,

            // 504 Gateway Timeout
            Error::Timeout(_) => 504,
        }
    }

    fn error_code(&self) -> &str {
        match self {
            Error::Validation { .. } => "validation_error",
            Error::Authentication(_) => "authentication_error",
            Error::Protocol(_) => "imap_error",
            Error::Broker(_) => "broker_error",
            Error::NotFound(_) => "not_found",
            Error::Config { .. } => "config_error",
            Error::Timeout(_) => "timeout",
            Error::ShuttingDown => "shutting_down",
            Error::Io(_) => "io_error",
            Error::Network(_) => "network_error",
            Error::Serialization(_) => "serialization_error",
            Error::ApiServerError(_) => "api_server_error",
            Error::Other(_) => "internal_error",
        }
    }
}

impl From<Error> for ApiError {
    fn from(error: Error) -> Self {
        let code = error.error_code().to_string();
        let message = error.to_string();

        let errors = match error {
            Error::Validation { errors, .. } if !errors.is_empty() => Some(errors),
            _ => None,
        };

        ApiError {
            message,
            code,
            errors,
        }
    }
}
