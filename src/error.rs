//! Error types for the provider.
//!
//! Driver errors are classified by SQL Server error number so that the host
//! sees "already exists" or "permission denied" instead of a raw TDS message.

use thiserror::Error;

/// Errors that can occur while serving a provider request.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// The requested object was not found on the server.
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// A validation error occurred.
    #[error("Validation error: {0}")]
    Validation(String),

    /// A configuration error occurred.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The requested resource type is unknown.
    #[error("Unknown resource type: {0}")]
    UnknownResource(String),

    /// An import id could not be decoded.
    #[error("Invalid resource id: {0}")]
    InvalidId(String),

    /// The object already exists (create conflict).
    #[error("Resource already exists: {0}")]
    AlreadyExists(String),

    /// Permission denied (authentication or authorization failure).
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// The server could not be reached or the pool gave up waiting.
    #[error("Service unavailable: {0}")]
    Unavailable(String),

    /// Any other error reported by SQL Server.
    #[error("Database error: {0}")]
    Database(String),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A gRPC transport error occurred.
    #[error("Transport error: {0}")]
    Transport(#[from] tonic::transport::Error),
}

impl ProviderError {
    /// Get the error message without the category prefix.
    pub fn message(&self) -> &str {
        match self {
            Self::NotFound(msg)
            | Self::Validation(msg)
            | Self::Configuration(msg)
            | Self::UnknownResource(msg)
            | Self::InvalidId(msg)
            | Self::AlreadyExists(msg)
            | Self::PermissionDenied(msg)
            | Self::Unavailable(msg)
            | Self::Database(msg) => msg,
            Self::Serialization(_) => "serialization error (see Debug output)",
            Self::Transport(_) => "transport error (see Debug output)",
        }
    }

    /// Whether this error means the target object does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Classify a SQL Server error number and message.
    pub fn from_server_error(code: u32, message: impl Into<String>) -> Self {
        let message = message.into();
        match code {
            // login/user/object/role/schema already exists
            15025 | 15023 | 2714 | 15633 | 15578 => Self::AlreadyExists(message),
            // cannot drop/find principal, object or schema
            15151 | 15007 | 15008 | 3701 | 15530 => Self::NotFound(message),
            229 | 230 | 262 | 297 | 300 | 15247 | 18456 => Self::PermissionDenied(message),
            _ => Self::Database(format!("[{}] {}", code, message)),
        }
    }
}

impl From<tiberius::error::Error> for ProviderError {
    fn from(err: tiberius::error::Error) -> Self {
        match err {
            tiberius::error::Error::Server(token) => {
                Self::from_server_error(token.code(), token.message())
            }
            tiberius::error::Error::Io { kind, message } => {
                Self::Unavailable(format!("{:?}: {}", kind, message))
            }
            other => Self::Database(other.to_string()),
        }
    }
}

impl From<bb8::RunError<ProviderError>> for ProviderError {
    fn from(err: bb8::RunError<ProviderError>) -> Self {
        match err {
            bb8::RunError::User(err) => err,
            bb8::RunError::TimedOut => {
                Self::Unavailable("timed out waiting for a pooled connection".to_string())
            }
        }
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        if err.status().map(|s| s.is_client_error()).unwrap_or(false) {
            Self::PermissionDenied(format!("Azure AD token request rejected: {}", err))
        } else {
            Self::Unavailable(format!("Azure AD token request failed: {}", err))
        }
    }
}

impl From<ProviderError> for tonic::Status {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::NotFound(msg) => tonic::Status::not_found(msg),
            ProviderError::Validation(msg) => tonic::Status::invalid_argument(msg),
            ProviderError::Configuration(msg) => tonic::Status::failed_precondition(msg),
            ProviderError::UnknownResource(msg) => tonic::Status::not_found(msg),
            ProviderError::InvalidId(msg) => tonic::Status::invalid_argument(msg),
            ProviderError::AlreadyExists(msg) => tonic::Status::already_exists(msg),
            ProviderError::PermissionDenied(msg) => tonic::Status::permission_denied(msg),
            ProviderError::Unavailable(msg) => tonic::Status::unavailable(msg),
            ProviderError::Database(msg) => tonic::Status::internal(msg),
            ProviderError::Serialization(err) => {
                tonic::Status::invalid_argument(format!("Serialization error: {}", err))
            }
            ProviderError::Transport(err) => {
                tonic::Status::unavailable(format!("Transport error: {}", err))
            }
        }
    }
}
