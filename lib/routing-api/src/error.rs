use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, RoutingError>;

/// Every failure the storage and migration layers surface to a caller.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RoutingError {
    #[error("Cannot process request: {0}")]
    ProcessRequest(String),

    #[error("Route not found: {0}")]
    NotFound(String),

    #[error("Revision conflict: {0}")]
    Conflict(String),

    #[error("Backend communication error: {0}")]
    Communication(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Migration lock not available within {0:?}")]
    LockTimeout(Duration),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl RoutingError {
    /// Wire-level kind of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            RoutingError::ProcessRequest(_) => ErrorKind::ProcessRequest,
            RoutingError::NotFound(_) => ErrorKind::ResourceNotFound,
            RoutingError::Conflict(_) => ErrorKind::DbConflict,
            RoutingError::Communication(_) => ErrorKind::DbCommunication,
            RoutingError::Unauthorized(_) => ErrorKind::Unauthorized,
            RoutingError::LockTimeout(_) => ErrorKind::LockTimeout,
            RoutingError::Internal(_) => ErrorKind::Unknown,
        }
    }

    /// Whether repeating the same call can succeed without any change by the caller
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RoutingError::Communication(_) | RoutingError::LockTimeout(_)
        )
    }
}

impl From<serde_json::Error> for RoutingError {
    fn from(err: serde_json::Error) -> Self {
        RoutingError::Internal(format!("serialization error: {}", err))
    }
}

/// Error names as they appear in API responses
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    #[serde(rename = "ProcessRequestError")]
    ProcessRequest,
    #[serde(rename = "ResourceNotFoundError")]
    ResourceNotFound,
    #[serde(rename = "DBConflictError")]
    DbConflict,
    #[serde(rename = "DBCommunicationError")]
    DbCommunication,
    #[serde(rename = "UnauthorizedError")]
    Unauthorized,
    #[serde(rename = "LockTimeoutError")]
    LockTimeout,
    #[serde(rename = "UnknownError")]
    Unknown,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::ProcessRequest => "ProcessRequestError",
            ErrorKind::ResourceNotFound => "ResourceNotFoundError",
            ErrorKind::DbConflict => "DBConflictError",
            ErrorKind::DbCommunication => "DBCommunicationError",
            ErrorKind::Unauthorized => "UnauthorizedError",
            ErrorKind::LockTimeout => "LockTimeoutError",
            ErrorKind::Unknown => "UnknownError",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// JSON body returned to API clients on failure
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiError {
    pub name: ErrorKind,
    pub message: String,
}

impl From<&RoutingError> for ApiError {
    fn from(err: &RoutingError) -> Self {
        Self {
            name: err.kind(),
            message: err.to_string(),
        }
    }
}
