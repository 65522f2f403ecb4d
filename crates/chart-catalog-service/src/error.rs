//! Service-layer error types
//!
//! Every error carries its [`ErrorKind`] from the point where it is raised, so
//! callers decide on retries by kind instead of by message.

use chart_catalog_core::CatalogError;
use chart_catalog_db::DbError;
use std::fmt;
use thiserror::Error;

/// Result type alias for service operations
pub type ServiceResult<T> = std::result::Result<T, ServiceError>;

/// Coarse classification of a service error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Bad input; retrying will not help
    Validation,
    /// Network, storage or stream trouble; the caller may retry
    TransientIo,
    /// A resource with the same name already exists
    Conflict,
    /// The external reconciler reported failure
    ReconciliationFailure,
    /// The requested resource does not exist
    NotFound,
    /// Anything else
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Validation => "validation",
            ErrorKind::TransientIo => "transient_io",
            ErrorKind::Conflict => "conflict",
            ErrorKind::ReconciliationFailure => "reconciliation_failure",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Internal => "internal",
        };
        f.write_str(name)
    }
}

/// Service-layer error types
#[derive(Error, Debug)]
pub enum ServiceError {
    /// Input failed validation
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Fetching from a repository endpoint failed
    #[error("Fetch of {url} failed: {message}")]
    Fetch { url: String, message: String },

    /// The store is temporarily unavailable
    #[error("Storage unavailable: {0}")]
    Storage(String),

    /// The change stream ended before the watched resource settled
    #[error("Change stream closed while waiting for {0}")]
    StreamClosed(String),

    /// The change stream reported an error
    #[error("Change stream error: {0}")]
    Stream(String),

    /// Name collision
    #[error("Conflict: {0}")]
    Conflict(String),

    /// The reconciler marked a pull request as failed
    #[error("Pull request {name} failed: {message}")]
    ReconciliationFailed { name: String, message: String },

    /// Resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Internal service error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ServiceError {
    /// Classification of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            ServiceError::Validation(_) => ErrorKind::Validation,
            ServiceError::Fetch { .. }
            | ServiceError::Storage(_)
            | ServiceError::StreamClosed(_)
            | ServiceError::Stream(_) => ErrorKind::TransientIo,
            ServiceError::Conflict(_) => ErrorKind::Conflict,
            ServiceError::ReconciliationFailed { .. } => ErrorKind::ReconciliationFailure,
            ServiceError::NotFound(_) => ErrorKind::NotFound,
            ServiceError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Whether the caller may retry the operation unchanged
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::TransientIo
    }
}

impl From<CatalogError> for ServiceError {
    fn from(err: CatalogError) -> Self {
        match err {
            CatalogError::InvalidEndpoint(_)
            | CatalogError::InvalidPackageRef(_)
            | CatalogError::InvalidIdentifier(_)
            | CatalogError::InvalidChecksum(_)
            | CatalogError::InvalidVersion(_)
            | CatalogError::InvalidRecord { .. }
            | CatalogError::ValidationError(_) => ServiceError::Validation(err.to_string()),
            CatalogError::SerializationError(_) | CatalogError::IoError(_) => {
                ServiceError::Internal(err.to_string())
            }
        }
    }
}

impl From<DbError> for ServiceError {
    fn from(err: DbError) -> Self {
        match err {
            DbError::NotFound(msg) => ServiceError::NotFound(msg),
            DbError::AlreadyExists(msg) | DbError::UniqueViolation(msg) => {
                ServiceError::Conflict(msg)
            }
            DbError::NoRecords(msg) => {
                ServiceError::Validation(format!("no records to publish: {}", msg))
            }
            DbError::ConstraintViolation(msg) => ServiceError::Validation(msg),
            DbError::Connection(msg) | DbError::Pool(msg) | DbError::Transaction(msg) => {
                ServiceError::Storage(msg)
            }
            DbError::Feed(msg) => ServiceError::Stream(msg),
            DbError::Domain(err) => ServiceError::from(err),
            DbError::Query(msg)
            | DbError::Migration(msg)
            | DbError::InvalidData(msg)
            | DbError::Serialization(msg)
            | DbError::Configuration(msg)
            | DbError::Internal(msg) => ServiceError::Internal(msg),
        }
    }
}

impl From<serde_json::Error> for ServiceError {
    fn from(err: serde_json::Error) -> Self {
        ServiceError::Internal(format!("Serialization error: {}", err))
    }
}
