//! Error types for the chart catalog domain

use thiserror::Error;

/// Result type alias for catalog domain operations
pub type Result<T> = std::result::Result<T, CatalogError>;

/// Main error type for catalog domain operations
#[derive(Error, Debug)]
pub enum CatalogError {
    /// Repository endpoint is not a usable absolute URL
    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),

    /// Package reference could not be parsed
    #[error("Invalid package reference: {0}")]
    InvalidPackageRef(String),

    /// Identifier (repository, record, resource name) is malformed
    #[error("Invalid identifier: {0}")]
    InvalidIdentifier(String),

    /// Checksum string is malformed or uses an unknown algorithm
    #[error("Invalid checksum: {0}")]
    InvalidChecksum(String),

    /// Invalid version format
    #[error("Invalid version: {0}")]
    InvalidVersion(String),

    /// Package record violates a structural invariant
    #[error("Invalid package record {id}: {reason}")]
    InvalidRecord { id: String, reason: String },

    /// Validation error
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// Serialization/Deserialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// IO error
    #[error("IO error: {0}")]
    IoError(String),
}

impl From<serde_json::Error> for CatalogError {
    fn from(err: serde_json::Error) -> Self {
        CatalogError::SerializationError(err.to_string())
    }
}

impl From<semver::Error> for CatalogError {
    fn from(err: semver::Error) -> Self {
        CatalogError::InvalidVersion(err.to_string())
    }
}

impl From<url::ParseError> for CatalogError {
    fn from(err: url::ParseError) -> Self {
        CatalogError::InvalidEndpoint(err.to_string())
    }
}

impl From<std::io::Error> for CatalogError {
    fn from(err: std::io::Error) -> Self {
        CatalogError::IoError(err.to_string())
    }
}
