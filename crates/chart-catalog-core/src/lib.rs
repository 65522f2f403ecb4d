//! Core domain models and types for the chart catalog
//!
//! This crate contains the data structures shared by the store, the sync engine
//! and the artifact pull machinery: repository identities, package records,
//! content fingerprints, pull request resources and their change events.

pub mod checksum;
pub mod error;
pub mod event;
pub mod package;
pub mod pull;
pub mod repository;
pub mod types;

// Re-exports for convenience
pub use checksum::{fingerprint, Checksum, Fingerprinter, HashAlgorithm};
pub use error::{CatalogError, Result};
pub use event::{ChangeEvent, ChangeKind};
pub use package::{
    CatalogEntry, ChartFiles, Maintainer, PackageRecord, PackageVersion, SyncMetadata,
};
pub use pull::{
    pull_request_name, PackageRef, PullCondition, PullRequest, PullRequestSpec, PullSelector,
    PullStatus, VersionPolicy,
};
pub use repository::{index_url, normalize_endpoint, Credential, Repository};
pub use types::{RecordId, RepositoryId, RepositoryKind};
