//! Package records and their stored forms
//!
//! A [`PackageRecord`] is what an index decoder produces for one package of one
//! repository. A [`CatalogEntry`] is the same record as persisted by the store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

use crate::checksum::Checksum;
use crate::error::{CatalogError, Result};
use crate::types::{RecordId, RepositoryId};

/// A single published version of a package
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackageVersion {
    /// Package version (semver for Helm charts)
    pub version: String,

    /// Version of the application packaged, if declared
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_version: Option<String>,

    /// Creation time advertised by the index
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<DateTime<Utc>>,

    /// Digest advertised by the index
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,

    /// Download URLs for the artifact
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub urls: Vec<String>,
}

impl PackageVersion {
    /// Create a version entry with only the version string set
    pub fn new(version: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            app_version: None,
            created: None,
            digest: None,
            urls: Vec::new(),
        }
    }

    /// Newest-first ordering.
    ///
    /// Semver versions come first, highest first. Anything unparseable follows,
    /// ordered by creation time and then by text.
    pub fn newest_first(a: &PackageVersion, b: &PackageVersion) -> Ordering {
        match (
            semver::Version::parse(a.version.trim_start_matches('v')),
            semver::Version::parse(b.version.trim_start_matches('v')),
        ) {
            (Ok(va), Ok(vb)) => vb.cmp(&va).then_with(|| b.version.cmp(&a.version)),
            (Ok(_), Err(_)) => Ordering::Less,
            (Err(_), Ok(_)) => Ordering::Greater,
            (Err(_), Err(_)) => b
                .created
                .cmp(&a.created)
                .then_with(|| b.version.cmp(&a.version)),
        }
    }
}

/// Package maintainer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Maintainer {
    /// Maintainer name
    pub name: String,
    /// Optional contact email
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

/// A package decoded from a repository index
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackageRecord {
    /// Stable record identifier
    pub id: RecordId,

    /// Owning repository
    pub repository: RepositoryId,

    /// Package name as it appears in the index
    pub name: String,

    /// Short description of the latest version
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Project home page
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub home: Option<String>,

    /// Icon reference
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,

    /// Category annotation, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,

    /// Search keywords
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub keywords: Vec<String>,

    /// Maintainers
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub maintainers: Vec<Maintainer>,

    /// Source code locations
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<String>,

    /// Published versions, newest first; never empty for a valid record
    pub versions: Vec<PackageVersion>,

    /// Arbitrary structured metadata carried through from the index
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl PackageRecord {
    /// Create a record for `name` in `repository` with the given versions
    pub fn new(repository: RepositoryId, name: impl Into<String>, versions: Vec<PackageVersion>) -> Self {
        let name = name.into();
        let mut record = Self {
            id: repository.record_id(&name),
            repository,
            name,
            description: None,
            home: None,
            icon: None,
            category: None,
            keywords: Vec::new(),
            maintainers: Vec::new(),
            sources: Vec::new(),
            versions,
            metadata: serde_json::Value::Null,
        };
        record.sort_versions();
        record
    }

    /// Sort versions newest first
    pub fn sort_versions(&mut self) {
        self.versions.sort_by(PackageVersion::newest_first);
    }

    /// Latest published version, if any
    pub fn latest_version(&self) -> Option<&PackageVersion> {
        self.versions.first()
    }

    /// Check structural invariants
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(CatalogError::InvalidRecord {
                id: self.id.to_string(),
                reason: "name is empty".to_string(),
            });
        }

        if self.versions.is_empty() {
            return Err(CatalogError::InvalidRecord {
                id: self.id.to_string(),
                reason: "record has no versions".to_string(),
            });
        }

        if self.id != self.repository.record_id(&self.name) {
            return Err(CatalogError::InvalidRecord {
                id: self.id.to_string(),
                reason: format!("id does not match repository {}", self.repository),
            });
        }

        Ok(())
    }
}

/// Stored form of a package record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogEntry {
    /// Record identifier, the storage key
    pub id: RecordId,

    /// Owning repository
    pub repository: RepositoryId,

    /// The record itself, stored as an opaque document
    pub record: PackageRecord,
}

impl CatalogEntry {
    /// Serialize the record into the stored document form
    pub fn document(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(&self.record)?)
    }

    /// Rebuild an entry from a stored document
    pub fn from_document(document: serde_json::Value) -> Result<Self> {
        let record: PackageRecord = serde_json::from_value(document)?;
        Ok(Self::from(record))
    }
}

impl From<PackageRecord> for CatalogEntry {
    fn from(record: PackageRecord) -> Self {
        Self {
            id: record.id.clone(),
            repository: record.repository.clone(),
            record,
        }
    }
}

/// Auxiliary files cached for one version of a package
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChartFiles {
    /// Owning record
    pub record_id: RecordId,

    /// Owning repository
    pub repository: RepositoryId,

    /// Version the files belong to
    pub version: String,

    /// README contents
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub readme: Option<String>,

    /// Default values file contents
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub values: Option<String>,

    /// Values JSON schema contents
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,
}

/// Bookkeeping written after a successful publish
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncMetadata {
    /// Repository the metadata belongs to
    pub repository: RepositoryId,

    /// Fingerprint of the index that produced the stored entries
    pub checksum: Checksum,

    /// Time of the last successful publish
    pub last_update: DateTime<Utc>,
}
