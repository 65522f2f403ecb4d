//! Core type definitions

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{CatalogError, Result};

/// Identity of a package repository: a name scoped to a namespace
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RepositoryId {
    /// Namespace owning the repository
    pub namespace: String,
    /// Repository name, unique within the namespace
    pub name: String,
}

impl RepositoryId {
    /// Create a repository identity, rejecting empty or slash-containing parts
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Result<Self> {
        let namespace = namespace.into();
        let name = name.into();

        for (field, value) in [("namespace", &namespace), ("name", &name)] {
            if value.trim().is_empty() {
                return Err(CatalogError::InvalidIdentifier(format!(
                    "repository {} cannot be empty",
                    field
                )));
            }
            if value.contains('/') {
                return Err(CatalogError::InvalidIdentifier(format!(
                    "repository {} cannot contain '/': {}",
                    field, value
                )));
            }
        }

        Ok(Self { namespace, name })
    }

    /// Record ID for a package published by this repository
    pub fn record_id(&self, package: &str) -> RecordId {
        RecordId(format!("{}/{}/{}", self.namespace, self.name, package))
    }
}

impl fmt::Display for RepositoryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Stable, globally unique identifier of a catalog entry.
///
/// Rendered as `namespace/repository/package`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(String);

impl RecordId {
    /// Borrow the string form
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Package identifier within its namespace (`repository/package`)
    pub fn package_identifier(&self) -> &str {
        self.0.split_once('/').map(|(_, rest)| rest).unwrap_or(&self.0)
    }
}

impl FromStr for RecordId {
    type Err = CatalogError;

    fn from_str(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.split('/').collect();
        if parts.len() != 3 || parts.iter().any(|p| p.is_empty()) {
            return Err(CatalogError::InvalidIdentifier(format!(
                "record id must be namespace/repository/package: {}",
                s
            )));
        }
        Ok(Self(s.to_string()))
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Source format of a repository, used to select fetch/decode backends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepositoryKind {
    /// Classic Helm repository serving `index.yaml`
    Helm,
    /// OCI registry hosting charts as artifacts
    Oci,
}

impl Default for RepositoryKind {
    fn default() -> Self {
        Self::Helm
    }
}

impl fmt::Display for RepositoryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Helm => write!(f, "helm"),
            Self::Oci => write!(f, "oci"),
        }
    }
}

impl FromStr for RepositoryKind {
    type Err = CatalogError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "helm" => Ok(Self::Helm),
            "oci" => Ok(Self::Oci),
            _ => Err(CatalogError::ValidationError(format!(
                "Invalid repository kind: {}",
                s
            ))),
        }
    }
}
