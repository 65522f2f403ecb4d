//! Artifact pull requests
//!
//! A pull request asks an external reconciler to materialize a package artifact
//! (a chart tarball) and report where it can be downloaded. The catalog creates
//! and observes pull requests but never changes their status.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

use crate::error::{CatalogError, Result};

/// Default reconcile interval requested on new pull requests
pub const DEFAULT_PULL_INTERVAL: &str = "10m";

const NAME_PREFIX_MAX: usize = 40;
const NAME_HASH_LEN: usize = 10;

/// Reference to a package in the catalog, as supplied by a client
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PackageRef {
    /// Namespace the owning repository lives in
    pub namespace: String,
    /// Repository name
    pub repository: String,
    /// Package name
    pub package: String,
    /// Requested version; `None` means latest
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

impl PackageRef {
    /// Parse a `repository/package` identifier within a namespace
    pub fn parse(namespace: impl Into<String>, identifier: &str) -> Result<Self> {
        let parts: Vec<&str> = identifier.split('/').collect();
        if parts.len() != 2 {
            return Err(CatalogError::InvalidPackageRef(format!(
                "identifier must be repository/package: [{}]",
                identifier
            )));
        }

        let package_ref = Self {
            namespace: namespace.into(),
            repository: parts[0].to_string(),
            package: parts[1].to_string(),
            version: None,
        };
        package_ref.validate()?;
        Ok(package_ref)
    }

    /// Request a specific version
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    /// Check that every required part is present
    pub fn validate(&self) -> Result<()> {
        if self.namespace.trim().is_empty() {
            return Err(CatalogError::InvalidPackageRef(
                "reference is missing required 'namespace' field".to_string(),
            ));
        }
        if self.repository.trim().is_empty() || self.package.trim().is_empty() {
            return Err(CatalogError::InvalidPackageRef(format!(
                "reference needs both repository and package: [{}]",
                self.identifier()
            )));
        }
        if matches!(self.version.as_deref(), Some(v) if v.trim().is_empty()) {
            return Err(CatalogError::InvalidPackageRef(
                "version cannot be blank".to_string(),
            ));
        }
        Ok(())
    }

    /// `repository/package`
    pub fn identifier(&self) -> String {
        format!("{}/{}", self.repository, self.package)
    }
}

impl fmt::Display for PackageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.namespace, self.repository, self.package)?;
        if let Some(ref version) = self.version {
            write!(f, "@{}", version)?;
        }
        Ok(())
    }
}

/// How existing pull requests are matched against a requested version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VersionPolicy {
    /// One pull request per package; the requested version is ignored
    #[default]
    AnyVersion,
    /// One pull request per package and requested version
    Exact,
}

impl FromStr for VersionPolicy {
    type Err = CatalogError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "any_version" | "any" => Ok(Self::AnyVersion),
            "exact" => Ok(Self::Exact),
            _ => Err(CatalogError::ValidationError(format!(
                "Invalid version policy: {}",
                s
            ))),
        }
    }
}

/// Desired state of a pull request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequestSpec {
    /// Source repository name
    pub repository: String,
    /// Package to pull
    pub package: String,
    /// Version to pull; `None` asks for the latest
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Reconcile interval hint for the external controller
    pub interval: String,
}

/// Reconciliation condition reported by the external controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PullCondition {
    /// Not yet reconciled
    Pending,
    /// Artifact available at `status.location`
    Ready,
    /// Reconciliation failed; see `status.message`
    Failed,
}

impl Default for PullCondition {
    fn default() -> Self {
        Self::Pending
    }
}

impl fmt::Display for PullCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Ready => write!(f, "ready"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

impl FromStr for PullCondition {
    type Err = CatalogError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "ready" => Ok(Self::Ready),
            "failed" => Ok(Self::Failed),
            _ => Err(CatalogError::ValidationError(format!(
                "Invalid pull condition: {}",
                s
            ))),
        }
    }
}

/// Observed state of a pull request
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullStatus {
    /// Current condition
    pub condition: PullCondition,
    /// Human-readable detail, mostly set on failure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Artifact location once ready
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
}

/// A pull request resource
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequest {
    /// Resource name, unique within the namespace
    pub name: String,
    /// Namespace of the resource
    pub namespace: String,
    /// Desired state
    pub spec: PullRequestSpec,
    /// Observed state
    #[serde(default)]
    pub status: PullStatus,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Monotonic version marker, bumped on every change
    #[serde(default)]
    pub resource_version: u64,
}

impl PullRequest {
    /// Build a new, not yet submitted pull request for a package reference
    pub fn for_package(package_ref: &PackageRef, policy: VersionPolicy) -> Self {
        let version = match policy {
            VersionPolicy::AnyVersion => None,
            VersionPolicy::Exact => package_ref.version.clone(),
        };

        Self {
            name: pull_request_name(package_ref, policy),
            namespace: package_ref.namespace.clone(),
            spec: PullRequestSpec {
                repository: package_ref.repository.clone(),
                package: package_ref.package.clone(),
                version,
                interval: DEFAULT_PULL_INTERVAL.to_string(),
            },
            status: PullStatus::default(),
            created_at: Utc::now(),
            resource_version: 0,
        }
    }

    /// Set the reconcile interval hint
    pub fn with_interval(mut self, interval: impl Into<String>) -> Self {
        self.spec.interval = interval.into();
        self
    }

    /// Artifact location when the request is ready and the location is populated
    pub fn ready_location(&self) -> Option<&str> {
        match self.status.condition {
            PullCondition::Ready => self
                .status
                .location
                .as_deref()
                .filter(|location| !location.is_empty()),
            _ => None,
        }
    }

    /// True when the reconciler reported failure
    pub fn is_failed(&self) -> bool {
        self.status.condition == PullCondition::Failed
    }

    /// Failure message, falling back to a generic description
    pub fn failure_message(&self) -> String {
        self.status
            .message
            .clone()
            .unwrap_or_else(|| "reconciliation failed without a message".to_string())
    }
}

/// Filter used to list and watch pull requests
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PullSelector {
    /// Namespace to look in
    pub namespace: String,
    /// Restrict to a repository
    pub repository: Option<String>,
    /// Restrict to a package
    pub package: Option<String>,
    /// Restrict to an exact requested version (`Some(None)` means "latest" requests)
    pub version: Option<Option<String>>,
    /// Restrict to a single resource name
    pub name: Option<String>,
}

impl PullSelector {
    /// Everything in a namespace
    pub fn namespace(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            ..Default::default()
        }
    }

    /// Requests equivalent to `package_ref` under `policy`
    pub fn for_package(package_ref: &PackageRef, policy: VersionPolicy) -> Self {
        Self {
            namespace: package_ref.namespace.clone(),
            repository: Some(package_ref.repository.clone()),
            package: Some(package_ref.package.clone()),
            version: match policy {
                VersionPolicy::AnyVersion => None,
                VersionPolicy::Exact => Some(package_ref.version.clone()),
            },
            name: None,
        }
    }

    /// A single named resource
    pub fn named(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: Some(name.into()),
            ..Default::default()
        }
    }

    /// Check whether a pull request satisfies this selector
    pub fn matches(&self, request: &PullRequest) -> bool {
        request.namespace == self.namespace
            && self.name.as_ref().map_or(true, |n| *n == request.name)
            && self
                .repository
                .as_ref()
                .map_or(true, |r| *r == request.spec.repository)
            && self
                .package
                .as_ref()
                .map_or(true, |p| *p == request.spec.package)
            && self
                .version
                .as_ref()
                .map_or(true, |v| *v == request.spec.version)
    }
}

/// Deterministic resource name for a package reference.
///
/// `{package}-{digest}`: the prefix keeps names readable, the digest over the full
/// identity makes two references that must share a request collide on create.
pub fn pull_request_name(package_ref: &PackageRef, policy: VersionPolicy) -> String {
    let mut key = format!(
        "{}/{}/{}",
        package_ref.namespace, package_ref.repository, package_ref.package
    );
    if policy == VersionPolicy::Exact {
        if let Some(ref version) = package_ref.version {
            key.push('@');
            key.push_str(version);
        }
    }

    let digest = format!("{:x}", Sha256::digest(key.as_bytes()));

    let mut prefix: String = package_ref
        .package
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .take(NAME_PREFIX_MAX)
        .collect();
    prefix = prefix.trim_matches('-').to_string();
    if prefix.is_empty() {
        prefix.push_str("pull");
    }

    format!("{}-{}", prefix, &digest[..NAME_HASH_LEN])
}
