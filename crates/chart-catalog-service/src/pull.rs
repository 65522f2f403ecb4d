//! Artifact pull coordination
//!
//! Resolving a package reference to a downloadable artifact means finding (or
//! creating) the pull request for it and waiting for the reconciler to settle it.
//! Request names are deterministic, so concurrent resolves of the same reference
//! collide on create and end up sharing one request.

use chart_catalog_core::{
    PackageRef, PullCondition, PullRequest, PullSelector, VersionPolicy,
};
use chart_catalog_core::pull::DEFAULT_PULL_INTERVAL;
use chart_catalog_db::{DbError, PullRequestStore};
use std::sync::Arc;
use tracing::{debug, info, instrument};

use crate::error::{ServiceError, ServiceResult};
use crate::waiter::ArtifactReadyWaiter;

/// Pull coordination settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullConfig {
    /// How a requested version is matched against existing pull requests
    pub version_policy: VersionPolicy,
    /// Reconcile interval requested on new pull requests
    pub interval: String,
}

impl Default for PullConfig {
    fn default() -> Self {
        Self {
            version_policy: VersionPolicy::AnyVersion,
            interval: DEFAULT_PULL_INTERVAL.to_string(),
        }
    }
}

/// Resolves package references to artifact locations
pub struct ArtifactPullCoordinator {
    requests: Arc<dyn PullRequestStore>,
    waiter: ArtifactReadyWaiter,
    config: PullConfig,
}

impl ArtifactPullCoordinator {
    /// Create a coordinator
    pub fn new(
        requests: Arc<dyn PullRequestStore>,
        waiter: ArtifactReadyWaiter,
        config: PullConfig,
    ) -> Self {
        Self {
            requests,
            waiter,
            config,
        }
    }

    /// Active configuration
    pub fn config(&self) -> &PullConfig {
        &self.config
    }

    /// Resolve `identifier` (`repository/package`) in `namespace`
    pub async fn resolve_identifier(
        &self,
        namespace: &str,
        identifier: &str,
        version: Option<&str>,
    ) -> ServiceResult<String> {
        let mut package_ref = PackageRef::parse(namespace, identifier)?;
        if let Some(version) = version {
            package_ref = package_ref.with_version(version);
            package_ref.validate()?;
        }
        self.resolve(&package_ref).await
    }

    /// Resolve a package reference to its artifact location.
    ///
    /// Reuses a matching pull request when one exists, otherwise creates one, and
    /// waits until it is ready.
    ///
    /// # Errors
    ///
    /// - `Validation` for a malformed reference
    /// - `ReconciliationFailure` when the matching request failed
    /// - `TransientIo` when the store or change stream fails
    #[instrument(skip(self), fields(package = %package_ref))]
    pub async fn resolve(&self, package_ref: &PackageRef) -> ServiceResult<String> {
        package_ref.validate()?;

        let policy = self.config.version_policy;
        let selector = PullSelector::for_package(package_ref, policy);
        let existing = self.requests.list(&selector).await?;

        let request = match pick_existing(existing) {
            Some(request) => {
                debug!(name = %request.name, condition = %request.status.condition, "Reusing pull request");
                request
            }
            None => self.create_or_adopt(package_ref).await?,
        };

        if let Some(location) = request.ready_location() {
            return Ok(location.to_string());
        }
        if request.is_failed() {
            return Err(ServiceError::ReconciliationFailed {
                name: request.name.clone(),
                message: request.failure_message(),
            });
        }

        self.waiter.wait(&request).await
    }

    async fn create_or_adopt(&self, package_ref: &PackageRef) -> ServiceResult<PullRequest> {
        let request = PullRequest::for_package(package_ref, self.config.version_policy)
            .with_interval(self.config.interval.clone());
        let (namespace, name) = (request.namespace.clone(), request.name.clone());

        match self.requests.create(request).await {
            Ok(created) => {
                info!(name = %created.name, "Pull request created");
                Ok(created)
            }
            Err(DbError::AlreadyExists(_)) | Err(DbError::UniqueViolation(_)) => {
                debug!(name = %name, "Pull request created concurrently, adopting it");
                self.requests.get(&namespace, &name).await?.ok_or_else(|| {
                    ServiceError::Conflict(format!(
                        "pull request {}/{} was removed while being adopted",
                        namespace, name
                    ))
                })
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Best candidate among matching requests: ready, then pending, then failed
fn pick_existing(mut requests: Vec<PullRequest>) -> Option<PullRequest> {
    requests.sort_by_key(|request| match request.status.condition {
        PullCondition::Ready if request.ready_location().is_some() => 0,
        PullCondition::Ready | PullCondition::Pending => 1,
        PullCondition::Failed => 2,
    });
    requests.into_iter().next()
}
