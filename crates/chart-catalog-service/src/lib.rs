//! Service layer for the chart catalog
//!
//! This crate sits between the stores and the daemon. It implements the sync
//! engine that mirrors repository indexes into the catalog, and the pull
//! machinery that turns a package reference into a ready artifact location.
//!
//! # Architecture
//!
//! - **RepositorySyncer**: fetch, fingerprint, decode and publish one repository
//! - **ArtifactPullCoordinator**: find or create the pull request for a package
//! - **ArtifactReadyWaiter**: block on the change feed until a request settles
//! - **CatalogReader**: queries over published entries
//!
//! [`CatalogServices`] wires them together over shared stores.
//!
//! # Example
//!
//! ```rust,no_run
//! use chart_catalog_service::CatalogServicesBuilder;
//! use chart_catalog_db::{InMemoryCatalogStore, InMemoryPullRequests};
//! use std::sync::Arc;
//!
//! # fn example() -> chart_catalog_service::ServiceResult<()> {
//! let requests = Arc::new(InMemoryPullRequests::new());
//! let services = CatalogServicesBuilder::new()
//!     .catalog_store(Arc::new(InMemoryCatalogStore::new()))
//!     .pull_requests(requests.clone())
//!     .change_feed(requests)
//!     .build()?;
//! # let _ = services;
//! # Ok(())
//! # }
//! ```

pub mod catalog;
pub mod error;
pub mod pull;
pub mod source;
pub mod sync;
pub mod waiter;

pub use catalog::CatalogReader;
pub use error::{ErrorKind, ServiceError, ServiceResult};
pub use pull::{ArtifactPullCoordinator, PullConfig};
pub use source::{
    Fetcher, HelmIndexDecoder, HttpFetcher, IndexDecoder, SourceBackend, SourceBackends,
    DEFAULT_FETCH_TIMEOUT,
};
pub use sync::{RepositorySyncer, SyncOutcome, SyncReport, DEFAULT_SYNC_CONCURRENCY};
pub use waiter::{ArtifactReadyWaiter, WaitState};

use chart_catalog_core::{PackageRef, Repository, RepositoryId};
use chart_catalog_db::{CatalogStore, ChangeFeed, PullRequestStore};
use std::sync::Arc;
use tracing::instrument;

/// Shared service context built once by the process entry point
#[derive(Clone)]
pub struct CatalogServices {
    store: Arc<dyn CatalogStore>,
    syncer: Arc<RepositorySyncer>,
    pulls: Arc<ArtifactPullCoordinator>,
    reader: CatalogReader,
}

impl CatalogServices {
    /// Sync one repository
    pub async fn sync(&self, repository: &Repository) -> ServiceResult<SyncOutcome> {
        self.syncer.sync(repository).await
    }

    /// Sync several repositories; failures are reported per repository
    pub async fn sync_all(&self, repositories: &[Repository]) -> SyncReport {
        self.syncer.sync_all(repositories).await
    }

    /// Remove a repository and everything stored for it
    pub async fn delete_repository(&self, repository: &RepositoryId) -> ServiceResult<()> {
        self.syncer.delete_repository(repository).await
    }

    /// Resolve a package reference to a ready artifact location
    pub async fn resolve_artifact(&self, package_ref: &PackageRef) -> ServiceResult<String> {
        self.pulls.resolve(package_ref).await
    }

    /// Read access to published entries
    pub fn catalog(&self) -> &CatalogReader {
        &self.reader
    }

    /// The sync engine
    pub fn syncer(&self) -> &Arc<RepositorySyncer> {
        &self.syncer
    }

    /// The pull coordinator
    pub fn pulls(&self) -> &Arc<ArtifactPullCoordinator> {
        &self.pulls
    }

    /// Check that the catalog store is reachable
    #[instrument(skip(self))]
    pub async fn health_check(&self) -> ServiceResult<()> {
        Ok(self.store.health_check().await?)
    }
}

/// Builder for [`CatalogServices`]
#[derive(Default)]
pub struct CatalogServicesBuilder {
    catalog_store: Option<Arc<dyn CatalogStore>>,
    pull_requests: Option<Arc<dyn PullRequestStore>>,
    change_feed: Option<Arc<dyn ChangeFeed>>,
    backends: Option<SourceBackends>,
    pull_config: PullConfig,
    sync_concurrency: usize,
}

impl CatalogServicesBuilder {
    /// Create a new builder
    pub fn new() -> Self {
        Self {
            sync_concurrency: DEFAULT_SYNC_CONCURRENCY,
            ..Default::default()
        }
    }

    /// Set the catalog store
    pub fn catalog_store(mut self, store: Arc<dyn CatalogStore>) -> Self {
        self.catalog_store = Some(store);
        self
    }

    /// Set the pull request store
    pub fn pull_requests(mut self, requests: Arc<dyn PullRequestStore>) -> Self {
        self.pull_requests = Some(requests);
        self
    }

    /// Set the change feed watched for pull request updates
    pub fn change_feed(mut self, feed: Arc<dyn ChangeFeed>) -> Self {
        self.change_feed = Some(feed);
        self
    }

    /// Use custom fetch/decode backends instead of the HTTP Helm backend
    pub fn backends(mut self, backends: SourceBackends) -> Self {
        self.backends = Some(backends);
        self
    }

    /// Set pull coordination settings
    pub fn pull_config(mut self, config: PullConfig) -> Self {
        self.pull_config = config;
        self
    }

    /// Limit concurrent repository syncs
    pub fn sync_concurrency(mut self, concurrency: usize) -> Self {
        self.sync_concurrency = concurrency;
        self
    }

    /// Build the services.
    ///
    /// # Errors
    ///
    /// Returns `Internal` when a store is missing or the default HTTP client
    /// cannot be created.
    pub fn build(self) -> ServiceResult<CatalogServices> {
        let store = self
            .catalog_store
            .ok_or_else(|| ServiceError::Internal("catalog store is required".to_string()))?;
        let requests = self
            .pull_requests
            .ok_or_else(|| ServiceError::Internal("pull request store is required".to_string()))?;
        let feed = self
            .change_feed
            .ok_or_else(|| ServiceError::Internal("change feed is required".to_string()))?;

        let backends = match self.backends {
            Some(backends) => backends,
            None => SourceBackends::helm(Arc::new(HttpFetcher::new(DEFAULT_FETCH_TIMEOUT)?)),
        };

        let syncer = RepositorySyncer::new(store.clone(), backends)
            .with_concurrency(self.sync_concurrency);
        let waiter = ArtifactReadyWaiter::new(requests.clone(), feed);
        let pulls = ArtifactPullCoordinator::new(requests, waiter, self.pull_config);

        Ok(CatalogServices {
            reader: CatalogReader::new(store.clone()),
            store,
            syncer: Arc::new(syncer),
            pulls: Arc::new(pulls),
        })
    }
}
