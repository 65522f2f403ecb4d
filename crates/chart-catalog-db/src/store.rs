//! Store trait abstractions
//!
//! This module defines the persistence seams used by the sync engine and the
//! artifact pull machinery, allowing PostgreSQL and in-memory implementations to be
//! swapped behind `Arc<dyn ...>`.

use async_trait::async_trait;
use chart_catalog_core::{
    CatalogEntry, ChangeEvent, ChartFiles, Checksum, PullRequest, PullSelector, RecordId,
    RepositoryId, SyncMetadata,
};
use chrono::{DateTime, Utc};
use futures::stream::{BoxStream, StreamExt};
use std::fmt;

use crate::error::DbResult;

/// Catalog persistence.
///
/// Writes are atomic: a failed call leaves no partial state visible to readers.
#[async_trait]
pub trait CatalogStore: Send + Sync {
    /// Checksum of the last index published for a repository.
    ///
    /// Returns `None` when the repository has never been synced.
    async fn get_checksum(&self, repository: &RepositoryId) -> DbResult<Option<Checksum>>;

    /// Replace the stored entries of every repository present in `entries`.
    ///
    /// In one transaction: upsert every entry, then delete previously stored
    /// entries of each touched repository whose ID is not in the new set.
    ///
    /// # Errors
    ///
    /// Returns `DbError::NoRecords` without touching the store when `entries` is empty.
    async fn replace_all(&self, entries: &[CatalogEntry]) -> DbResult<()>;

    /// Record the checksum and time of the last successful publish (last write wins)
    async fn upsert_sync_metadata(
        &self,
        repository: &RepositoryId,
        checksum: &Checksum,
        last_update: DateTime<Utc>,
    ) -> DbResult<()>;

    /// Remove entries, chart files and sync metadata for a repository.
    ///
    /// Succeeds when any or all of them are already absent.
    async fn delete_repository(&self, repository: &RepositoryId) -> DbResult<()>;

    /// All entries of a repository, ordered by ID
    async fn list_entries(&self, repository: &RepositoryId) -> DbResult<Vec<CatalogEntry>>;

    /// A single entry
    async fn get_entry(&self, id: &RecordId) -> DbResult<Option<CatalogEntry>>;

    /// Sync bookkeeping for a repository
    async fn get_sync_metadata(&self, repository: &RepositoryId)
        -> DbResult<Option<SyncMetadata>>;

    /// Cache auxiliary files for one version of a record
    async fn put_chart_files(&self, files: &ChartFiles) -> DbResult<()>;

    /// Cached files for one version of a record
    async fn get_chart_files(&self, id: &RecordId, version: &str)
        -> DbResult<Option<ChartFiles>>;

    /// Check store connectivity
    async fn health_check(&self) -> DbResult<()>;
}

/// Pull request persistence as seen by the catalog.
///
/// The catalog only creates and reads; status changes come from the reconciler.
#[async_trait]
pub trait PullRequestStore: Send + Sync {
    /// Create a pull request, assigning its resource version.
    ///
    /// # Errors
    ///
    /// Returns `DbError::AlreadyExists` when a request with the same name exists in
    /// the namespace.
    async fn create(&self, request: PullRequest) -> DbResult<PullRequest>;

    /// Requests matching a selector
    async fn list(&self, selector: &PullSelector) -> DbResult<Vec<PullRequest>>;

    /// A single request by name
    async fn get(&self, namespace: &str, name: &str) -> DbResult<Option<PullRequest>>;
}

/// Source of pull request change events
#[async_trait]
pub trait ChangeFeed: Send + Sync {
    /// Subscribe to changes matching `selector` with a resource version strictly
    /// greater than `since_version`.
    async fn watch(&self, selector: &PullSelector, since_version: u64) -> DbResult<Subscription>;
}

/// Whether a watch opened at `since_version` with `selector` delivers `event`.
///
/// Stream-level errors always pass; object events pass only when their resource
/// version is newer than the watch's starting point.
pub fn is_visible(event: &ChangeEvent, selector: &PullSelector, since_version: u64) -> bool {
    match event.object() {
        Some(request) => request.resource_version > since_version && selector.matches(request),
        None => true,
    }
}

/// A live change subscription.
///
/// Dropping the subscription releases it.
pub struct Subscription {
    events: BoxStream<'static, ChangeEvent>,
}

impl Subscription {
    /// Wrap an event stream
    pub fn new(events: BoxStream<'static, ChangeEvent>) -> Self {
        Self { events }
    }

    /// Next event, or `None` once the stream is closed
    pub async fn next(&mut self) -> Option<ChangeEvent> {
        self.events.next().await
    }

    /// Release the subscription
    pub fn close(self) {
        drop(self);
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription").finish_non_exhaustive()
    }
}
