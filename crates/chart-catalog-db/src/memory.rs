//! In-memory store implementations
//!
//! Used by tests and by the daemon when no database is configured. The pull
//! request side also plays the external reconciler in tests: `update_status` and
//! `delete` mutate requests and publish the matching change events.

use async_trait::async_trait;
use chart_catalog_core::{
    CatalogEntry, ChangeEvent, ChartFiles, Checksum, PullRequest, PullSelector, PullStatus,
    RecordId, RepositoryId, SyncMetadata,
};
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, instrument};

use crate::error::{DbError, DbResult};
use crate::store::{is_visible, CatalogStore, ChangeFeed, PullRequestStore, Subscription};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Object events kept for replay to new watchers
pub const DEFAULT_HISTORY_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Default)]
struct CatalogState {
    entries: BTreeMap<RecordId, CatalogEntry>,
    metadata: HashMap<RepositoryId, SyncMetadata>,
    files: BTreeMap<(RecordId, String), ChartFiles>,
}

/// Catalog store held in process memory
#[derive(Debug, Default)]
pub struct InMemoryCatalogStore {
    state: RwLock<CatalogState>,
}

impl InMemoryCatalogStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries across all repositories
    pub async fn entry_count(&self) -> usize {
        self.state.read().await.entries.len()
    }
}

#[async_trait]
impl CatalogStore for InMemoryCatalogStore {
    async fn get_checksum(&self, repository: &RepositoryId) -> DbResult<Option<Checksum>> {
        let state = self.state.read().await;
        Ok(state.metadata.get(repository).map(|m| m.checksum.clone()))
    }

    #[instrument(skip(self, entries), fields(entries = entries.len()))]
    async fn replace_all(&self, entries: &[CatalogEntry]) -> DbResult<()> {
        if entries.is_empty() {
            return Err(DbError::NoRecords("empty entry set".to_string()));
        }

        let mut state = self.state.write().await;

        // Stage on a copy and swap, so a rejected entry leaves nothing behind
        let mut staged = state.clone();
        let mut keep: HashMap<&RepositoryId, BTreeSet<&RecordId>> = HashMap::new();
        for entry in entries {
            entry.record.validate()?;
            keep.entry(&entry.repository).or_default().insert(&entry.id);
            staged.entries.insert(entry.id.clone(), entry.clone());
        }

        staged.entries.retain(|id, entry| {
            keep.get(&entry.repository)
                .map_or(true, |ids| ids.contains(id))
        });
        staged.files.retain(|(id, _), files| {
            keep.get(&files.repository)
                .map_or(true, |ids| ids.contains(id))
        });

        *state = staged;
        debug!(total = state.entries.len(), "Replaced entries");
        Ok(())
    }

    async fn upsert_sync_metadata(
        &self,
        repository: &RepositoryId,
        checksum: &Checksum,
        last_update: DateTime<Utc>,
    ) -> DbResult<()> {
        let mut state = self.state.write().await;
        state.metadata.insert(
            repository.clone(),
            SyncMetadata {
                repository: repository.clone(),
                checksum: checksum.clone(),
                last_update,
            },
        );
        Ok(())
    }

    async fn delete_repository(&self, repository: &RepositoryId) -> DbResult<()> {
        let mut state = self.state.write().await;
        state.entries.retain(|_, entry| entry.repository != *repository);
        state.files.retain(|_, files| files.repository != *repository);
        state.metadata.remove(repository);
        Ok(())
    }

    async fn list_entries(&self, repository: &RepositoryId) -> DbResult<Vec<CatalogEntry>> {
        let state = self.state.read().await;
        Ok(state
            .entries
            .values()
            .filter(|entry| entry.repository == *repository)
            .cloned()
            .collect())
    }

    async fn get_entry(&self, id: &RecordId) -> DbResult<Option<CatalogEntry>> {
        Ok(self.state.read().await.entries.get(id).cloned())
    }

    async fn get_sync_metadata(
        &self,
        repository: &RepositoryId,
    ) -> DbResult<Option<SyncMetadata>> {
        Ok(self.state.read().await.metadata.get(repository).cloned())
    }

    async fn put_chart_files(&self, files: &ChartFiles) -> DbResult<()> {
        let mut state = self.state.write().await;
        state.files.insert(
            (files.record_id.clone(), files.version.clone()),
            files.clone(),
        );
        Ok(())
    }

    async fn get_chart_files(&self, id: &RecordId, version: &str) -> DbResult<Option<ChartFiles>> {
        let state = self.state.read().await;
        Ok(state.files.get(&(id.clone(), version.to_string())).cloned())
    }

    async fn health_check(&self) -> DbResult<()> {
        Ok(())
    }
}

struct PullState {
    requests: BTreeMap<(String, String), PullRequest>,
    history: VecDeque<ChangeEvent>,
    history_capacity: usize,
    /// Highest resource version dropped from `history`
    compacted_through: u64,
    last_version: u64,
    events: broadcast::Sender<ChangeEvent>,
}

impl PullState {
    fn next_version(&mut self) -> u64 {
        self.last_version += 1;
        self.last_version
    }

    fn publish(&mut self, event: ChangeEvent) {
        if let Some(version) = event.resource_version() {
            self.history.push_back(event.clone());
            while self.history.len() > self.history_capacity {
                if let Some(dropped) = self.history.pop_front() {
                    self.compacted_through = dropped.resource_version().unwrap_or(version);
                }
            }
        }
        // No receivers is fine
        let _ = self.events.send(event);
    }
}

/// Pull request store and change feed held in process memory
pub struct InMemoryPullRequests {
    state: Mutex<PullState>,
}

impl Default for InMemoryPullRequests {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryPullRequests {
    /// Create an empty store
    pub fn new() -> Self {
        Self::with_history_capacity(DEFAULT_HISTORY_CAPACITY)
    }

    /// Create an empty store replaying at most `capacity` past events.
    ///
    /// A watch starting before the oldest retained event opens with a stream error.
    pub fn with_history_capacity(capacity: usize) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            state: Mutex::new(PullState {
                requests: BTreeMap::new(),
                history: VecDeque::with_capacity(capacity.min(DEFAULT_HISTORY_CAPACITY)),
                history_capacity: capacity.max(1),
                compacted_through: 0,
                last_version: 0,
                events,
            }),
        }
    }

    /// Set the status of a request, as the reconciler would, and publish `MODIFIED`
    #[instrument(skip(self, status))]
    pub async fn update_status(
        &self,
        namespace: &str,
        name: &str,
        status: PullStatus,
    ) -> DbResult<PullRequest> {
        let mut state = self.state.lock().await;
        let version = state.next_version();

        let request = state
            .requests
            .get_mut(&(namespace.to_string(), name.to_string()))
            .ok_or_else(|| DbError::NotFound(format!("pull request {}/{}", namespace, name)))?;
        request.status = status;
        request.resource_version = version;
        let updated = request.clone();

        state.publish(ChangeEvent::Modified(updated.clone()));
        Ok(updated)
    }

    /// Remove a request and publish `DELETED`
    pub async fn delete(&self, namespace: &str, name: &str) -> DbResult<()> {
        let mut state = self.state.lock().await;
        let mut removed = state
            .requests
            .remove(&(namespace.to_string(), name.to_string()))
            .ok_or_else(|| DbError::NotFound(format!("pull request {}/{}", namespace, name)))?;
        removed.resource_version = state.next_version();
        state.publish(ChangeEvent::Deleted(removed));
        Ok(())
    }

    /// Publish a stream-level error to every watcher
    pub async fn emit_error(&self, message: impl Into<String>) {
        self.state.lock().await.publish(ChangeEvent::Error(message.into()));
    }

    /// End every open subscription, as a dropped watch connection would
    pub async fn close_watchers(&self) {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        // Dropping the old sender closes its receivers
        self.state.lock().await.events = events;
    }

    /// Number of live subscriptions
    pub async fn watcher_count(&self) -> usize {
        self.state.lock().await.events.receiver_count()
    }

    /// Number of stored requests
    pub async fn request_count(&self) -> usize {
        self.state.lock().await.requests.len()
    }
}

#[async_trait]
impl PullRequestStore for InMemoryPullRequests {
    #[instrument(skip(self, request), fields(namespace = %request.namespace, name = %request.name))]
    async fn create(&self, mut request: PullRequest) -> DbResult<PullRequest> {
        let mut state = self.state.lock().await;
        let key = (request.namespace.clone(), request.name.clone());
        if state.requests.contains_key(&key) {
            return Err(DbError::AlreadyExists(format!(
                "pull request {}/{}",
                key.0, key.1
            )));
        }

        request.resource_version = state.next_version();
        state.requests.insert(key, request.clone());
        state.publish(ChangeEvent::Added(request.clone()));
        Ok(request)
    }

    async fn list(&self, selector: &PullSelector) -> DbResult<Vec<PullRequest>> {
        let state = self.state.lock().await;
        Ok(state
            .requests
            .values()
            .filter(|request| selector.matches(request))
            .cloned()
            .collect())
    }

    async fn get(&self, namespace: &str, name: &str) -> DbResult<Option<PullRequest>> {
        let state = self.state.lock().await;
        Ok(state
            .requests
            .get(&(namespace.to_string(), name.to_string()))
            .cloned())
    }
}

#[async_trait]
impl ChangeFeed for InMemoryPullRequests {
    async fn watch(&self, selector: &PullSelector, since_version: u64) -> DbResult<Subscription> {
        let state = self.state.lock().await;

        // Replay and subscribe under one lock so no event falls in between
        let mut backlog: Vec<ChangeEvent> = Vec::new();
        if since_version < state.compacted_through {
            backlog.push(ChangeEvent::Error(format!(
                "resource version {} is too old, history starts after {}",
                since_version, state.compacted_through
            )));
        }
        backlog.extend(
            state
                .history
                .iter()
                .filter(|event| is_visible(event, selector, since_version))
                .cloned(),
        );
        let receiver = state.events.subscribe();
        drop(state);

        let selector = selector.clone();
        let live = BroadcastStream::new(receiver).filter_map(move |item| {
            let event = match item {
                Ok(event) if is_visible(&event, &selector, since_version) => Some(event),
                Ok(_) => None,
                Err(BroadcastStreamRecvError::Lagged(missed)) => Some(ChangeEvent::Error(
                    format!("watch fell behind, {} events missed", missed),
                )),
            };
            futures::future::ready(event)
        });

        Ok(Subscription::new(stream::iter(backlog).chain(live).boxed()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chart_catalog_core::{
        PackageRecord, PackageRef, PackageVersion, PullCondition, VersionPolicy,
    };

    fn repo(name: &str) -> RepositoryId {
        RepositoryId::new("default", name).unwrap()
    }

    fn entry(repository: &RepositoryId, name: &str) -> CatalogEntry {
        CatalogEntry::from(PackageRecord::new(
            repository.clone(),
            name,
            vec![PackageVersion::new("1.0.0")],
        ))
    }

    fn nginx_request() -> PullRequest {
        let package_ref = PackageRef::parse("default", "bitnami/nginx").unwrap();
        PullRequest::for_package(&package_ref, VersionPolicy::AnyVersion)
    }

    #[tokio::test]
    async fn test_replace_all_prunes_only_touched_repository() {
        let store = InMemoryCatalogStore::new();
        let bitnami = repo("bitnami");
        let jetstack = repo("jetstack");

        store
            .replace_all(&[
                entry(&bitnami, "nginx"),
                entry(&bitnami, "redis"),
                entry(&jetstack, "cert-manager"),
            ])
            .await
            .unwrap();

        store.replace_all(&[entry(&bitnami, "nginx")]).await.unwrap();

        let names: Vec<String> = store
            .list_entries(&bitnami)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.record.name)
            .collect();
        assert_eq!(names, vec!["nginx"]);
        assert_eq!(store.list_entries(&jetstack).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_replace_all_rejects_empty_input() {
        let store = InMemoryCatalogStore::new();
        store.replace_all(&[entry(&repo("bitnami"), "nginx")]).await.unwrap();

        let result = store.replace_all(&[]).await;
        assert!(matches!(result, Err(DbError::NoRecords(_))));
        assert_eq!(store.entry_count().await, 1);
    }

    #[tokio::test]
    async fn test_replace_all_is_atomic() {
        let store = InMemoryCatalogStore::new();
        let bitnami = repo("bitnami");
        store.replace_all(&[entry(&bitnami, "nginx")]).await.unwrap();

        let mut broken = entry(&bitnami, "redis");
        broken.record.versions.clear();

        let result = store
            .replace_all(&[entry(&bitnami, "apache"), broken])
            .await;
        assert!(result.is_err());

        let names: Vec<String> = store
            .list_entries(&bitnami)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.record.name)
            .collect();
        assert_eq!(names, vec!["nginx"]);
    }

    #[tokio::test]
    async fn test_delete_repository_clears_everything() {
        let store = InMemoryCatalogStore::new();
        let bitnami = repo("bitnami");
        let nginx = entry(&bitnami, "nginx");
        store.replace_all(&[nginx.clone()]).await.unwrap();
        store
            .upsert_sync_metadata(&bitnami, &chart_catalog_core::fingerprint(b"index"), Utc::now())
            .await
            .unwrap();
        store
            .put_chart_files(&ChartFiles {
                record_id: nginx.id.clone(),
                repository: bitnami.clone(),
                version: "1.0.0".to_string(),
                readme: Some("# nginx".to_string()),
                values: None,
                schema: None,
            })
            .await
            .unwrap();

        store.delete_repository(&bitnami).await.unwrap();

        assert!(store.get_checksum(&bitnami).await.unwrap().is_none());
        assert!(store.get_entry(&nginx.id).await.unwrap().is_none());
        assert!(store.get_chart_files(&nginx.id, "1.0.0").await.unwrap().is_none());

        // Deleting again is fine
        store.delete_repository(&bitnami).await.unwrap();
    }

    #[tokio::test]
    async fn test_create_rejects_duplicate_name() {
        let store = InMemoryPullRequests::new();
        let created = store.create(nginx_request()).await.unwrap();
        assert_eq!(created.resource_version, 1);

        let result = store.create(nginx_request()).await;
        assert!(matches!(result, Err(DbError::AlreadyExists(_))));
        assert_eq!(store.request_count().await, 1);
    }

    #[tokio::test]
    async fn test_watch_replays_after_version_then_streams() {
        let store = InMemoryPullRequests::new();
        let created = store.create(nginx_request()).await.unwrap();
        let selector = PullSelector::named("default", created.name.clone());

        let mut subscription = store.watch(&selector, created.resource_version).await.unwrap();

        let status = PullStatus {
            condition: PullCondition::Ready,
            message: None,
            location: Some("https://x/nginx.tgz".to_string()),
        };
        store
            .update_status("default", &created.name, status)
            .await
            .unwrap();

        match subscription.next().await {
            Some(ChangeEvent::Modified(request)) => {
                assert_eq!(request.ready_location(), Some("https://x/nginx.tgz"));
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_history_is_bounded() {
        let store = InMemoryPullRequests::with_history_capacity(2);
        for version in ["1.0.0", "2.0.0", "3.0.0"] {
            let package_ref = PackageRef::parse("default", "bitnami/nginx")
                .unwrap()
                .with_version(version);
            store
                .create(PullRequest::for_package(&package_ref, VersionPolicy::Exact))
                .await
                .unwrap();
        }
        assert_eq!(store.state.lock().await.history.len(), 2);

        // Versions 2 and 3 are still replayed
        let mut subscription = store
            .watch(&PullSelector::namespace("default"), 1)
            .await
            .unwrap();
        assert_eq!(subscription.next().await.and_then(|e| e.resource_version()), Some(2));
        assert_eq!(subscription.next().await.and_then(|e| e.resource_version()), Some(3));

        // Version 1 was dropped, so a watch from 0 cannot be served
        let mut subscription = store
            .watch(&PullSelector::namespace("default"), 0)
            .await
            .unwrap();
        assert!(matches!(subscription.next().await, Some(ChangeEvent::Error(_))));
    }

    #[tokio::test]
    async fn test_dropping_subscription_releases_it() {
        let store = InMemoryPullRequests::new();
        let subscription = store
            .watch(&PullSelector::namespace("default"), 0)
            .await
            .unwrap();
        assert_eq!(store.watcher_count().await, 1);

        drop(subscription);
        assert_eq!(store.watcher_count().await, 0);
    }

    #[tokio::test]
    async fn test_close_watchers_ends_streams() {
        let store = InMemoryPullRequests::new();
        let mut subscription = store
            .watch(&PullSelector::namespace("default"), 0)
            .await
            .unwrap();

        store.close_watchers().await;
        assert!(subscription.next().await.is_none());
    }
}
