//! Repository synchronization
//!
//! Mirrors a repository index into the catalog store: fetch, fingerprint, skip
//! when unchanged, decode, replace the stored entries, record the new checksum.

use chart_catalog_core::{
    index_url, normalize_endpoint, CatalogEntry, Checksum, Fingerprinter, HashAlgorithm,
    Repository, RepositoryId,
};
use chart_catalog_db::CatalogStore;
use chrono::Utc;
use futures::stream::{self, StreamExt};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use crate::error::{ServiceError, ServiceResult};
use crate::source::SourceBackends;

/// Default number of repositories synced at once by `sync_all`
pub const DEFAULT_SYNC_CONCURRENCY: usize = 4;

/// Result of syncing one repository
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// The index was unchanged; nothing was written
    Skipped {
        /// Fingerprint of the fetched index
        checksum: Checksum,
    },
    /// The catalog was replaced with the decoded index
    Synced {
        /// Fingerprint of the fetched index
        checksum: Checksum,
        /// Number of records published
        records: usize,
    },
}

impl SyncOutcome {
    /// True when nothing was written
    pub fn is_skipped(&self) -> bool {
        matches!(self, SyncOutcome::Skipped { .. })
    }

    /// Fingerprint of the fetched index
    pub fn checksum(&self) -> &Checksum {
        match self {
            SyncOutcome::Skipped { checksum } | SyncOutcome::Synced { checksum, .. } => checksum,
        }
    }
}

/// Per-repository results of a `sync_all` pass
#[derive(Debug)]
pub struct SyncReport {
    /// Outcome for each distinct repository, in completion order
    pub results: Vec<(RepositoryId, ServiceResult<SyncOutcome>)>,
}

impl SyncReport {
    /// Number of repositories that failed
    pub fn failures(&self) -> usize {
        self.results.iter().filter(|(_, r)| r.is_err()).count()
    }

    /// Number of repositories whose catalog was replaced
    pub fn synced(&self) -> usize {
        self.results
            .iter()
            .filter(|(_, r)| matches!(r, Ok(SyncOutcome::Synced { .. })))
            .count()
    }
}

/// Synchronizes repository indexes into the catalog store
pub struct RepositorySyncer {
    store: Arc<dyn CatalogStore>,
    backends: SourceBackends,
    fingerprinter: Fingerprinter,
    concurrency: usize,
}

impl RepositorySyncer {
    /// Create a syncer using SHA-256 fingerprints
    pub fn new(store: Arc<dyn CatalogStore>, backends: SourceBackends) -> Self {
        Self {
            store,
            backends,
            fingerprinter: Fingerprinter::new(HashAlgorithm::SHA256),
            concurrency: DEFAULT_SYNC_CONCURRENCY,
        }
    }

    /// Use a different fingerprint algorithm
    pub fn with_fingerprinter(mut self, fingerprinter: Fingerprinter) -> Self {
        self.fingerprinter = fingerprinter;
        self
    }

    /// Limit how many repositories `sync_all` processes at once
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Sync one repository.
    ///
    /// Callers must not sync the same repository concurrently.
    ///
    /// # Errors
    ///
    /// - `Validation` for a malformed endpoint, an unsupported kind, a malformed
    ///   index or an index without records; nothing is fetched or written.
    /// - `TransientIo` when the fetch or the store fails; the store is unchanged.
    #[instrument(skip(self, repository), fields(repository = %repository.id, kind = %repository.kind))]
    pub async fn sync(&self, repository: &Repository) -> ServiceResult<SyncOutcome> {
        let endpoint = normalize_endpoint(&repository.url)?;
        let backend = self.backends.get(repository.kind)?;
        let url = index_url(&endpoint);

        let bytes = backend
            .fetcher
            .get(&url, repository.credential.as_ref())
            .await?;

        let checksum = self.fingerprinter.fingerprint(&bytes);
        if self.store.get_checksum(&repository.id).await?.as_ref() == Some(&checksum) {
            debug!(checksum = %checksum, "Index unchanged, skipping");
            return Ok(SyncOutcome::Skipped { checksum });
        }

        let records = backend.decoder.decode(&bytes, repository)?;
        if records.is_empty() {
            return Err(ServiceError::Validation(format!(
                "no charts in repository index {}",
                url
            )));
        }

        let entries: Vec<CatalogEntry> = records
            .into_iter()
            .map(|record| {
                if record.repository != repository.id {
                    return Err(ServiceError::Validation(format!(
                        "decoder produced {} outside repository {}",
                        record.id, repository.id
                    )));
                }
                Ok(CatalogEntry::from(record))
            })
            .collect::<ServiceResult<_>>()?;

        self.store.replace_all(&entries).await?;
        self.store
            .upsert_sync_metadata(&repository.id, &checksum, Utc::now())
            .await?;

        info!(records = entries.len(), checksum = %checksum, "Repository synced");
        Ok(SyncOutcome::Synced {
            checksum,
            records: entries.len(),
        })
    }

    /// Sync several repositories concurrently.
    ///
    /// Duplicate repository IDs are synced once. A failure is reported for its
    /// repository and never stops the others.
    #[instrument(skip(self, repositories), fields(repositories = repositories.len()))]
    pub async fn sync_all(&self, repositories: &[Repository]) -> SyncReport {
        let mut seen = HashSet::new();
        let distinct: Vec<&Repository> = repositories
            .iter()
            .filter(|repository| {
                let first = seen.insert(&repository.id);
                if !first {
                    warn!(repository = %repository.id, "Duplicate repository ignored");
                }
                first
            })
            .collect();

        let results: Vec<(RepositoryId, ServiceResult<SyncOutcome>)> = stream::iter(distinct)
            .map(|repository| async move {
                let result = self.sync(repository).await;
                if let Err(ref e) = result {
                    warn!(repository = %repository.id, kind = %e.kind(), error = %e, "Sync failed");
                }
                (repository.id.clone(), result)
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let report = SyncReport { results };
        info!(
            synced = report.synced(),
            failed = report.failures(),
            "Sync pass finished"
        );
        report
    }

    /// Remove a repository and everything stored for it
    #[instrument(skip(self), fields(repository = %repository))]
    pub async fn delete_repository(&self, repository: &RepositoryId) -> ServiceResult<()> {
        self.store.delete_repository(repository).await?;
        info!("Repository deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::source::{Fetcher, IndexDecoder};
    use async_trait::async_trait;
    use chart_catalog_core::{
        Credential, PackageRecord, PackageVersion, RecordId, RepositoryKind, SyncMetadata,
    };
    use chart_catalog_db::{DbError, DbResult, InMemoryCatalogStore};
    use chrono::DateTime;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use url::Url;

    const TWO_CHARTS: &str = r#"
apiVersion: v1
entries:
  nginx:
    - version: 1.0.0
  redis:
    - version: 7.0.0
"#;

    const ONE_CHART: &str = r#"
apiVersion: v1
entries:
  nginx:
    - version: 1.1.0
"#;

    /// Serves canned bodies by URL and counts requests
    #[derive(Default)]
    struct StaticFetcher {
        bodies: Mutex<HashMap<String, Result<Vec<u8>, String>>>,
        calls: AtomicUsize,
    }

    impl StaticFetcher {
        fn serve(&self, url: &str, body: &str) {
            self.bodies
                .lock()
                .unwrap()
                .insert(url.to_string(), Ok(body.as_bytes().to_vec()));
        }

        fn fail(&self, url: &str, message: &str) {
            self.bodies
                .lock()
                .unwrap()
                .insert(url.to_string(), Err(message.to_string()));
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Fetcher for StaticFetcher {
        async fn get(&self, url: &Url, _: Option<&Credential>) -> ServiceResult<Vec<u8>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.bodies.lock().unwrap().get(url.as_str()) {
                Some(Ok(body)) => Ok(body.clone()),
                Some(Err(message)) => Err(ServiceError::Fetch {
                    url: url.to_string(),
                    message: message.clone(),
                }),
                None => Err(ServiceError::Fetch {
                    url: url.to_string(),
                    message: "unexpected status 404 Not Found".to_string(),
                }),
            }
        }
    }

    /// Wraps a store and counts writes, optionally failing replace_all
    struct CountingStore {
        inner: InMemoryCatalogStore,
        writes: AtomicUsize,
        fail_replace: bool,
    }

    impl CountingStore {
        fn new(fail_replace: bool) -> Self {
            Self {
                inner: InMemoryCatalogStore::new(),
                writes: AtomicUsize::new(0),
                fail_replace,
            }
        }
    }

    #[async_trait]
    impl CatalogStore for CountingStore {
        async fn get_checksum(&self, repository: &RepositoryId) -> DbResult<Option<Checksum>> {
            self.inner.get_checksum(repository).await
        }
        async fn replace_all(&self, entries: &[CatalogEntry]) -> DbResult<()> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            if self.fail_replace {
                return Err(DbError::Connection("connection reset".to_string()));
            }
            self.inner.replace_all(entries).await
        }
        async fn upsert_sync_metadata(
            &self,
            repository: &RepositoryId,
            checksum: &Checksum,
            last_update: DateTime<Utc>,
        ) -> DbResult<()> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            self.inner
                .upsert_sync_metadata(repository, checksum, last_update)
                .await
        }
        async fn delete_repository(&self, repository: &RepositoryId) -> DbResult<()> {
            self.inner.delete_repository(repository).await
        }
        async fn list_entries(&self, repository: &RepositoryId) -> DbResult<Vec<CatalogEntry>> {
            self.inner.list_entries(repository).await
        }
        async fn get_entry(&self, id: &RecordId) -> DbResult<Option<CatalogEntry>> {
            self.inner.get_entry(id).await
        }
        async fn get_sync_metadata(
            &self,
            repository: &RepositoryId,
        ) -> DbResult<Option<SyncMetadata>> {
            self.inner.get_sync_metadata(repository).await
        }
        async fn put_chart_files(&self, files: &chart_catalog_core::ChartFiles) -> DbResult<()> {
            self.inner.put_chart_files(files).await
        }
        async fn get_chart_files(
            &self,
            id: &RecordId,
            version: &str,
        ) -> DbResult<Option<chart_catalog_core::ChartFiles>> {
            self.inner.get_chart_files(id, version).await
        }
        async fn health_check(&self) -> DbResult<()> {
            Ok(())
        }
    }

    fn bitnami() -> Repository {
        Repository::new(
            RepositoryId::new("default", "bitnami").unwrap(),
            "https://charts.example.com/bitnami",
        )
    }

    const BITNAMI_INDEX: &str = "https://charts.example.com/bitnami/index.yaml";

    fn syncer(store: Arc<dyn CatalogStore>, fetcher: Arc<StaticFetcher>) -> RepositorySyncer {
        RepositorySyncer::new(store, SourceBackends::helm(fetcher))
    }

    async fn names(store: &dyn CatalogStore, repository: &RepositoryId) -> Vec<String> {
        store
            .list_entries(repository)
            .await
            .unwrap()
            .into_iter()
            .map(|entry| entry.record.name)
            .collect()
    }

    #[tokio::test]
    async fn test_first_sync_publishes_records_and_metadata() {
        let store = Arc::new(InMemoryCatalogStore::new());
        let fetcher = Arc::new(StaticFetcher::default());
        fetcher.serve(BITNAMI_INDEX, TWO_CHARTS);

        let outcome = syncer(store.clone(), fetcher).sync(&bitnami()).await.unwrap();

        assert_eq!(
            outcome,
            SyncOutcome::Synced {
                checksum: chart_catalog_core::fingerprint(TWO_CHARTS.as_bytes()),
                records: 2
            }
        );
        assert_eq!(names(store.as_ref(), &bitnami().id).await, vec!["nginx", "redis"]);

        let metadata = store.get_sync_metadata(&bitnami().id).await.unwrap().unwrap();
        assert_eq!(&metadata.checksum, outcome.checksum());
    }

    #[tokio::test]
    async fn test_unchanged_index_is_skipped_without_writes() {
        let store = Arc::new(CountingStore::new(false));
        let fetcher = Arc::new(StaticFetcher::default());
        fetcher.serve(BITNAMI_INDEX, TWO_CHARTS);
        let syncer = syncer(store.clone(), fetcher);

        syncer.sync(&bitnami()).await.unwrap();
        let writes = store.writes.load(Ordering::SeqCst);

        let outcome = syncer.sync(&bitnami()).await.unwrap();
        assert!(outcome.is_skipped());
        assert_eq!(store.writes.load(Ordering::SeqCst), writes);
    }

    #[tokio::test]
    async fn test_changed_index_prunes_removed_records() {
        let store = Arc::new(InMemoryCatalogStore::new());
        let fetcher = Arc::new(StaticFetcher::default());
        fetcher.serve(BITNAMI_INDEX, TWO_CHARTS);
        let syncer = syncer(store.clone(), fetcher.clone());
        syncer.sync(&bitnami()).await.unwrap();

        fetcher.serve(BITNAMI_INDEX, ONE_CHART);
        let outcome = syncer.sync(&bitnami()).await.unwrap();

        assert!(matches!(outcome, SyncOutcome::Synced { records: 1, .. }));
        assert_eq!(names(store.as_ref(), &bitnami().id).await, vec!["nginx"]);
        let stored = store.get_checksum(&bitnami().id).await.unwrap().unwrap();
        assert_eq!(stored, chart_catalog_core::fingerprint(ONE_CHART.as_bytes()));
    }

    #[tokio::test]
    async fn test_malformed_endpoint_never_fetches() {
        let store = Arc::new(InMemoryCatalogStore::new());
        let fetcher = Arc::new(StaticFetcher::default());
        let syncer = syncer(store, fetcher.clone());

        let mut repository = bitnami();
        repository.url = "not a url".to_string();

        let err = syncer.sync(&repository).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert_eq!(fetcher.calls(), 0);
    }

    #[tokio::test]
    async fn test_endpoint_whitespace_is_trimmed() {
        let store = Arc::new(InMemoryCatalogStore::new());
        let fetcher = Arc::new(StaticFetcher::default());
        fetcher.serve(BITNAMI_INDEX, TWO_CHARTS);

        let mut repository = bitnami();
        repository.url = "  https://charts.example.com/bitnami/  ".to_string();

        let outcome = syncer(store, fetcher).sync(&repository).await.unwrap();
        assert!(!outcome.is_skipped());
    }

    #[tokio::test]
    async fn test_empty_index_is_rejected_and_store_untouched() {
        let store = Arc::new(CountingStore::new(false));
        let fetcher = Arc::new(StaticFetcher::default());
        fetcher.serve(BITNAMI_INDEX, "apiVersion: v1\nentries: {}\n");

        let err = syncer(store.clone(), fetcher).sync(&bitnami()).await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(err.to_string().contains("no charts"));
        assert_eq!(store.writes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_fetch_failure_is_transient_and_writes_nothing() {
        let store = Arc::new(CountingStore::new(false));
        let fetcher = Arc::new(StaticFetcher::default());
        fetcher.fail(BITNAMI_INDEX, "connection refused");

        let err = syncer(store.clone(), fetcher).sync(&bitnami()).await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::TransientIo);
        assert_eq!(store.writes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_failed_replace_skips_metadata() {
        let store = Arc::new(CountingStore::new(true));
        let fetcher = Arc::new(StaticFetcher::default());
        fetcher.serve(BITNAMI_INDEX, TWO_CHARTS);

        let err = syncer(store.clone(), fetcher).sync(&bitnami()).await.unwrap_err();

        assert!(err.is_retryable());
        assert!(store.get_checksum(&bitnami().id).await.unwrap().is_none());
        // replace_all was attempted, metadata never written
        assert_eq!(store.writes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unregistered_kind_is_validation_error() {
        let store = Arc::new(InMemoryCatalogStore::new());
        let fetcher = Arc::new(StaticFetcher::default());
        let repository = bitnami().with_kind(RepositoryKind::Oci);

        let err = syncer(store, fetcher.clone()).sync(&repository).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert_eq!(fetcher.calls(), 0);
    }

    #[tokio::test]
    async fn test_foreign_records_are_rejected() {
        struct ForeignDecoder;
        impl IndexDecoder for ForeignDecoder {
            fn decode(&self, _: &[u8], _: &Repository) -> ServiceResult<Vec<PackageRecord>> {
                let other = RepositoryId::new("default", "other").unwrap();
                Ok(vec![PackageRecord::new(
                    other,
                    "nginx",
                    vec![PackageVersion::new("1.0.0")],
                )])
            }
        }

        let store = Arc::new(InMemoryCatalogStore::new());
        let fetcher = Arc::new(StaticFetcher::default());
        fetcher.serve(BITNAMI_INDEX, TWO_CHARTS);
        let backends = SourceBackends::new().register(
            RepositoryKind::Helm,
            fetcher,
            Arc::new(ForeignDecoder),
        );

        let err = RepositorySyncer::new(store.clone(), backends)
            .sync(&bitnami())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert_eq!(store.entry_count().await, 0);
    }

    #[tokio::test]
    async fn test_sync_all_isolates_failures() {
        let store = Arc::new(InMemoryCatalogStore::new());
        let fetcher = Arc::new(StaticFetcher::default());
        fetcher.serve(BITNAMI_INDEX, TWO_CHARTS);
        fetcher.fail("https://charts.example.com/broken/index.yaml", "timeout");

        let broken = Repository::new(
            RepositoryId::new("default", "broken").unwrap(),
            "https://charts.example.com/broken",
        );

        let report = syncer(store.clone(), fetcher.clone())
            .with_concurrency(2)
            .sync_all(&[bitnami(), broken, bitnami()])
            .await;

        assert_eq!(report.results.len(), 2);
        assert_eq!(report.failures(), 1);
        assert_eq!(report.synced(), 1);
        assert_eq!(fetcher.calls(), 2);
        assert_eq!(names(store.as_ref(), &bitnami().id).await.len(), 2);
    }

    #[tokio::test]
    async fn test_delete_repository_removes_catalog_and_metadata() {
        let store = Arc::new(InMemoryCatalogStore::new());
        let fetcher = Arc::new(StaticFetcher::default());
        fetcher.serve(BITNAMI_INDEX, TWO_CHARTS);
        let syncer = syncer(store.clone(), fetcher);
        syncer.sync(&bitnami()).await.unwrap();

        syncer.delete_repository(&bitnami().id).await.unwrap();

        assert!(names(store.as_ref(), &bitnami().id).await.is_empty());
        assert!(store.get_checksum(&bitnami().id).await.unwrap().is_none());

        // Next sync starts from scratch
        let outcome = syncer.sync(&bitnami()).await.unwrap();
        assert!(!outcome.is_skipped());
    }

    #[test]
    fn test_helm_decoder_is_default_for_helm() {
        let fetcher = Arc::new(StaticFetcher::default());
        let backends = SourceBackends::helm(fetcher);
        let backend = backends.get(RepositoryKind::Helm).unwrap();
        let records = backend
            .decoder
            .decode(TWO_CHARTS.as_bytes(), &bitnami())
            .unwrap();
        assert_eq!(records.len(), 2);
    }
}
