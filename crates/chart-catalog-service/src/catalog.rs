//! Read path over the catalog store
//!
//! Chart files are not produced by sync. A separate component that unpacks chart
//! archives writes them through [`CatalogReader::put_chart_files`]; sync only prunes
//! files whose entry disappears.

use chart_catalog_core::{CatalogEntry, ChartFiles, RecordId, RepositoryId, SyncMetadata};
use chart_catalog_db::CatalogStore;
use std::sync::Arc;
use tracing::{debug, instrument};

use crate::error::{ServiceError, ServiceResult};

/// Queries published catalog entries and their cached files
#[derive(Clone)]
pub struct CatalogReader {
    store: Arc<dyn CatalogStore>,
}

impl CatalogReader {
    /// Create a reader over `store`
    pub fn new(store: Arc<dyn CatalogStore>) -> Self {
        Self { store }
    }

    /// Entries published for a repository, ordered by ID
    #[instrument(skip(self), fields(repository = %repository))]
    pub async fn list_entries(&self, repository: &RepositoryId) -> ServiceResult<Vec<CatalogEntry>> {
        let entries = self.store.list_entries(repository).await?;
        debug!(count = entries.len(), "Listed catalog entries");
        Ok(entries)
    }

    /// A single entry
    ///
    /// # Errors
    ///
    /// `NotFound` when no entry has this ID.
    #[instrument(skip(self), fields(id = %id))]
    pub async fn get_entry(&self, id: &RecordId) -> ServiceResult<CatalogEntry> {
        self.store
            .get_entry(id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("catalog entry {}", id)))
    }

    /// Checksum and time of the last publish, `None` for a never-synced repository
    pub async fn get_sync_metadata(
        &self,
        repository: &RepositoryId,
    ) -> ServiceResult<Option<SyncMetadata>> {
        Ok(self.store.get_sync_metadata(repository).await?)
    }

    /// Cache files for a published version.
    ///
    /// Write entry point for whatever extracts README, values and schema from chart
    /// archives. The entry must exist, belong to `files.repository` and list
    /// `files.version`.
    #[instrument(skip(self, files), fields(id = %files.record_id, version = %files.version))]
    pub async fn put_chart_files(&self, files: &ChartFiles) -> ServiceResult<()> {
        let entry = self.get_entry(&files.record_id).await?;
        if entry.repository != files.repository {
            return Err(ServiceError::Validation(format!(
                "{} belongs to {}, not {}",
                files.record_id, entry.repository, files.repository
            )));
        }
        if !entry
            .record
            .versions
            .iter()
            .any(|v| v.version == files.version)
        {
            return Err(ServiceError::NotFound(format!(
                "version {} of {}",
                files.version, files.record_id
            )));
        }

        self.store.put_chart_files(files).await?;
        Ok(())
    }

    /// Cached files for one version
    ///
    /// # Errors
    ///
    /// `NotFound` when nothing is cached for this version.
    pub async fn get_chart_files(&self, id: &RecordId, version: &str) -> ServiceResult<ChartFiles> {
        self.store
            .get_chart_files(id, version)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("files for {} version {}", id, version)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use chart_catalog_core::{PackageRecord, PackageVersion};
    use chart_catalog_db::InMemoryCatalogStore;

    fn bitnami() -> RepositoryId {
        RepositoryId::new("default", "bitnami").unwrap()
    }

    fn files(version: &str) -> ChartFiles {
        ChartFiles {
            record_id: bitnami().record_id("nginx"),
            repository: bitnami(),
            version: version.to_string(),
            readme: Some("# nginx".to_string()),
            values: Some("replicaCount: 1\n".to_string()),
            schema: None,
        }
    }

    async fn reader_with_nginx() -> CatalogReader {
        let store = Arc::new(InMemoryCatalogStore::new());
        let record = PackageRecord::new(
            bitnami(),
            "nginx",
            vec![PackageVersion::new("1.1.0"), PackageVersion::new("1.0.0")],
        );
        store.replace_all(&[CatalogEntry::from(record)]).await.unwrap();
        CatalogReader::new(store)
    }

    #[tokio::test]
    async fn test_get_entry_not_found() {
        let reader = reader_with_nginx().await;

        let entry = reader.get_entry(&bitnami().record_id("nginx")).await.unwrap();
        assert_eq!(entry.record.name, "nginx");

        let err = reader
            .get_entry(&bitnami().record_id("redis"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_chart_files_for_known_version() {
        let reader = reader_with_nginx().await;

        reader.put_chart_files(&files("1.0.0")).await.unwrap();
        let cached = reader
            .get_chart_files(&bitnami().record_id("nginx"), "1.0.0")
            .await
            .unwrap();
        assert_eq!(cached.readme.as_deref(), Some("# nginx"));

        let err = reader
            .get_chart_files(&bitnami().record_id("nginx"), "1.1.0")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_chart_files_for_unknown_version_rejected() {
        let reader = reader_with_nginx().await;

        let err = reader.put_chart_files(&files("9.9.9")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        let mut foreign = files("1.0.0");
        foreign.repository = RepositoryId::new("default", "other").unwrap();
        let err = reader.put_chart_files(&foreign).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[tokio::test]
    async fn test_sync_metadata_absent_before_sync() {
        let reader = reader_with_nginx().await;
        assert!(reader.get_sync_metadata(&bitnami()).await.unwrap().is_none());
    }
}
