//! PostgreSQL implementations of the catalog and pull request stores
//!
//! Catalog entries live in `charts` as opaque JSON documents keyed by record ID,
//! sync bookkeeping in `repos`, cached chart files in `chart_files`, and pull
//! requests in `pull_requests`.

use async_trait::async_trait;
use chart_catalog_core::{
    CatalogEntry, ChartFiles, Checksum, PullCondition, PullRequest, PullRequestSpec,
    PullSelector, PullStatus, RecordId, RepositoryId, SyncMetadata,
};
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use std::collections::BTreeMap;
use std::str::FromStr;
use tracing::{debug, info, instrument};

use crate::error::{DbError, DbResult};
use crate::store::{CatalogStore, PullRequestStore};

/// Rows per multi-row INSERT; four binds per row keeps us well under the
/// PostgreSQL parameter limit.
const INSERT_CHUNK_SIZE: usize = 1000;

/// PostgreSQL implementation of CatalogStore
#[derive(Debug, Clone)]
pub struct PostgresCatalogStore {
    pool: PgPool,
}

impl PostgresCatalogStore {
    /// Create a new PostgreSQL catalog store
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl CatalogStore for PostgresCatalogStore {
    #[instrument(skip(self), fields(repository = %repository))]
    async fn get_checksum(&self, repository: &RepositoryId) -> DbResult<Option<Checksum>> {
        let checksum: Option<String> =
            sqlx::query_scalar("SELECT checksum FROM repos WHERE namespace = $1 AND name = $2")
                .bind(&repository.namespace)
                .bind(&repository.name)
                .fetch_optional(&self.pool)
                .await?;

        checksum.map(|value| parse_checksum(&value)).transpose()
    }

    #[instrument(skip(self, entries), fields(entries = entries.len()))]
    async fn replace_all(&self, entries: &[CatalogEntry]) -> DbResult<()> {
        if entries.is_empty() {
            return Err(DbError::NoRecords("empty entry set".to_string()));
        }

        // Later duplicates win, so a batch never upserts the same row twice
        let mut rows: BTreeMap<&str, (&CatalogEntry, JsonValue)> = BTreeMap::new();
        let mut touched: BTreeMap<&RepositoryId, Vec<String>> = BTreeMap::new();
        for entry in entries {
            entry.record.validate()?;
            rows.insert(entry.id.as_str(), (entry, entry.document()?));
        }
        for (id, (entry, _)) in &rows {
            touched
                .entry(&entry.repository)
                .or_default()
                .push((*id).to_string());
        }

        let rows: Vec<(&CatalogEntry, JsonValue)> = rows.into_values().collect();

        let mut tx = self.pool.begin().await?;

        for chunk in rows.chunks(INSERT_CHUNK_SIZE) {
            let mut builder: QueryBuilder<Postgres> =
                QueryBuilder::new("INSERT INTO charts (id, repo_namespace, repo_name, info) ");
            builder.push_values(chunk, |mut row, (entry, document)| {
                row.push_bind(entry.id.as_str())
                    .push_bind(entry.repository.namespace.as_str())
                    .push_bind(entry.repository.name.as_str())
                    .push_bind(document.clone());
            });
            builder.push(
                " ON CONFLICT (id) DO UPDATE SET \
                 repo_namespace = EXCLUDED.repo_namespace, \
                 repo_name = EXCLUDED.repo_name, \
                 info = EXCLUDED.info",
            );
            builder.build().execute(&mut *tx).await?;
        }

        for (repository, ids) in &touched {
            let pruned = sqlx::query(
                r#"
                DELETE FROM charts
                WHERE repo_namespace = $1 AND repo_name = $2 AND NOT (id = ANY($3))
                "#,
            )
            .bind(&repository.namespace)
            .bind(&repository.name)
            .bind(ids)
            .execute(&mut *tx)
            .await?;

            sqlx::query(
                r#"
                DELETE FROM chart_files
                WHERE repo_namespace = $1 AND repo_name = $2 AND NOT (chart_id = ANY($3))
                "#,
            )
            .bind(&repository.namespace)
            .bind(&repository.name)
            .bind(ids)
            .execute(&mut *tx)
            .await?;

            debug!(
                repository = %repository,
                kept = ids.len(),
                pruned = pruned.rows_affected(),
                "Replaced repository entries"
            );
        }

        tx.commit().await?;
        Ok(())
    }

    #[instrument(skip(self, checksum), fields(repository = %repository))]
    async fn upsert_sync_metadata(
        &self,
        repository: &RepositoryId,
        checksum: &Checksum,
        last_update: DateTime<Utc>,
    ) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO repos (namespace, name, checksum, last_update)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (namespace, name)
            DO UPDATE SET checksum = EXCLUDED.checksum, last_update = EXCLUDED.last_update
            "#,
        )
        .bind(&repository.namespace)
        .bind(&repository.name)
        .bind(checksum.to_string())
        .bind(last_update)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    #[instrument(skip(self), fields(repository = %repository))]
    async fn delete_repository(&self, repository: &RepositoryId) -> DbResult<()> {
        let mut tx = self.pool.begin().await?;

        let charts = sqlx::query("DELETE FROM charts WHERE repo_namespace = $1 AND repo_name = $2")
            .bind(&repository.namespace)
            .bind(&repository.name)
            .execute(&mut *tx)
            .await?;

        sqlx::query("DELETE FROM chart_files WHERE repo_namespace = $1 AND repo_name = $2")
            .bind(&repository.namespace)
            .bind(&repository.name)
            .execute(&mut *tx)
            .await?;

        sqlx::query("DELETE FROM repos WHERE namespace = $1 AND name = $2")
            .bind(&repository.namespace)
            .bind(&repository.name)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        info!(charts = charts.rows_affected(), "Repository deleted from catalog");
        Ok(())
    }

    #[instrument(skip(self), fields(repository = %repository))]
    async fn list_entries(&self, repository: &RepositoryId) -> DbResult<Vec<CatalogEntry>> {
        let documents: Vec<JsonValue> = sqlx::query_scalar(
            "SELECT info FROM charts WHERE repo_namespace = $1 AND repo_name = $2 ORDER BY id",
        )
        .bind(&repository.namespace)
        .bind(&repository.name)
        .fetch_all(&self.pool)
        .await?;

        documents
            .into_iter()
            .map(|document| CatalogEntry::from_document(document).map_err(DbError::from))
            .collect()
    }

    #[instrument(skip(self), fields(id = %id))]
    async fn get_entry(&self, id: &RecordId) -> DbResult<Option<CatalogEntry>> {
        let document: Option<JsonValue> =
            sqlx::query_scalar("SELECT info FROM charts WHERE id = $1")
                .bind(id.as_str())
                .fetch_optional(&self.pool)
                .await?;

        document
            .map(|document| CatalogEntry::from_document(document).map_err(DbError::from))
            .transpose()
    }

    #[instrument(skip(self), fields(repository = %repository))]
    async fn get_sync_metadata(
        &self,
        repository: &RepositoryId,
    ) -> DbResult<Option<SyncMetadata>> {
        let row = sqlx::query(
            "SELECT checksum, last_update FROM repos WHERE namespace = $1 AND name = $2",
        )
        .bind(&repository.namespace)
        .bind(&repository.name)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let checksum: String = row.try_get("checksum")?;
                Ok(Some(SyncMetadata {
                    repository: repository.clone(),
                    checksum: parse_checksum(&checksum)?,
                    last_update: row.try_get("last_update")?,
                }))
            }
            None => Ok(None),
        }
    }

    #[instrument(skip(self, files), fields(id = %files.record_id, version = %files.version))]
    async fn put_chart_files(&self, files: &ChartFiles) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO chart_files (
                chart_id, repo_namespace, repo_name, version, readme, values_yaml, values_schema
            ) VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (chart_id, version) DO UPDATE SET
                readme = EXCLUDED.readme,
                values_yaml = EXCLUDED.values_yaml,
                values_schema = EXCLUDED.values_schema
            "#,
        )
        .bind(files.record_id.as_str())
        .bind(&files.repository.namespace)
        .bind(&files.repository.name)
        .bind(&files.version)
        .bind(&files.readme)
        .bind(&files.values)
        .bind(&files.schema)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    #[instrument(skip(self), fields(id = %id))]
    async fn get_chart_files(&self, id: &RecordId, version: &str) -> DbResult<Option<ChartFiles>> {
        let row = sqlx::query(
            r#"
            SELECT repo_namespace, repo_name, readme, values_yaml, values_schema
            FROM chart_files WHERE chart_id = $1 AND version = $2
            "#,
        )
        .bind(id.as_str())
        .bind(version)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let repository = RepositoryId::new(
            row.try_get::<String, _>("repo_namespace")?,
            row.try_get::<String, _>("repo_name")?,
        )?;

        Ok(Some(ChartFiles {
            record_id: id.clone(),
            repository,
            version: version.to_string(),
            readme: row.try_get("readme")?,
            values: row.try_get("values_yaml")?,
            schema: row.try_get("values_schema")?,
        }))
    }

    async fn health_check(&self) -> DbResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

/// PostgreSQL implementation of PullRequestStore
#[derive(Debug, Clone)]
pub struct PostgresPullRequestStore {
    pool: PgPool,
}

impl PostgresPullRequestStore {
    /// Create a new PostgreSQL pull request store
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

const PULL_REQUEST_COLUMNS: &str = "namespace, name, repository, package, version, \
     reconcile_every, condition, message, location, created_at, resource_version";

#[async_trait]
impl PullRequestStore for PostgresPullRequestStore {
    #[instrument(skip(self, request), fields(namespace = %request.namespace, name = %request.name))]
    async fn create(&self, request: PullRequest) -> DbResult<PullRequest> {
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO pull_requests (
                namespace, name, repository, package, version, reconcile_every,
                condition, message, location, created_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            RETURNING {}
            "#,
            PULL_REQUEST_COLUMNS
        ))
        .bind(&request.namespace)
        .bind(&request.name)
        .bind(&request.spec.repository)
        .bind(&request.spec.package)
        .bind(&request.spec.version)
        .bind(&request.spec.interval)
        .bind(request.status.condition.to_string())
        .bind(&request.status.message)
        .bind(&request.status.location)
        .bind(request.created_at)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match DbError::from(e) {
            DbError::UniqueViolation(_) => DbError::AlreadyExists(format!(
                "pull request {}/{}",
                request.namespace, request.name
            )),
            other => other,
        })?;

        let created = row_to_pull_request(&row)?;
        debug!(resource_version = created.resource_version, "Pull request created");
        Ok(created)
    }

    #[instrument(skip(self), fields(namespace = %selector.namespace))]
    async fn list(&self, selector: &PullSelector) -> DbResult<Vec<PullRequest>> {
        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(format!(
            "SELECT {} FROM pull_requests WHERE namespace = ",
            PULL_REQUEST_COLUMNS
        ));
        builder.push_bind(&selector.namespace);

        if let Some(ref name) = selector.name {
            builder.push(" AND name = ").push_bind(name);
        }
        if let Some(ref repository) = selector.repository {
            builder.push(" AND repository = ").push_bind(repository);
        }
        if let Some(ref package) = selector.package {
            builder.push(" AND package = ").push_bind(package);
        }
        match selector.version {
            Some(Some(ref version)) => {
                builder.push(" AND version = ").push_bind(version);
            }
            Some(None) => {
                builder.push(" AND version IS NULL");
            }
            None => {}
        }
        builder.push(" ORDER BY created_at, name");

        let rows = builder.build().fetch_all(&self.pool).await?;
        rows.iter().map(row_to_pull_request).collect()
    }

    #[instrument(skip(self))]
    async fn get(&self, namespace: &str, name: &str) -> DbResult<Option<PullRequest>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM pull_requests WHERE namespace = $1 AND name = $2",
            PULL_REQUEST_COLUMNS
        ))
        .bind(namespace)
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_pull_request).transpose()
    }
}

fn parse_checksum(value: &str) -> DbResult<Checksum> {
    Checksum::from_str(value)
        .map_err(|e| DbError::InvalidData(format!("Invalid stored checksum: {}", e)))
}

/// Convert a database row to a PullRequest
fn row_to_pull_request(row: &PgRow) -> DbResult<PullRequest> {
    let condition: String = row.try_get("condition")?;
    let condition = PullCondition::from_str(&condition)
        .map_err(|e| DbError::InvalidData(format!("Invalid pull condition: {}", e)))?;

    let resource_version: i64 = row.try_get("resource_version")?;
    let resource_version = u64::try_from(resource_version).map_err(|_| {
        DbError::InvalidData(format!("Negative resource version: {}", resource_version))
    })?;

    Ok(PullRequest {
        name: row.try_get("name")?,
        namespace: row.try_get("namespace")?,
        spec: PullRequestSpec {
            repository: row.try_get("repository")?,
            package: row.try_get("package")?,
            version: row.try_get("version")?,
            interval: row.try_get("reconcile_every")?,
        },
        status: PullStatus {
            condition,
            message: row.try_get("message")?,
            location: row.try_get("location")?,
        },
        created_at: row.try_get("created_at")?,
        resource_version,
    })
}
