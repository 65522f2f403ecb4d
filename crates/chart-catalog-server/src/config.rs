//! Daemon configuration
//!
//! Configuration is layered, later sources override earlier ones:
//! - `config/default.toml`
//! - `config/{environment}.toml`
//! - Environment variables (`CHART_CATALOG__SECTION__KEY`)
//! - Command-line arguments

use chart_catalog_core::{Repository, RepositoryId, VersionPolicy};
use chart_catalog_db::{NatsFeedConfig, PoolConfig, DEFAULT_DATABASE_URL_ENV};
use chart_catalog_service::{PullConfig, DEFAULT_SYNC_CONCURRENCY};
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

/// Daemon configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServerConfig {
    /// Database settings
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Change feed settings
    #[serde(default)]
    pub nats: NatsConfig,

    /// Repository sync settings
    #[serde(default)]
    pub sync: SyncConfig,

    /// Artifact pull settings
    #[serde(default)]
    pub pull: PullSettings,

    /// Logging settings
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Database configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Use PostgreSQL; the catalog is kept in memory otherwise
    #[serde(default)]
    pub enabled: bool,

    /// Database connection URL
    #[serde(default = "default_database_url")]
    pub url: String,

    /// Maximum number of connections in the pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Minimum number of connections in the pool
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,

    /// Seconds to wait for a pooled connection
    #[serde(default = "default_acquire_timeout")]
    pub acquire_timeout_seconds: u64,

    /// Idle timeout in seconds
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_seconds: u64,

    /// Run migrations on startup
    #[serde(default = "default_true")]
    pub run_migrations: bool,
}

fn default_database_url() -> String {
    std::env::var(DEFAULT_DATABASE_URL_ENV)
        .unwrap_or_else(|_| "postgres://localhost/chart_catalog".to_string())
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    2
}

fn default_acquire_timeout() -> u64 {
    30
}

fn default_idle_timeout() -> u64 {
    600
}

fn default_true() -> bool {
    true
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: default_database_url(),
            max_connections: default_max_connections(),
            min_connections: default_min_connections(),
            acquire_timeout_seconds: default_acquire_timeout(),
            idle_timeout_seconds: default_idle_timeout(),
            run_migrations: default_true(),
        }
    }
}

impl DatabaseConfig {
    /// Pool settings for this configuration
    pub fn pool_config(&self, log_statements: bool) -> PoolConfig {
        PoolConfig::new(&self.url)
            .min_connections(self.min_connections)
            .max_connections(self.max_connections)
            .acquire_timeout(Duration::from_secs(self.acquire_timeout_seconds))
            .idle_timeout(Duration::from_secs(self.idle_timeout_seconds))
            .run_migrations(self.run_migrations)
            .log_statements(log_statements)
    }
}

/// NATS change feed configuration
#[derive(Debug, Clone, Deserialize)]
pub struct NatsConfig {
    /// Watch pull requests over NATS; requires the database
    #[serde(default)]
    pub enabled: bool,

    /// NATS server URL
    #[serde(default = "default_nats_url")]
    pub url: String,

    /// Subject prefix the reconciler publishes under
    #[serde(default = "default_subject_prefix")]
    pub subject_prefix: String,
}

fn default_nats_url() -> String {
    "nats://localhost:4222".to_string()
}

fn default_subject_prefix() -> String {
    "catalog.pullrequests".to_string()
}

impl Default for NatsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: default_nats_url(),
            subject_prefix: default_subject_prefix(),
        }
    }
}

impl NatsConfig {
    pub fn feed_config(&self) -> NatsFeedConfig {
        NatsFeedConfig::new(&self.url)
            .with_client_name("chart-catalog-server")
            .with_subject_prefix(&self.subject_prefix)
    }
}

/// Repository sync configuration
#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
    /// Seconds between syncs of each repository
    #[serde(default = "default_sync_interval")]
    pub interval_seconds: u64,

    /// Repositories synced at once by a one-shot pass
    #[serde(default = "default_sync_concurrency")]
    pub concurrency: usize,

    /// Repositories to mirror
    #[serde(default)]
    pub repositories: Vec<Repository>,
}

fn default_sync_interval() -> u64 {
    600
}

fn default_sync_concurrency() -> usize {
    DEFAULT_SYNC_CONCURRENCY
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval_seconds: default_sync_interval(),
            concurrency: default_sync_concurrency(),
            repositories: Vec::new(),
        }
    }
}

impl SyncConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_seconds.max(1))
    }
}

/// Artifact pull configuration
#[derive(Debug, Clone, Deserialize)]
pub struct PullSettings {
    /// Whether existing pull requests must match the requested version
    #[serde(default)]
    pub version_policy: VersionPolicy,

    /// Reconcile interval requested on new pull requests
    #[serde(default = "default_pull_interval")]
    pub interval: String,

    /// Seconds the `resolve` command waits for an artifact
    #[serde(default = "default_resolve_timeout")]
    pub resolve_timeout_seconds: u64,
}

fn default_pull_interval() -> String {
    chart_catalog_core::pull::DEFAULT_PULL_INTERVAL.to_string()
}

fn default_resolve_timeout() -> u64 {
    300
}

impl Default for PullSettings {
    fn default() -> Self {
        Self {
            version_policy: VersionPolicy::default(),
            interval: default_pull_interval(),
            resolve_timeout_seconds: default_resolve_timeout(),
        }
    }
}

impl PullSettings {
    pub fn pull_config(&self) -> PullConfig {
        PullConfig {
            version_policy: self.version_policy,
            interval: self.interval.clone(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Use JSON formatting
    #[serde(default)]
    pub json_format: bool,

    /// Include thread IDs
    #[serde(default)]
    pub include_thread_ids: bool,

    /// Include target module
    #[serde(default = "default_true")]
    pub include_target: bool,

    /// Log SQL statements
    #[serde(default)]
    pub log_statements: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json_format: false,
            include_thread_ids: false,
            include_target: true,
            log_statements: false,
        }
    }
}

impl ServerConfig {
    /// Load configuration from files and environment
    ///
    /// # Errors
    ///
    /// Returns an error if a source cannot be parsed or the result is invalid
    pub fn load(config_dir: impl Into<PathBuf>, environment: &str) -> Result<Self, ConfigError> {
        let config_dir = config_dir.into();

        let config = Config::builder()
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            .add_source(File::from(config_dir.join(format!("{}.toml", environment))).required(false))
            // e.g. CHART_CATALOG__SYNC__INTERVAL_SECONDS=60
            .add_source(
                Environment::with_prefix("CHART_CATALOG")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Self = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the daemon cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.nats.enabled && !self.database.enabled {
            return Err(ConfigError::Message(
                "nats change feed requires database.enabled".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for repository in &self.sync.repositories {
            RepositoryId::new(&repository.id.namespace, &repository.id.name)
                .map_err(|e| ConfigError::Message(e.to_string()))?;
            if !seen.insert(&repository.id) {
                return Err(ConfigError::Message(format!(
                    "repository {} configured twice",
                    repository.id
                )));
            }
        }
        Ok(())
    }

    /// Reject configurations under which no reconciler can settle a pull request.
    ///
    /// Resolving needs pull requests in PostgreSQL and status changes from NATS;
    /// anywhere else they stay private to this process.
    pub fn validate_for_resolve(&self) -> Result<(), ConfigError> {
        if !self.database.enabled || !self.nats.enabled {
            return Err(ConfigError::Message(
                "resolve requires database.enabled and nats.enabled, \
                 otherwise no reconciler can see the pull request"
                    .to_string(),
            ));
        }
        Ok(())
    }
}

/// Get the current environment name
///
/// Reads from the `ENVIRONMENT` or `ENV` environment variable,
/// defaulting to "development" if not set.
pub fn get_environment() -> String {
    std::env::var("ENVIRONMENT")
        .or_else(|_| std::env::var("ENV"))
        .unwrap_or_else(|_| "development".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chart_catalog_core::RepositoryKind;
    use std::fs;

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert!(!config.database.enabled);
        assert!(!config.nats.enabled);
        assert_eq!(config.sync.interval(), Duration::from_secs(600));
        assert_eq!(config.sync.concurrency, DEFAULT_SYNC_CONCURRENCY);
        assert_eq!(config.pull.pull_config(), PullConfig::default());
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_load_repositories_from_file() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("default.toml"),
            r#"
[sync]
interval_seconds = 60

[[sync.repositories]]
namespace = "default"
name = "bitnami"
url = "https://charts.bitnami.com/bitnami"

[[sync.repositories]]
namespace = "team-a"
name = "internal"
url = "https://charts.internal.example.com"
credential = { type = "bearer", token = "s3cr3t" }

[pull]
version_policy = "exact"
"#,
        )
        .unwrap();

        let config = ServerConfig::load(dir.path(), "test").unwrap();
        assert_eq!(config.sync.interval_seconds, 60);
        assert_eq!(config.sync.repositories.len(), 2);
        assert_eq!(config.sync.repositories[0].kind, RepositoryKind::Helm);
        assert!(config.sync.repositories[1].credential.is_some());
        assert_eq!(config.pull.version_policy, VersionPolicy::Exact);
    }

    #[test]
    fn test_environment_file_overrides_default() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("default.toml"), "[logging]\nlevel = \"info\"\n").unwrap();
        fs::write(dir.path().join("production.toml"), "[logging]\njson_format = true\nlevel = \"warn\"\n")
            .unwrap();

        let config = ServerConfig::load(dir.path(), "production").unwrap();
        assert_eq!(config.logging.level, "warn");
        assert!(config.logging.json_format);
    }

    #[test]
    fn test_duplicate_repository_rejected() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("default.toml"),
            r#"
[[sync.repositories]]
namespace = "default"
name = "bitnami"
url = "https://a.example.com"

[[sync.repositories]]
namespace = "default"
name = "bitnami"
url = "https://b.example.com"
"#,
        )
        .unwrap();

        assert!(ServerConfig::load(dir.path(), "test").is_err());
    }

    #[test]
    fn test_nats_requires_database() {
        let mut config = ServerConfig::default();
        config.nats.enabled = true;
        assert!(config.validate().is_err());

        config.database.enabled = true;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_resolve_requires_shared_pull_requests() {
        let mut config = ServerConfig::default();
        let err = config.validate_for_resolve().unwrap_err();
        assert!(err.to_string().contains("nats.enabled"));

        config.database.enabled = true;
        assert!(config.validate_for_resolve().is_err());

        config.nats.enabled = true;
        assert!(config.validate_for_resolve().is_ok());
    }
}
