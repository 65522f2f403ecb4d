//! Persistence layer for the chart catalog
//!
//! This crate provides:
//! - Connection pool management and migrations
//! - Store traits for catalog entries, pull requests and change feeds
//! - PostgreSQL implementations with SQLx
//! - In-memory implementations for tests and database-less runs
//! - A NATS-backed change feed
//!
//! # Example
//!
//! ```rust,no_run
//! use chart_catalog_db::{create_pool, CatalogStore, PoolConfig, PostgresCatalogStore};
//! use chart_catalog_core::RepositoryId;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = PoolConfig::new("postgres://localhost/chart_catalog").max_connections(10);
//! let pool = create_pool(&config).await?;
//!
//! let store = PostgresCatalogStore::new(pool);
//! let repository = RepositoryId::new("default", "bitnami")?;
//! let checksum = store.get_checksum(&repository).await?;
//! # Ok(())
//! # }
//! ```

// Re-export core domain types for convenience
pub use chart_catalog_core;

pub mod error;
pub mod memory;
pub mod nats_feed;
pub mod pool;
pub mod postgres;
pub mod store;

pub use error::{DbError, DbResult};
pub use memory::{InMemoryCatalogStore, InMemoryPullRequests};
pub use nats_feed::{NatsChangeFeed, NatsFeedConfig};
pub use pool::{
    close_pool, create_pool, mask_password, run_migrations, verify_pool_health, PoolConfig,
};
pub use postgres::{PostgresCatalogStore, PostgresPullRequestStore};
pub use store::{CatalogStore, ChangeFeed, PullRequestStore, Subscription};

// Re-export sqlx types that users may need
pub use sqlx::postgres::PgPool;

/// Default database URL environment variable name
pub const DEFAULT_DATABASE_URL_ENV: &str = "DATABASE_URL";
