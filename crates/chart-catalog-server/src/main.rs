//! Chart Catalog daemon
//!
//! Mirrors configured chart repositories into the catalog on a fixed interval and
//! offers one-shot commands for syncing, deleting repositories and resolving
//! artifacts.

mod config;
mod telemetry;

use anyhow::{bail, Context, Result};
use chart_catalog_core::{PackageRef, Repository, RepositoryId};
use chart_catalog_db::{
    close_pool, create_pool, mask_password, InMemoryCatalogStore, InMemoryPullRequests,
    NatsChangeFeed, PgPool, PostgresCatalogStore, PostgresPullRequestStore,
};
use chart_catalog_service::{CatalogServices, CatalogServicesBuilder};
use clap::{Parser, Subcommand};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::ServerConfig;

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration directory
    #[arg(short, long, env = "CONFIG_DIR", default_value = "config")]
    config_dir: String,

    /// Environment (development, production, etc.)
    #[arg(short, long, env = "ENVIRONMENT", default_value_t = crate::config::get_environment())]
    environment: String,

    /// Database URL; implies database.enabled
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,

    /// Log level
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Sync every configured repository on an interval until interrupted
    Run,
    /// Sync every configured repository once
    Sync,
    /// Delete a repository and everything stored for it
    Delete { namespace: String, name: String },
    /// Resolve `repository/package` to a ready artifact location
    Resolve {
        namespace: String,
        identifier: String,
        #[arg(long)]
        version: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let args = Args::parse();

    let mut config = ServerConfig::load(&args.config_dir, &args.environment)
        .context("Failed to load configuration")?;
    if let Some(database_url) = args.database_url {
        config.database.url = database_url;
        config.database.enabled = true;
    }
    if let Some(log_level) = args.log_level {
        config.logging.level = log_level;
    }

    telemetry::init_with_config(telemetry::TelemetryConfig::from(&config.logging));

    info!(environment = %args.environment, "Starting chart catalog");

    let command = args.command.unwrap_or(Command::Run);
    check_command(&command, &config)?;

    let (services, pool) = build_services(&config).await?;

    let result = match command {
        Command::Run => run(services, &config).await,
        Command::Sync => sync_once(&services, &config.sync.repositories).await,
        Command::Delete { namespace, name } => {
            let repository = RepositoryId::new(namespace, name)?;
            services.delete_repository(&repository).await?;
            Ok(())
        }
        Command::Resolve {
            namespace,
            identifier,
            version,
        } => {
            let mut package_ref = PackageRef::parse(namespace, &identifier)?;
            if let Some(version) = version {
                package_ref = package_ref.with_version(version);
            }
            let timeout = Duration::from_secs(config.pull.resolve_timeout_seconds);
            let location = tokio::time::timeout(timeout, services.resolve_artifact(&package_ref))
                .await
                .with_context(|| format!("Timed out after {:?} resolving {}", timeout, package_ref))??;
            println!("{}", location);
            Ok(())
        }
    };

    if let Some(pool) = pool {
        close_pool(pool).await;
    }
    info!("Shutdown complete");
    result
}

/// Reject a command the configuration cannot serve, before connecting anything
fn check_command(command: &Command, config: &ServerConfig) -> Result<()> {
    if let Command::Resolve { .. } = command {
        config
            .validate_for_resolve()
            .context("Cannot resolve artifacts with this configuration")?;
    }
    Ok(())
}

/// Build the service context from configuration
async fn build_services(config: &ServerConfig) -> Result<(CatalogServices, Option<PgPool>)> {
    let builder = CatalogServicesBuilder::new()
        .pull_config(config.pull.pull_config())
        .sync_concurrency(config.sync.concurrency);

    if !config.database.enabled {
        info!("Database disabled, keeping the catalog in memory");
        let requests = Arc::new(InMemoryPullRequests::new());
        let services = builder
            .catalog_store(Arc::new(InMemoryCatalogStore::new()))
            .pull_requests(requests.clone())
            .change_feed(requests)
            .build()?;
        return Ok((services, None));
    }

    info!(database = %mask_password(&config.database.url), "Connecting to database");
    let pool = create_pool(&config.database.pool_config(config.logging.log_statements))
        .await
        .context("Failed to create database connection pool")?;

    let builder = builder.catalog_store(Arc::new(PostgresCatalogStore::new(pool.clone())));
    let builder = if config.nats.enabled {
        let feed = NatsChangeFeed::connect(config.nats.feed_config())
            .await
            .context("Failed to connect to NATS")?;
        builder
            .pull_requests(Arc::new(PostgresPullRequestStore::new(pool.clone())))
            .change_feed(Arc::new(feed))
    } else {
        warn!("NATS disabled, pull requests are tracked in memory");
        let requests = Arc::new(InMemoryPullRequests::new());
        builder.pull_requests(requests.clone()).change_feed(requests)
    };

    Ok((builder.build()?, Some(pool)))
}

/// One sync pass over all repositories
async fn sync_once(services: &CatalogServices, repositories: &[Repository]) -> Result<()> {
    let report = services.sync_all(repositories).await;
    for (repository, result) in &report.results {
        match result {
            Ok(outcome) if outcome.is_skipped() => info!(%repository, "Unchanged"),
            Ok(outcome) => info!(%repository, checksum = %outcome.checksum(), "Synced"),
            Err(e) => error!(%repository, kind = %e.kind(), error = %e, "Failed"),
        }
    }

    if report.failures() > 0 {
        bail!(
            "{} of {} repositories failed to sync",
            report.failures(),
            report.results.len()
        );
    }
    Ok(())
}

/// Sync each repository from its own task until a shutdown signal arrives
async fn run(services: CatalogServices, config: &ServerConfig) -> Result<()> {
    let shutdown = CancellationToken::new();
    let interval = config.sync.interval();

    if config.sync.repositories.is_empty() {
        warn!("No repositories configured");
    }

    let mut tasks = JoinSet::new();
    for repository in config.sync.repositories.iter().cloned() {
        tasks.spawn(sync_loop(
            services.clone(),
            repository,
            interval,
            shutdown.child_token(),
        ));
    }
    info!(
        repositories = config.sync.repositories.len(),
        interval_seconds = interval.as_secs(),
        "Sync loop started"
    );

    shutdown_signal().await;
    shutdown.cancel();

    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined {
            error!(error = %e, "Sync task panicked");
        }
    }
    Ok(())
}

async fn sync_loop(
    services: CatalogServices,
    repository: Repository,
    interval: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }

        // An interrupted sync rolls back; the next run redoes it
        tokio::select! {
            _ = shutdown.cancelled() => break,
            result = services.sync(&repository) => match result {
                Ok(outcome) => debug!(repository = %repository.id, skipped = outcome.is_skipped(), "Sync finished"),
                Err(e) => warn!(
                    repository = %repository.id,
                    kind = %e.kind(),
                    retryable = e.is_retryable(),
                    error = %e,
                    "Sync failed"
                ),
            },
        }
    }
    debug!(repository = %repository.id, "Sync loop stopped");
}

/// Wait for SIGTERM or SIGINT (Ctrl+C)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }
}
