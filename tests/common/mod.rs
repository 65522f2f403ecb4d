//! Common test utilities and helpers
//!
//! Each [`TestCatalog`] runs its own mock chart server and in-memory stores, so
//! tests never share state.

#![allow(dead_code)]

use chart_catalog_core::{
    PullCondition, PullRequest, PullSelector, PullStatus, Repository, RepositoryId,
};
use chart_catalog_db::{InMemoryCatalogStore, InMemoryPullRequests, PullRequestStore};
use chart_catalog_service::{CatalogServices, CatalogServicesBuilder, PullConfig};
use std::sync::Arc;
use tokio::task::JoinHandle;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

pub mod fixtures;

pub const NAMESPACE: &str = "default";

/// Test application state
pub struct TestCatalog {
    pub server: MockServer,
    pub store: Arc<InMemoryCatalogStore>,
    pub requests: Arc<InMemoryPullRequests>,
    pub services: CatalogServices,
}

impl TestCatalog {
    /// Create a catalog with default pull settings
    pub async fn new() -> Self {
        Self::with_pull_config(PullConfig::default()).await
    }

    /// Create a catalog with custom pull settings
    pub async fn with_pull_config(pull_config: PullConfig) -> Self {
        let server = MockServer::start().await;
        let store = Arc::new(InMemoryCatalogStore::new());
        let requests = Arc::new(InMemoryPullRequests::new());

        let services = CatalogServicesBuilder::new()
            .catalog_store(store.clone())
            .pull_requests(requests.clone())
            .change_feed(requests.clone())
            .pull_config(pull_config)
            .build()
            .expect("Failed to build services");

        Self {
            server,
            store,
            requests,
            services,
        }
    }

    /// Repository `name` in the default namespace, served by the mock server
    pub fn repository(&self, name: &str) -> Repository {
        Repository::new(
            RepositoryId::new(NAMESPACE, name).expect("valid repository id"),
            format!("{}/{}", self.server.uri(), name),
        )
    }

    /// Serve `body` as the index of repository `name`
    pub async fn serve_index(&self, name: &str, body: impl Into<String>) {
        Mock::given(method("GET"))
            .and(path(format!("/{}/index.yaml", name)))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(body.into())
                    .insert_header("content-type", "application/x-yaml"),
            )
            .mount(&self.server)
            .await;
    }

    /// Replace every served index with `body` for repository `name`
    pub async fn replace_index(&self, name: &str, body: impl Into<String>) {
        self.server.reset().await;
        self.serve_index(name, body).await;
    }

    /// Answer requests for repository `name` with `status`
    pub async fn fail_index(&self, name: &str, status: u16) {
        Mock::given(method("GET"))
            .and(path(format!("/{}/index.yaml", name)))
            .respond_with(ResponseTemplate::new(status))
            .mount(&self.server)
            .await;
    }

    /// Names of the packages stored for repository `name`
    pub async fn package_names(&self, name: &str) -> Vec<String> {
        let repository = RepositoryId::new(NAMESPACE, name).expect("valid repository id");
        self.services
            .catalog()
            .list_entries(&repository)
            .await
            .expect("Failed to list entries")
            .into_iter()
            .map(|entry| entry.record.name)
            .collect()
    }

    /// Number of requests the mock server received
    pub async fn fetch_count(&self) -> usize {
        self.server
            .received_requests()
            .await
            .map(|requests| requests.len())
            .unwrap_or(0)
    }

    /// Play the external reconciler: settle the first pull request that appears
    pub fn spawn_reconciler(&self, status: PullStatus) -> JoinHandle<PullRequest> {
        let requests = self.requests.clone();
        tokio::spawn(async move {
            loop {
                let pending = requests
                    .list(&PullSelector::namespace(NAMESPACE))
                    .await
                    .expect("Failed to list pull requests");
                if let Some(request) = pending.into_iter().next() {
                    return requests
                        .update_status(NAMESPACE, &request.name, status)
                        .await
                        .expect("Failed to update pull request");
                }
                tokio::task::yield_now().await;
            }
        })
    }

    /// Wait until at least `count` subscriptions are open
    pub async fn until_watching(&self, count: usize) {
        while self.requests.watcher_count().await < count {
            tokio::task::yield_now().await;
        }
    }
}

/// Status the reconciler reports for a ready artifact
pub fn ready(location: &str) -> PullStatus {
    PullStatus {
        condition: PullCondition::Ready,
        message: None,
        location: Some(location.to_string()),
    }
}

/// Status the reconciler reports for a failed pull
pub fn failed(message: &str) -> PullStatus {
    PullStatus {
        condition: PullCondition::Failed,
        message: Some(message.to_string()),
        location: None,
    }
}
