//! Repository sources: fetching and decoding indexes
//!
//! A [`SourceBackend`] pairs a [`Fetcher`] with an [`IndexDecoder`]. The syncer
//! looks backends up by [`RepositoryKind`] in [`SourceBackends`].

use async_trait::async_trait;
use chart_catalog_core::{
    Credential, Maintainer, PackageRecord, PackageVersion, Repository, RepositoryKind,
};
use chrono::{DateTime, Utc};
use reqwest::header::AUTHORIZATION;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument, warn};
use url::Url;

use crate::error::{ServiceError, ServiceResult};

/// Default timeout for a single index fetch
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Retrieves raw bytes from a repository endpoint
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Fetch `url`, authenticating with `credential` when given.
    ///
    /// # Errors
    ///
    /// Returns `ServiceError::Fetch` on network failure or a non-success status.
    async fn get(&self, url: &Url, credential: Option<&Credential>) -> ServiceResult<Vec<u8>>;
}

/// Fetcher over HTTP(S)
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    /// Build a fetcher with its own client
    pub fn new(timeout: Duration) -> ServiceResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("chart-catalog/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ServiceError::Internal(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self { client })
    }

    /// Use an existing client
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    #[instrument(skip(self, credential), fields(url = %url))]
    async fn get(&self, url: &Url, credential: Option<&Credential>) -> ServiceResult<Vec<u8>> {
        let fetch_error = |message: String| ServiceError::Fetch {
            url: url.to_string(),
            message,
        };

        let mut request = self.client.get(url.clone());
        if let Some(credential) = credential {
            if let Some(header) = credential.authorization_header() {
                request = request.header(AUTHORIZATION, header);
            } else if let Some((username, password)) = credential.basic_auth() {
                request = request.basic_auth(username, Some(password));
            }
        }

        let response = request.send().await.map_err(|e| fetch_error(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(fetch_error(format!("unexpected status {}", status)));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| fetch_error(format!("failed to read body: {}", e)))?;

        debug!(bytes = body.len(), "Fetched index");
        Ok(body.to_vec())
    }
}

/// Turns raw index bytes into package records
pub trait IndexDecoder: Send + Sync {
    /// Decode every package of `repository` described by `bytes`.
    ///
    /// # Errors
    ///
    /// Returns `ServiceError::Validation` when the index is malformed.
    fn decode(&self, bytes: &[u8], repository: &Repository) -> ServiceResult<Vec<PackageRecord>>;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HelmIndexFile {
    #[serde(default)]
    api_version: Option<String>,
    #[serde(default)]
    entries: BTreeMap<String, Vec<HelmChartVersion>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HelmChartVersion {
    version: String,
    #[serde(default)]
    app_version: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    home: Option<String>,
    #[serde(default)]
    icon: Option<String>,
    #[serde(default)]
    keywords: Vec<String>,
    #[serde(default)]
    maintainers: Vec<HelmMaintainer>,
    #[serde(default)]
    sources: Vec<String>,
    #[serde(default)]
    urls: Vec<String>,
    #[serde(default)]
    created: Option<String>,
    #[serde(default)]
    digest: Option<String>,
    #[serde(default)]
    deprecated: bool,
    #[serde(default)]
    annotations: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct HelmMaintainer {
    #[serde(default)]
    name: String,
    #[serde(default)]
    email: Option<String>,
}

/// Decoder for Helm `index.yaml` files
#[derive(Debug, Clone, Default)]
pub struct HelmIndexDecoder;

impl HelmIndexDecoder {
    /// Create a decoder
    pub fn new() -> Self {
        Self
    }

    fn to_record(
        repository: &Repository,
        name: &str,
        chart_versions: Vec<HelmChartVersion>,
    ) -> Option<PackageRecord> {
        let versions: Vec<PackageVersion> = chart_versions
            .iter()
            .map(|v| PackageVersion {
                version: v.version.clone(),
                app_version: v.app_version.clone(),
                created: v.created.as_deref().and_then(parse_created),
                digest: v.digest.clone(),
                urls: v.urls.clone(),
            })
            .collect();

        let mut record = PackageRecord::new(repository.id.clone(), name, versions);
        let latest = record.latest_version()?.version.clone();
        let metadata = chart_versions.into_iter().find(|v| v.version == latest)?;

        // A deprecated latest version deprecates the whole chart
        if metadata.deprecated {
            debug!(chart = name, "Skipping deprecated chart");
            return None;
        }

        record.description = metadata.description;
        record.home = metadata.home;
        record.icon = metadata.icon;
        record.category = metadata.annotations.get("category").cloned();
        record.keywords = metadata.keywords;
        record.sources = metadata.sources;
        record.maintainers = metadata
            .maintainers
            .into_iter()
            .filter(|m| !m.name.is_empty())
            .map(|m| Maintainer {
                name: m.name,
                email: m.email,
            })
            .collect();
        if !metadata.annotations.is_empty() {
            record.metadata = serde_json::json!({ "annotations": metadata.annotations });
        }

        Some(record)
    }
}

impl IndexDecoder for HelmIndexDecoder {
    fn decode(&self, bytes: &[u8], repository: &Repository) -> ServiceResult<Vec<PackageRecord>> {
        let index: HelmIndexFile = serde_yaml::from_slice(bytes)
            .map_err(|e| ServiceError::Validation(format!("malformed index: {}", e)))?;

        if let Some(ref api_version) = index.api_version {
            if api_version != "v1" {
                warn!(api_version = %api_version, "Unexpected index apiVersion");
            }
        }

        let mut records = Vec::with_capacity(index.entries.len());
        for (name, chart_versions) in index.entries {
            if name.trim().is_empty() || name.contains('/') {
                warn!(chart = %name, "Skipping chart with unusable name");
                continue;
            }
            if chart_versions.is_empty() {
                continue;
            }
            if let Some(record) = Self::to_record(repository, &name, chart_versions) {
                record.validate()?;
                records.push(record);
            }
        }

        Ok(records)
    }
}

fn parse_created(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|created| created.with_timezone(&Utc))
}

/// A fetcher and decoder pair for one repository kind
#[derive(Clone)]
pub struct SourceBackend {
    /// Retrieves the index
    pub fetcher: Arc<dyn Fetcher>,
    /// Decodes the index
    pub decoder: Arc<dyn IndexDecoder>,
}

/// Backends by repository kind
#[derive(Clone, Default)]
pub struct SourceBackends {
    backends: HashMap<RepositoryKind, SourceBackend>,
}

impl SourceBackends {
    /// An empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry serving Helm repositories through `fetcher`
    pub fn helm(fetcher: Arc<dyn Fetcher>) -> Self {
        Self::new().register(RepositoryKind::Helm, fetcher, Arc::new(HelmIndexDecoder::new()))
    }

    /// Register (or replace) the backend for a kind
    pub fn register(
        mut self,
        kind: RepositoryKind,
        fetcher: Arc<dyn Fetcher>,
        decoder: Arc<dyn IndexDecoder>,
    ) -> Self {
        self.backends.insert(kind, SourceBackend { fetcher, decoder });
        self
    }

    /// Backend for a kind
    pub fn get(&self, kind: RepositoryKind) -> ServiceResult<&SourceBackend> {
        self.backends.get(&kind).ok_or_else(|| {
            ServiceError::Validation(format!("no source backend registered for {} repositories", kind))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use chart_catalog_core::RepositoryId;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const INDEX: &str = r#"
apiVersion: v1
entries:
  nginx:
    - name: nginx
      version: 1.2.0
      appVersion: "1.25.0"
      description: NGINX web server
      icon: https://example.com/nginx.png
      keywords: [web, proxy]
      maintainers:
        - name: Bitnami
          email: containers@bitnami.com
      urls: [https://charts.example.com/nginx-1.2.0.tgz]
      created: "2024-02-01T10:00:00.123456789Z"
      annotations:
        category: Infrastructure
    - name: nginx
      version: 1.10.0
      description: NGINX web server (latest)
      urls: [https://charts.example.com/nginx-1.10.0.tgz]
  legacy:
    - name: legacy
      version: 0.1.0
      deprecated: true
  empty: []
generated: "2024-02-01T10:00:00Z"
"#;

    fn repository() -> Repository {
        Repository::new(
            RepositoryId::new("default", "bitnami").unwrap(),
            "https://charts.example.com",
        )
    }

    #[test]
    fn test_decode_helm_index() {
        let records = HelmIndexDecoder::new()
            .decode(INDEX.as_bytes(), &repository())
            .unwrap();

        assert_eq!(records.len(), 1);
        let nginx = &records[0];
        assert_eq!(nginx.id.as_str(), "default/bitnami/nginx");
        assert_eq!(nginx.versions.len(), 2);
        assert_eq!(nginx.latest_version().unwrap().version, "1.10.0");
        assert_eq!(nginx.description.as_deref(), Some("NGINX web server (latest)"));
    }

    #[test]
    fn test_decode_keeps_version_details() {
        let records = HelmIndexDecoder::new()
            .decode(INDEX.as_bytes(), &repository())
            .unwrap();
        let older = &records[0].versions[1];

        assert_eq!(older.version, "1.2.0");
        assert_eq!(older.app_version.as_deref(), Some("1.25.0"));
        assert!(older.created.is_some());
        assert_eq!(older.urls.len(), 1);
    }

    #[test]
    fn test_decode_rejects_malformed_index() {
        let err = HelmIndexDecoder::new()
            .decode(b"entries: [not, a, map", &repository())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[test]
    fn test_decode_empty_index_yields_nothing() {
        let records = HelmIndexDecoder::new()
            .decode(b"apiVersion: v1\nentries: {}\n", &repository())
            .unwrap();
        assert!(records.is_empty());
    }

    #[test]
    fn test_backends_reject_unregistered_kind() {
        let fetcher = Arc::new(HttpFetcher::with_client(reqwest::Client::new()));
        let backends = SourceBackends::helm(fetcher);

        assert!(backends.get(RepositoryKind::Helm).is_ok());
        let err = backends.get(RepositoryKind::Oci).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[tokio::test]
    async fn test_http_fetcher_sends_bearer_token() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/charts/index.yaml"))
            .and(header("authorization", "Bearer s3cret"))
            .respond_with(ResponseTemplate::new(200).set_body_string(INDEX))
            .mount(&server)
            .await;

        let fetcher = HttpFetcher::new(DEFAULT_FETCH_TIMEOUT).unwrap();
        let url = Url::parse(&format!("{}/charts/index.yaml", server.uri())).unwrap();
        let body = fetcher
            .get(&url, Some(&Credential::bearer("s3cret")))
            .await
            .unwrap();

        assert_eq!(body, INDEX.as_bytes());
    }

    #[tokio::test]
    async fn test_http_fetcher_sends_basic_auth() {
        let server = MockServer::start().await;
        // "user:pass" base64-encoded
        Mock::given(method("GET"))
            .and(header("authorization", "Basic dXNlcjpwYXNz"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .mount(&server)
            .await;

        let fetcher = HttpFetcher::new(DEFAULT_FETCH_TIMEOUT).unwrap();
        let url = Url::parse(&format!("{}/index.yaml", server.uri())).unwrap();
        let body = fetcher
            .get(&url, Some(&Credential::basic("user", "pass")))
            .await
            .unwrap();

        assert_eq!(body, b"ok");
    }

    #[tokio::test]
    async fn test_http_fetcher_maps_error_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let fetcher = HttpFetcher::new(DEFAULT_FETCH_TIMEOUT).unwrap();
        let url = Url::parse(&format!("{}/index.yaml", server.uri())).unwrap();
        let err = fetcher.get(&url, None).await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::TransientIo);
        assert!(err.to_string().contains("503"));
    }
}
