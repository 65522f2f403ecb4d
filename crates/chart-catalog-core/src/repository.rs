//! Package repository definitions
//!
//! A [`Repository`] is the unit of synchronization: an endpoint serving an index,
//! optional credentials for that endpoint and the kind of index it serves.

use secrecy::{ExposeSecret, Secret};
use serde::{Deserialize, Serialize};
use std::fmt;
use url::Url;

use crate::error::{CatalogError, Result};
use crate::types::{RepositoryId, RepositoryKind};

/// File name of a Helm repository index relative to the repository URL
pub const INDEX_FILE_NAME: &str = "index.yaml";

/// Credentials used when fetching from a repository endpoint
#[derive(Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Credential {
    /// `Authorization: Bearer <token>`
    Bearer { token: Secret<String> },
    /// HTTP basic authentication
    Basic {
        username: String,
        password: Secret<String>,
    },
    /// A complete `Authorization` header value, passed through verbatim
    Header { value: Secret<String> },
}

impl Credential {
    /// Bearer token credential
    pub fn bearer(token: impl Into<String>) -> Self {
        Self::Bearer {
            token: Secret::new(token.into()),
        }
    }

    /// Basic auth credential
    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self::Basic {
            username: username.into(),
            password: Secret::new(password.into()),
        }
    }

    /// Raw authorization header credential
    pub fn header(value: impl Into<String>) -> Self {
        Self::Header {
            value: Secret::new(value.into()),
        }
    }

    /// Raw header value for the bearer and passthrough forms.
    ///
    /// Basic credentials return `None`; HTTP clients encode those themselves.
    pub fn authorization_header(&self) -> Option<String> {
        match self {
            Self::Bearer { token } => Some(format!("Bearer {}", token.expose_secret())),
            Self::Header { value } => Some(value.expose_secret().clone()),
            Self::Basic { .. } => None,
        }
    }

    /// Username and password for the basic form
    pub fn basic_auth(&self) -> Option<(&str, &str)> {
        match self {
            Self::Basic { username, password } => {
                Some((username.as_str(), password.expose_secret().as_str()))
            }
            _ => None,
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bearer { .. } => write!(f, "Credential::Bearer(***)"),
            Self::Basic { username, .. } => write!(f, "Credential::Basic({}, ***)", username),
            Self::Header { .. } => write!(f, "Credential::Header(***)"),
        }
    }
}

/// A package repository to be mirrored into the catalog
#[derive(Debug, Clone, Deserialize)]
pub struct Repository {
    /// Repository identity
    #[serde(flatten)]
    pub id: RepositoryId,

    /// Source endpoint as configured (validated at sync time)
    pub url: String,

    /// Index format served by the endpoint
    #[serde(default)]
    pub kind: RepositoryKind,

    /// Optional credential for the endpoint
    #[serde(default)]
    pub credential: Option<Credential>,
}

impl Repository {
    /// Create a Helm repository without credentials
    pub fn new(id: RepositoryId, url: impl Into<String>) -> Self {
        Self {
            id,
            url: url.into(),
            kind: RepositoryKind::Helm,
            credential: None,
        }
    }

    /// Set the repository kind
    pub fn with_kind(mut self, kind: RepositoryKind) -> Self {
        self.kind = kind;
        self
    }

    /// Set the credential
    pub fn with_credential(mut self, credential: Credential) -> Self {
        self.credential = Some(credential);
        self
    }
}

/// Validate and normalize a repository endpoint.
///
/// Surrounding whitespace is ignored. The result is an absolute `http` or `https`
/// URL with a host.
pub fn normalize_endpoint(raw: &str) -> Result<Url> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(CatalogError::InvalidEndpoint("endpoint is empty".to_string()));
    }

    let url = Url::parse(trimmed)
        .map_err(|e| CatalogError::InvalidEndpoint(format!("{}: {}", trimmed, e)))?;

    match url.scheme() {
        "http" | "https" => {}
        other => {
            return Err(CatalogError::InvalidEndpoint(format!(
                "unsupported scheme {} in {}",
                other, trimmed
            )))
        }
    }

    if url.host_str().map_or(true, str::is_empty) {
        return Err(CatalogError::InvalidEndpoint(format!(
            "missing host in {}",
            trimmed
        )));
    }

    Ok(url)
}

/// URL of the `index.yaml` file for a normalized repository endpoint
pub fn index_url(endpoint: &Url) -> Url {
    let mut url = endpoint.clone();
    let path = format!("{}/{}", endpoint.path().trim_end_matches('/'), INDEX_FILE_NAME);
    url.set_path(&path);
    url
}
