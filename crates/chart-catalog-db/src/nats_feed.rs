//! NATS change feed
//!
//! The external reconciler publishes pull request change events as JSON on
//! `catalog.pullrequests.{namespace}`. Core NATS has no replay, so a watch only
//! sees events published after it subscribed; callers re-read the current state
//! after subscribing to cover the gap.

use async_nats::{Client, ConnectOptions};
use async_trait::async_trait;
use chart_catalog_core::{ChangeEvent, PullSelector};
use futures::StreamExt;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use crate::error::{DbError, DbResult};
use crate::store::{is_visible, ChangeFeed, Subscription};

/// Default subject prefix; the namespace is appended
pub const DEFAULT_SUBJECT_PREFIX: &str = "catalog.pullrequests";

/// NATS change feed configuration
#[derive(Debug, Clone)]
pub struct NatsFeedConfig {
    /// NATS server URL
    pub server_url: String,

    /// Client name for identification
    pub client_name: String,

    /// Connection timeout
    pub connect_timeout: Duration,

    /// Delay between reconnect attempts
    pub reconnect_delay: Duration,

    /// Subject prefix
    pub subject_prefix: String,
}

impl Default for NatsFeedConfig {
    fn default() -> Self {
        Self {
            server_url: "nats://localhost:4222".to_string(),
            client_name: "chart-catalog".to_string(),
            connect_timeout: Duration::from_secs(5),
            reconnect_delay: Duration::from_secs(1),
            subject_prefix: DEFAULT_SUBJECT_PREFIX.to_string(),
        }
    }
}

impl NatsFeedConfig {
    /// Create new configuration
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            ..Default::default()
        }
    }

    /// Set client name
    pub fn with_client_name(mut self, name: impl Into<String>) -> Self {
        self.client_name = name.into();
        self
    }

    /// Set subject prefix
    pub fn with_subject_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.subject_prefix = prefix.into();
        self
    }

    /// Subject carrying events for a namespace
    pub fn subject_for(&self, namespace: &str) -> String {
        format!("{}.{}", self.subject_prefix, namespace)
    }
}

/// Change feed backed by a NATS subscription
#[derive(Clone)]
pub struct NatsChangeFeed {
    client: Client,
    config: NatsFeedConfig,
}

impl NatsChangeFeed {
    /// Connect to the NATS server
    pub async fn connect(config: NatsFeedConfig) -> DbResult<Self> {
        info!(server = %config.server_url, "Connecting change feed to NATS");

        let reconnect_delay = config.reconnect_delay;
        let client = ConnectOptions::new()
            .name(&config.client_name)
            .connection_timeout(config.connect_timeout)
            .reconnect_delay_callback(move |attempts| {
                if attempts > 5 {
                    warn!("NATS reconnection attempt #{}", attempts);
                }
                reconnect_delay
            })
            .connect(&config.server_url)
            .await
            .map_err(|e| DbError::Configuration(format!("Failed to connect to NATS: {}", e)))?;

        Ok(Self { client, config })
    }

    /// Publish a change event for the namespace of its object
    pub async fn publish(&self, namespace: &str, event: &ChangeEvent) -> DbResult<()> {
        let subject = self.config.subject_for(namespace);
        let payload = serde_json::to_vec(event)?;

        self.client
            .publish(subject, payload.into())
            .await
            .map_err(|e| DbError::Feed(format!("NATS publish failed: {}", e)))?;

        Ok(())
    }

    /// Check if connected to NATS
    pub fn is_connected(&self) -> bool {
        matches!(
            self.client.connection_state(),
            async_nats::connection::State::Connected
        )
    }
}

#[async_trait]
impl ChangeFeed for NatsChangeFeed {
    #[instrument(skip(self), fields(namespace = %selector.namespace))]
    async fn watch(&self, selector: &PullSelector, since_version: u64) -> DbResult<Subscription> {
        let subject = self.config.subject_for(&selector.namespace);
        let subscriber = self
            .client
            .subscribe(subject.clone())
            .await
            .map_err(|e| DbError::Feed(format!("NATS subscribe to {} failed: {}", subject, e)))?;

        debug!(subject = %subject, "Watching pull requests");

        let selector = selector.clone();
        let events = subscriber.filter_map(move |message| {
            let event = decode_event(&message.payload);
            let visible = is_visible(&event, &selector, since_version);
            futures::future::ready(visible.then_some(event))
        });

        Ok(Subscription::new(events.boxed()))
    }
}

/// Decode a message payload; undecodable payloads surface as stream errors
fn decode_event(payload: &[u8]) -> ChangeEvent {
    serde_json::from_slice(payload).unwrap_or_else(|e| {
        warn!(error = %e, "Undecodable change event");
        ChangeEvent::Error(format!("undecodable change event: {}", e))
    })
}
