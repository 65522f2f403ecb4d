//! Waiting for a pull request to settle
//!
//! The waiter subscribes to changes of one pull request and resolves once the
//! reconciler marks it ready or failed. It has no timeout of its own; dropping
//! the future cancels the wait and releases the subscription.

use chart_catalog_core::{ChangeEvent, PullRequest, PullSelector};
use chart_catalog_db::{ChangeFeed, PullRequestStore};
use std::sync::Arc;
use tracing::{debug, instrument, warn};

use crate::error::{ServiceError, ServiceResult};

/// Observed state of a watched pull request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitState {
    /// Not settled yet
    Pending,
    /// Artifact available at the location
    Ready(String),
    /// Reconciler reported failure, or the request disappeared
    Failed(String),
    /// The change stream ended
    StreamClosed,
    /// The change stream reported an error
    StreamError(String),
}

impl WaitState {
    /// State implied by a snapshot of the request
    pub fn observe(request: &PullRequest) -> Self {
        if let Some(location) = request.ready_location() {
            WaitState::Ready(location.to_string())
        } else if request.is_failed() {
            WaitState::Failed(request.failure_message())
        } else {
            WaitState::Pending
        }
    }

    /// Whether waiting is over
    pub fn is_terminal(&self) -> bool {
        !matches!(self, WaitState::Pending)
    }

    /// Apply one event for the request named `name`.
    ///
    /// Events about other resources leave the state unchanged.
    pub fn transition(self, name: &str, event: Option<ChangeEvent>) -> Self {
        if self.is_terminal() {
            return self;
        }

        match event {
            None => WaitState::StreamClosed,
            Some(ChangeEvent::Error(message)) => WaitState::StreamError(message),
            Some(ChangeEvent::Added(request)) | Some(ChangeEvent::Modified(request)) => {
                if request.name == name {
                    WaitState::observe(&request)
                } else {
                    self
                }
            }
            Some(ChangeEvent::Deleted(request)) => {
                if request.name == name {
                    WaitState::Failed("pull request was deleted before it became ready".to_string())
                } else {
                    self
                }
            }
        }
    }

    fn into_result(self, name: &str) -> ServiceResult<String> {
        match self {
            WaitState::Ready(location) => Ok(location),
            WaitState::Failed(message) => Err(ServiceError::ReconciliationFailed {
                name: name.to_string(),
                message,
            }),
            WaitState::StreamClosed | WaitState::Pending => {
                Err(ServiceError::StreamClosed(name.to_string()))
            }
            WaitState::StreamError(message) => Err(ServiceError::Stream(message)),
        }
    }
}

/// Blocks until a pull request is ready or failed
#[derive(Clone)]
pub struct ArtifactReadyWaiter {
    requests: Arc<dyn PullRequestStore>,
    feed: Arc<dyn ChangeFeed>,
}

impl ArtifactReadyWaiter {
    /// Create a waiter reading snapshots from `requests` and changes from `feed`
    pub fn new(requests: Arc<dyn PullRequestStore>, feed: Arc<dyn ChangeFeed>) -> Self {
        Self { requests, feed }
    }

    /// Wait for `request` to settle and return its artifact location.
    ///
    /// # Errors
    ///
    /// - `ReconciliationFailed` when the reconciler marks it failed or it is deleted
    /// - `StreamClosed` / `Stream` when the change stream ends or errors
    #[instrument(skip(self, request), fields(namespace = %request.namespace, name = %request.name))]
    pub async fn wait(&self, request: &PullRequest) -> ServiceResult<String> {
        let selector = PullSelector::named(request.namespace.clone(), request.name.clone());
        let mut subscription = self.feed.watch(&selector, request.resource_version).await?;

        // Catch a transition that landed before the subscription was live
        let mut state = match self.requests.get(&request.namespace, &request.name).await? {
            Some(current) => WaitState::observe(&current),
            None => WaitState::Failed("pull request no longer exists".to_string()),
        };

        while !state.is_terminal() {
            let event = subscription.next().await;
            if let Some(ref event) = event {
                debug!(event = %event, "Change received");
            }
            state = state.transition(&request.name, event);
        }
        subscription.close();

        if let WaitState::StreamClosed | WaitState::StreamError(_) = state {
            warn!(state = ?state, "Change stream ended before the pull request settled");
        }
        state.into_result(&request.name)
    }
}
