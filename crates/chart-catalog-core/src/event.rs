//! Change notifications for pull request resources
//!
//! Events are delivered over a watch subscription and never persisted. The wire
//! form mirrors a Kubernetes watch event: `{"type": "MODIFIED", "object": {...}}`.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::pull::PullRequest;

/// Kind of change carried by an event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    Added,
    Modified,
    Deleted,
    Error,
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChangeKind::Added => write!(f, "ADDED"),
            ChangeKind::Modified => write!(f, "MODIFIED"),
            ChangeKind::Deleted => write!(f, "DELETED"),
            ChangeKind::Error => write!(f, "ERROR"),
        }
    }
}

/// A change to a pull request resource
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "object", rename_all = "UPPERCASE")]
pub enum ChangeEvent {
    /// Resource created; carries the new state
    Added(PullRequest),
    /// Resource updated; carries the new state
    Modified(PullRequest),
    /// Resource removed; carries the last known state
    Deleted(PullRequest),
    /// The stream itself reported a problem
    Error(String),
}

impl ChangeEvent {
    /// Kind of this event
    pub fn kind(&self) -> ChangeKind {
        match self {
            ChangeEvent::Added(_) => ChangeKind::Added,
            ChangeEvent::Modified(_) => ChangeKind::Modified,
            ChangeEvent::Deleted(_) => ChangeKind::Deleted,
            ChangeEvent::Error(_) => ChangeKind::Error,
        }
    }

    /// Resource snapshot, absent for stream errors
    pub fn object(&self) -> Option<&PullRequest> {
        match self {
            ChangeEvent::Added(obj) | ChangeEvent::Modified(obj) | ChangeEvent::Deleted(obj) => {
                Some(obj)
            }
            ChangeEvent::Error(_) => None,
        }
    }

    /// Resource version of the snapshot, if any
    pub fn resource_version(&self) -> Option<u64> {
        self.object().map(|obj| obj.resource_version)
    }
}

impl fmt::Display for ChangeEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChangeEvent::Error(message) => write!(f, "ChangeEvent(ERROR: {})", message),
            _ => match self.object() {
                Some(obj) => write!(
                    f,
                    "ChangeEvent({} {}/{} rv={})",
                    self.kind(),
                    obj.namespace,
                    obj.name,
                    obj.resource_version
                ),
                None => write!(f, "ChangeEvent({})", self.kind()),
            },
        }
    }
}
