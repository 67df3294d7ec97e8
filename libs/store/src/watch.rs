//! Watch subscriptions over the store's change log.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tiller_api::{Kind, LabelSelector, Object, ObjectKey};
use tokio::sync::watch;

use crate::store::SharedState;

/// The type of a change event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    Added,
    Modified,
    Deleted,
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EventType::Added => "ADDED",
            EventType::Modified => "MODIFIED",
            EventType::Deleted => "DELETED",
        };
        write!(f, "{}", s)
    }
}

/// One entry in the change log.
///
/// `object` is the state after the write; for deletions it is the last
/// state the object had.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchEvent {
    /// Globally monotonic sequence number; doubles as the resume token.
    pub sequence: u64,

    pub event_type: EventType,

    pub object: Object,
}

impl WatchEvent {
    #[must_use]
    pub fn key(&self) -> ObjectKey {
        self.object.key()
    }
}

/// Which events a subscription wants to see.
#[derive(Debug, Clone, Default)]
pub struct WatchFilter {
    pub kind: Option<Kind>,
    pub namespace: Option<String>,
    pub selector: Option<LabelSelector>,
}

impl WatchFilter {
    /// Filter for one kind, all namespaces, no selector.
    #[must_use]
    pub fn kind(kind: Kind) -> Self {
        Self {
            kind: Some(kind),
            namespace: None,
            selector: None,
        }
    }

    /// Filter matching every event.
    #[must_use]
    pub fn everything() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_selector(mut self, selector: LabelSelector) -> Self {
        self.selector = Some(selector);
        self
    }

    /// Evaluates the filter against an event's object.
    #[must_use]
    pub fn matches(&self, event: &WatchEvent) -> bool {
        if let Some(kind) = self.kind {
            if event.object.kind() != kind {
                return false;
            }
        }
        if let Some(namespace) = &self.namespace {
            if &event.object.meta.namespace != namespace {
                return false;
            }
        }
        if let Some(selector) = &self.selector {
            if !selector.matches(&event.object.meta.labels) {
                return false;
            }
        }
        true
    }
}

/// A lazy, restartable sequence of change events.
///
/// Dropping the stream is the only way to unsubscribe; the store keeps no
/// per-subscriber state.
pub struct WatchStream {
    shared: Arc<SharedState>,
    filter: WatchFilter,
    cursor: u64,
    head: watch::Receiver<u64>,
}

impl WatchStream {
    pub(crate) fn new(
        shared: Arc<SharedState>,
        filter: WatchFilter,
        resume_after: Option<u64>,
        head: watch::Receiver<u64>,
    ) -> Self {
        Self {
            shared,
            filter,
            cursor: resume_after.unwrap_or(0),
            head,
        }
    }

    /// The resume token: sequence of the last event returned.
    #[must_use]
    pub fn resume_token(&self) -> u64 {
        self.cursor
    }

    /// Returns the next matching event, waiting for one if necessary.
    pub async fn next(&mut self) -> WatchEvent {
        loop {
            if let Some(event) = self.poll() {
                return event;
            }
            // Wait for the head sequence to move. An error here cannot
            // happen while the store is alive; treat it as pending forever.
            if self.head.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }

    /// Returns the next matching event if one is already in the log.
    pub fn try_next(&mut self) -> Option<WatchEvent> {
        self.poll()
    }

    fn poll(&mut self) -> Option<WatchEvent> {
        let state = self.shared.state.read().expect("store lock poisoned");
        for event in state.events_after(self.cursor) {
            if self.filter.matches(event) {
                self.cursor = event.sequence;
                return Some(event.clone());
            }
            self.cursor = event.sequence;
        }
        None
    }
}
