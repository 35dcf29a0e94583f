//! Devtools Event Log
//!
//! Every graph and lifecycle mutation appends an event to a bounded
//! ring. The log is append-only and snapshotted per reader; when the
//! ring is full the oldest events are dropped. Observers (devtools,
//! tests) poll snapshots — the engine never blocks on them.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::atom::{Action, ActiveState};

/// Default ring capacity.
pub const DEFAULT_EVENT_CAPACITY: usize = 10_000;

/// What happened, with ids rendered as plain strings so the log is
/// serializable without holding graph references.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "payload", rename_all = "camelCase")]
pub enum EventAction {
    /// An edge between two live nodes was created.
    #[serde(rename_all = "camelCase")]
    EdgeCreated {
        dependent: String,
        dependency: String,
        operation: String,
    },
    /// An edge was removed.
    #[serde(rename_all = "camelCase")]
    EdgeRemoved { dependent: String, dependency: String },
    /// An edge was created while its dependency was still initializing.
    #[serde(rename_all = "camelCase")]
    GhostEdgeCreated { dependent: String, dependency: String },
    /// A ghost edge was promoted (its dependency activated) or torn
    /// down with a failed initialization.
    #[serde(rename_all = "camelCase")]
    GhostEdgeDestroyed { dependent: String, dependency: String },
    /// An instance moved through its lifecycle machine.
    #[serde(rename_all = "camelCase")]
    InstanceActiveStateChanged { id: String, state: ActiveState },
    /// An instance's store committed a new state.
    #[serde(rename_all = "camelCase")]
    InstanceStateChanged {
        id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        action: Option<Action>,
    },
    /// A destructor panicked during destruction; swallowed.
    #[serde(rename_all = "camelCase")]
    DestructorPanicked { id: String },
    /// A listener panicked during a notification pass; swallowed.
    #[serde(rename_all = "camelCase")]
    ListenerPanicked { id: String },
}

/// One log entry.
#[derive(Debug, Clone, Serialize)]
pub struct EcosystemEvent {
    /// Monotonic per-ecosystem sequence number.
    pub id: u64,
    /// Wall-clock time the event was recorded.
    pub timestamp: DateTime<Utc>,
    /// What happened.
    pub action: EventAction,
}

/// Bounded append-only ring of [`EcosystemEvent`]s.
pub(crate) struct EventLog {
    events: Mutex<VecDeque<EcosystemEvent>>,
    next_id: AtomicU64,
    capacity: usize,
}

impl EventLog {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            events: Mutex::new(VecDeque::new()),
            next_id: AtomicU64::new(0),
            capacity,
        }
    }

    /// Append an event, evicting the oldest entry when full.
    pub(crate) fn append(&self, action: EventAction) {
        tracing::trace!(?action, "ecosystem event");
        let event = EcosystemEvent {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            timestamp: Utc::now(),
            action,
        };
        let mut events = self.events.lock().expect("event log lock poisoned");
        if events.len() == self.capacity {
            events.pop_front();
        }
        events.push_back(event);
    }

    /// Copy of the current ring contents, oldest first.
    pub(crate) fn snapshot(&self) -> Vec<EcosystemEvent> {
        self.events
            .lock()
            .expect("event log lock poisoned")
            .iter()
            .cloned()
            .collect()
    }

    pub(crate) fn clear(&self) {
        self.events.lock().expect("event log lock poisoned").clear();
    }
}
