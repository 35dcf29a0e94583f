//! Graph Nodes
//!
//! This module defines the node and edge types that live in the
//! dependency graph.
//!
//! Every participant in the graph is a node: atom instances, external
//! subscribers (host-side callbacks), and selector caches. An edge runs
//! from a dependent to its dependency and is mirrored on both endpoints
//! so the graph can be walked in either direction in O(1) per step.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

/// Unique identifier for a node in the dependency graph.
///
/// Atom instances use `"{template_key}-{params_hash:x}"` (or the bare
/// template key for parameterless atoms), so the id is a pure function
/// of the template and its params. External subscribers and selector
/// caches get their own prefixes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(Arc<str>);

impl NodeId {
    /// Id for an atom instance of `key` with an optional params hash.
    pub fn atom(key: &str, params_hash: Option<u64>) -> Self {
        match params_hash {
            Some(hash) => Self(format!("{key}-{hash:x}").into()),
            None => Self(key.into()),
        }
    }

    /// Id for a new external subscriber node.
    pub fn external() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(format!("ext-{}", COUNTER.fetch_add(1, Ordering::Relaxed)).into())
    }

    /// Id for a selector cache keyed by `key`.
    pub fn selector(key: &str) -> Self {
        Self(format!("sel-{key}").into())
    }

    /// The raw id string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Cheap handle to the underlying string.
    pub fn raw(&self) -> Arc<str> {
        Arc::clone(&self.0)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(id: &str) -> Self {
        Self(id.into())
    }
}

/// The kind of node in the dependency graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    /// A live atom instance. Can have both dependencies and dependents.
    AtomInstance,

    /// A host-side subscriber. Leaves of the graph: they have
    /// dependencies but never dependents, and they are notified last in
    /// every flush so they observe a consistent graph snapshot.
    ExternalSubscriber,

    /// A cached selector over the graph. Has dependencies; a dependency
    /// change only marks the cache dirty.
    SelectorCache,
}

bitflags! {
    /// Per-edge flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EdgeFlags: u8 {
        /// Created by a direct dependency call, not derived bookkeeping.
        const EXPLICIT = 1;
        /// The dependent endpoint is an external subscriber.
        const EXTERNAL = 1 << 1;
        /// The dependent pins the dependency's lifetime but does not
        /// want `StateChanged` notifications.
        const STATIC = 1 << 2;
        /// Reserved.
        const DEFERRED = 1 << 3;
    }
}

impl EdgeFlags {
    /// Whether `StateChanged` notifications flow across this edge.
    pub fn is_dynamic(&self) -> bool {
        !self.contains(EdgeFlags::STATIC)
    }
}

/// Why a dependent is being notified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum NotifyReason {
    /// The dependency's state changed.
    StateChanged,
    /// The dependency was destroyed.
    Destroyed,
    /// The edge itself was just created.
    EdgeAdded,
}

/// Callback attached to an edge whose dependent is an external
/// subscriber.
pub type NotifyFn = Arc<dyn Fn(NotifyReason) + Send + Sync>;

/// A directed dependency from a dependent node to its dependency.
#[derive(Clone)]
pub struct Edge {
    /// The node that depends (reads).
    pub dependent: NodeId,
    /// The node depended upon (read).
    pub dependency: NodeId,
    /// Flag bits.
    pub flags: EdgeFlags,
    /// Devtools label for the call that created the edge
    /// (`"get"`, `"getInstance"`, `"subscribe"`, `"select"`).
    pub operation: Arc<str>,
    /// Notification callback, present only on external edges.
    pub notify: Option<NotifyFn>,
}

impl Edge {
    /// Create an edge with no callback.
    pub fn new(dependent: NodeId, dependency: NodeId, flags: EdgeFlags, operation: &str) -> Self {
        Self {
            dependent,
            dependency,
            flags,
            operation: operation.into(),
            notify: None,
        }
    }

    /// Attach a notification callback.
    pub fn with_notify(mut self, notify: NotifyFn) -> Self {
        self.notify = Some(notify);
        self
    }
}

impl fmt::Debug for Edge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Edge")
            .field("dependent", &self.dependent)
            .field("dependency", &self.dependency)
            .field("flags", &self.flags)
            .field("operation", &self.operation)
            .field("has_notify", &self.notify.is_some())
            .finish()
    }
}

/// A node in the dependency graph.
///
/// Dependencies ("incoming" edges: data flows in from them) and
/// dependents ("outgoing" edges: notifications flow out to them) are
/// both kept as maps keyed by the far endpoint, so edge lookups and
/// removals are O(1) and destruction can walk both sides.
#[derive(Debug)]
pub struct Node {
    id: NodeId,
    kind: NodeKind,
    dependencies: HashMap<NodeId, Edge>,
    dependents: HashMap<NodeId, Edge>,
    weight: u64,
}

impl Node {
    /// Create a node of the given kind. Weight starts at 1, the weight
    /// of a node with no atom dependencies.
    pub fn new(id: NodeId, kind: NodeKind) -> Self {
        Self {
            id,
            kind,
            dependencies: HashMap::new(),
            dependents: HashMap::new(),
            weight: 1,
        }
    }

    /// The node's id.
    pub fn id(&self) -> &NodeId {
        &self.id
    }

    /// The node's kind.
    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    /// Notification-order weight: `1 + Σ weight(dependency)` over
    /// atom-instance dependencies. Dependents always weigh more than
    /// any of their dependencies, which is what makes a plain
    /// ascending-weight sweep a topological order.
    pub fn weight(&self) -> u64 {
        self.weight
    }

    pub(crate) fn set_weight(&mut self, weight: u64) {
        self.weight = weight;
    }

    /// Edges to the nodes this node reads.
    pub fn dependencies(&self) -> &HashMap<NodeId, Edge> {
        &self.dependencies
    }

    /// Edges from the nodes that read this node.
    pub fn dependents(&self) -> &HashMap<NodeId, Edge> {
        &self.dependents
    }

    /// Number of dependents currently pinning this node.
    pub fn dependent_count(&self) -> usize {
        self.dependents.len()
    }

    pub(crate) fn insert_dependency(&mut self, edge: Edge) {
        self.dependencies.insert(edge.dependency.clone(), edge);
    }

    pub(crate) fn insert_dependent(&mut self, edge: Edge) {
        self.dependents.insert(edge.dependent.clone(), edge);
    }

    pub(crate) fn remove_dependency(&mut self, id: &NodeId) -> Option<Edge> {
        self.dependencies.remove(id)
    }

    pub(crate) fn remove_dependent(&mut self, id: &NodeId) -> Option<Edge> {
        self.dependents.remove(id)
    }

    pub(crate) fn dependency_mut(&mut self, id: &NodeId) -> Option<&mut Edge> {
        self.dependencies.get_mut(id)
    }

    pub(crate) fn dependent_mut(&mut self, id: &NodeId) -> Option<&mut Edge> {
        self.dependents.get_mut(id)
    }
}
