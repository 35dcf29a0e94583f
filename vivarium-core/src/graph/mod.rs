//! Dependency Graph
//!
//! This module implements the dependency graph that tracks relationships
//! between atom instances, selector caches, and external subscribers.
//!
//! # Overview
//!
//! The graph is a directed acyclic graph (DAG) where:
//!
//! - Nodes represent atom instances, selector caches, or host-side
//!   subscribers
//! - Edges run from a dependent to its dependency and carry flags
//!   (explicit/external/static) plus an optional notify callback
//!
//! When an atom's state changes, we traverse the graph over dynamic
//! dependent edges to find all affected nodes and deliver at most one
//! notification to each, dependencies before dependents, host
//! subscribers last.
//!
//! # Design Decisions
//!
//! 1. We use a centralized graph owned by the ecosystem rather than
//!    shared mutable pointer cycles because:
//!    - It enables a deterministic global notification order
//!    - It keeps destruction bounded: removing a node walks both edge
//!      maps and nothing else
//!    - Edges are plain data, not `Rc` webs that can leak
//!
//! 2. Each edge is mirrored on both endpoints for O(1) traversal in
//!    either direction.
//!
//! 3. Notification order is derived from incrementally-maintained node
//!    weights instead of a per-flush topological sort.

mod node;
mod scheduler;

pub use node::{Edge, EdgeFlags, Node, NodeId, NodeKind, NotifyFn, NotifyReason};
pub use scheduler::{DependencyGraph, EdgeOutcome};
