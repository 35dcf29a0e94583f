//! Dependency Graph & Notification Ordering
//!
//! The graph maintains the edge tables and computes the order in which
//! dependents are notified when a node's state changes.
//!
//! # Algorithm
//!
//! 1. When a node changes, BFS over its dynamic dependent edges collects
//!    the affected subgraph. Static edges stop propagation: their
//!    dependents asked not to hear about state changes.
//!
//! 2. Affected atoms and selector caches are ordered by `weight`
//!    ascending (a dependent always weighs more than any of its
//!    dependencies), with the node id as a stable tiebreak so repeated
//!    identical mutations produce identical notification sequences.
//!
//! 3. External subscribers are drained last, after every atom has
//!    settled, so host callbacks observe a consistent graph snapshot.
//!
//! Weights are maintained incrementally on edge insertion and removal
//! rather than recomputed per flush; with an acyclic graph this keeps
//! notification ordering O(n log n) in the size of the affected set.

use std::collections::{HashMap, HashSet, VecDeque};

use super::node::{Edge, EdgeFlags, Node, NodeId, NodeKind};

/// Outcome of [`DependencyGraph::add_edge`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeOutcome {
    /// A new edge was inserted.
    Created,
    /// The edge already existed; flags were OR-merged and the original
    /// notify callback kept.
    Merged,
}

/// The bidirectional dependency graph.
///
/// Exclusively owned by the ecosystem; consumers never mutate it
/// directly.
#[derive(Debug, Default)]
pub struct DependencyGraph {
    nodes: HashMap<NodeId, Node>,
}

impl DependencyGraph {
    /// Create an empty graph.
    pub fn new() -> Self {
        Self { nodes: HashMap::new() }
    }

    /// Register a node. Returns false if the id was already present.
    pub fn add_node(&mut self, id: NodeId, kind: NodeKind) -> bool {
        if self.nodes.contains_key(&id) {
            return false;
        }
        self.nodes.insert(id.clone(), Node::new(id, kind));
        true
    }

    /// Remove a node, detaching every edge that involves it.
    ///
    /// Returns the removed node so the caller can notify its dependents.
    pub fn remove_node(&mut self, id: &NodeId) -> Option<Node> {
        let node = self.nodes.remove(id)?;

        for dep_id in node.dependencies().keys() {
            if let Some(dep) = self.nodes.get_mut(dep_id) {
                dep.remove_dependent(id);
            }
        }
        for dependent_id in node.dependents().keys() {
            if let Some(dependent) = self.nodes.get_mut(dependent_id) {
                dependent.remove_dependency(id);
            }
        }

        let dependents: Vec<NodeId> = node.dependents().keys().cloned().collect();
        self.refresh_weights(&dependents);

        Some(node)
    }

    /// Whether a node is registered.
    pub fn contains(&self, id: &NodeId) -> bool {
        self.nodes.contains_key(id)
    }

    /// Get a node.
    pub fn get(&self, id: &NodeId) -> Option<&Node> {
        self.nodes.get(id)
    }

    /// Total number of registered nodes.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// All node ids, unordered.
    pub fn node_ids(&self) -> Vec<NodeId> {
        self.nodes.keys().cloned().collect()
    }

    /// Ids of the nodes `id` reads.
    pub fn dependency_ids(&self, id: &NodeId) -> Vec<NodeId> {
        self.nodes
            .get(id)
            .map(|n| n.dependencies().keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of dependents currently pinning `id`.
    pub fn dependent_count(&self, id: &NodeId) -> usize {
        self.nodes.get(id).map(|n| n.dependent_count()).unwrap_or(0)
    }

    /// Insert an edge, mirrored on both endpoints.
    ///
    /// Idempotent on `(dependent, dependency)`: re-adding OR-merges the
    /// flags and keeps the first notify callback. Both endpoints must be
    /// registered; an edge to an unknown node is silently dropped, which
    /// preserves the invariant that every stored edge has two live ends.
    pub fn add_edge(&mut self, edge: Edge) -> Option<EdgeOutcome> {
        if !self.nodes.contains_key(&edge.dependent) || !self.nodes.contains_key(&edge.dependency) {
            return None;
        }

        let exists = self
            .nodes
            .get(&edge.dependent)
            .map(|n| n.dependencies().contains_key(&edge.dependency))
            .unwrap_or(false);

        if exists {
            let flags = edge.flags;
            if let Some(node) = self.nodes.get_mut(&edge.dependent) {
                if let Some(existing) = node.dependency_mut(&edge.dependency) {
                    existing.flags |= flags;
                }
            }
            if let Some(node) = self.nodes.get_mut(&edge.dependency) {
                if let Some(existing) = node.dependent_mut(&edge.dependent) {
                    existing.flags |= flags;
                }
            }
            return Some(EdgeOutcome::Merged);
        }

        if let Some(node) = self.nodes.get_mut(&edge.dependent) {
            node.insert_dependency(edge.clone());
        }
        if let Some(node) = self.nodes.get_mut(&edge.dependency) {
            node.insert_dependent(edge.clone());
        }

        self.refresh_weights(&[edge.dependent.clone()]);
        Some(EdgeOutcome::Created)
    }

    /// Remove the edge from `dependent` to `dependency`.
    ///
    /// Returns the removed edge (the dependency-side copy, which carries
    /// any notify callback). The caller decides whether losing its last
    /// dependent makes `dependency` eligible for ttl destruction.
    pub fn remove_edge(&mut self, dependent: &NodeId, dependency: &NodeId) -> Option<Edge> {
        let removed = self
            .nodes
            .get_mut(dependency)
            .and_then(|n| n.remove_dependent(dependent));
        if let Some(node) = self.nodes.get_mut(dependent) {
            node.remove_dependency(dependency);
        }
        if removed.is_some() {
            self.refresh_weights(&[dependent.clone()]);
        }
        removed
    }

    /// Collect the transitive dynamic dependents of `sources`, in
    /// notification order: atoms and selector caches by `(weight, id)`
    /// ascending, then external subscribers by id.
    ///
    /// The sources themselves are not included.
    pub fn collect_affected(&self, sources: &[NodeId]) -> Vec<NodeId> {
        let mut visited: HashSet<NodeId> = sources.iter().cloned().collect();
        let mut queue: VecDeque<NodeId> = sources.iter().cloned().collect();
        let mut atoms: Vec<(u64, NodeId)> = Vec::new();
        let mut externals: Vec<NodeId> = Vec::new();

        while let Some(id) = queue.pop_front() {
            let Some(node) = self.nodes.get(&id) else { continue };

            for (dependent_id, edge) in node.dependents() {
                if !edge.flags.is_dynamic() || visited.contains(dependent_id) {
                    continue;
                }
                visited.insert(dependent_id.clone());

                let Some(dependent) = self.nodes.get(dependent_id) else { continue };
                match dependent.kind() {
                    NodeKind::ExternalSubscriber => externals.push(dependent_id.clone()),
                    NodeKind::AtomInstance | NodeKind::SelectorCache => {
                        atoms.push((dependent.weight(), dependent_id.clone()));
                        queue.push_back(dependent_id.clone());
                    }
                }
            }
        }

        atoms.sort();
        externals.sort();

        atoms
            .into_iter()
            .map(|(_, id)| id)
            .chain(externals)
            .collect()
    }

    /// Recompute weights for `roots` and propagate downstream.
    ///
    /// `weight = 1 + Σ weight(dependency)` counting atom-instance
    /// dependencies only. The graph is acyclic at factory-resolution
    /// time, so the propagation terminates.
    fn refresh_weights(&mut self, roots: &[NodeId]) {
        let mut queue: VecDeque<NodeId> = roots.iter().cloned().collect();
        let mut guard = 0usize;
        let budget = self.nodes.len().saturating_mul(self.nodes.len()).max(64);

        while let Some(id) = queue.pop_front() {
            guard += 1;
            if guard > budget {
                // A cycle slipped past resolution-time detection; stop
                // rather than spin. Ordering degrades but stays stable.
                break;
            }

            let new_weight = {
                let Some(node) = self.nodes.get(&id) else { continue };
                1 + node
                    .dependencies()
                    .keys()
                    .filter_map(|dep_id| self.nodes.get(dep_id))
                    .filter(|dep| dep.kind() == NodeKind::AtomInstance)
                    .map(|dep| dep.weight())
                    .sum::<u64>()
            };

            let Some(node) = self.nodes.get_mut(&id) else { continue };
            if node.weight() == new_weight {
                continue;
            }
            node.set_weight(new_weight);

            for dependent_id in node.dependents().keys() {
                queue.push_back(dependent_id.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn atom(id: &str) -> NodeId {
        NodeId::atom(id, None)
    }

    fn explicit(dependent: &NodeId, dependency: &NodeId) -> Edge {
        Edge::new(dependent.clone(), dependency.clone(), EdgeFlags::EXPLICIT, "get")
    }

    #[test]
    fn add_and_remove_nodes() {
        let mut graph = DependencyGraph::new();
        let a = atom("a");
        let b = atom("b");

        assert!(graph.add_node(a.clone(), NodeKind::AtomInstance));
        assert!(!graph.add_node(a.clone(), NodeKind::AtomInstance));
        graph.add_node(b.clone(), NodeKind::AtomInstance);
        assert_eq!(graph.node_count(), 2);

        graph.remove_node(&a);
        assert_eq!(graph.node_count(), 1);
        assert!(!graph.contains(&a));
        assert!(graph.contains(&b));
    }

    #[test]
    fn edges_are_mirrored_on_both_endpoints() {
        let mut graph = DependencyGraph::new();
        let dep = atom("count");
        let dependent = atom("double");
        graph.add_node(dep.clone(), NodeKind::AtomInstance);
        graph.add_node(dependent.clone(), NodeKind::AtomInstance);

        assert_eq!(
            graph.add_edge(explicit(&dependent, &dep)),
            Some(EdgeOutcome::Created)
        );

        assert!(graph.get(&dependent).unwrap().dependencies().contains_key(&dep));
        assert!(graph.get(&dep).unwrap().dependents().contains_key(&dependent));

        graph.remove_edge(&dependent, &dep);
        assert!(graph.get(&dependent).unwrap().dependencies().is_empty());
        assert!(graph.get(&dep).unwrap().dependents().is_empty());
    }

    #[test]
    fn re_adding_an_edge_merges_flags() {
        let mut graph = DependencyGraph::new();
        let dep = atom("count");
        let dependent = atom("double");
        graph.add_node(dep.clone(), NodeKind::AtomInstance);
        graph.add_node(dependent.clone(), NodeKind::AtomInstance);

        graph.add_edge(explicit(&dependent, &dep));
        let merged = graph.add_edge(Edge::new(
            dependent.clone(),
            dep.clone(),
            EdgeFlags::STATIC,
            "getInstance",
        ));
        assert_eq!(merged, Some(EdgeOutcome::Merged));

        let flags = graph
            .get(&dependent)
            .unwrap()
            .dependencies()
            .get(&dep)
            .unwrap()
            .flags;
        assert!(flags.contains(EdgeFlags::EXPLICIT));
        assert!(flags.contains(EdgeFlags::STATIC));
    }

    #[test]
    fn edge_to_unknown_node_is_rejected() {
        let mut graph = DependencyGraph::new();
        let a = atom("a");
        graph.add_node(a.clone(), NodeKind::AtomInstance);
        assert_eq!(graph.add_edge(explicit(&a, &atom("ghost"))), None);
        assert!(graph.get(&a).unwrap().dependencies().is_empty());
    }

    #[test]
    fn weights_follow_dependency_depth() {
        let mut graph = DependencyGraph::new();
        let count = atom("count");
        let double = atom("double");
        let quadruple = atom("quadruple");
        for id in [&count, &double, &quadruple] {
            graph.add_node(id.clone(), NodeKind::AtomInstance);
        }

        graph.add_edge(explicit(&double, &count));
        graph.add_edge(explicit(&quadruple, &double));

        assert_eq!(graph.get(&count).unwrap().weight(), 1);
        assert_eq!(graph.get(&double).unwrap().weight(), 2);
        assert_eq!(graph.get(&quadruple).unwrap().weight(), 3);

        graph.remove_edge(&double, &count);
        assert_eq!(graph.get(&double).unwrap().weight(), 1);
        assert_eq!(graph.get(&quadruple).unwrap().weight(), 2);
    }

    #[test]
    fn affected_set_is_topological_with_externals_last() {
        let mut graph = DependencyGraph::new();
        let count = atom("count");
        let a = atom("a");
        let b = atom("b");
        let sum = atom("sum");
        for id in [&count, &a, &b, &sum] {
            graph.add_node(id.clone(), NodeKind::AtomInstance);
        }
        let ext = NodeId::external();
        graph.add_node(ext.clone(), NodeKind::ExternalSubscriber);

        // Diamond: a and b read count, sum reads both; an external
        // subscriber watches a.
        graph.add_edge(explicit(&a, &count));
        graph.add_edge(explicit(&b, &count));
        graph.add_edge(explicit(&sum, &a));
        graph.add_edge(explicit(&sum, &b));
        graph.add_edge(
            Edge::new(ext.clone(), a.clone(), EdgeFlags::EXPLICIT | EdgeFlags::EXTERNAL, "subscribe"),
        );

        let order = graph.collect_affected(&[count.clone()]);
        assert_eq!(order.len(), 4);

        let pos = |id: &NodeId| order.iter().position(|o| o == id).unwrap();
        assert!(pos(&a) < pos(&sum));
        assert!(pos(&b) < pos(&sum));
        assert_eq!(order.last(), Some(&ext));

        // Deterministic: same mutation, same order.
        assert_eq!(order, graph.collect_affected(&[count.clone()]));
    }

    #[test]
    fn static_edges_stop_propagation() {
        let mut graph = DependencyGraph::new();
        let count = atom("count");
        let pinned = atom("pinned");
        graph.add_node(count.clone(), NodeKind::AtomInstance);
        graph.add_node(pinned.clone(), NodeKind::AtomInstance);

        graph.add_edge(Edge::new(
            pinned.clone(),
            count.clone(),
            EdgeFlags::EXPLICIT | EdgeFlags::STATIC,
            "getInstance",
        ));

        assert!(graph.collect_affected(&[count]).is_empty());
    }
}
