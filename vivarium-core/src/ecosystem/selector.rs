//! Selector Caches
//!
//! A selector is a cached derived read over the graph: a keyed function
//! that reads atoms through a tracking context and caches its result.
//! The cache is invalidated (marked dirty, not recomputed) when any
//! dependency notifies; the next `select` call with the same key
//! recomputes and re-tracks.
//!
//! Selectors are lazy: a dirty cache does no work until it is read
//! again, so selectors that fall out of use cost nothing beyond their
//! graph node until dropped.

use std::any::Any;
use std::sync::{Arc, Mutex};

use crate::atom::{AtomParams, AtomState, AtomTemplate};
use crate::error::{EcosystemError, Result};
use crate::graph::{EdgeFlags, NodeId, NodeKind};

use super::Ecosystem;

/// Cached state of one selector.
pub(crate) struct SelectorEntry {
    cached: Arc<dyn Any + Send + Sync>,
    dirty: bool,
}

/// Tracking context passed to selector functions. Reads through it
/// register dynamic edges from the selector's cache node.
pub struct Selection<'a> {
    eco: &'a Ecosystem,
    id: NodeId,
    deps: Mutex<Vec<NodeId>>,
}

impl Selection<'_> {
    /// Read an atom's state, registering the selector's dependency on
    /// it.
    pub fn get<T: AtomState, P: AtomParams>(
        &self,
        template: &AtomTemplate<T, P>,
        params: P,
    ) -> Result<T> {
        let instance = self.eco.get_node(template, params)?;
        self.eco
            .link_edge(&self.id, instance.id(), EdgeFlags::empty(), "select", None);
        self.deps
            .lock()
            .expect("selection deps lock poisoned")
            .push(instance.id().clone());
        instance.get()
    }
}

impl Ecosystem {
    /// Run (or return the cached result of) the selector registered
    /// under `key`.
    ///
    /// The value type must stay consistent per key; reusing a key with
    /// a different type is rejected.
    pub fn select<V: Clone + Send + Sync + 'static>(
        &self,
        key: &str,
        selector: impl Fn(&Selection<'_>) -> Result<V>,
    ) -> Result<V> {
        let id = NodeId::selector(key);

        {
            let selectors = self.inner.selectors.lock().expect("selectors lock poisoned");
            if let Some(entry) = selectors.get(&id) {
                if !entry.dirty {
                    return entry
                        .cached
                        .clone()
                        .downcast::<V>()
                        .map(|v| (*v).clone())
                        .map_err(|_| EcosystemError::InvalidParams {
                            key: key.into(),
                            reason: "selector value type changed between reads".into(),
                        });
                }
            }
        }

        {
            let mut graph = self.inner.graph.write().expect("graph lock poisoned");
            graph.add_node(id.clone(), NodeKind::SelectorCache);
        }

        let prev = self.dependency_ids_of(&id);
        let selection = Selection {
            eco: self,
            id: id.clone(),
            deps: Mutex::new(Vec::new()),
        };
        let value = selector(&selection)?;
        let kept = selection.deps.into_inner().expect("selection deps lock poisoned");

        self.retract_stale_edges(&id, prev, &kept);

        self.inner
            .selectors
            .lock()
            .expect("selectors lock poisoned")
            .insert(
                id,
                SelectorEntry { cached: Arc::new(value.clone()), dirty: false },
            );

        Ok(value)
    }

    /// Drop the selector registered under `key`, removing its cache
    /// node and releasing its dependencies. Returns whether one
    /// existed.
    pub fn drop_selector(&self, key: &str) -> bool {
        self.remove_selector_node(&NodeId::selector(key))
    }

    pub(crate) fn remove_selector_node(&self, id: &NodeId) -> bool {
        let existed = self
            .inner
            .selectors
            .lock()
            .expect("selectors lock poisoned")
            .remove(id)
            .is_some();
        if !existed {
            return false;
        }

        let dependencies = self.dependency_ids_of(id);
        {
            let mut graph = self.inner.graph.write().expect("graph lock poisoned");
            graph.remove_node(id);
        }
        for dep in dependencies {
            self.maybe_schedule_destruction(&dep);
        }
        true
    }

    /// Invalidate a selector cache. Returns false when `id` is not a
    /// selector node.
    pub(crate) fn mark_selector_dirty(&self, id: &NodeId) -> bool {
        let mut selectors = self.inner.selectors.lock().expect("selectors lock poisoned");
        match selectors.get_mut(id) {
            Some(entry) => {
                entry.dirty = true;
                true
            }
            None => false,
        }
    }
}
