//! Ecosystem
//!
//! The ecosystem is the root container: it owns the node registry, the
//! dependency graph, the override table, the injection stack, and the
//! notification scheduler. All mutation flows through it.
//!
//! # How Updates Propagate
//!
//! 1. A consumer resolves an instance with [`Ecosystem::get_node`].
//!    Construction runs the template's factory under an injection
//!    frame; every read the factory performs becomes an incoming edge.
//!
//! 2. A state commit schedules a notification and triggers a flush.
//!    The flush collects the transitive dynamic dependents, re-runs
//!    dependent factories in weight order (dependencies before
//!    dependents, at most once each), and notifies external
//!    subscribers last.
//!
//! 3. State changes made *during* a flush (by a notified listener) are
//!    queued and delivered in a follow-up batch, after the current one
//!    completes. There is no reentrancy.
//!
//! # Threading
//!
//! The ecosystem is single-threaded cooperative: every externally
//! delivered turn (a state change, a timer tick, a promise settlement)
//! runs to completion before the next begins. Locks exist so handles
//! are `Send + Sync`, and no lock is ever held across a user callback —
//! targets are copied out first, then invoked.

mod events;
mod injection;
mod selector;

pub use events::{EcosystemEvent, EventAction, DEFAULT_EVENT_CAPACITY};
pub use injection::Injection;
pub use selector::Selection;

pub(crate) use injection::{InjectionFrame, RunGuard};

use std::any::Any;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Instant;

use crate::atom::{
    Action, ActiveState, AnyInstance, AtomInstance, AtomParams, AtomState, AtomTemplate,
    InstanceShared, PromiseStatus, Runner, TemplateScope,
};
use crate::error::{EcosystemError, Result};
use crate::graph::{
    DependencyGraph, Edge, EdgeFlags, EdgeOutcome, NodeId, NodeKind, NotifyFn, NotifyReason,
};

use events::EventLog;
use selector::SelectorEntry;

/// Construction options for an [`Ecosystem`].
#[derive(Debug, Clone)]
pub struct EcosystemConfig {
    /// Stable identifier; autogenerated when absent.
    pub id: Option<String>,
    /// Capacity of the devtools event ring.
    pub event_log_capacity: usize,
}

impl Default for EcosystemConfig {
    fn default() -> Self {
        Self { id: None, event_log_capacity: DEFAULT_EVENT_CAPACITY }
    }
}

/// A template replacement installed with [`Ecosystem::set_overrides`].
///
/// The replacement keeps the original key; live instances of the key
/// are destroyed when the override table commits, and their dependents
/// re-evaluate against the replacement.
#[derive(Clone)]
pub struct AtomOverride {
    key: Arc<str>,
    template: Arc<dyn Any + Send + Sync>,
    fingerprint: usize,
}

impl AtomOverride {
    /// Wrap a replacement template.
    pub fn new<T: AtomState, P: AtomParams>(template: AtomTemplate<T, P>) -> Self {
        let key = template.key().clone();
        let fingerprint = template.fingerprint();
        Self { key, template: Arc::new(template), fingerprint }
    }

    /// The key being overridden.
    pub fn key(&self) -> &Arc<str> {
        &self.key
    }
}

#[derive(PartialEq, Eq, PartialOrd, Ord)]
struct TtlEntry {
    deadline: Instant,
    id: NodeId,
    generation: u64,
}

pub(crate) struct EcoInner {
    id: Arc<str>,
    graph: RwLock<DependencyGraph>,
    registry: RwLock<HashMap<NodeId, Arc<dyn AnyInstance>>>,
    template_identities: RwLock<HashMap<Arc<str>, usize>>,
    overrides: RwLock<HashMap<Arc<str>, AtomOverride>>,
    /// Override swap requested during a factory run; applied when the
    /// stack unwinds.
    pending_overrides: Mutex<Option<Vec<AtomOverride>>>,
    stack: RwLock<Vec<InjectionFrame>>,
    queue: Mutex<VecDeque<(NodeId, NotifyReason)>>,
    flushing: AtomicBool,
    ttl_heap: Mutex<BinaryHeap<Reverse<TtlEntry>>>,
    events: EventLog,
    selectors: Mutex<HashMap<NodeId, SelectorEntry>>,
    /// Per-binding scratch state; the core neither reads nor interprets
    /// it.
    storage: RwLock<HashMap<String, Arc<dyn Any + Send + Sync>>>,
}

/// The root container owning the graph and registry.
///
/// Cloning shares the ecosystem.
pub struct Ecosystem {
    pub(crate) inner: Arc<EcoInner>,
}

/// Non-owning ecosystem reference held by instances and promise
/// handles, so dropped ecosystems are not kept alive by their own
/// contents.
#[derive(Clone)]
pub struct WeakEcosystem {
    inner: Weak<EcoInner>,
}

impl WeakEcosystem {
    pub(crate) fn upgrade(&self) -> Option<Ecosystem> {
        self.inner.upgrade().map(|inner| Ecosystem { inner })
    }
}

/// Handle to an external subscription edge. Removing it releases the
/// dependency; if that was the last dependent, the dependency's ttl
/// starts counting.
pub struct EdgeHandle {
    eco: WeakEcosystem,
    dependent: NodeId,
    dependency: NodeId,
}

impl EdgeHandle {
    /// The node this edge subscribes to.
    pub fn dependency(&self) -> &NodeId {
        &self.dependency
    }

    /// Remove the edge and its subscriber node.
    pub fn remove(self) {
        let Some(eco) = self.eco.upgrade() else { return };
        let removed = {
            let mut graph = eco.inner.graph.write().expect("graph lock poisoned");
            let removed = graph.remove_edge(&self.dependent, &self.dependency);
            graph.remove_node(&self.dependent);
            removed
        };
        if removed.is_some() {
            eco.inner.events.append(EventAction::EdgeRemoved {
                dependent: self.dependent.to_string(),
                dependency: self.dependency.to_string(),
            });
            eco.maybe_schedule_destruction(&self.dependency);
            eco.flush();
        }
    }
}

/// Type-erased instance view returned by [`Ecosystem::get_node_by_id`].
pub struct ErasedNode {
    eco: Ecosystem,
    inner: Arc<dyn AnyInstance>,
}

impl ErasedNode {
    /// The instance id.
    pub fn id(&self) -> &NodeId {
        self.inner.id()
    }

    /// The template key the instance was created from.
    pub fn template_key(&self) -> Arc<str> {
        self.inner.template_key()
    }

    /// Current lifecycle state.
    pub fn active_state(&self) -> ActiveState {
        self.inner.active_state()
    }

    /// Readiness of the attached promise.
    pub fn promise_status(&self) -> PromiseStatus {
        self.inner.promise_status()
    }

    /// Rejection message, when the promise failed.
    pub fn promise_error(&self) -> Option<String> {
        self.inner.promise_error()
    }

    /// The template's host-side scope hint.
    pub fn scope(&self) -> TemplateScope {
        self.inner.scope()
    }

    /// Destroy the instance; see [`Ecosystem::destroy`].
    pub fn destroy(&self, force: bool) -> bool {
        self.eco.destroy(self.inner.id(), force)
    }
}

static ECOSYSTEM_COUNTER: AtomicU64 = AtomicU64::new(0);

impl Ecosystem {
    /// Create an ecosystem with default configuration.
    pub fn new() -> Self {
        Self::with_config(EcosystemConfig::default())
    }

    /// Create an ecosystem with explicit configuration.
    pub fn with_config(config: EcosystemConfig) -> Self {
        let id: Arc<str> = match config.id {
            Some(id) => id.into(),
            None => format!("eco-{}", ECOSYSTEM_COUNTER.fetch_add(1, Ordering::Relaxed)).into(),
        };
        tracing::debug!(id = %id, "creating ecosystem");
        Self {
            inner: Arc::new(EcoInner {
                id,
                graph: RwLock::new(DependencyGraph::new()),
                registry: RwLock::new(HashMap::new()),
                template_identities: RwLock::new(HashMap::new()),
                overrides: RwLock::new(HashMap::new()),
                pending_overrides: Mutex::new(None),
                stack: RwLock::new(Vec::new()),
                queue: Mutex::new(VecDeque::new()),
                flushing: AtomicBool::new(false),
                ttl_heap: Mutex::new(BinaryHeap::new()),
                events: EventLog::new(config.event_log_capacity),
                selectors: Mutex::new(HashMap::new()),
                storage: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// The ecosystem's identifier.
    pub fn id(&self) -> Arc<str> {
        Arc::clone(&self.inner.id)
    }

    /// Resolve or create the instance of `template` for `params`.
    ///
    /// Hashing of params is structural, so equal-by-value params always
    /// resolve to the same live instance. Construction runs the factory
    /// synchronously; a factory error destroys the partial instance and
    /// surfaces as [`EcosystemError::FactoryFailed`].
    pub fn get_node<T: AtomState, P: AtomParams>(
        &self,
        template: &AtomTemplate<T, P>,
        params: P,
    ) -> Result<AtomInstance<T>> {
        let resolved = self.resolve_template(template)?;
        let id = NodeId::atom(template.key(), crate::atom::params_id(&params));

        {
            let stack = self.inner.stack.read().expect("stack lock poisoned");
            if stack.iter().any(|frame| frame.node_id == id) {
                let mut path: Vec<&str> = stack.iter().map(|frame| frame.key.as_ref()).collect();
                path.push(template.key());
                return Err(EcosystemError::CyclicDependency { path: path.join(" -> ") });
            }
        }

        if let Some(existing) = self.instance_for(&id) {
            let shared = existing
                .as_any_arc()
                .downcast::<InstanceShared<T>>()
                .map_err(|_| EcosystemError::InvalidParams {
                    key: template.key().clone(),
                    reason: "existing instance has a different state type".into(),
                })?;
            return Ok(AtomInstance { shared, eco: self.clone() });
        }

        if let Some(max) = resolved.max_instances() {
            let live = {
                let registry = self.inner.registry.read().expect("registry lock poisoned");
                registry
                    .values()
                    .filter(|i| i.template_key() == *template.key())
                    .count()
            };
            if live >= max {
                return Err(EcosystemError::InstanceLimitExceeded {
                    key: template.key().clone(),
                    max,
                });
            }
        }

        self.create_instance(&resolved, template.key(), params, id)
    }

    /// Look up a live instance by id, type-erased.
    pub fn get_node_by_id(&self, id: &NodeId) -> Option<ErasedNode> {
        self.instance_for(id)
            .map(|inner| ErasedNode { eco: self.clone(), inner })
    }

    /// Destroy a node by id. Without `force`, instances destroy only
    /// when nothing pins them; with `force`, dependents receive a
    /// `Destroyed` notification and re-evaluate (re-creating the
    /// dependency on their next read). Returns whether destruction
    /// happened.
    pub fn destroy(&self, id: &NodeId, force: bool) -> bool {
        if self.remove_selector_node(id) {
            return true;
        }
        let Some(_) = self.instance_for(id) else {
            return self.remove_external_node(id);
        };
        if !force && self.dependent_count_of(id) > 0 {
            return false;
        }
        self.destroy_node(id);
        self.flush();
        true
    }

    /// Subscribe an external callback to a node. The callback fires
    /// during flushes (after all atoms settle) with `StateChanged`, and
    /// directly with `Destroyed` when the node dies. The edge pins the
    /// node alive until removed.
    pub fn subscribe(
        &self,
        id: &NodeId,
        notify: impl Fn(NotifyReason) + Send + Sync + 'static,
    ) -> Result<EdgeHandle> {
        if !self.inner.graph.read().expect("graph lock poisoned").contains(id) {
            return Err(EcosystemError::InstanceDestroyed { id: id.raw() });
        }

        let ext = NodeId::external();
        {
            let mut graph = self.inner.graph.write().expect("graph lock poisoned");
            graph.add_node(ext.clone(), NodeKind::ExternalSubscriber);
        }
        let notify: NotifyFn = Arc::new(notify);
        self.link_edge(
            &ext,
            id,
            EdgeFlags::EXPLICIT | EdgeFlags::EXTERNAL,
            "subscribe",
            Some(Arc::clone(&notify)),
        );
        notify(NotifyReason::EdgeAdded);

        Ok(EdgeHandle { eco: self.downgrade(), dependent: ext, dependency: id.clone() })
    }

    /// Replace the override table atomically. Live instances of every
    /// changed key are destroyed; their dependents re-evaluate against
    /// the new table. Called during a factory run of an affected
    /// template, the swap is deferred until the run completes.
    pub fn set_overrides(&self, overrides: Vec<AtomOverride>) {
        if !self.inner.stack.read().expect("stack lock poisoned").is_empty() {
            *self.inner.pending_overrides.lock().expect("pending overrides lock poisoned") =
                Some(overrides);
            return;
        }
        self.apply_overrides(overrides);
    }

    /// Clear every override.
    pub fn clear_overrides(&self) {
        self.set_overrides(Vec::new());
    }

    /// Process due ttl destructions. The host calls this from its timer
    /// turn; expirations are measured against a monotonic clock.
    pub fn tick(&self) {
        let now = Instant::now();
        loop {
            let entry = {
                let mut heap = self.inner.ttl_heap.lock().expect("ttl heap lock poisoned");
                let due = matches!(heap.peek(), Some(Reverse(entry)) if entry.deadline <= now);
                if due {
                    heap.pop().map(|Reverse(entry)| entry)
                } else {
                    None
                }
            };
            let Some(entry) = entry else { break };

            let Some(instance) = self.instance_for(&entry.id) else { continue };
            if instance.ttl_generation() != entry.generation {
                continue; // cancelled by a re-acquired dependent
            }
            if self.dependent_count_of(&entry.id) > 0 {
                continue;
            }
            tracing::debug!(id = %entry.id, "ttl expired, destroying instance");
            self.destroy_node(&entry.id);
        }
        self.flush();
    }

    /// Snapshot of the devtools event log, oldest first.
    pub fn events(&self) -> Vec<EcosystemEvent> {
        self.inner.events.snapshot()
    }

    /// Number of registered graph nodes (instances, selectors, external
    /// subscribers).
    pub fn node_count(&self) -> usize {
        self.inner.graph.read().expect("graph lock poisoned").node_count()
    }

    /// Ids of all live atom instances, sorted.
    pub fn instance_ids(&self) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self
            .inner
            .registry
            .read()
            .expect("registry lock poisoned")
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    /// Whether the edge `dependent -> dependency` exists.
    pub fn edge_exists(&self, dependent: &NodeId, dependency: &NodeId) -> bool {
        self.inner
            .graph
            .read()
            .expect("graph lock poisoned")
            .get(dependent)
            .map(|node| node.dependencies().contains_key(dependency))
            .unwrap_or(false)
    }

    /// Number of dependents currently pinning `id`.
    pub fn dependent_count(&self, id: &NodeId) -> usize {
        self.dependent_count_of(id)
    }

    /// Stash host-binding scratch state. The core never interprets it.
    pub fn put_storage<V: Send + Sync + 'static>(&self, key: impl Into<String>, value: V) {
        self.inner
            .storage
            .write()
            .expect("storage lock poisoned")
            .insert(key.into(), Arc::new(value));
    }

    /// Retrieve host-binding scratch state.
    pub fn get_storage<V: Send + Sync + 'static>(&self, key: &str) -> Option<Arc<V>> {
        self.inner
            .storage
            .read()
            .expect("storage lock poisoned")
            .get(key)
            .cloned()
            .and_then(|value| value.downcast::<V>().ok())
    }

    /// Force-destroy everything and clear all tables, including the
    /// event log and override table.
    pub fn reset(&self) {
        tracing::debug!(id = %self.inner.id, "resetting ecosystem");
        let mut instances: Vec<(u64, NodeId)> = {
            let graph = self.inner.graph.read().expect("graph lock poisoned");
            let registry = self.inner.registry.read().expect("registry lock poisoned");
            registry
                .keys()
                .map(|id| (graph.get(id).map(|n| n.weight()).unwrap_or(0), id.clone()))
                .collect()
        };
        // Dependents first, so destruction never notifies into freed
        // dependencies.
        instances.sort();
        instances.reverse();
        for (_, id) in instances {
            self.destroy_node(&id);
        }

        let remaining = self.inner.graph.read().expect("graph lock poisoned").node_ids();
        {
            let mut graph = self.inner.graph.write().expect("graph lock poisoned");
            for id in remaining {
                graph.remove_node(&id);
            }
        }
        self.inner.selectors.lock().expect("selectors lock poisoned").clear();
        self.inner.overrides.write().expect("overrides lock poisoned").clear();
        self.inner
            .template_identities
            .write()
            .expect("identities lock poisoned")
            .clear();
        self.inner.queue.lock().expect("queue lock poisoned").clear();
        self.inner.ttl_heap.lock().expect("ttl heap lock poisoned").clear();
        self.inner.events.clear();
    }

    // ------------------------------------------------------------------
    // Crate internals
    // ------------------------------------------------------------------

    pub(crate) fn downgrade(&self) -> WeakEcosystem {
        WeakEcosystem { inner: Arc::downgrade(&self.inner) }
    }

    pub(crate) fn instance_for(&self, id: &NodeId) -> Option<Arc<dyn AnyInstance>> {
        self.inner
            .registry
            .read()
            .expect("registry lock poisoned")
            .get(id)
            .cloned()
    }

    pub(crate) fn dependency_ids_of(&self, id: &NodeId) -> Vec<NodeId> {
        self.inner
            .graph
            .read()
            .expect("graph lock poisoned")
            .dependency_ids(id)
    }

    fn dependent_count_of(&self, id: &NodeId) -> usize {
        self.inner
            .graph
            .read()
            .expect("graph lock poisoned")
            .dependent_count(id)
    }

    // --- injection stack ------------------------------------------------

    pub(crate) fn begin_run(&self, node_id: NodeId, key: Arc<str>) -> RunGuard<'_> {
        self.inner
            .stack
            .write()
            .expect("stack lock poisoned")
            .push(InjectionFrame::new(node_id, key));
        RunGuard::new(self)
    }

    pub(crate) fn pop_frame(&self) -> InjectionFrame {
        self.inner
            .stack
            .write()
            .expect("stack lock poisoned")
            .pop()
            .expect("injection stack underflow")
    }

    pub(crate) fn current_frame_node(&self) -> Result<NodeId> {
        self.inner
            .stack
            .read()
            .expect("stack lock poisoned")
            .last()
            .map(|frame| frame.node_id.clone())
            .ok_or(EcosystemError::InjectionOutOfScope)
    }

    pub(crate) fn with_current_frame<R>(
        &self,
        f: impl FnOnce(&mut InjectionFrame) -> R,
    ) -> Result<R> {
        let mut stack = self.inner.stack.write().expect("stack lock poisoned");
        let frame = stack.last_mut().ok_or(EcosystemError::InjectionOutOfScope)?;
        Ok(f(frame))
    }

    // --- edges ----------------------------------------------------------

    /// Insert an edge and log it. A new dependent cancels any pending
    /// ttl destruction of the dependency.
    pub(crate) fn link_edge(
        &self,
        dependent: &NodeId,
        dependency: &NodeId,
        flags: EdgeFlags,
        operation: &str,
        notify: Option<NotifyFn>,
    ) {
        let dependency_initializing = self
            .instance_for(dependency)
            .map(|i| i.active_state() == ActiveState::Initializing)
            .unwrap_or(false);

        let outcome = {
            let mut graph = self.inner.graph.write().expect("graph lock poisoned");
            let mut edge = Edge::new(dependent.clone(), dependency.clone(), flags, operation);
            if let Some(notify) = notify {
                edge = edge.with_notify(notify);
            }
            graph.add_edge(edge)
        };

        if outcome == Some(EdgeOutcome::Created) {
            if dependency_initializing {
                self.inner.events.append(EventAction::GhostEdgeCreated {
                    dependent: dependent.to_string(),
                    dependency: dependency.to_string(),
                });
            } else {
                self.inner.events.append(EventAction::EdgeCreated {
                    dependent: dependent.to_string(),
                    dependency: dependency.to_string(),
                    operation: operation.to_string(),
                });
            }
            if let Some(instance) = self.instance_for(dependency) {
                instance.bump_ttl_generation();
            }
        }
    }

    /// Edge insertion from inside a factory run: also records the
    /// dependency in the current frame for end-of-run retraction.
    pub(crate) fn link_dependency(
        &self,
        dependent: &NodeId,
        dependency: &NodeId,
        flags: EdgeFlags,
        operation: &str,
    ) -> Result<()> {
        self.link_edge(dependent, dependency, flags, operation, None);
        self.with_current_frame(|frame| frame.new_edges.push(dependency.clone()))
    }

    /// Remove edges read in a previous run but not in the current one.
    pub(crate) fn retract_stale_edges(&self, id: &NodeId, prev: Vec<NodeId>, kept: &[NodeId]) {
        let kept: HashSet<&NodeId> = kept.iter().collect();
        for dep in prev {
            if kept.contains(&dep) {
                continue;
            }
            let removed = {
                let mut graph = self.inner.graph.write().expect("graph lock poisoned");
                graph.remove_edge(id, &dep)
            };
            if removed.is_some() {
                self.inner.events.append(EventAction::EdgeRemoved {
                    dependent: id.to_string(),
                    dependency: dep.to_string(),
                });
                self.maybe_schedule_destruction(&dep);
            }
        }
    }

    /// Called whenever a node loses a dependent: arms ttl destruction
    /// when nothing pins it anymore. Zero ttl destroys immediately.
    pub(crate) fn maybe_schedule_destruction(&self, id: &NodeId) {
        self.schedule_destruction_inner(id, true);
    }

    fn schedule_destruction_inner(&self, id: &NodeId, immediate_zero: bool) {
        if self.dependent_count_of(id) > 0 {
            return;
        }
        let Some(instance) = self.instance_for(id) else { return };
        if instance.active_state() == ActiveState::Destroyed {
            return;
        }
        match instance.ttl() {
            Some(ttl) if ttl.is_zero() && immediate_zero => {
                self.destroy_node(id);
            }
            Some(ttl) => {
                let entry = TtlEntry {
                    deadline: Instant::now() + ttl,
                    id: id.clone(),
                    generation: instance.ttl_generation(),
                };
                self.inner
                    .ttl_heap
                    .lock()
                    .expect("ttl heap lock poisoned")
                    .push(Reverse(entry));
                tracing::trace!(id = %id, ?ttl, "armed ttl destruction");
            }
            None => {}
        }
    }

    // --- lifecycle ------------------------------------------------------

    fn resolve_template<T: AtomState, P: AtomParams>(
        &self,
        template: &AtomTemplate<T, P>,
    ) -> Result<AtomTemplate<T, P>> {
        {
            let mut identities = self
                .inner
                .template_identities
                .write()
                .expect("identities lock poisoned");
            match identities.get(template.key()) {
                Some(fingerprint) if *fingerprint != template.fingerprint() => {
                    return Err(EcosystemError::DuplicateKey { key: template.key().clone() });
                }
                Some(_) => {}
                None => {
                    identities.insert(template.key().clone(), template.fingerprint());
                }
            }
        }

        let overrides = self.inner.overrides.read().expect("overrides lock poisoned");
        if let Some(replacement) = overrides.get(template.key()) {
            let replacement = replacement
                .template
                .downcast_ref::<AtomTemplate<T, P>>()
                .ok_or_else(|| EcosystemError::InvalidParams {
                    key: template.key().clone(),
                    reason: "override template has a different state or params type".into(),
                })?;
            return Ok(replacement.clone());
        }
        Ok(template.clone())
    }

    fn create_instance<T: AtomState, P: AtomParams>(
        &self,
        resolved: &AtomTemplate<T, P>,
        key: &Arc<str>,
        params: P,
        id: NodeId,
    ) -> Result<AtomInstance<T>> {
        tracing::debug!(id = %id, "creating atom instance");
        let runner: Runner<T> = {
            let factory = Arc::clone(resolved.factory());
            Arc::new(move |injection: &Injection<'_>| factory(injection, &params))
        };
        let shared = Arc::new(InstanceShared::new(
            id.clone(),
            Arc::clone(key),
            runner,
            resolved.ttl(),
            resolved.is_readonly(),
            resolved.scope(),
        ));

        {
            let mut graph = self.inner.graph.write().expect("graph lock poisoned");
            graph.add_node(id.clone(), NodeKind::AtomInstance);
        }
        {
            let erased: Arc<dyn AnyInstance> = shared.clone();
            self.inner
                .registry
                .write()
                .expect("registry lock poisoned")
                .insert(id.clone(), erased);
        }
        self.log_active_state(&id, ActiveState::Initializing);

        match shared.run_factory(self, true) {
            Ok(()) => {
                self.flush();
                Ok(AtomInstance { shared, eco: self.clone() })
            }
            Err(err) => {
                self.destroy_node(&id);
                self.flush();
                Err(EcosystemError::FactoryFailed { key: Arc::clone(key), source: Arc::new(err) })
            }
        }
    }

    /// Ghost-edge promotion and initial ttl arming, after the first
    /// factory run completes.
    pub(crate) fn on_instance_activated(&self, id: &NodeId) {
        let dependents: Vec<(NodeId, String)> = {
            let graph = self.inner.graph.read().expect("graph lock poisoned");
            graph
                .get(id)
                .map(|node| {
                    node.dependents()
                        .values()
                        .map(|edge| (edge.dependent.clone(), edge.operation.to_string()))
                        .collect()
                })
                .unwrap_or_default()
        };
        for (dependent, operation) in dependents {
            self.inner.events.append(EventAction::GhostEdgeDestroyed {
                dependent: dependent.to_string(),
                dependency: id.to_string(),
            });
            self.inner.events.append(EventAction::EdgeCreated {
                dependent: dependent.to_string(),
                dependency: id.to_string(),
                operation,
            });
        }
        // Arm the ttl if nothing pins the fresh instance. A zero ttl is
        // deferred to the next timer turn rather than destroyed inline:
        // when the instance was created from inside another run, the
        // creator's edge lands right after this and cancels it.
        self.schedule_destruction_inner(id, false);
    }

    /// Destruction core: transition, destructors, edge teardown,
    /// registry removal — one synchronous step.
    pub(crate) fn destroy_node(&self, id: &NodeId) {
        let removed_instance = {
            self.inner
                .registry
                .write()
                .expect("registry lock poisoned")
                .remove(id)
        };
        let Some(instance) = removed_instance else { return };
        tracing::debug!(id = %id, "destroying atom instance");

        instance.mark_destroyed(self);

        let removed_node = {
            let mut graph = self.inner.graph.write().expect("graph lock poisoned");
            graph.remove_node(id)
        };
        let Some(node) = removed_node else { return };

        for dep_id in node.dependencies().keys() {
            self.inner.events.append(EventAction::EdgeRemoved {
                dependent: id.to_string(),
                dependency: dep_id.to_string(),
            });
            self.maybe_schedule_destruction(dep_id);
        }

        for (dependent_id, edge) in node.dependents() {
            self.inner.events.append(EventAction::EdgeRemoved {
                dependent: dependent_id.to_string(),
                dependency: id.to_string(),
            });
            if edge.flags.contains(EdgeFlags::EXTERNAL) {
                if let Some(notify) = &edge.notify {
                    let notify = Arc::clone(notify);
                    if catch_unwind(AssertUnwindSafe(|| notify(NotifyReason::Destroyed))).is_err() {
                        tracing::warn!(id = %dependent_id, "external subscriber panicked on destroy");
                        self.note_listener_panic(dependent_id);
                    }
                }
                let mut graph = self.inner.graph.write().expect("graph lock poisoned");
                graph.remove_node(dependent_id);
            } else if self.mark_selector_dirty(dependent_id) {
                // lazily recomputed on next read
            } else {
                self.schedule(dependent_id.clone(), NotifyReason::Destroyed);
            }
        }
    }

    fn remove_external_node(&self, id: &NodeId) -> bool {
        let removed = {
            let mut graph = self.inner.graph.write().expect("graph lock poisoned");
            match graph.get(id) {
                Some(node) if node.kind() == NodeKind::ExternalSubscriber => graph.remove_node(id),
                _ => None,
            }
        };
        let Some(node) = removed else { return false };
        for dep_id in node.dependencies().keys() {
            self.inner.events.append(EventAction::EdgeRemoved {
                dependent: id.to_string(),
                dependency: dep_id.to_string(),
            });
            self.maybe_schedule_destruction(dep_id);
        }
        self.flush();
        true
    }

    // --- scheduling -----------------------------------------------------

    pub(crate) fn schedule(&self, id: NodeId, reason: NotifyReason) {
        self.inner
            .queue
            .lock()
            .expect("queue lock poisoned")
            .push_back((id, reason));
    }

    pub(crate) fn schedule_and_flush(&self, id: &NodeId, reason: NotifyReason) {
        self.schedule(id.clone(), reason);
        self.flush();
    }

    /// Drain the notification queue. Each batch notifies every
    /// transitively-affected dependent at most once, dependencies
    /// before dependents, externals last; mutations made by notified
    /// code form the next batch. Deferred until the injection stack
    /// unwinds, and never reentrant.
    pub(crate) fn flush(&self) {
        if !self.inner.stack.read().expect("stack lock poisoned").is_empty() {
            return;
        }
        if self.inner.flushing.swap(true, Ordering::SeqCst) {
            return;
        }

        loop {
            let batch: Vec<(NodeId, NotifyReason)> = {
                let mut queue = self.inner.queue.lock().expect("queue lock poisoned");
                queue.drain(..).collect()
            };
            if batch.is_empty() {
                break;
            }

            let mut sources: Vec<NodeId> = Vec::new();
            for (id, reason) in batch {
                match reason {
                    NotifyReason::StateChanged => {
                        if !sources.contains(&id) {
                            sources.push(id);
                        }
                    }
                    NotifyReason::Destroyed | NotifyReason::EdgeAdded => {
                        // Direct delivery: the dependent re-runs its
                        // factory (re-creating the dependency if it is
                        // still read), then its own change propagates.
                        if let Some(instance) = self.instance_for(&id) {
                            instance.re_evaluate(self);
                            if !sources.contains(&id) {
                                sources.push(id);
                            }
                        }
                    }
                }
            }
            if sources.is_empty() {
                continue;
            }

            let ordered = {
                let graph = self.inner.graph.read().expect("graph lock poisoned");
                graph.collect_affected(&sources)
            };
            tracing::trace!(
                sources = sources.len(),
                affected = ordered.len(),
                "flushing notifications"
            );
            for target in ordered {
                self.deliver(&target);
            }
        }

        self.inner.flushing.store(false, Ordering::SeqCst);
        self.apply_pending_overrides();
    }

    fn deliver(&self, id: &NodeId) {
        if let Some(instance) = self.instance_for(id) {
            instance.re_evaluate(self);
            return;
        }
        if self.mark_selector_dirty(id) {
            return;
        }
        // External subscriber: copy the callbacks out, then invoke.
        let notifies: Vec<NotifyFn> = {
            let graph = self.inner.graph.read().expect("graph lock poisoned");
            graph
                .get(id)
                .map(|node| {
                    node.dependencies()
                        .values()
                        .filter_map(|edge| edge.notify.clone())
                        .collect()
                })
                .unwrap_or_default()
        };
        for notify in notifies {
            if catch_unwind(AssertUnwindSafe(|| notify(NotifyReason::StateChanged))).is_err() {
                tracing::warn!(id = %id, "external subscriber panicked");
                self.note_listener_panic(id);
            }
        }
    }

    // --- overrides ------------------------------------------------------

    fn apply_pending_overrides(&self) {
        let pending = {
            self.inner
                .pending_overrides
                .lock()
                .expect("pending overrides lock poisoned")
                .take()
        };
        if let Some(overrides) = pending {
            self.apply_overrides(overrides);
        }
    }

    fn apply_overrides(&self, overrides: Vec<AtomOverride>) {
        let new_table: HashMap<Arc<str>, AtomOverride> = overrides
            .into_iter()
            .map(|o| (o.key.clone(), o))
            .collect();

        let changed: HashSet<Arc<str>> = {
            let current = self.inner.overrides.read().expect("overrides lock poisoned");
            let mut changed = HashSet::new();
            for (key, existing) in current.iter() {
                match new_table.get(key) {
                    Some(n) if n.fingerprint == existing.fingerprint => {}
                    _ => {
                        changed.insert(key.clone());
                    }
                }
            }
            for (key, incoming) in new_table.iter() {
                match current.get(key) {
                    Some(c) if c.fingerprint == incoming.fingerprint => {}
                    _ => {
                        changed.insert(key.clone());
                    }
                }
            }
            changed
        };

        *self.inner.overrides.write().expect("overrides lock poisoned") = new_table;
        if changed.is_empty() {
            return;
        }
        tracing::debug!(keys = ?changed, "override table changed, swapping live instances");

        let marked: Vec<NodeId> = {
            let registry = self.inner.registry.read().expect("registry lock poisoned");
            registry
                .values()
                .filter(|instance| changed.contains(&instance.template_key()))
                .map(|instance| instance.id().clone())
                .collect()
        };
        for id in marked {
            self.destroy_node(&id);
        }
        self.flush();
    }

    // --- event helpers --------------------------------------------------

    pub(crate) fn log_active_state(&self, id: &NodeId, state: ActiveState) {
        self.inner.events.append(EventAction::InstanceActiveStateChanged {
            id: id.to_string(),
            state,
        });
    }

    /// A store owned by `id` committed a user-driven state change:
    /// record it and propagate.
    pub(crate) fn note_instance_state_changed(&self, id: &NodeId, action: Option<&Action>) {
        if self.instance_for(id).is_none() {
            return;
        }
        self.inner.events.append(EventAction::InstanceStateChanged {
            id: id.to_string(),
            action: action.cloned(),
        });
        self.schedule_and_flush(id, NotifyReason::StateChanged);
    }

    pub(crate) fn note_listener_panic(&self, id: &NodeId) {
        self.inner
            .events
            .append(EventAction::ListenerPanicked { id: id.to_string() });
    }

    pub(crate) fn note_destructor_panic(&self, id: &NodeId) {
        self.inner
            .events
            .append(EventAction::DestructorPanicked { id: id.to_string() });
    }

    /// Route a promise settlement to its instance. Detached handles
    /// (destroyed instance, stale generation) are ignored.
    pub(crate) fn settle_promise(
        &self,
        id: &NodeId,
        generation: u64,
        outcome: std::result::Result<(), String>,
    ) -> bool {
        let Some(instance) = self.instance_for(id) else { return false };
        instance.settle_promise(self, generation, outcome)
    }
}

impl Clone for Ecosystem {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl Default for Ecosystem {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Ecosystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ecosystem")
            .field("id", &self.inner.id)
            .field("node_count", &self.node_count())
            .finish()
    }
}
