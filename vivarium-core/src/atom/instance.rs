//! Atom Instances
//!
//! An instance is the live materialization of a template plus params:
//! it owns a state holder, exports, an optional readiness promise, and
//! a destructor list, and it moves through a small lifecycle machine:
//!
//! ```text
//! Initializing ──▶ Active ◀──▶ Stale
//!       │            │           │
//!       └────────────┴───────────┴──▶ Destroyed
//! ```
//!
//! - `Initializing`: the factory is running; reads by others return the
//!   current (possibly intermediate) value.
//! - `Active`: the factory completed; state changes propagate.
//! - `Stale`: the factory completed with a pending readiness promise;
//!   reads are permitted and dynamic subscribers can surface the
//!   promise for host-side suspension.
//! - `Destroyed`: terminal. Held handles refuse further operations.
//!
//! Instances re-run their factory when a dependency notifies them; the
//! set of edges read during the run replaces the previous run's set
//! (dependency retraction).

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use serde::Serialize;

use crate::atom::store::{Action, AtomState, Settable, Store, StoreBinding};
use crate::atom::template::{ApiValue, FactoryOutput, TemplateScope};
use crate::ecosystem::{Ecosystem, EdgeHandle, Injection, WeakEcosystem};
use crate::error::{EcosystemError, Result};
use crate::graph::{NodeId, NotifyReason};

/// Lifecycle state of an atom instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ActiveState {
    /// The factory is running.
    Initializing,
    /// Live; state changes propagate.
    Active,
    /// Live with an unresolved readiness promise.
    Stale,
    /// Terminal.
    Destroyed,
}

/// Readiness of an instance's attached promise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum PromiseStatus {
    /// No promise attached.
    Idle,
    /// Attached and pending; dynamic subscribers may suspend on it.
    Loading,
    /// Resolved.
    Success,
    /// Rejected; see
    /// [`AtomInstance::promise_error`].
    Error,
}

/// Cleanup registered by a factory effect, run LIFO at destruction.
pub type Destructor = Box<dyn FnOnce() + Send>;

/// Factory with its params bound, so the instance can re-run it without
/// carrying the params type.
pub(crate) type Runner<T> = Arc<dyn Fn(&Injection<'_>) -> Result<FactoryOutput<T>> + Send + Sync>;

/// Per-instance storage for injection slots, surviving factory re-runs.
///
/// `ordered` backs `Injection::store` and `Injection::cell`, keyed by
/// call order within the run; `memos` backs `Injection::memo`, keyed by
/// the caller's string key.
#[derive(Default)]
pub(crate) struct SlotTable {
    pub(crate) ordered: Vec<Arc<dyn Any + Send + Sync>>,
    pub(crate) memos: HashMap<String, Arc<dyn Any + Send + Sync>>,
}

struct PromiseState {
    status: PromiseStatus,
    error: Option<String>,
    /// Bumped on re-attachment and on destruction, detaching any
    /// outstanding handles.
    generation: u64,
}

/// Shared body of an atom instance. Public handles and the ecosystem
/// registry both point at one of these.
pub(crate) struct InstanceShared<T: AtomState> {
    id: NodeId,
    key: Arc<str>,
    runner: Runner<T>,
    store: RwLock<Option<Store<T>>>,
    active: RwLock<ActiveState>,
    destructors: Mutex<Vec<Destructor>>,
    slots: Mutex<SlotTable>,
    exports: RwLock<Option<Arc<dyn Any + Send + Sync>>>,
    promise: RwLock<PromiseState>,
    ttl: RwLock<Option<Duration>>,
    ttl_generation: AtomicU64,
    readonly: bool,
    scope: TemplateScope,
}

impl<T: AtomState> InstanceShared<T> {
    pub(crate) fn new(
        id: NodeId,
        key: Arc<str>,
        runner: Runner<T>,
        ttl: Option<Duration>,
        readonly: bool,
        scope: TemplateScope,
    ) -> Self {
        Self {
            id,
            key,
            runner,
            store: RwLock::new(None),
            active: RwLock::new(ActiveState::Initializing),
            destructors: Mutex::new(Vec::new()),
            slots: Mutex::new(SlotTable::default()),
            exports: RwLock::new(None),
            promise: RwLock::new(PromiseState {
                status: PromiseStatus::Idle,
                error: None,
                generation: 0,
            }),
            ttl: RwLock::new(ttl),
            ttl_generation: AtomicU64::new(0),
            readonly,
            scope,
        }
    }

    pub(crate) fn store(&self) -> Option<Store<T>> {
        self.store.read().expect("store lock poisoned").clone()
    }

    /// Run the factory and apply its output. Used for both the initial
    /// run and dependency-triggered re-runs; on re-runs, edges read
    /// before but not during this run are retracted afterwards.
    pub(crate) fn run_factory(&self, eco: &Ecosystem, first: bool) -> Result<()> {
        let prev_deps = if first { Vec::new() } else { eco.dependency_ids_of(&self.id) };

        let guard = eco.begin_run(self.id.clone(), Arc::clone(&self.key));
        let injection = Injection::new(eco);
        let outcome = (self.runner)(&injection);
        let frame = guard.finish();

        let output = match outcome {
            Ok(output) => output,
            Err(err) => {
                // Partial edges from the failed run are retracted by the
                // caller's destroy path; just surface the error.
                return Err(err);
            }
        };

        // Unpack the output into a value-or-store plus envelope extras.
        let (value, api_exports, api_ttl) = match output {
            FactoryOutput::Value(v) => (ApiValue::Value(v), None, None),
            FactoryOutput::Store(s) => (ApiValue::Store(s), None, None),
            FactoryOutput::Api(api) => (api.value, api.exports, api.ttl),
        };

        self.adopt(eco, value);

        if let Some(exports) = frame.exports.or(api_exports) {
            *self.exports.write().expect("exports lock poisoned") = Some(exports);
        }

        // An explicit injection ttl wins over the envelope, which wins
        // over the template default already stored here.
        match frame.ttl {
            Some(setting) => *self.ttl.write().expect("ttl lock poisoned") = setting,
            None => {
                if let Some(ttl) = api_ttl {
                    *self.ttl.write().expect("ttl lock poisoned") = Some(ttl);
                }
            }
        }

        // Release dependencies this run no longer reads. This is the
        // atomic step that lets a factory swap inputs between runs.
        eco.retract_stale_edges(&self.id, prev_deps, &frame.new_edges);

        let next = if self.promise_status() == PromiseStatus::Loading {
            ActiveState::Stale
        } else {
            ActiveState::Active
        };
        let prev = {
            let mut state = self.active.write().expect("active lock poisoned");
            std::mem::replace(&mut *state, next)
        };
        if prev != next {
            eco.log_active_state(&self.id, next);
        }

        if first {
            eco.on_instance_activated(&self.id);
        }

        for effect in frame.effects {
            if let Some(destructor) = effect() {
                self.push_destructor(destructor);
            }
        }

        tracing::trace!(id = %self.id, first, "atom factory run completed");
        Ok(())
    }

    /// Wrap or commit the factory's value. First run creates and binds
    /// the store; re-runs keep the store identity (and its subscribers)
    /// and commit into it.
    fn adopt(&self, eco: &Ecosystem, value: ApiValue<T>) {
        let current = self.store();
        match current {
            None => {
                let store = match value {
                    ApiValue::Value(v) if self.readonly => Store::readonly(v),
                    ApiValue::Value(v) => Store::new(v),
                    ApiValue::Store(s) => s,
                };
                store.bind(self.make_binding(eco));
                *self.store.write().expect("store lock poisoned") = Some(store);
            }
            Some(existing) => match value {
                ApiValue::Value(v) => {
                    existing.commit_internal(v);
                }
                ApiValue::Store(s) => {
                    if !Store::ptr_eq(&existing, &s) {
                        existing.commit_internal(s.get());
                    }
                }
            },
        }
    }

    fn make_binding(&self, eco: &Ecosystem) -> StoreBinding {
        let on_commit = {
            let weak = eco.downgrade();
            let id = self.id.clone();
            Arc::new(move |action: Option<&Action>| {
                if let Some(eco) = weak.upgrade() {
                    eco.note_instance_state_changed(&id, action);
                }
            }) as Arc<dyn Fn(Option<&Action>) + Send + Sync>
        };
        let on_listener_panic = {
            let weak = eco.downgrade();
            let id = self.id.clone();
            Arc::new(move || {
                if let Some(eco) = weak.upgrade() {
                    eco.note_listener_panic(&id);
                }
            }) as Arc<dyn Fn() + Send + Sync>
        };
        StoreBinding { on_commit, on_listener_panic }
    }

    /// Run destructors in reverse registration order, swallowing
    /// panics. Returns how many panicked.
    pub(crate) fn run_destructors(&self) -> usize {
        let drained: Vec<Destructor> = {
            let mut destructors = self.destructors.lock().expect("destructors lock poisoned");
            destructors.drain(..).collect()
        };
        let mut panicked = 0;
        for destructor in drained.into_iter().rev() {
            if catch_unwind(AssertUnwindSafe(destructor)).is_err() {
                panicked += 1;
                tracing::warn!(id = %self.id, "atom destructor panicked");
            }
        }
        panicked
    }
}

/// Object-safe view of an instance used by the registry and the flush
/// loop. The state type is erased; `as_any_arc` recovers it.
pub(crate) trait AnyInstance: Send + Sync {
    fn id(&self) -> &NodeId;
    fn template_key(&self) -> Arc<str>;
    fn active_state(&self) -> ActiveState;
    fn promise_status(&self) -> PromiseStatus;
    fn promise_error(&self) -> Option<String>;
    fn ttl(&self) -> Option<Duration>;
    fn ttl_generation(&self) -> u64;
    fn bump_ttl_generation(&self) -> u64;
    fn scope(&self) -> TemplateScope;
    fn slots(&self) -> &Mutex<SlotTable>;
    fn push_destructor(&self, destructor: Destructor);
    fn exports_any(&self) -> Option<Arc<dyn Any + Send + Sync>>;
    /// Attach (or re-attach) a readiness promise; returns the handle
    /// generation.
    fn begin_promise(&self) -> u64;
    /// Deliver a promise settlement. Returns false when the handle was
    /// detached (stale generation or already settled).
    fn settle_promise(
        &self,
        eco: &Ecosystem,
        generation: u64,
        outcome: std::result::Result<(), String>,
    ) -> bool;
    /// Re-run the factory in response to a dependency notification.
    fn re_evaluate(&self, eco: &Ecosystem);
    /// Transition to `Destroyed` and run destructors. Edge and registry
    /// cleanup is the ecosystem's job.
    fn mark_destroyed(&self, eco: &Ecosystem);
    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl<T: AtomState> AnyInstance for InstanceShared<T> {
    fn id(&self) -> &NodeId {
        &self.id
    }

    fn template_key(&self) -> Arc<str> {
        Arc::clone(&self.key)
    }

    fn active_state(&self) -> ActiveState {
        *self.active.read().expect("active lock poisoned")
    }

    fn promise_status(&self) -> PromiseStatus {
        self.promise.read().expect("promise lock poisoned").status
    }

    fn promise_error(&self) -> Option<String> {
        self.promise.read().expect("promise lock poisoned").error.clone()
    }

    fn ttl(&self) -> Option<Duration> {
        *self.ttl.read().expect("ttl lock poisoned")
    }

    fn ttl_generation(&self) -> u64 {
        self.ttl_generation.load(Ordering::SeqCst)
    }

    fn bump_ttl_generation(&self) -> u64 {
        self.ttl_generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn scope(&self) -> TemplateScope {
        self.scope
    }

    fn slots(&self) -> &Mutex<SlotTable> {
        &self.slots
    }

    fn push_destructor(&self, destructor: Destructor) {
        self.destructors
            .lock()
            .expect("destructors lock poisoned")
            .push(destructor);
    }

    fn exports_any(&self) -> Option<Arc<dyn Any + Send + Sync>> {
        self.exports.read().expect("exports lock poisoned").clone()
    }

    fn begin_promise(&self) -> u64 {
        let mut promise = self.promise.write().expect("promise lock poisoned");
        promise.status = PromiseStatus::Loading;
        promise.error = None;
        promise.generation += 1;
        promise.generation
    }

    fn settle_promise(
        &self,
        eco: &Ecosystem,
        generation: u64,
        outcome: std::result::Result<(), String>,
    ) -> bool {
        {
            let mut promise = self.promise.write().expect("promise lock poisoned");
            if promise.generation != generation || promise.status != PromiseStatus::Loading {
                return false;
            }
            match outcome {
                Ok(()) => promise.status = PromiseStatus::Success,
                Err(message) => {
                    promise.status = PromiseStatus::Error;
                    promise.error = Some(message);
                }
            }
        }

        let transitioned = {
            let mut state = self.active.write().expect("active lock poisoned");
            if *state == ActiveState::Stale {
                *state = ActiveState::Active;
                true
            } else {
                false
            }
        };
        if transitioned {
            eco.log_active_state(&self.id, ActiveState::Active);
        }

        eco.note_instance_state_changed(&self.id, None);
        true
    }

    fn re_evaluate(&self, eco: &Ecosystem) {
        match self.active_state() {
            ActiveState::Active | ActiveState::Stale => {}
            ActiveState::Initializing | ActiveState::Destroyed => return,
        }
        if let Err(err) = self.run_factory(eco, false) {
            tracing::warn!(id = %self.id, error = %err, "factory re-run failed; destroying instance");
            eco.destroy_node(&self.id);
        }
    }

    fn mark_destroyed(&self, eco: &Ecosystem) {
        {
            let mut state = self.active.write().expect("active lock poisoned");
            if *state == ActiveState::Destroyed {
                return;
            }
            *state = ActiveState::Destroyed;
        }
        eco.log_active_state(&self.id, ActiveState::Destroyed);

        // Detach outstanding promise handles and pending ttl entries.
        self.promise.write().expect("promise lock poisoned").generation += 1;
        self.ttl_generation.fetch_add(1, Ordering::SeqCst);

        let panicked = self.run_destructors();
        for _ in 0..panicked {
            eco.note_destructor_panic(&self.id);
        }
    }

    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// Host-completable handle for an instance's readiness promise.
///
/// The engine never blocks on it: completion is delivered by the host
/// as a synchronous turn via [`resolve`](Self::resolve) or
/// [`reject`](Self::reject). Completing after the instance was
/// destroyed (or after the factory re-attached a promise) is a no-op.
#[derive(Clone)]
pub struct PromiseHandle {
    pub(crate) eco: WeakEcosystem,
    pub(crate) id: NodeId,
    pub(crate) generation: u64,
}

impl PromiseHandle {
    /// Mark the promise resolved. Dependents are notified so hosts can
    /// lift suspension.
    pub fn resolve(&self) {
        if let Some(eco) = self.eco.upgrade() {
            eco.settle_promise(&self.id, self.generation, Ok(()));
        }
    }

    /// Mark the promise rejected with an error message, surfaced via
    /// [`AtomInstance::promise_error`].
    pub fn reject(&self, message: impl Into<String>) {
        if let Some(eco) = self.eco.upgrade() {
            eco.settle_promise(&self.id, self.generation, Err(message.into()));
        }
    }
}

impl fmt::Debug for PromiseHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PromiseHandle")
            .field("id", &self.id)
            .field("generation", &self.generation)
            .finish()
    }
}

/// Public handle to a live atom instance.
///
/// Cloning shares the instance. All operations check the lifecycle
/// state: a destroyed instance refuses reads and writes with
/// [`EcosystemError::InstanceDestroyed`].
pub struct AtomInstance<T: AtomState> {
    pub(crate) shared: Arc<InstanceShared<T>>,
    pub(crate) eco: Ecosystem,
}

impl<T: AtomState> AtomInstance<T> {
    /// The instance id, `"{key}-{params_hash}"`.
    pub fn id(&self) -> &NodeId {
        &self.shared.id
    }

    /// The template key this instance was created from.
    pub fn template_key(&self) -> Arc<str> {
        Arc::clone(&self.shared.key)
    }

    /// Current lifecycle state.
    pub fn active_state(&self) -> ActiveState {
        AnyInstance::active_state(&*self.shared)
    }

    /// The template's host-side scope hint.
    pub fn scope(&self) -> TemplateScope {
        self.shared.scope
    }

    /// Current state value.
    pub fn get(&self) -> Result<T> {
        Ok(self.state_holder()?.get())
    }

    /// Replace or update the state; propagates to dependents before
    /// returning.
    pub fn set_state(&self, settable: impl Into<Settable<T>>) -> Result<T> {
        self.state_holder()?.set_state(settable)
    }

    /// Dispatch an action through the instance's store.
    pub fn dispatch(&self, action: Action) -> Result<T> {
        self.state_holder()?.dispatch(action)
    }

    /// Subscribe to state changes as an external (host-side) dependent.
    /// The listener is invoked during flushes, after all atoms have
    /// settled. Remove the returned edge to unsubscribe; the edge pins
    /// the instance alive until then.
    pub fn subscribe(&self, listener: impl Fn(&T) + Send + Sync + 'static) -> Result<EdgeHandle> {
        let store = self.state_holder()?;
        self.eco.subscribe(self.id(), move |reason| {
            if reason == NotifyReason::StateChanged {
                let value = store.get();
                listener(&value);
            }
        })
    }

    /// The underlying state holder.
    pub fn store(&self) -> Result<Store<T>> {
        self.state_holder()
    }

    /// Exports declared by the factory, downcast to `E`.
    pub fn exports<E: Any + Send + Sync>(&self) -> Option<Arc<E>> {
        AnyInstance::exports_any(&*self.shared).and_then(|e| e.downcast::<E>().ok())
    }

    /// Readiness of the attached promise.
    pub fn promise_status(&self) -> PromiseStatus {
        AnyInstance::promise_status(&*self.shared)
    }

    /// Rejection message, when `promise_status` is `Error`.
    pub fn promise_error(&self) -> Option<String> {
        AnyInstance::promise_error(&*self.shared)
    }

    /// Destroy this instance. Without `force`, destruction only happens
    /// when no dependents pin it. Returns whether it happened.
    pub fn destroy(&self, force: bool) -> bool {
        self.eco.destroy(self.id(), force)
    }

    fn state_holder(&self) -> Result<Store<T>> {
        if self.active_state() == ActiveState::Destroyed {
            return Err(EcosystemError::InstanceDestroyed { id: self.shared.id.raw() });
        }
        self.shared
            .store()
            .ok_or_else(|| EcosystemError::factory("atom instance has no state holder yet"))
    }
}

impl<T: AtomState> Clone for AtomInstance<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            eco: self.eco.clone(),
        }
    }
}

impl<T: AtomState + fmt::Debug> fmt::Debug for AtomInstance<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AtomInstance")
            .field("id", &self.shared.id)
            .field("active_state", &self.active_state())
            .field("promise_status", &self.promise_status())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bare_shared() -> InstanceShared<i32> {
        InstanceShared::new(
            NodeId::atom("test", None),
            "test".into(),
            Arc::new(|_inj: &Injection<'_>| Ok(FactoryOutput::Value(0))),
            None,
            false,
            TemplateScope::App,
        )
    }

    #[test]
    fn destructors_run_in_reverse_order() {
        let shared = bare_shared();
        let order = Arc::new(Mutex::new(Vec::new()));

        for label in ["first", "second", "third"] {
            let order = order.clone();
            shared.push_destructor(Box::new(move || {
                order.lock().unwrap().push(label);
            }));
        }

        assert_eq!(shared.run_destructors(), 0);
        assert_eq!(*order.lock().unwrap(), vec!["third", "second", "first"]);

        // Already drained; running again is a no-op.
        assert_eq!(shared.run_destructors(), 0);
    }

    #[test]
    fn panicking_destructor_is_swallowed_and_counted() {
        let shared = bare_shared();
        let ran = Arc::new(Mutex::new(false));

        let ran_clone = ran.clone();
        shared.push_destructor(Box::new(move || {
            *ran_clone.lock().unwrap() = true;
        }));
        shared.push_destructor(Box::new(|| panic!("cleanup failed")));

        // LIFO: the panicking one runs first, the earlier one still runs.
        assert_eq!(shared.run_destructors(), 1);
        assert!(*ran.lock().unwrap());
    }

    #[test]
    fn promise_generation_detaches_stale_handles() {
        let shared = bare_shared();
        assert_eq!(AnyInstance::promise_status(&shared), PromiseStatus::Idle);

        let first = shared.begin_promise();
        assert_eq!(AnyInstance::promise_status(&shared), PromiseStatus::Loading);

        // Re-attaching bumps the generation.
        let second = shared.begin_promise();
        assert_ne!(first, second);
    }
}
