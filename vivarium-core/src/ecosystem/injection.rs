//! Injection Context
//!
//! The injection context is the API a factory uses to declare
//! dependencies and side effects while it runs. The "current factory"
//! is a per-ecosystem stack of frames, not ambient global state: nested
//! factory runs (one atom constructing while another resolves) push a
//! new frame, and every injection call operates on the top frame.
//!
//! Reads through [`Injection::get`] are recorded as incoming edges of
//! the running instance. At the end of the run, edges present before
//! the run but not re-read are retracted — that is the atomic step that
//! releases dependencies a factory no longer uses.
//!
//! Calling any injection primitive outside a live factory run fails
//! with [`EcosystemError::InjectionOutOfScope`].

use std::any::Any;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use crate::atom::{
    AtomInstance, AtomParams, AtomState, AtomTemplate, Destructor, PromiseHandle, Store,
};
use crate::error::{EcosystemError, Result};
use crate::graph::{EdgeFlags, NodeId};

use super::Ecosystem;

pub(crate) type EffectFn = Box<dyn FnOnce() -> Option<Destructor> + Send + Sync>;

/// One entry on the ecosystem's injection stack: the state of a single
/// factory run.
pub(crate) struct InjectionFrame {
    pub(crate) node_id: NodeId,
    pub(crate) key: Arc<str>,
    /// Dependencies read during this run. Edges not in this set at the
    /// end of the run are retracted.
    pub(crate) new_edges: Vec<NodeId>,
    /// Effects to run after the factory returns.
    pub(crate) effects: Vec<EffectFn>,
    /// Ttl declared this run: `Some(None)` pins the instance alive,
    /// `Some(Some(d))` sets the delay, `None` leaves the template
    /// default in place.
    pub(crate) ttl: Option<Option<Duration>>,
    pub(crate) exports: Option<Arc<dyn Any + Send + Sync>>,
    /// Cursor into the instance's ordered slot table.
    pub(crate) slot_cursor: usize,
}

impl InjectionFrame {
    pub(crate) fn new(node_id: NodeId, key: Arc<str>) -> Self {
        Self {
            node_id,
            key,
            new_edges: Vec::new(),
            effects: Vec::new(),
            ttl: None,
            exports: None,
            slot_cursor: 0,
        }
    }
}

/// Guard for a pushed frame. [`finish`](Self::finish) pops and returns
/// it; dropping without finishing (a panicking factory) still pops, so
/// the stack stays balanced.
pub(crate) struct RunGuard<'a> {
    eco: &'a Ecosystem,
    done: bool,
}

impl<'a> RunGuard<'a> {
    pub(crate) fn new(eco: &'a Ecosystem) -> Self {
        Self { eco, done: false }
    }

    pub(crate) fn finish(mut self) -> InjectionFrame {
        self.done = true;
        self.eco.pop_frame()
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        if !self.done {
            self.eco.pop_frame();
        }
    }
}

/// The API handed to factories.
///
/// Borrowed for the duration of the run; all methods resolve against
/// the top frame of the owning ecosystem's injection stack.
pub struct Injection<'a> {
    eco: &'a Ecosystem,
}

impl<'a> Injection<'a> {
    pub(crate) fn new(eco: &'a Ecosystem) -> Self {
        Self { eco }
    }

    /// The ecosystem this run belongs to.
    pub fn ecosystem(&self) -> &Ecosystem {
        self.eco
    }

    /// Read another atom's state, registering a dynamic dependency.
    ///
    /// The running instance re-evaluates whenever the dependency's
    /// state changes. Resolves (or creates) the dependency first; a
    /// read that cycles back into an atom currently initializing fails
    /// with [`EcosystemError::CyclicDependency`].
    pub fn get<T: AtomState, P: AtomParams>(
        &self,
        template: &AtomTemplate<T, P>,
        params: P,
    ) -> Result<T> {
        let dependent = self.eco.current_frame_node()?;
        let instance = self.eco.get_node(template, params)?;
        self.eco
            .link_dependency(&dependent, instance.id(), EdgeFlags::EXPLICIT, "get")?;
        instance.get()
    }

    /// Resolve another atom's instance handle, registering a static
    /// dependency: the handle pins the dependency alive but this
    /// instance is not re-evaluated on its state changes.
    pub fn get_instance<T: AtomState, P: AtomParams>(
        &self,
        template: &AtomTemplate<T, P>,
        params: P,
    ) -> Result<AtomInstance<T>> {
        let dependent = self.eco.current_frame_node()?;
        let instance = self.eco.get_node(template, params)?;
        self.eco.link_dependency(
            &dependent,
            instance.id(),
            EdgeFlags::EXPLICIT | EdgeFlags::STATIC,
            "getInstance",
        )?;
        Ok(instance)
    }

    /// Create (or, on a re-run, retrieve) a local store owned by this
    /// instance. Keyed by call order within the run, so `store`/`cell`
    /// calls must be unconditional.
    pub fn store<S: AtomState>(&self, initial: S) -> Result<Store<S>> {
        self.slot_store(initial, false)
    }

    /// Like [`store`](Self::store) but the returned store refuses
    /// external `set_state`.
    pub fn readonly_store<S: AtomState>(&self, initial: S) -> Result<Store<S>> {
        self.slot_store(initial, true)
    }

    /// Register a function to run after the factory returns. It may
    /// hand back a destructor, which runs (LIFO) when the instance is
    /// destroyed.
    pub fn effect(
        &self,
        effect: impl FnOnce() -> Option<Destructor> + Send + Sync + 'static,
    ) -> Result<()> {
        self.eco
            .with_current_frame(|frame| frame.effects.push(Box::new(effect)))
    }

    /// A mutable per-instance cell surviving re-runs. Keyed by call
    /// order within the run, like [`store`](Self::store).
    pub fn cell<V: Send + Sync + 'static>(&self, initial: V) -> Result<Arc<RwLock<V>>> {
        let (instance, cursor) = self.next_slot()?;
        let mut slots = instance.slots().lock().expect("slot table lock poisoned");
        if cursor < slots.ordered.len() {
            let any = Arc::clone(&slots.ordered[cursor]);
            drop(slots);
            any.downcast::<RwLock<V>>().map_err(|_| self.slot_type_error(&instance))
        } else {
            let cell = Arc::new(RwLock::new(initial));
            slots.ordered.push(cell.clone());
            Ok(cell)
        }
    }

    /// A value cached across re-runs, keyed by `key`. The initializer
    /// runs only when the key is absent.
    pub fn memo<V: Send + Sync + 'static>(
        &self,
        key: &str,
        init: impl FnOnce() -> V,
    ) -> Result<Arc<V>> {
        let instance = self.current_instance()?;
        {
            let slots = instance.slots().lock().expect("slot table lock poisoned");
            if let Some(any) = slots.memos.get(key) {
                return Arc::clone(any)
                    .downcast::<V>()
                    .map_err(|_| self.slot_type_error(&instance));
            }
        }
        // Initialize outside the slot lock; the initializer may itself
        // use injection.
        let value = Arc::new(init());
        instance
            .slots()
            .lock()
            .expect("slot table lock poisoned")
            .memos
            .insert(key.to_string(), value.clone());
        Ok(value)
    }

    /// Declare the destruction delay after the last dependent leaves,
    /// overriding the template default for this instance.
    pub fn ttl(&self, ttl: Duration) -> Result<()> {
        self.eco.with_current_frame(|frame| frame.ttl = Some(Some(ttl)))
    }

    /// Pin this instance alive regardless of dependents, overriding any
    /// template ttl.
    pub fn keep_alive(&self) -> Result<()> {
        self.eco.with_current_frame(|frame| frame.ttl = Some(None))
    }

    /// Attach a readiness promise. The instance finishes its run in the
    /// `Stale` state; the host completes the returned handle to move it
    /// to `Active` (or record a rejection). Completion after
    /// destruction is ignored.
    pub fn promise(&self) -> Result<PromiseHandle> {
        let instance = self.current_instance()?;
        let generation = instance.begin_promise();
        Ok(PromiseHandle {
            eco: self.eco.downgrade(),
            id: instance.id().clone(),
            generation,
        })
    }

    /// Declare stable exports retrievable from the instance handle.
    pub fn exports<E: Any + Send + Sync>(&self, exports: E) -> Result<()> {
        self.eco
            .with_current_frame(|frame| frame.exports = Some(Arc::new(exports)))
    }

    fn slot_store<S: AtomState>(&self, initial: S, readonly: bool) -> Result<Store<S>> {
        let (instance, cursor) = self.next_slot()?;
        let mut slots = instance.slots().lock().expect("slot table lock poisoned");
        if cursor < slots.ordered.len() {
            let any = Arc::clone(&slots.ordered[cursor]);
            drop(slots);
            let store = any
                .downcast::<Store<S>>()
                .map_err(|_| self.slot_type_error(&instance))?;
            Ok((*store).clone())
        } else {
            let store = if readonly { Store::readonly(initial) } else { Store::new(initial) };
            slots.ordered.push(Arc::new(store.clone()));
            Ok(store)
        }
    }

    fn next_slot(&self) -> Result<(Arc<dyn crate::atom::AnyInstance>, usize)> {
        let instance = self.current_instance()?;
        let cursor = self.eco.with_current_frame(|frame| {
            let cursor = frame.slot_cursor;
            frame.slot_cursor += 1;
            cursor
        })?;
        Ok((instance, cursor))
    }

    fn current_instance(&self) -> Result<Arc<dyn crate::atom::AnyInstance>> {
        let node = self.eco.current_frame_node()?;
        self.eco
            .instance_for(&node)
            .ok_or(EcosystemError::InjectionOutOfScope)
    }

    fn slot_type_error(&self, instance: &Arc<dyn crate::atom::AnyInstance>) -> EcosystemError {
        EcosystemError::InvalidParams {
            key: instance.template_key(),
            reason: "injection slot type changed between factory runs".into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_slot_cursor_advances() {
        let mut frame = InjectionFrame::new(NodeId::atom("count", None), "count".into());
        assert_eq!(frame.slot_cursor, 0);
        frame.slot_cursor += 1;
        assert_eq!(frame.slot_cursor, 1);
        assert!(frame.new_edges.is_empty());
        assert!(frame.ttl.is_none());
    }

    #[test]
    fn injection_outside_a_run_is_rejected() {
        let eco = Ecosystem::new();
        // No factory frame on the stack: frame-dependent calls fail.
        assert!(matches!(
            eco.current_frame_node(),
            Err(EcosystemError::InjectionOutOfScope)
        ));
    }
}
