//! Store Implementation
//!
//! A Store is the state holder behind every atom instance: an observable
//! value with a `get` / `set_state` / `dispatch` / `subscribe` contract.
//! It is the only surface the engine requires from state containers, so
//! factories can hand the ecosystem their own stores and everything else
//! keeps working.
//!
//! # How Stores Work
//!
//! 1. `set_state` commits synchronously: the new value is observable to
//!    `get` before `set_state` returns.
//!
//! 2. Listeners run synchronously in subscription order after a commit.
//!
//! 3. A listener that itself calls `set_state` does not recurse: the
//!    write lands immediately, but its listener pass is queued and runs
//!    after the current pass completes.
//!
//! 4. `dispatch` routes an [`Action`] through the store's reducer (if
//!    any) and then commits like `set_state`.
//!
//! # Thread Safety
//!
//! Stores are `Send + Sync`; the value and listener list sit behind
//! locks. The engine itself is single-threaded cooperative, so the locks
//! exist for soundness, not for parallel mutation, and no lock is ever
//! held across a listener call.

use std::collections::VecDeque;
use std::fmt::Debug;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use serde::{Deserialize, Serialize};

use crate::error::{EcosystemError, Result};

/// Bound required of atom state values.
pub trait AtomState: Clone + Send + Sync + 'static {}

impl<T: Clone + Send + Sync + 'static> AtomState for T {}

/// A dispatched action: a kind tag plus an optional structured payload.
///
/// Payloads are plain JSON values so the devtools event log can record
/// them without knowing the store's state type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    /// Action discriminator, e.g. `"increment"`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Optional structured payload.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

impl Action {
    /// An action with no payload.
    pub fn new(kind: impl Into<String>) -> Self {
        Self { kind: kind.into(), payload: None }
    }

    /// An action carrying a payload.
    pub fn with_payload(kind: impl Into<String>, payload: serde_json::Value) -> Self {
        Self { kind: kind.into(), payload: Some(payload) }
    }
}

/// Argument to [`Store::set_state`]: either a replacement value or an
/// updater applied to the previous value.
pub enum Settable<T> {
    /// Replace the state.
    Value(T),
    /// Compute the next state from the previous one.
    Update(Box<dyn FnOnce(&T) -> T + Send>),
}

impl<T> Settable<T> {
    /// An updater closure, `store.set_state(Settable::update(|n| n + 1))`.
    pub fn update(f: impl FnOnce(&T) -> T + Send + 'static) -> Self {
        Self::Update(Box::new(f))
    }
}

impl<T: AtomState> From<T> for Settable<T> {
    fn from(value: T) -> Self {
        Self::Value(value)
    }
}

/// Reducer applied by [`Store::dispatch`].
pub type Reducer<T> = Arc<dyn Fn(&T, &Action) -> T + Send + Sync>;

type Listener<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Hooks the ecosystem installs when it adopts a store for an atom
/// instance. `on_commit` schedules graph propagation for user-driven
/// commits; `on_listener_panic` writes the swallowed panic to the event
/// log.
pub(crate) struct StoreBinding {
    pub(crate) on_commit: Arc<dyn Fn(Option<&Action>) + Send + Sync>,
    pub(crate) on_listener_panic: Arc<dyn Fn() + Send + Sync>,
}

struct StoreInner<T: AtomState> {
    value: RwLock<T>,
    listeners: RwLock<Vec<(u64, Listener<T>)>>,
    next_listener_id: AtomicU64,
    reducer: RwLock<Option<Reducer<T>>>,
    readonly: bool,
    /// Set while a listener pass is running; nested commits queue.
    notifying: AtomicBool,
    /// Commits awaiting a listener pass. The bool records whether the
    /// commit should also propagate into the graph; the action is kept
    /// for the binding hook.
    pending: Mutex<VecDeque<(bool, Option<Action>)>>,
    binding: RwLock<Option<StoreBinding>>,
}

/// An observable state container.
///
/// Cloning a `Store` shares state: all clones read and write the same
/// value and listener list.
pub struct Store<T: AtomState> {
    inner: Arc<StoreInner<T>>,
}

impl<T: AtomState> Store<T> {
    /// Create a store with the given initial value.
    pub fn new(initial: T) -> Self {
        Self::build(initial, None, false)
    }

    /// Create a store whose `dispatch` runs `reducer`.
    pub fn with_reducer(initial: T, reducer: impl Fn(&T, &Action) -> T + Send + Sync + 'static) -> Self {
        Self::build(initial, Some(Arc::new(reducer)), false)
    }

    /// Create a readonly store: `set_state` is refused, `dispatch`
    /// still works through the reducer.
    pub fn readonly(initial: T) -> Self {
        Self::build(initial, None, true)
    }

    fn build(initial: T, reducer: Option<Reducer<T>>, readonly: bool) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                value: RwLock::new(initial),
                listeners: RwLock::new(Vec::new()),
                next_listener_id: AtomicU64::new(0),
                reducer: RwLock::new(reducer),
                readonly,
                notifying: AtomicBool::new(false),
                pending: Mutex::new(VecDeque::new()),
                binding: RwLock::new(None),
            }),
        }
    }

    /// The current state.
    pub fn get(&self) -> T {
        self.inner.value.read().expect("value lock poisoned").clone()
    }

    /// Whether the store refuses external `set_state`.
    pub fn is_readonly(&self) -> bool {
        self.inner.readonly
    }

    /// Replace or update the state and notify listeners.
    ///
    /// The write is observable to `get` before this returns. Returns the
    /// committed value.
    pub fn set_state(&self, settable: impl Into<Settable<T>>) -> Result<T> {
        if self.inner.readonly {
            return Err(EcosystemError::ReadonlyStore);
        }
        Ok(self.commit(settable.into(), true, None))
    }

    /// Run `action` through the reducer (identity if none) and commit.
    pub fn dispatch(&self, action: Action) -> Result<T> {
        let next = {
            let reducer = self.inner.reducer.read().expect("reducer lock poisoned");
            let current = self.inner.value.read().expect("value lock poisoned");
            match reducer.as_ref() {
                Some(reduce) => reduce(&current, &action),
                None => current.clone(),
            }
        };
        Ok(self.commit(Settable::Value(next), true, Some(action)))
    }

    /// Register a listener, invoked after every commit with the
    /// committed state. Listeners run in subscription order. The
    /// returned guard unsubscribes on drop.
    pub fn subscribe(&self, listener: impl Fn(&T) + Send + Sync + 'static) -> Subscription<T> {
        let id = self.inner.next_listener_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .listeners
            .write()
            .expect("listeners lock poisoned")
            .push((id, Arc::new(listener)));
        Subscription {
            inner: Arc::downgrade(&self.inner),
            id,
            active: true,
        }
    }

    /// Number of registered listeners.
    pub fn listener_count(&self) -> usize {
        self.inner.listeners.read().expect("listeners lock poisoned").len()
    }

    /// Whether two handles share one store.
    pub fn ptr_eq(a: &Self, b: &Self) -> bool {
        Arc::ptr_eq(&a.inner, &b.inner)
    }

    /// Engine-side commit: bypasses the readonly check and does not
    /// re-propagate into the graph (used while a flush is already
    /// delivering this change). Listeners still run.
    pub(crate) fn commit_internal(&self, value: T) -> T {
        self.commit(Settable::Value(value), false, None)
    }

    pub(crate) fn bind(&self, binding: StoreBinding) {
        *self.inner.binding.write().expect("binding lock poisoned") = Some(binding);
    }

    /// Write the value, queue a listener pass, and drain the queue
    /// unless a pass is already running (in which case the running pass
    /// picks it up).
    fn commit(&self, settable: Settable<T>, propagate: bool, action: Option<Action>) -> T {
        let committed = {
            let mut guard = self.inner.value.write().expect("value lock poisoned");
            let next = match settable {
                Settable::Value(v) => v,
                Settable::Update(f) => f(&guard),
            };
            *guard = next.clone();
            next
        };

        self.inner
            .pending
            .lock()
            .expect("pending lock poisoned")
            .push_back((propagate, action));

        if self.inner.notifying.swap(true, Ordering::SeqCst) {
            // A listener pass is already draining; it will see this
            // commit. Read-your-writes already holds.
            return committed;
        }

        loop {
            let entry = self
                .inner
                .pending
                .lock()
                .expect("pending lock poisoned")
                .pop_front();
            let Some((propagate, action)) = entry else { break };

            let snapshot = self.get();
            let listeners: Vec<Listener<T>> = self
                .inner
                .listeners
                .read()
                .expect("listeners lock poisoned")
                .iter()
                .map(|(_, l)| Arc::clone(l))
                .collect();

            for listener in listeners {
                if catch_unwind(AssertUnwindSafe(|| listener(&snapshot))).is_err() {
                    tracing::warn!("store listener panicked; continuing listener pass");
                    let on_panic = {
                        let binding = self.inner.binding.read().expect("binding lock poisoned");
                        binding.as_ref().map(|b| Arc::clone(&b.on_listener_panic))
                    };
                    if let Some(hook) = on_panic {
                        hook();
                    }
                }
            }

            if propagate {
                // Copy the hook out so no store lock is held while the
                // ecosystem runs its flush.
                let on_commit = {
                    let binding = self.inner.binding.read().expect("binding lock poisoned");
                    binding.as_ref().map(|b| Arc::clone(&b.on_commit))
                };
                if let Some(hook) = on_commit {
                    hook(action.as_ref());
                }
            }
        }

        self.inner.notifying.store(false, Ordering::SeqCst);
        committed
    }
}

impl<T: AtomState> Clone for Store<T> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl<T: AtomState + Debug> Debug for Store<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("value", &self.get())
            .field("listener_count", &self.listener_count())
            .field("readonly", &self.inner.readonly)
            .finish()
    }
}

/// RAII guard for a store listener. Dropping it unsubscribes before the
/// next notification cycle.
pub struct Subscription<T: AtomState> {
    inner: Weak<StoreInner<T>>,
    id: u64,
    active: bool,
}

impl<T: AtomState> Subscription<T> {
    /// Unsubscribe now.
    pub fn unsubscribe(self) {}

    /// Keep the listener registered for the life of the store.
    pub fn forget(mut self) {
        self.active = false;
    }
}

impl<T: AtomState> Drop for Subscription<T> {
    fn drop(&mut self) {
        if !self.active {
            return;
        }
        if let Some(inner) = self.inner.upgrade() {
            inner
                .listeners
                .write()
                .expect("listeners lock poisoned")
                .retain(|(id, _)| *id != self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicI32;

    #[test]
    fn get_and_set() {
        let store = Store::new(0);
        assert_eq!(store.get(), 0);

        assert_eq!(store.set_state(42).unwrap(), 42);
        assert_eq!(store.get(), 42);

        assert_eq!(store.set_state(Settable::update(|n| n + 8)).unwrap(), 50);
        assert_eq!(store.get(), 50);
    }

    #[test]
    fn listeners_run_in_subscription_order() {
        let store = Store::new(0);
        let order = Arc::new(Mutex::new(Vec::new()));

        let order_a = order.clone();
        let _a = store.subscribe(move |_| order_a.lock().unwrap().push("a"));
        let order_b = order.clone();
        let _b = store.subscribe(move |_| order_b.lock().unwrap().push("b"));

        store.set_state(1).unwrap();
        assert_eq!(*order.lock().unwrap(), vec!["a", "b"]);
    }

    #[test]
    fn dropping_subscription_unsubscribes() {
        let store = Store::new(0);
        let calls = Arc::new(AtomicI32::new(0));

        let calls_clone = calls.clone();
        let sub = store.subscribe(move |_| {
            calls_clone.fetch_add(1, Ordering::SeqCst);
        });

        store.set_state(1).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        drop(sub);
        store.set_state(2).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn listener_setting_state_defers_to_a_follow_up_pass() {
        let store = Store::new(0);
        let seen = Arc::new(Mutex::new(Vec::new()));

        let store_clone = store.clone();
        let seen_clone = seen.clone();
        store
            .subscribe(move |value| {
                seen_clone.lock().unwrap().push(*value);
                if *value == 1 {
                    // Re-entrant set: must not recurse, must run after
                    // this pass.
                    store_clone.set_state(2).unwrap();
                }
            })
            .forget();

        store.set_state(1).unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![1, 2]);
        assert_eq!(store.get(), 2);
    }

    #[test]
    fn dispatch_runs_reducer() {
        let store = Store::with_reducer(10, |state, action| match action.kind.as_str() {
            "add" => {
                let amount = action
                    .payload
                    .as_ref()
                    .and_then(|p| p.as_i64())
                    .unwrap_or(0);
                state + amount as i32
            }
            _ => *state,
        });

        let value = store
            .dispatch(Action::with_payload("add", serde_json::json!(5)))
            .unwrap();
        assert_eq!(value, 15);

        // Unknown actions leave the state untouched.
        assert_eq!(store.dispatch(Action::new("noop")).unwrap(), 15);
    }

    #[test]
    fn readonly_store_refuses_set_state() {
        let store = Store::readonly(1);
        assert!(matches!(
            store.set_state(2),
            Err(EcosystemError::ReadonlyStore)
        ));
        assert_eq!(store.get(), 1);

        // Engine-side commits still work.
        store.commit_internal(3);
        assert_eq!(store.get(), 3);
    }

    #[test]
    fn panicking_listener_does_not_stop_the_pass() {
        let store = Store::new(0);
        let calls = Arc::new(AtomicI32::new(0));

        store.subscribe(|_| panic!("boom")).forget();
        let calls_clone = calls.clone();
        store
            .subscribe(move |_| {
                calls_clone.fetch_add(1, Ordering::SeqCst);
            })
            .forget();

        store.set_state(1).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(store.get(), 1);
    }

    #[test]
    fn clone_shares_state() {
        let a = Store::new(0);
        let b = a.clone();

        a.set_state(42).unwrap();
        assert_eq!(b.get(), 42);

        b.set_state(7).unwrap();
        assert_eq!(a.get(), 7);
    }
}
