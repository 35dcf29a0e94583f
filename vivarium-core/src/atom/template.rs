//! Atom Templates
//!
//! A template is the immutable description of an atom: its key, factory,
//! and lifecycle flags. Instances are materialized from a template plus
//! a params value; the pair determines the instance id, so equal
//! params always resolve to the same live instance.
//!
//! # Params
//!
//! Params must implement [`Hash`]; the hash is structural, so
//! equal-by-value params produce equal instance ids. Opaque values that
//! cannot implement `Hash` (closures, host handles) cannot be used as
//! params — the bound enforces what the engine would otherwise have to
//! document away.

use std::any::Any;
use std::any::TypeId;
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use crate::atom::store::{AtomState, Store};
use crate::ecosystem::Injection;
use crate::error::Result;

/// Bound required of atom params.
pub trait AtomParams: Clone + fmt::Debug + Hash + Send + Sync + 'static {}

impl<P: Clone + fmt::Debug + Hash + Send + Sync + 'static> AtomParams for P {}

/// Structural hash of a params value. Stable within a process run.
pub fn params_hash<P: Hash>(params: &P) -> u64 {
    let mut hasher = DefaultHasher::new();
    params.hash(&mut hasher);
    hasher.finish()
}

/// Hash used in instance ids: `None` for parameterless (`()`) atoms so
/// their id is the bare template key.
pub(crate) fn params_id<P: AtomParams>(params: &P) -> Option<u64> {
    if TypeId::of::<P>() == TypeId::of::<()>() {
        None
    } else {
        Some(params_hash(params))
    }
}

/// Where instances of a template live, from the host's point of view.
/// Carried as metadata for host bindings; the core does not interpret
/// it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TemplateScope {
    /// One instance set per application ecosystem.
    #[default]
    App,
    /// Shared across ecosystems by the host.
    Global,
    /// Scoped to a host-defined local region.
    Local,
}

/// What a factory hands back to the engine.
pub enum FactoryOutput<T: AtomState> {
    /// A plain value; the engine wraps it in a [`Store`] on first run
    /// and commits it into the existing store on re-runs.
    Value(T),
    /// A state holder the engine adopts as-is.
    Store(Store<T>),
    /// The full envelope: value or store plus exports and lifecycle
    /// declarations.
    Api(AtomApi<T>),
}

impl<T: AtomState> From<T> for FactoryOutput<T> {
    fn from(value: T) -> Self {
        Self::Value(value)
    }
}

impl<T: AtomState> From<Store<T>> for FactoryOutput<T> {
    fn from(store: Store<T>) -> Self {
        Self::Store(store)
    }
}

impl<T: AtomState> From<AtomApi<T>> for FactoryOutput<T> {
    fn from(api: AtomApi<T>) -> Self {
        Self::Api(api)
    }
}

pub(crate) enum ApiValue<T: AtomState> {
    Value(T),
    Store(Store<T>),
}

/// Builder-style envelope for factories that want to declare exports or
/// lifecycle settings alongside their value.
///
/// An async readiness promise is attached through
/// [`Injection::promise`], which is the only place the engine can mint
/// a host-completable handle.
pub struct AtomApi<T: AtomState> {
    pub(crate) value: ApiValue<T>,
    pub(crate) exports: Option<Arc<dyn Any + Send + Sync>>,
    pub(crate) ttl: Option<Duration>,
}

impl<T: AtomState> AtomApi<T> {
    /// Envelope around a plain value.
    pub fn value(value: T) -> Self {
        Self { value: ApiValue::Value(value), exports: None, ttl: None }
    }

    /// Envelope around an existing store.
    pub fn store(store: Store<T>) -> Self {
        Self { value: ApiValue::Store(store), exports: None, ttl: None }
    }

    /// Attach stable exports, retrievable with
    /// [`AtomInstance::exports`](crate::atom::AtomInstance::exports).
    pub fn with_exports<E: Any + Send + Sync>(mut self, exports: E) -> Self {
        self.exports = Some(Arc::new(exports));
        self
    }

    /// Declare the destruction delay after the last dependent leaves.
    /// An explicit [`Injection::ttl`] call wins over this.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }
}

/// Factory function type for a template.
pub type Factory<T, P> = Arc<dyn Fn(&Injection<'_>, &P) -> Result<FactoryOutput<T>> + Send + Sync>;

/// Immutable description of an atom: key, factory, and lifecycle flags.
///
/// Cloning shares the factory, so clones have the same identity for
/// duplicate-key detection.
pub struct AtomTemplate<T: AtomState, P: AtomParams = ()> {
    key: Arc<str>,
    factory: Factory<T, P>,
    ttl: Option<Duration>,
    readonly: bool,
    max_instances: Option<usize>,
    scope: TemplateScope,
}

impl<T: AtomState, P: AtomParams> AtomTemplate<T, P> {
    /// Create a template. `key` must be unique within an ecosystem;
    /// reusing a key with a different factory is rejected at resolution
    /// time (override replacement goes through
    /// [`Ecosystem::set_overrides`](crate::ecosystem::Ecosystem::set_overrides)).
    pub fn new(
        key: impl Into<Arc<str>>,
        factory: impl Fn(&Injection<'_>, &P) -> Result<FactoryOutput<T>> + Send + Sync + 'static,
    ) -> Self {
        Self {
            key: key.into(),
            factory: Arc::new(factory),
            ttl: None,
            readonly: false,
            max_instances: None,
            scope: TemplateScope::App,
        }
    }

    /// Default destruction delay after the last dependent leaves.
    /// `Duration::ZERO` destroys immediately. Without a ttl, instances
    /// live until explicitly destroyed.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Refuse external `set_state` on instances of this template.
    pub fn readonly(mut self) -> Self {
        self.readonly = true;
        self
    }

    /// Cap the number of simultaneously live instances.
    pub fn with_max_instances(mut self, max: usize) -> Self {
        self.max_instances = Some(max);
        self
    }

    /// Set the host-side scope hint.
    pub fn with_scope(mut self, scope: TemplateScope) -> Self {
        self.scope = scope;
        self
    }

    /// The template key.
    pub fn key(&self) -> &Arc<str> {
        &self.key
    }

    /// The default ttl, if any.
    pub fn ttl(&self) -> Option<Duration> {
        self.ttl
    }

    /// Whether instances refuse external writes.
    pub fn is_readonly(&self) -> bool {
        self.readonly
    }

    /// The live-instance cap, if any.
    pub fn max_instances(&self) -> Option<usize> {
        self.max_instances
    }

    /// The host-side scope hint.
    pub fn scope(&self) -> TemplateScope {
        self.scope
    }

    pub(crate) fn factory(&self) -> &Factory<T, P> {
        &self.factory
    }

    /// Identity of the factory, used for duplicate-key detection.
    /// Clones share it; independently constructed templates do not.
    pub(crate) fn fingerprint(&self) -> usize {
        Arc::as_ptr(&self.factory) as *const () as usize
    }
}

impl<T: AtomState, P: AtomParams> Clone for AtomTemplate<T, P> {
    fn clone(&self) -> Self {
        Self {
            key: Arc::clone(&self.key),
            factory: Arc::clone(&self.factory),
            ttl: self.ttl,
            readonly: self.readonly,
            max_instances: self.max_instances,
            scope: self.scope,
        }
    }
}

impl<T: AtomState, P: AtomParams> fmt::Debug for AtomTemplate<T, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AtomTemplate")
            .field("key", &self.key)
            .field("ttl", &self.ttl)
            .field("readonly", &self.readonly)
            .field("max_instances", &self.max_instances)
            .field("scope", &self.scope)
            .finish()
    }
}
