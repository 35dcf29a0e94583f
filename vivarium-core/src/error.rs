//! Engine errors.
//!
//! All control-path operations (node resolution, injection calls, state
//! writes) fail loudly with an [`EcosystemError`] returned to the caller.
//! Asynchronous failures (a panicking listener or destructor) are not
//! errors: they are caught, written to the event log, and the current
//! flush continues, so that one bad callback cannot leave the graph
//! half-notified.

use std::sync::Arc;

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, EcosystemError>;

/// Errors surfaced by the ecosystem and its injection API.
#[derive(Debug, Clone, Error)]
pub enum EcosystemError {
    /// Parameters were missing or malformed for a template, or an
    /// override resolved to a template with an incompatible state type.
    #[error("invalid params for atom `{key}`: {reason}")]
    InvalidParams {
        /// Template key the params were supplied for.
        key: Arc<str>,
        /// Human-readable description of the mismatch.
        reason: String,
    },

    /// An injection primitive was called outside a live factory run.
    #[error("injection used outside an active factory run")]
    InjectionOutOfScope,

    /// An operation was attempted on a destroyed instance.
    #[error("atom instance `{id}` has been destroyed")]
    InstanceDestroyed {
        /// Id of the destroyed instance.
        id: Arc<str>,
    },

    /// A factory read an atom that transitively reads the factory's own
    /// atom during its initial run.
    #[error("cyclic dependency detected: {path}")]
    CyclicDependency {
        /// The chain of template keys forming the cycle, `a -> b -> a`.
        path: String,
    },

    /// A factory returned an error. The instance transitions directly to
    /// `Destroyed` and the error is handed back to the `get_node` caller.
    #[error("factory for atom `{key}` failed: {source}")]
    FactoryFailed {
        /// Template key whose factory failed.
        key: Arc<str>,
        /// The factory's own error.
        #[source]
        source: Arc<EcosystemError>,
    },

    /// Two templates with the same key but different factory identities
    /// were used with one ecosystem. Replacement must go through
    /// `set_overrides`.
    #[error("duplicate template key `{key}` with a different factory")]
    DuplicateKey {
        /// The colliding key.
        key: Arc<str>,
    },

    /// `set_state` or `dispatch` was called on a readonly store from
    /// outside the owning factory.
    #[error("store is readonly")]
    ReadonlyStore,

    /// Creating the instance would exceed the template's `max_instances`.
    #[error("atom `{key}` is limited to {max} live instances")]
    InstanceLimitExceeded {
        /// Template key at its limit.
        key: Arc<str>,
        /// The configured limit.
        max: usize,
    },

    /// A factory-supplied failure with no more specific kind. Factories
    /// can use this to abort initialization with a message.
    #[error("{0}")]
    Factory(String),
}

impl EcosystemError {
    /// Shorthand for a factory-supplied failure message.
    pub fn factory(msg: impl Into<String>) -> Self {
        Self::Factory(msg.into())
    }
}
