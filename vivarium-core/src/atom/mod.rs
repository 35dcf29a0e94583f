//! Atoms
//!
//! This module implements the atom layer: templates, live instances,
//! and the store contract behind them.
//!
//! # Concepts
//!
//! ## Templates
//!
//! An [`AtomTemplate`] is an immutable description: a key, a factory,
//! and lifecycle flags. Templates are cheap values; nothing runs until
//! an ecosystem materializes one.
//!
//! ## Instances
//!
//! An [`AtomInstance`] is the live materialization of a template plus a
//! params value. It owns a [`Store`], optional exports, an optional
//! readiness promise, and a destructor list, and it participates in the
//! ecosystem's dependency graph.
//!
//! ## Stores
//!
//! A [`Store`] is the minimal state-holder contract the engine
//! consumes: `get`, `set_state`, `dispatch`, `subscribe`. Factories may
//! return their own stores and the engine adopts them unchanged.

mod instance;
mod store;
mod template;

pub use instance::{ActiveState, AtomInstance, Destructor, PromiseHandle, PromiseStatus};
pub use store::{Action, AtomState, Reducer, Settable, Store, Subscription};
pub use template::{params_hash, AtomApi, AtomParams, AtomTemplate, Factory, FactoryOutput, TemplateScope};

pub(crate) use instance::{AnyInstance, InstanceShared, Runner, SlotTable};
pub(crate) use store::StoreBinding;
pub(crate) use template::{params_id, ApiValue};
