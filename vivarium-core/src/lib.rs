//! Vivarium Core
//!
//! This crate provides a reactive atomic state engine: a runtime that
//! manages a dynamic, bidirectional dependency graph of independently
//! keyed state cells ("atoms"), propagates updates along that graph in
//! a deterministic order, and applies lifecycle policies (time-to-live,
//! promise-backed staleness, override replacement).
//!
//! # Architecture
//!
//! The crate is organized into three modules:
//!
//! - `graph`: the dependency graph — nodes, flagged edges, and the
//!   notification ordering that drives every flush
//! - `atom`: templates, live instances, and the store contract behind
//!   them
//! - `ecosystem`: the root container — registry, override table,
//!   injection stack, scheduler, ttl timers, and the devtools event log
//!
//! # Example
//!
//! ```rust,ignore
//! use vivarium_core::{AtomTemplate, Ecosystem, FactoryOutput};
//!
//! let eco = Ecosystem::new();
//!
//! // A root atom holding a number.
//! let count = AtomTemplate::new("count", |_, _| Ok(FactoryOutput::Value(0)));
//!
//! // A derived atom that re-evaluates when `count` changes.
//! let double = AtomTemplate::new("double", {
//!     let count = count.clone();
//!     move |i, _| Ok(FactoryOutput::Value(i.get(&count, ())? * 2))
//! });
//!
//! let counter = eco.get_node(&count, ())?;
//! let doubled = eco.get_node(&double, ())?;
//! assert_eq!(doubled.get()?, 0);
//!
//! // Propagates through the graph before returning.
//! counter.set_state(5)?;
//! assert_eq!(doubled.get()?, 10);
//! # Ok::<(), vivarium_core::EcosystemError>(())
//! ```
//!
//! # Concurrency Model
//!
//! The engine is single-threaded cooperative: every externally
//! delivered turn (a state change, a timer tick via
//! [`Ecosystem::tick`], a promise settlement) runs to completion before
//! the next begins. Handles are `Send + Sync` so they can be moved
//! across threads, but all mutation is expected to arrive from one
//! logical thread at a time.

pub mod atom;
pub mod ecosystem;
pub mod error;
pub mod graph;

pub use atom::{
    params_hash, Action, ActiveState, AtomApi, AtomInstance, AtomParams, AtomState, AtomTemplate,
    Destructor, FactoryOutput, PromiseHandle, PromiseStatus, Settable, Store, Subscription,
    TemplateScope,
};
pub use ecosystem::{
    AtomOverride, EcosystemConfig, EcosystemEvent, Ecosystem, EdgeHandle, ErasedNode, EventAction,
    Injection, Selection,
};
pub use error::{EcosystemError, Result};
pub use graph::{EdgeFlags, NodeId, NotifyReason};
