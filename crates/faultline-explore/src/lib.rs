//! Explore policies and the machinery they share.
//!
//! A policy receives deferred events from the orchestrator and decides, in
//! its own time, which one to release next and how. Decisions flow back
//! through a single action channel owned by [`policy::Policy`].

pub mod dispatch;
pub mod params;
pub mod policy;
pub mod queue;
pub mod rng;

pub use dispatch::Dispatcher;
pub use params::{FaultRates, ParamError, PolicyParams};
pub use policy::{
    reduce_partial_order, ActionSink, ExplorePolicy, Policy, PolicyContext, PolicyError,
    PolicyKind, POLICY_NAMES,
};
pub use queue::{QueueError, QueueHandle, TimeBoundedItem, TimeBoundedQueue};
