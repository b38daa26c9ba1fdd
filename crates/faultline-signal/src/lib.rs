//! Signals exchanged between entities under test and the orchestrator.
//!
//! An [`event::Event`] is reported by an entity; an [`action::Action`]
//! resolves it. The realized sequence of actions for one run is a
//! [`trace::Trace`].

pub mod action;
pub mod event;
pub mod trace;

pub use action::{Action, ActionKind, FaultKind};
pub use event::{events_match, Event, EventKind, NamedParam, Params, RuntimeInfo, StackFrame};
pub use trace::Trace;

/// Errors raised while building or validating signals.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SignalError {
    #[error("cannot accept non-deferred event {event_id}")]
    NotDeferred { event_id: String },

    #[error("action {action_id} does not carry the event it resolves")]
    MissingEvent { action_id: String },

    #[error("action {action_id} targets no entity")]
    MissingEntity { action_id: String },

    #[error("action targets entity {action_entity} but its event belongs to {event_entity}")]
    EntityMismatch {
        action_entity: String,
        event_entity: String,
    },
}

pub(crate) fn new_signal_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
