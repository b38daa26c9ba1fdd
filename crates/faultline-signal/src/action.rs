use std::fmt;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::event::{Event, Params};
use crate::SignalError;

/// What an action does to the entity that receives it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ActionKind {
    /// Release the event unchanged.
    Accept,
    /// Resolve the event by injecting a fault into its entity.
    FaultInjection,
    /// Bookkeeping only.
    Nop,
}

/// Faults an explore policy can inject.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FaultKind {
    Kill,
    Shutdown,
}

impl FaultKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FaultKind::Kill => "kill",
            FaultKind::Shutdown => "shutdown",
        }
    }
}

/// A scheduling decision that resolves one event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    pub id: String,
    pub kind: ActionKind,
    /// Entity that receives this action.
    pub entity_id: String,
    pub params: Params,
    /// Never forwarded to the entity when set.
    pub orchestrator_local: bool,
    /// The event this action resolves.
    pub event: Option<Event>,
    /// Set by the orchestrator when the action is dispatched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub triggered_at: Option<SystemTime>,
}

impl Action {
    /// Check the structural invariants every dispatched action must hold.
    pub fn validate(&self) -> Result<(), SignalError> {
        if !self.orchestrator_local && self.entity_id.is_empty() {
            return Err(SignalError::MissingEntity {
                action_id: self.id.clone(),
            });
        }
        match self.kind {
            ActionKind::Accept => {
                let event = self.event.as_ref().ok_or_else(|| SignalError::MissingEvent {
                    action_id: self.id.clone(),
                })?;
                if event.entity_id != self.entity_id {
                    return Err(SignalError::EntityMismatch {
                        action_entity: self.entity_id.clone(),
                        event_entity: event.entity_id.clone(),
                    });
                }
                if !event.deferred {
                    return Err(SignalError::NotDeferred {
                        event_id: event.id.clone(),
                    });
                }
            }
            ActionKind::FaultInjection | ActionKind::Nop => {}
        }
        Ok(())
    }

    /// The fault carried by a fault-injection action.
    pub fn fault(&self) -> Option<&str> {
        self.params.get("fault").and_then(|v| v.as_str())
    }

    pub fn is_accept(&self) -> bool {
        self.kind == ActionKind::Accept
    }

    pub fn is_fault(&self) -> bool {
        self.kind == ActionKind::FaultInjection
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Action{{type={:?}, entity={}", self.kind, self.entity_id)?;
        if let Some(fault) = self.fault() {
            write!(f, ", fault={fault}")?;
        }
        if let Some(event) = &self.event {
            write!(f, ", event={event}")?;
        }
        f.write_str("}")
    }
}
