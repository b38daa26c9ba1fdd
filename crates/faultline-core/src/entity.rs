//! Orchestrator side of one connected entity.
//!
//! A transport (RPC server, REST handler, in-process shim) owns one
//! [`TransitionEntity`] per connection and pushes the entity's events
//! through it.

use faultline_signal::{Action, Event};
use tokio::sync::mpsc;
use tracing::debug;

use crate::orchestrator::{ConnId, Inbound};

/// Id of an entity before its first event arrives.
pub const UNINITIALIZED_ENTITY: &str = "uninitialized";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EntityError {
    #[error("connection is bound to entity {bound}, got an event from {got}")]
    IdMismatch { bound: String, got: String },

    #[error("orchestrator is gone")]
    Disconnected,

    #[error("action {action_id} does not resolve event {event_id}")]
    UnexpectedAction { action_id: String, event_id: String },
}

pub struct TransitionEntity {
    conn: ConnId,
    id: String,
    to_main: mpsc::UnboundedSender<Inbound>,
    from_main: mpsc::UnboundedReceiver<Action>,
}

impl TransitionEntity {
    pub(crate) fn new(
        conn: ConnId,
        to_main: mpsc::UnboundedSender<Inbound>,
        from_main: mpsc::UnboundedReceiver<Action>,
    ) -> Self {
        Self {
            conn,
            id: UNINITIALIZED_ENTITY.to_string(),
            to_main,
            from_main,
        }
    }

    /// Entity id, or [`UNINITIALIZED_ENTITY`] until the first event.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn conn_id(&self) -> ConnId {
        self.conn
    }

    /// Report `event`. Deferred events wait for and return their resolving
    /// action; passive events return `None` right away.
    pub async fn send_event(&mut self, event: Event) -> Result<Option<Action>, EntityError> {
        if self.id == UNINITIALIZED_ENTITY {
            self.id = event.entity_id.clone();
            debug!(conn = self.conn, entity = %self.id, "bound connection");
        } else if self.id != event.entity_id {
            return Err(EntityError::IdMismatch {
                bound: self.id.clone(),
                got: event.entity_id,
            });
        }

        let deferred = event.deferred;
        let event_id = event.id.clone();
        self.to_main
            .send(Inbound::Event {
                conn: self.conn,
                event,
            })
            .map_err(|_| EntityError::Disconnected)?;
        if !deferred {
            return Ok(None);
        }

        let action = self.from_main.recv().await.ok_or(EntityError::Disconnected)?;
        let resolves = action
            .event
            .as_ref()
            .is_some_and(|resolved| resolved.id == event_id);
        if !resolves {
            return Err(EntityError::UnexpectedAction {
                action_id: action.id,
                event_id,
            });
        }
        Ok(Some(action))
    }
}

impl Drop for TransitionEntity {
    fn drop(&mut self) {
        let _ = self.to_main.send(Inbound::Disconnected { conn: self.conn });
    }
}
