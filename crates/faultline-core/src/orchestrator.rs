//! The orchestrator run loop.
//!
//! One loop owns the entity table, the explore policy and the realized
//! action sequence. It has two states:
//!
//! - **Running**: deferred events go to the policy, passive events are
//!   resolved on the spot, and every decided action is recorded and
//!   forwarded to its entity.
//! - **Draining**: entered when the run ends. Events are accepted without
//!   consulting the policy and nothing is recorded. The loop returns once
//!   every entity disconnected or the handle terminates it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use faultline_explore::{Policy, PolicyError};
use faultline_signal::{Action, Event, SignalError, Trace};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::entity::TransitionEntity;

/// Key of one entity connection.
pub type ConnId = u64;

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Policy(#[from] PolicyError),

    #[error(transparent)]
    Signal(#[from] SignalError),

    #[error("action targets unknown entity {0}")]
    UnknownEntity(String),

    #[error("entity {0} is already connected")]
    DuplicateEntity(String),

    #[error("connection {conn} is bound to {bound}, got an event from {got}")]
    IdMismatch {
        conn: ConnId,
        bound: String,
        got: String,
    },

    #[error("event from unregistered connection {0}")]
    UnknownConnection(ConnId),

    #[error("run already ended")]
    AlreadyDraining,

    #[error("orchestrator stopped")]
    Stopped,
}

/// Messages from entities to the loop, in per-connection order.
pub(crate) enum Inbound {
    Connected {
        conn: ConnId,
        actions: mpsc::UnboundedSender<Action>,
    },
    Event {
        conn: ConnId,
        event: Event,
    },
    Disconnected {
        conn: ConnId,
    },
    EndRun {
        reply: oneshot::Sender<Result<Trace, OrchestratorError>>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunState {
    Running,
    Draining,
}

struct Connection {
    entity: Option<String>,
    actions: mpsc::UnboundedSender<Action>,
}

/// Cloneable control surface of a running orchestrator.
///
/// Requests share the entities' inbox, so an `end_run` issued after an
/// event was sent always sees that event.
#[derive(Clone)]
pub struct OrchestratorHandle {
    inbox: mpsc::UnboundedSender<Inbound>,
    next_conn: Arc<AtomicU64>,
    terminate: CancellationToken,
}

impl OrchestratorHandle {
    /// Open a new entity connection.
    pub fn connect_entity(&self) -> TransitionEntity {
        let conn = self.next_conn.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        // A closed inbox surfaces as Disconnected on the entity's first event.
        let _ = self.inbox.send(Inbound::Connected { conn, actions: tx });
        TransitionEntity::new(conn, self.inbox.clone(), rx)
    }

    /// End the run: switch the loop to draining and return the trace.
    pub async fn end_run(&self) -> Result<Trace, OrchestratorError> {
        let (tx, rx) = oneshot::channel();
        self.inbox
            .send(Inbound::EndRun { reply: tx })
            .map_err(|_| OrchestratorError::Stopped)?;
        rx.await.map_err(|_| OrchestratorError::Stopped)?
    }

    /// Stop the loop regardless of state.
    pub fn terminate(&self) {
        self.terminate.cancel();
    }
}

pub struct Orchestrator {
    policy: Policy,
    inbox: mpsc::UnboundedReceiver<Inbound>,
    terminate: CancellationToken,
    connections: HashMap<ConnId, Connection>,
    /// Every entity id ever bound, to tell "gone" apart from "never seen".
    entities: HashMap<String, ConnId>,
    actions: Vec<Action>,
    state: RunState,
}

impl Orchestrator {
    /// `policy` must already be initialized.
    pub fn new(policy: Policy) -> (Self, OrchestratorHandle) {
        let (inbox_tx, inbox) = mpsc::unbounded_channel();
        let terminate = CancellationToken::new();
        let handle = OrchestratorHandle {
            inbox: inbox_tx,
            next_conn: Arc::new(AtomicU64::new(0)),
            terminate: terminate.clone(),
        };
        let orchestrator = Self {
            policy,
            inbox,
            terminate,
            connections: HashMap::new(),
            entities: HashMap::new(),
            actions: Vec::new(),
            state: RunState::Running,
        };
        (orchestrator, handle)
    }

    /// Serve the loop until termination, the end of draining, or a fatal
    /// error. The policy is shut down on return.
    pub async fn run(mut self) -> Result<(), OrchestratorError> {
        info!(policy = self.policy.name(), "orchestrator started");
        let result = self.serve().await;
        self.policy.shutdown();
        match &result {
            Ok(()) => info!(connected = self.connections.len(), "orchestrator stopped"),
            Err(err) => warn!(error = %err, "orchestrator failed"),
        }
        result
    }

    async fn serve(&mut self) -> Result<(), OrchestratorError> {
        loop {
            match self.state {
                RunState::Running => self.serve_running().await?,
                RunState::Draining => {
                    if self.connections.is_empty() {
                        debug!("every entity disconnected");
                        return Ok(());
                    }
                    self.serve_draining().await?;
                }
            }
            if self.terminate.is_cancelled() {
                return Ok(());
            }
        }
    }

    async fn serve_running(&mut self) -> Result<(), OrchestratorError> {
        tokio::select! {
            _ = self.terminate.cancelled() => {}
            msg = self.inbox.recv() => match msg {
                Some(msg) => self.handle_inbound(msg)?,
                None => self.terminate.cancel(),
            },
            decision = self.policy.next_action() => self.record(decision?)?,
        }
        Ok(())
    }

    async fn serve_draining(&mut self) -> Result<(), OrchestratorError> {
        tokio::select! {
            _ = self.terminate.cancelled() => {}
            msg = self.inbox.recv() => match msg {
                Some(msg) => self.handle_inbound(msg)?,
                None => self.terminate.cancel(),
            },
            decision = self.policy.next_action() => match decision {
                Ok(action) => self.forward(&action),
                Err(err) => debug!(error = %err, "ignoring policy error while draining"),
            },
        }
        Ok(())
    }

    fn handle_inbound(&mut self, msg: Inbound) -> Result<(), OrchestratorError> {
        match msg {
            Inbound::Connected { conn, actions } => {
                debug!(conn, "entity connected");
                self.connections.insert(
                    conn,
                    Connection {
                        entity: None,
                        actions,
                    },
                );
            }
            Inbound::Disconnected { conn } => {
                if let Some(connection) = self.connections.remove(&conn) {
                    info!(conn, entity = ?connection.entity, "entity disconnected");
                }
            }
            Inbound::Event { conn, event } => self.handle_event(conn, event)?,
            Inbound::EndRun { reply } => {
                let result = match self.state {
                    RunState::Running => {
                        let trace = Trace::new(std::mem::take(&mut self.actions));
                        info!(actions = trace.len(), "run ended, draining");
                        self.state = RunState::Draining;
                        Ok(trace)
                    }
                    RunState::Draining => Err(OrchestratorError::AlreadyDraining),
                };
                let _ = reply.send(result);
            }
        }
        Ok(())
    }

    fn handle_event(&mut self, conn: ConnId, event: Event) -> Result<(), OrchestratorError> {
        self.bind(conn, &event.entity_id)?;
        match self.state {
            RunState::Running if event.deferred => {
                self.policy.queue_event(event)?;
            }
            RunState::Running => {
                let action = event.default_action()?;
                self.record(action)?;
            }
            RunState::Draining => {
                debug!(%event, "auto-accepting while draining");
                let action = event.default_action()?;
                if !action.orchestrator_local {
                    self.forward(&action);
                }
            }
        }
        Ok(())
    }

    fn bind(&mut self, conn: ConnId, entity: &str) -> Result<(), OrchestratorError> {
        let bound = self
            .connections
            .get(&conn)
            .ok_or(OrchestratorError::UnknownConnection(conn))?
            .entity
            .clone();
        match bound {
            Some(bound) if bound == entity => Ok(()),
            Some(bound) => Err(OrchestratorError::IdMismatch {
                conn,
                bound,
                got: entity.to_string(),
            }),
            None => {
                if let Some(other) = self.entities.get(entity) {
                    if *other != conn && self.connections.contains_key(other) {
                        return Err(OrchestratorError::DuplicateEntity(entity.to_string()));
                    }
                }
                if let Some(connection) = self.connections.get_mut(&conn) {
                    connection.entity = Some(entity.to_string());
                }
                self.entities.insert(entity.to_string(), conn);
                info!(conn, entity, "entity registered");
                Ok(())
            }
        }
    }

    /// Validate, stamp, record and forward a decided action.
    fn record(&mut self, mut action: Action) -> Result<(), OrchestratorError> {
        action.validate()?;
        if !action.orchestrator_local && !self.entities.contains_key(&action.entity_id) {
            return Err(OrchestratorError::UnknownEntity(action.entity_id));
        }
        action.triggered_at = Some(SystemTime::now());
        debug!(%action, "dispatching");
        if !action.orchestrator_local {
            self.forward(&action);
        }
        self.actions.push(action);
        Ok(())
    }

    fn forward(&self, action: &Action) {
        let target = self
            .entities
            .get(&action.entity_id)
            .and_then(|conn| self.connections.get(conn));
        match target {
            Some(connection) => {
                if connection.actions.send(action.clone()).is_err() {
                    warn!(entity = %action.entity_id, "entity dropped before its action arrived");
                }
            }
            None => warn!(entity = %action.entity_id, "target entity disconnected, skipping action"),
        }
    }
}
