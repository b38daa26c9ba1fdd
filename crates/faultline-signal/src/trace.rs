use serde::{Deserialize, Serialize};

use crate::action::Action;
use crate::event::Event;

/// The realized sequence of actions for one complete run.
///
/// Built once by the orchestrator at end-of-run and never modified after.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Trace {
    actions: Vec<Action>,
}

impl Trace {
    pub fn new(actions: Vec<Action>) -> Self {
        Self { actions }
    }

    pub fn actions(&self) -> &[Action] {
        &self.actions
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Events released by scheduling decisions, in order.
    ///
    /// Orchestrator-local bookkeeping actions are skipped; this is the
    /// sequence that history prefix search compares against.
    pub fn decided_events(&self) -> Vec<Event> {
        self.actions
            .iter()
            .filter(|a| !a.orchestrator_local)
            .filter_map(|a| a.event.clone())
            .collect()
    }
}

impl From<Vec<Action>> for Trace {
    fn from(actions: Vec<Action>) -> Self {
        Self::new(actions)
    }
}
