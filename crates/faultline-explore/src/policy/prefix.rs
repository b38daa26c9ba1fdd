//! History-guided scheduling shared by BFS, DFS and DPOR.
//!
//! The policy keeps the events it has released so far (the prefix) and a
//! FIFO of queued candidates. Every `interval` a [`PrefixStrategy`] looks
//! at `prefix + candidate` for each candidate against history storage and
//! picks what to release. Strategies may also give up on guidance, at
//! which point everything queued is released and later events are
//! accepted through the dispatcher without consulting history.

use std::sync::Arc;
use std::time::Duration;

use faultline_history::{HistoryError, HistoryStorage};
use faultline_signal::Event;
use parking_lot::Mutex;
use rand_chacha::ChaCha8Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::dispatch::Dispatcher;
use crate::params::PolicyParams;
use crate::policy::{ticker, ActionSink, ExplorePolicy, PolicyContext, PolicyError};
use crate::rng::{policy_rng, DECISION_STREAM};

/// What a strategy wants done with the queued candidates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Selection {
    /// Release the candidate at this index and extend the prefix with it.
    Release(usize),
    /// Release the candidate at this index, then everything else queued,
    /// and stop consulting history.
    Diverge(usize),
    /// Release everything queued and stop consulting history.
    Flush,
}

pub trait PrefixStrategy: Default + Send + Sync + 'static {
    const NAME: &'static str;

    /// Choose among `queued` (never empty) given the released `prefix`.
    fn select(
        &self,
        storage: &dyn HistoryStorage,
        prefix: &[Event],
        queued: &[Event],
        rng: &mut ChaCha8Rng,
    ) -> Result<Selection, HistoryError>;
}

#[derive(Debug, Default)]
struct PrefixState {
    queued: Vec<Event>,
    prefix: Vec<Event>,
    dumb: bool,
}

pub struct PrefixPolicy<S> {
    strategy: Arc<S>,
    params: PolicyParams,
    state: Arc<Mutex<PrefixState>>,
    dispatcher: Option<Dispatcher>,
}

impl<S: PrefixStrategy> PrefixPolicy<S> {
    pub fn new(params: PolicyParams) -> Self {
        Self {
            strategy: Arc::new(S::default()),
            params,
            state: Arc::new(Mutex::new(PrefixState::default())),
            dispatcher: None,
        }
    }

    /// True once the policy stopped consulting history.
    pub fn is_dumb(&self) -> bool {
        self.state.lock().dumb
    }

    /// Number of events released under history guidance.
    pub fn prefix_len(&self) -> usize {
        self.state.lock().prefix.len()
    }
}

impl<S: PrefixStrategy> ExplorePolicy for PrefixPolicy<S> {
    fn name(&self) -> &'static str {
        S::NAME
    }

    fn init(&mut self, ctx: PolicyContext) -> Result<(), PolicyError> {
        if self.dispatcher.is_some() {
            return Err(PolicyError::AlreadyInitialized(S::NAME));
        }
        self.dispatcher = Some(Dispatcher::from_params(
            &self.params,
            ctx.sink.clone(),
            ctx.cancel.clone(),
        ));
        tokio::spawn(decide(
            Arc::clone(&self.strategy),
            Arc::clone(&self.state),
            ctx.storage,
            self.params.interval(),
            policy_rng(ctx.seed, DECISION_STREAM),
            ctx.sink,
            ctx.cancel,
        ));
        info!(
            policy = S::NAME,
            interval_ms = self.params.interval,
            "history-guided policy started"
        );
        Ok(())
    }

    fn queue_event(&self, event: Event) -> Result<(), PolicyError> {
        let dispatcher = self
            .dispatcher
            .as_ref()
            .ok_or(PolicyError::NotInitialized(S::NAME))?;
        let mut state = self.state.lock();
        if state.dumb {
            drop(state);
            return dispatcher.submit(event);
        }
        state.queued.push(event);
        Ok(())
    }
}

struct Step {
    released: Vec<Event>,
    dumb: bool,
}

/// Queue and prefix as they stood when a tick began.
struct Snapshot {
    prefix: Vec<Event>,
    queued: Vec<Event>,
}

fn snapshot(state: &Mutex<PrefixState>) -> Option<Snapshot> {
    let state = state.lock();
    if state.dumb || state.queued.is_empty() {
        return None;
    }
    Some(Snapshot {
        prefix: state.prefix.clone(),
        queued: state.queued.clone(),
    })
}

/// Apply a selection made against a snapshot. Only the decision loop
/// removes from the queue, so snapshot indices still point at the same
/// events; anything queued since sits behind them.
fn apply(state: &Mutex<PrefixState>, selection: Selection) -> Step {
    let mut state = state.lock();
    match selection {
        Selection::Release(idx) => {
            let event = state.queued.remove(idx);
            state.prefix.push(event.clone());
            Step {
                released: vec![event],
                dumb: false,
            }
        }
        Selection::Diverge(idx) => {
            let mut released = vec![state.queued.remove(idx)];
            released.append(&mut state.queued);
            state.dumb = true;
            Step {
                released,
                dumb: true,
            }
        }
        Selection::Flush => {
            let released = std::mem::take(&mut state.queued);
            state.dumb = true;
            Step {
                released,
                dumb: true,
            }
        }
    }
}

async fn decide<S: PrefixStrategy>(
    strategy: Arc<S>,
    state: Arc<Mutex<PrefixState>>,
    storage: Arc<dyn HistoryStorage>,
    period: Duration,
    mut rng: ChaCha8Rng,
    sink: ActionSink,
    cancel: CancellationToken,
) {
    let mut ticker = ticker(period);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let Some(snapshot) = snapshot(&state) else {
            continue;
        };

        // Backends may read from disk. Search off the runtime and without
        // holding the queue lock.
        let search = tokio::task::spawn_blocking({
            let strategy = Arc::clone(&strategy);
            let storage = Arc::clone(&storage);
            move || {
                let selection = strategy.select(
                    storage.as_ref(),
                    &snapshot.prefix,
                    &snapshot.queued,
                    &mut rng,
                );
                (selection, rng, snapshot.queued.len())
            }
        });
        let joined = tokio::select! {
            _ = cancel.cancelled() => break,
            joined = search => joined,
        };
        let (selection, queued) = match joined {
            Ok((selection, returned, queued)) => {
                rng = returned;
                (selection, queued)
            }
            Err(err) => {
                error!(policy = S::NAME, error = %err, "history search task died");
                let _ = sink.fail(PolicyError::Shutdown);
                break;
            }
        };
        let selection = match selection {
            Ok(selection) => selection,
            Err(err) => {
                error!(policy = S::NAME, error = %err, "history search failed");
                let _ = sink.fail(err.into());
                break;
            }
        };
        debug!(policy = S::NAME, ?selection, queued, "selected");

        let step = apply(&state, selection);
        for event in &step.released {
            if !sink.forward(event.accept_action().map_err(PolicyError::from)) {
                return;
            }
        }
        if step.dumb {
            info!(
                policy = S::NAME,
                released = step.released.len(),
                "history exhausted, accepting remaining events directly"
            );
            break;
        }
    }
    debug!(policy = S::NAME, "decision loop stopped");
}
