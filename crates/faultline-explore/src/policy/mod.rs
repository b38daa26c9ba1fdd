//! Explore policy abstraction and registry.
//!
//! A policy is created by name from a raw parameter object, initialized
//! once with a history storage handle, and then fed deferred events. Its
//! decisions come back through [`Policy::next_action`]. Background tasks
//! belong to the policy's cancellation token and stop on
//! [`Policy::shutdown`] or drop.

pub mod bfs;
pub mod dfs;
pub mod dpor;
pub mod dumb;
pub mod etcd;
pub mod prefix;
pub mod random;
pub mod zk2172;

use std::sync::Arc;
use std::time::Duration;

use faultline_history::{HistoryError, HistoryStorage};
use faultline_signal::{Action, Event, SignalError};
use rand::Rng;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::params::{FaultRates, ParamError, PolicyParams};
use crate::queue::{QueueError, TimeBoundedQueue};

pub use bfs::{Bfs, BfsPolicy};
pub use dfs::{Dfs, DfsPolicy};
pub use dpor::{reduce_partial_order, Dpor, DporPolicy};
pub use dumb::DumbPolicy;
pub use etcd::{EtcdPolicy, EtcdRequest};
pub use prefix::{PrefixPolicy, PrefixStrategy, Selection};
pub use random::RandomPolicy;
pub use zk2172::Zk2172Policy;

/// Names accepted by [`Policy::create`].
pub const POLICY_NAMES: [&str; 7] = ["dumb", "random", "BFS", "DFS", "DPOR", "etcd", "ZK2172"];

#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    #[error("unknown explore policy: {0}")]
    UnknownPolicy(String),

    #[error(transparent)]
    InvalidParam(#[from] ParamError),

    #[error("policy {0} is already initialized")]
    AlreadyInitialized(&'static str),

    #[error("policy {0} is not initialized")]
    NotInitialized(&'static str),

    #[error("dispatcher queue is full")]
    Saturated,

    #[error("policy has shut down")]
    Shutdown,

    #[error("malformed event {event_id}: {reason}")]
    MalformedEvent { event_id: String, reason: String },

    #[error("unsupported event type {kind} for event {event_id}")]
    UnsupportedEvent { event_id: String, kind: String },

    #[error("history lookup failed: {0}")]
    History(#[from] HistoryError),

    #[error(transparent)]
    Signal(#[from] SignalError),

    #[error(transparent)]
    Queue(#[from] QueueError),
}

/// A decided action, or the error that stopped a policy loop.
pub type Decision = Result<Action, PolicyError>;

/// Sending side of a policy's decision channel.
#[derive(Debug, Clone)]
pub struct ActionSink {
    tx: mpsc::UnboundedSender<Decision>,
}

impl ActionSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Decision>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn send(&self, action: Action) -> Result<(), PolicyError> {
        self.tx.send(Ok(action)).map_err(|_| PolicyError::Shutdown)
    }

    /// Report an error that ends the policy's decisions for this run.
    pub fn fail(&self, err: PolicyError) -> Result<(), PolicyError> {
        self.tx.send(Err(err)).map_err(|_| PolicyError::Shutdown)
    }

    /// Forward a decision. Returns false once nobody is listening.
    pub(crate) fn forward(&self, decision: Decision) -> bool {
        self.tx.send(decision).is_ok()
    }
}

/// Everything a policy gets at init time.
#[derive(Clone)]
pub struct PolicyContext {
    pub storage: Arc<dyn HistoryStorage>,
    pub sink: ActionSink,
    pub cancel: CancellationToken,
    pub seed: u64,
}

/// Capability interface shared by all explore policies.
pub trait ExplorePolicy: Send + Sync {
    fn name(&self) -> &'static str;

    /// One-time setup. Starts the policy's background tasks, so it must be
    /// called from within a tokio runtime.
    fn init(&mut self, ctx: PolicyContext) -> Result<(), PolicyError>;

    /// Hand a deferred event to the policy. Never blocks.
    fn queue_event(&self, event: Event) -> Result<(), PolicyError>;
}

/// Closed set of policies.
pub enum PolicyKind {
    Dumb(DumbPolicy),
    Random(RandomPolicy),
    Bfs(BfsPolicy),
    Dfs(DfsPolicy),
    Dpor(DporPolicy),
    Etcd(EtcdPolicy),
    Zk2172(Zk2172Policy),
}

impl PolicyKind {
    pub fn from_name(name: &str, params: PolicyParams) -> Result<Self, PolicyError> {
        let kind = match name {
            "dumb" => PolicyKind::Dumb(DumbPolicy::new(params)),
            "random" => PolicyKind::Random(RandomPolicy::new(params)),
            "BFS" => PolicyKind::Bfs(BfsPolicy::new(params)),
            "DFS" => PolicyKind::Dfs(DfsPolicy::new(params)),
            "DPOR" => PolicyKind::Dpor(DporPolicy::new(params)),
            "etcd" => PolicyKind::Etcd(EtcdPolicy::new(params)),
            "ZK2172" => PolicyKind::Zk2172(Zk2172Policy::new(params)),
            other => return Err(PolicyError::UnknownPolicy(other.to_string())),
        };
        Ok(kind)
    }

    fn as_policy(&self) -> &dyn ExplorePolicy {
        match self {
            PolicyKind::Dumb(p) => p,
            PolicyKind::Random(p) => p,
            PolicyKind::Bfs(p) => p,
            PolicyKind::Dfs(p) => p,
            PolicyKind::Dpor(p) => p,
            PolicyKind::Etcd(p) => p,
            PolicyKind::Zk2172(p) => p,
        }
    }

    fn as_policy_mut(&mut self) -> &mut dyn ExplorePolicy {
        match self {
            PolicyKind::Dumb(p) => p,
            PolicyKind::Random(p) => p,
            PolicyKind::Bfs(p) => p,
            PolicyKind::Dfs(p) => p,
            PolicyKind::Dpor(p) => p,
            PolicyKind::Etcd(p) => p,
            PolicyKind::Zk2172(p) => p,
        }
    }
}

/// A policy together with its decision channel and cancellation token.
pub struct Policy {
    kind: PolicyKind,
    seed: u64,
    sink: ActionSink,
    decisions: mpsc::UnboundedReceiver<Decision>,
    cancel: CancellationToken,
    initialized: bool,
}

impl Policy {
    /// Look up a policy by name and validate its parameters.
    pub fn create(name: &str, raw_params: &serde_json::Value, seed: u64) -> Result<Self, PolicyError> {
        let params = PolicyParams::from_value(raw_params)?;
        let kind = PolicyKind::from_name(name, params)?;
        let (sink, decisions) = ActionSink::channel();
        Ok(Self {
            kind,
            seed,
            sink,
            decisions,
            cancel: CancellationToken::new(),
            initialized: false,
        })
    }

    pub fn name(&self) -> &'static str {
        self.kind.as_policy().name()
    }

    pub fn kind(&self) -> &PolicyKind {
        &self.kind
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn init(&mut self, storage: Arc<dyn HistoryStorage>) -> Result<(), PolicyError> {
        if self.initialized {
            return Err(PolicyError::AlreadyInitialized(self.name()));
        }
        let ctx = PolicyContext {
            storage,
            sink: self.sink.clone(),
            cancel: self.cancel.clone(),
            seed: self.seed,
        };
        self.kind.as_policy_mut().init(ctx)?;
        self.initialized = true;
        info!(policy = self.name(), seed = self.seed, "explore policy initialized");
        Ok(())
    }

    pub fn queue_event(&self, event: Event) -> Result<(), PolicyError> {
        if !self.initialized {
            return Err(PolicyError::NotInitialized(self.name()));
        }
        if !event.deferred {
            return Err(SignalError::NotDeferred { event_id: event.id }.into());
        }
        debug!(policy = self.name(), %event, "queued event");
        self.kind.as_policy().queue_event(event)
    }

    /// Next decided action. Cancel-safe.
    pub async fn next_action(&mut self) -> Result<Action, PolicyError> {
        match self.decisions.recv().await {
            Some(decision) => decision,
            None => Err(PolicyError::Shutdown),
        }
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Stop every background task of this policy.
    pub fn shutdown(&self) {
        if !self.cancel.is_cancelled() {
            debug!(policy = self.name(), "shutting down explore policy");
            self.cancel.cancel();
        }
    }
}

impl Drop for Policy {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Build the action resolving `event`, consulting the fault rates first.
pub(crate) fn resolve<R: Rng + ?Sized>(event: &Event, faults: &FaultRates, rng: &mut R) -> Decision {
    let action = match faults.decide(&event.entity_id, rng) {
        Some(fault) => {
            info!(entity = %event.entity_id, fault = fault.as_str(), "injecting fault");
            event.fault_action(fault)?
        }
        None => event.accept_action()?,
    };
    Ok(action)
}

/// Ticks every `period`, the first one a full period from now.
pub(crate) fn ticker(period: Duration) -> Interval {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker
}

/// Resolve events as they leave a time-bounded queue.
pub(crate) async fn release_delayed<R: Rng + Send>(
    mut queue: TimeBoundedQueue<Event>,
    faults: FaultRates,
    mut rng: R,
    sink: ActionSink,
    cancel: CancellationToken,
) {
    loop {
        let item = tokio::select! {
            _ = cancel.cancelled() => break,
            item = queue.dequeue() => item,
        };
        let Some(item) = item else { break };
        let event = item.into_value();
        if !sink.forward(resolve(&event, &faults, &mut rng)) {
            break;
        }
    }
    debug!("delayed release loop stopped");
}
