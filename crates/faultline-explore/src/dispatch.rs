//! Bounded dispatcher pool.
//!
//! Events that need no decision (dumb mode, etcd responses) are converted
//! to their default action by a fixed set of worker tasks draining one
//! bounded queue. Submission never waits: a full queue is reported to the
//! caller as [`PolicyError::Saturated`].

use std::sync::Arc;

use faultline_signal::Event;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::params::PolicyParams;
use crate::policy::{ActionSink, PolicyError};

#[derive(Debug, Clone)]
pub struct Dispatcher {
    tx: mpsc::Sender<Event>,
    workers: usize,
}

impl Dispatcher {
    /// Spawn `workers` tasks draining a queue of `capacity` events.
    pub fn spawn(workers: usize, capacity: usize, sink: ActionSink, cancel: CancellationToken) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let rx = Arc::new(Mutex::new(rx));
        for worker in 0..workers.max(1) {
            tokio::spawn(work(worker, Arc::clone(&rx), sink.clone(), cancel.clone()));
        }
        debug!(workers, capacity, "dispatcher pool started");
        Self { tx, workers }
    }

    pub fn from_params(params: &PolicyParams, sink: ActionSink, cancel: CancellationToken) -> Self {
        Self::spawn(
            params.dispatcher_workers,
            params.dispatcher_capacity,
            sink,
            cancel,
        )
    }

    pub fn submit(&self, event: Event) -> Result<(), PolicyError> {
        match self.tx.try_send(event) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(event)) => {
                warn!(entity = %event.entity_id, "dispatcher saturated");
                Err(PolicyError::Saturated)
            }
            Err(TrySendError::Closed(_)) => Err(PolicyError::Shutdown),
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }
}

async fn work(
    worker: usize,
    queue: Arc<Mutex<mpsc::Receiver<Event>>>,
    sink: ActionSink,
    cancel: CancellationToken,
) {
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break,
            next = async { queue.lock().await.recv().await } => next,
        };
        let Some(event) = next else { break };
        if !sink.forward(event.default_action().map_err(PolicyError::from)) {
            break;
        }
    }
    debug!(worker, "dispatcher worker stopped");
}
