//! Reproduction policy for ZOOKEEPER-2172.
//!
//! Function calls of one server (`delayedEntity`) into one function
//! (`delayedFunction`) are held back for `delayTicks` ticks while every
//! other call is released in random order. Only function call and return
//! events are accepted.

use std::sync::Arc;
use std::time::Duration;

use faultline_signal::{Event, EventKind};
use parking_lot::Mutex;
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::params::PolicyParams;
use crate::policy::{ticker, ActionSink, ExplorePolicy, PolicyContext, PolicyError};
use crate::rng::{policy_rng, DECISION_STREAM};

#[derive(Debug)]
struct Pending {
    event: Event,
    ticks: u64,
}

pub struct Zk2172Policy {
    params: PolicyParams,
    queue: Arc<Mutex<Vec<Pending>>>,
    started: bool,
}

impl Zk2172Policy {
    pub fn new(params: PolicyParams) -> Self {
        Self {
            params,
            queue: Arc::new(Mutex::new(Vec::new())),
            started: false,
        }
    }

    fn initial_ticks(&self, event: &Event) -> u64 {
        let delayed = event.entity_id == self.params.delayed_entity
            && event.param_str("name") == Some(self.params.delayed_function.as_str());
        if delayed {
            self.params.delay_ticks
        } else {
            0
        }
    }
}

impl ExplorePolicy for Zk2172Policy {
    fn name(&self) -> &'static str {
        "ZK2172"
    }

    fn init(&mut self, ctx: PolicyContext) -> Result<(), PolicyError> {
        if self.started {
            return Err(PolicyError::AlreadyInitialized(self.name()));
        }
        tokio::spawn(tick(
            Arc::clone(&self.queue),
            self.params.interval(),
            self.params.max_retries,
            policy_rng(ctx.seed, DECISION_STREAM),
            ctx.sink,
            ctx.cancel,
        ));
        self.started = true;
        info!(
            entity = %self.params.delayed_entity,
            function = %self.params.delayed_function,
            ticks = self.params.delay_ticks,
            "ZK2172 policy started"
        );
        Ok(())
    }

    fn queue_event(&self, event: Event) -> Result<(), PolicyError> {
        if !matches!(event.kind, EventKind::FuncCall | EventKind::FuncReturn) {
            return Err(PolicyError::UnsupportedEvent {
                event_id: event.id.clone(),
                kind: event.kind.to_string(),
            });
        }
        let ticks = self.initial_ticks(&event);
        if ticks > 0 {
            debug!(entity = %event.entity_id, ticks, "holding back call");
        }
        self.queue.lock().push(Pending { event, ticks });
        Ok(())
    }
}

/// Age every pending event by one tick, then try up to `max_retries`
/// random picks for one that is due.
fn pick(queue: &mut Vec<Pending>, max_retries: u32, rng: &mut ChaCha8Rng) -> Option<Event> {
    for pending in queue.iter_mut() {
        pending.ticks = pending.ticks.saturating_sub(1);
    }
    if queue.is_empty() {
        return None;
    }
    for _ in 0..max_retries {
        let idx = rng.gen_range(0..queue.len());
        if queue[idx].ticks == 0 {
            return Some(queue.remove(idx).event);
        }
    }
    None
}

async fn tick(
    queue: Arc<Mutex<Vec<Pending>>>,
    period: Duration,
    max_retries: u32,
    mut rng: ChaCha8Rng,
    sink: ActionSink,
    cancel: CancellationToken,
) {
    let mut ticker = ticker(period);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let picked = pick(&mut queue.lock(), max_retries, &mut rng);
                let Some(event) = picked else { continue };
                if !sink.forward(event.accept_action().map_err(PolicyError::from)) {
                    break;
                }
            }
        }
    }
    debug!("ZK2172 policy loop stopped");
}
