//! Random scheduling with an optional priority entity and fault injection.
//!
//! Events of the `prioritize` entity go to a high tier, everything else to
//! a low tier. Every `interval` one event is drawn uniformly from the high
//! tier if it has any, otherwise from the low tier. With `timeBound` the
//! tiers are bypassed and each event is released after a random delay in
//! `[0, maxBound]`.

use std::sync::Arc;
use std::time::Duration;

use faultline_signal::Event;
use parking_lot::Mutex;
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::params::{FaultRates, PolicyParams};
use crate::policy::{
    release_delayed, resolve, ticker, ActionSink, ExplorePolicy, PolicyContext, PolicyError,
};
use crate::queue::{QueueHandle, TimeBoundedItem, TimeBoundedQueue};
use crate::rng::{policy_rng, DECISION_STREAM, DELAY_STREAM};

#[derive(Debug, Default)]
struct Tiers {
    high: Vec<Event>,
    low: Vec<Event>,
}

impl Tiers {
    fn pick(&mut self, rng: &mut ChaCha8Rng) -> Option<Event> {
        let tier = if !self.high.is_empty() {
            &mut self.high
        } else if !self.low.is_empty() {
            &mut self.low
        } else {
            return None;
        };
        let idx = rng.gen_range(0..tier.len());
        Some(tier.remove(idx))
    }
}

pub struct RandomPolicy {
    params: PolicyParams,
    tiers: Arc<Mutex<Tiers>>,
    delayed: Option<QueueHandle<Event>>,
    started: bool,
}

impl RandomPolicy {
    pub fn new(params: PolicyParams) -> Self {
        Self {
            params,
            tiers: Arc::new(Mutex::new(Tiers::default())),
            delayed: None,
            started: false,
        }
    }

    /// Events waiting in the tiers.
    pub fn pending(&self) -> usize {
        let tiers = self.tiers.lock();
        tiers.high.len() + tiers.low.len()
    }
}

impl ExplorePolicy for RandomPolicy {
    fn name(&self) -> &'static str {
        "random"
    }

    fn init(&mut self, ctx: PolicyContext) -> Result<(), PolicyError> {
        if self.started {
            return Err(PolicyError::AlreadyInitialized(self.name()));
        }
        let faults = self.params.fault_rates();
        let rng = policy_rng(ctx.seed, DECISION_STREAM);

        if self.params.time_bound {
            let queue = TimeBoundedQueue::with_cancel(
                policy_rng(ctx.seed, DELAY_STREAM),
                ctx.cancel.child_token(),
            );
            self.delayed = Some(queue.handle());
            tokio::spawn(release_delayed(queue, faults, rng, ctx.sink, ctx.cancel));
            info!(max_bound_ms = self.params.max_bound, "random policy in time-bound mode");
        } else {
            tokio::spawn(tick(
                Arc::clone(&self.tiers),
                self.params.interval(),
                faults,
                rng,
                ctx.sink,
                ctx.cancel,
            ));
            info!(
                interval_ms = self.params.interval,
                prioritize = ?self.params.prioritize,
                "random policy started"
            );
        }
        self.started = true;
        Ok(())
    }

    fn queue_event(&self, event: Event) -> Result<(), PolicyError> {
        if let Some(delayed) = &self.delayed {
            let item = TimeBoundedItem::new(event, Duration::ZERO, self.params.max_bound())?;
            delayed.enqueue(item)?;
            return Ok(());
        }
        let mut tiers = self.tiers.lock();
        if self.params.prioritize.as_deref() == Some(event.entity_id.as_str()) {
            tiers.high.push(event);
        } else {
            tiers.low.push(event);
        }
        Ok(())
    }
}

async fn tick(
    tiers: Arc<Mutex<Tiers>>,
    period: Duration,
    faults: FaultRates,
    mut rng: ChaCha8Rng,
    sink: ActionSink,
    cancel: CancellationToken,
) {
    let mut ticker = ticker(period);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let picked = tiers.lock().pick(&mut rng);
                let Some(event) = picked else { continue };
                if !sink.forward(resolve(&event, &faults, &mut rng)) {
                    break;
                }
            }
        }
    }
    debug!("random policy loop stopped");
}
