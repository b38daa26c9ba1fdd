//! Time-bounded delivery queue.
//!
//! Items carry a delay window `[min, max]`. A dedicated driver task holds
//! each item until its window elapses, then hands it to the dequeue side:
//!
//! - Fixed windows (`min == max`) go through a FIFO stage. They leave in
//!   enqueue order, each no earlier than its own deadline, so a long delay
//!   at the head holds back shorter ones behind it.
//! - Other windows draw a delay uniformly in `[min, max]` and get an
//!   independent deadline. No relative order is guaranteed.
//!
//! The driver stops when the queue is dropped or its cancellation token
//! fires.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, VecDeque};
use std::time::Duration;

use rand::Rng;
use rand_chacha::ChaCha8Rng;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("invalid delay window: min {min:?} exceeds max {max:?}")]
    InvalidWindow { min: Duration, max: Duration },

    #[error("time-bounded queue is closed")]
    Closed,
}

/// A value waiting for its delay window to elapse.
#[derive(Debug)]
pub struct TimeBoundedItem<T> {
    value: T,
    enqueued_at: Option<Instant>,
    min_duration: Duration,
    max_duration: Duration,
}

impl<T> TimeBoundedItem<T> {
    pub fn new(value: T, min: Duration, max: Duration) -> Result<Self, QueueError> {
        if min > max {
            return Err(QueueError::InvalidWindow { min, max });
        }
        Ok(Self {
            value,
            enqueued_at: None,
            min_duration: min,
            max_duration: max,
        })
    }

    pub fn value(&self) -> &T {
        &self.value
    }

    pub fn into_value(self) -> T {
        self.value
    }

    /// Set when the item enters a queue.
    pub fn enqueued_at(&self) -> Option<Instant> {
        self.enqueued_at
    }

    pub fn min_duration(&self) -> Duration {
        self.min_duration
    }

    pub fn max_duration(&self) -> Duration {
        self.max_duration
    }

    pub fn is_fixed(&self) -> bool {
        self.min_duration == self.max_duration
    }
}

/// Cloneable enqueue side of a [`TimeBoundedQueue`].
pub struct QueueHandle<T> {
    tx: mpsc::UnboundedSender<TimeBoundedItem<T>>,
}

impl<T> Clone for QueueHandle<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<T> QueueHandle<T> {
    /// Stamp `enqueued_at` and hand the item to the driver. Never blocks.
    pub fn enqueue(&self, mut item: TimeBoundedItem<T>) -> Result<(), QueueError> {
        if item.min_duration > item.max_duration {
            return Err(QueueError::InvalidWindow {
                min: item.min_duration,
                max: item.max_duration,
            });
        }
        item.enqueued_at = Some(Instant::now());
        self.tx.send(item).map_err(|_| QueueError::Closed)
    }
}

pub struct TimeBoundedQueue<T> {
    handle: QueueHandle<T>,
    output: mpsc::UnboundedReceiver<TimeBoundedItem<T>>,
    cancel: CancellationToken,
}

impl<T: Send + 'static> TimeBoundedQueue<T> {
    /// Spawn the driver task on the current tokio runtime.
    pub fn new(rng: ChaCha8Rng) -> Self {
        Self::with_cancel(rng, CancellationToken::new())
    }

    /// Like [`TimeBoundedQueue::new`], stopping the driver when `cancel` fires.
    pub fn with_cancel(rng: ChaCha8Rng, cancel: CancellationToken) -> Self {
        let (tx, input) = mpsc::unbounded_channel();
        let (out_tx, output) = mpsc::unbounded_channel();
        tokio::spawn(drive(input, out_tx, rng, cancel.clone()));
        Self {
            handle: QueueHandle { tx },
            output,
            cancel,
        }
    }
}

impl<T> TimeBoundedQueue<T> {
    pub fn handle(&self) -> QueueHandle<T> {
        self.handle.clone()
    }

    pub fn enqueue(&self, item: TimeBoundedItem<T>) -> Result<(), QueueError> {
        self.handle.enqueue(item)
    }

    /// Next item whose window has elapsed. `None` once the driver stopped.
    pub async fn dequeue(&mut self) -> Option<TimeBoundedItem<T>> {
        self.output.recv().await
    }
}

impl<T> Drop for TimeBoundedQueue<T> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct Scheduled<T> {
    deadline: Instant,
    seq: u64,
    item: TimeBoundedItem<T>,
}

impl<T> PartialEq for Scheduled<T> {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl<T> Eq for Scheduled<T> {}

impl<T> PartialOrd for Scheduled<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Scheduled<T> {
    // Reversed: BinaryHeap is a max-heap and the earliest deadline must pop first.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

fn draw_delay<T>(rng: &mut ChaCha8Rng, item: &TimeBoundedItem<T>) -> Duration {
    let (min, max) = (item.min_duration, item.max_duration);
    let delay = rng.gen_range(min..=max);
    assert!(
        delay >= min && delay <= max,
        "drawn delay {delay:?} outside window [{min:?}, {max:?}]"
    );
    delay
}

fn next_deadline<T>(
    fixed: &VecDeque<(Instant, TimeBoundedItem<T>)>,
    timed: &BinaryHeap<Scheduled<T>>,
) -> Option<Instant> {
    let head = fixed.front().map(|(deadline, _)| *deadline);
    let earliest = timed.peek().map(|s| s.deadline);
    match (head, earliest) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

/// Send every due item. Returns false once the dequeue side is gone.
fn release_due<T>(
    fixed: &mut VecDeque<(Instant, TimeBoundedItem<T>)>,
    timed: &mut BinaryHeap<Scheduled<T>>,
    output: &mpsc::UnboundedSender<TimeBoundedItem<T>>,
) -> bool {
    let now = Instant::now();
    while fixed.front().is_some_and(|(deadline, _)| *deadline <= now) {
        if let Some((_, item)) = fixed.pop_front() {
            if output.send(item).is_err() {
                return false;
            }
        }
    }
    while timed.peek().is_some_and(|s| s.deadline <= now) {
        if let Some(scheduled) = timed.pop() {
            if output.send(scheduled.item).is_err() {
                return false;
            }
        }
    }
    true
}

async fn drive<T>(
    mut input: mpsc::UnboundedReceiver<TimeBoundedItem<T>>,
    output: mpsc::UnboundedSender<TimeBoundedItem<T>>,
    mut rng: ChaCha8Rng,
    cancel: CancellationToken,
) {
    let mut fixed: VecDeque<(Instant, TimeBoundedItem<T>)> = VecDeque::new();
    let mut timed: BinaryHeap<Scheduled<T>> = BinaryHeap::new();
    let mut seq = 0u64;
    let mut input_open = true;

    loop {
        let next = next_deadline(&fixed, &timed);
        if !input_open && next.is_none() {
            break;
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            received = input.recv(), if input_open => match received {
                Some(item) => {
                    let enqueued_at = item.enqueued_at.unwrap_or_else(Instant::now);
                    if item.is_fixed() {
                        trace!(delay = ?item.min_duration, "queued fixed-delay item");
                        fixed.push_back((enqueued_at + item.min_duration, item));
                    } else {
                        let delay = draw_delay(&mut rng, &item);
                        trace!(?delay, "queued random-delay item");
                        timed.push(Scheduled {
                            deadline: enqueued_at + delay,
                            seq,
                            item,
                        });
                        seq += 1;
                    }
                }
                None => input_open = false,
            },
            _ = sleep_until(next.unwrap_or_else(Instant::now)), if next.is_some() => {
                if !release_due(&mut fixed, &mut timed, &output) {
                    break;
                }
            }
        }
    }

    debug!(
        pending = fixed.len() + timed.len(),
        "time-bounded queue driver stopped"
    );
}
