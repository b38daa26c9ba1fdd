//! Partial-order-reduced exploration.
//!
//! Events of distinct entities are treated as independent, so two traces
//! that differ only in how those events interleave are the same
//! exploration. Candidates are compared against history after reducing
//! both sides to a canonical order.

use std::collections::BTreeMap;

use faultline_history::{HistoryError, HistoryStorage};
use faultline_signal::Event;
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use tracing::trace;

use crate::policy::prefix::{PrefixPolicy, PrefixStrategy, Selection};

/// Canonical order of a trace: events grouped by entity, each entity's own
/// order preserved, groups sorted by entity id.
pub fn reduce_partial_order(events: &[Event]) -> Vec<Event> {
    let mut groups: BTreeMap<&str, Vec<Event>> = BTreeMap::new();
    for event in events {
        groups
            .entry(event.entity_id.as_str())
            .or_default()
            .push(event.clone());
    }
    groups.into_values().flatten().collect()
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Dpor;

pub type DporPolicy = PrefixPolicy<Dpor>;

impl PrefixStrategy for Dpor {
    const NAME: &'static str = "DPOR";

    // Never gives up on history: an all-seen tick picks at random.
    fn select(
        &self,
        storage: &dyn HistoryStorage,
        prefix: &[Event],
        queued: &[Event],
        rng: &mut ChaCha8Rng,
    ) -> Result<Selection, HistoryError> {
        let mut candidate = prefix.to_vec();
        for (idx, event) in queued.iter().enumerate() {
            candidate.push(event.clone());
            let reduced = reduce_partial_order(&candidate);
            let hits = storage.search_with_converter(&reduced, &reduce_partial_order)?;
            candidate.pop();
            trace!(idx, hits = hits.len(), "searched reduced candidate");
            if hits.is_empty() {
                return Ok(Selection::Release(idx));
            }
        }
        Ok(Selection::Release(rng.gen_range(0..queued.len())))
    }
}
