//! Breadth-first exploration: prefer the first candidate that leads to an
//! interleaving no stored trace starts with.

use faultline_history::{HistoryError, HistoryStorage};
use faultline_signal::Event;
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use tracing::trace;

use crate::policy::prefix::{PrefixPolicy, PrefixStrategy, Selection};

#[derive(Debug, Default, Clone, Copy)]
pub struct Bfs;

pub type BfsPolicy = PrefixPolicy<Bfs>;

impl PrefixStrategy for Bfs {
    const NAME: &'static str = "BFS";

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
            let hits = storage.search(&candidate)?;
            candidate.pop();
            trace!(idx, hits = hits.len(), "searched candidate");
            if hits.is_empty() {
                return Ok(Selection::Diverge(idx));
            }
        }
        Ok(Selection::Release(rng.gen_range(0..queued.len())))
    }
}
