//! Depth-first exploration: follow stored traces as long as one of them
//! continues the current prefix.

use faultline_history::{HistoryError, HistoryStorage};
use faultline_signal::Event;
use rand_chacha::ChaCha8Rng;
use tracing::trace;

use crate::policy::prefix::{PrefixPolicy, PrefixStrategy, Selection};

#[derive(Debug, Default, Clone, Copy)]
pub struct Dfs;

pub type DfsPolicy = PrefixPolicy<Dfs>;

impl PrefixStrategy for Dfs {
    const NAME: &'static str = "DFS";

    fn select(
        &self,
        storage: &dyn HistoryStorage,
        prefix: &[Event],
        queued: &[Event],
        _rng: &mut ChaCha8Rng,
    ) -> Result<Selection, HistoryError> {
        let mut candidate = prefix.to_vec();
        for (idx, event) in queued.iter().enumerate() {
            candidate.push(event.clone());
            let hits = storage.search(&candidate)?;
            candidate.pop();
            trace!(idx, hits = hits.len(), "searched candidate");
            if !hits.is_empty() {
                return Ok(Selection::Release(idx));
            }
        }
        Ok(Selection::Flush)
    }
}
