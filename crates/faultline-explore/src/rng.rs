//! Deterministic randomness for policies.
//!
//! A policy seed keys one ChaCha8 generator; the concerns that draw on
//! their own task (decisions, queue delays) each read a different ChaCha
//! stream of that key. Keys of neighbouring run seeds never overlap with
//! another concern's stream, so run `n` and run `n + 1` share no draws.

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

/// Stream read by a policy's decision loop (picks and fault draws).
pub const DECISION_STREAM: u64 = 0;

/// Stream read by a policy's time-bounded queue.
pub const DELAY_STREAM: u64 = 1;

pub fn policy_rng(seed: u64, stream: u64) -> ChaCha8Rng {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    rng.set_stream(stream);
    rng
}
