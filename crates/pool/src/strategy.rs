//! Worker selection.

use std::cmp::Reverse;

use rand::Rng;
use tandem_config::BalancingStrategy;

/// A worker with a free slot, as seen by the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Candidate {
    /// Index in the pool's worker list.
    pub position: usize,
    pub priority: i32,
    pub load: usize,
}

/// Pick one of `candidates`, returning its `position`.
///
/// `cursor` is the round-robin position and is only advanced by that
/// strategy. Ties go to the worker listed first.
pub(crate) fn choose(
    strategy: BalancingStrategy,
    candidates: &[Candidate],
    cursor: &mut usize,
) -> Option<usize> {
    if candidates.is_empty() {
        return None;
    }
    let picked = match strategy {
        BalancingStrategy::RoundRobin => {
            let next = candidates
                .iter()
                .find(|c| c.position >= *cursor)
                .unwrap_or(&candidates[0]);
            *cursor = next.position + 1;
            next
        }
        BalancingStrategy::Random => &candidates[rand::rng().random_range(0..candidates.len())],
        BalancingStrategy::Priority => candidates
            .iter()
            .min_by_key(|c| (Reverse(c.priority), c.load, c.position))?,
        BalancingStrategy::LeastBusy => candidates.iter().min_by_key(|c| (c.load, c.position))?,
    };
    Some(picked.position)
}
