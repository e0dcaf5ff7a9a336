//! Client selection helpers for round drivers.

use std::collections::HashSet;

use rand::seq::IteratorRandom;

use crate::common::ClientId;

/// Picks the clients that participate in a round. The returned order is the
/// fixed processing order for that round.
pub trait Selector {
    fn select(&mut self, pool: &HashSet<ClientId>, count: usize) -> Vec<ClientId>;
}

/// Uniform random selection without replacement.
#[derive(Debug, Default)]
pub struct RandomSelector;

impl Selector for RandomSelector {
    fn select(&mut self, pool: &HashSet<ClientId>, count: usize) -> Vec<ClientId> {
        let mut rng = rand::thread_rng();
        pool.iter().copied().choose_multiple(&mut rng, count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selects_the_requested_count_from_the_pool() {
        let pool: HashSet<ClientId> = (0..10).map(|_| ClientId::new()).collect();
        let selection = RandomSelector.select(&pool, 4);
        assert_eq!(selection.len(), 4);
        assert!(selection.iter().all(|id| pool.contains(id)));
        let unique: HashSet<_> = selection.iter().collect();
        assert_eq!(unique.len(), 4);
    }

    #[test]
    fn a_small_pool_caps_the_selection() {
        let pool: HashSet<ClientId> = (0..2).map(|_| ClientId::new()).collect();
        assert_eq!(RandomSelector.select(&pool, 5).len(), 2);
    }
}
