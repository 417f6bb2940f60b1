//! Frontier + holes tracking for a strictly ordered scan.
//!
//! Every position below `frontier` is done. `holes` holds done positions at or above the
//! frontier that are not yet contiguous with it. Only this fringe is kept in memory.

mod store;

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

pub use store::{ProgressStore, ProgressStoreError};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OrderedProgress {
    frontier: u64,
    holes: BTreeSet<u64>,
}

/// Persisted form of `OrderedProgress`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub frontier: u64,
    #[serde(default)]
    pub holes: Vec<u64>,
}

impl OrderedProgress {
    pub fn new(frontier: u64) -> Self {
        Self {
            frontier,
            holes: BTreeSet::new(),
        }
    }

    /// Restores persisted state. Holes below `frontier` are discarded and holes contiguous with
    /// it are compacted, so a hand-edited or stale snapshot still satisfies the invariants.
    pub fn load(frontier: u64, holes: impl IntoIterator<Item = u64>) -> Self {
        let mut progress = Self::new(frontier);
        progress
            .holes
            .extend(holes.into_iter().filter(|id| *id >= frontier));
        progress.compact();
        progress
    }

    pub fn from_snapshot(snapshot: &ProgressSnapshot) -> Self {
        Self::load(snapshot.frontier, snapshot.holes.iter().copied())
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            frontier: self.frontier,
            holes: self.holes.iter().copied().collect(),
        }
    }

    pub fn frontier(&self) -> u64 {
        self.frontier
    }

    pub fn holes(&self) -> &BTreeSet<u64> {
        &self.holes
    }

    /// Marks `id` complete. Returns true when the frontier moved.
    pub fn observe(&mut self, id: u64) -> bool {
        if id < self.frontier {
            return false;
        }
        if id > self.frontier {
            self.holes.insert(id);
            return false;
        }
        self.frontier += 1;
        self.compact();
        true
    }

    pub fn is_done(&self, id: u64) -> bool {
        id < self.frontier || self.holes.contains(&id)
    }

    /// Marks every position in `[start, end)` complete.
    pub fn observe_range(&mut self, start: u64, end: u64) -> bool {
        if start <= self.frontier {
            return self.advance_to(end);
        }
        self.holes.extend(start..end);
        false
    }

    /// Moves the frontier forward to `position` (never backward), for example when a shared
    /// done prefix shows that everything below it is finished.
    pub fn advance_to(&mut self, position: u64) -> bool {
        if position <= self.frontier {
            return false;
        }
        self.frontier = position;
        self.holes = self.holes.split_off(&position);
        self.compact();
        true
    }

    /// Positions in `[start, end)` not yet known to be done.
    pub fn pending_in(&self, start: u64, end: u64) -> impl Iterator<Item = u64> + '_ {
        (start.max(self.frontier)..end).filter(move |id| !self.holes.contains(id))
    }

    fn compact(&mut self) {
        while self.holes.remove(&self.frontier) {
            self.frontier += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{OrderedProgress, ProgressSnapshot};
    use rand::rngs::StdRng;
    use rand::seq::SliceRandom;
    use rand::SeedableRng;

    #[test]
    fn contiguous_run_compacts_when_gap_closes() {
        let mut progress = OrderedProgress::new(4);
        for id in [5, 6, 7] {
            assert!(!progress.observe(id));
        }
        assert_eq!(progress.frontier(), 4);

        assert!(progress.observe(4));

        assert_eq!(progress.frontier(), 8);
        assert!(progress.holes().is_empty());
    }

    #[test]
    fn holes_persist_until_gap_is_filled() {
        let mut progress = OrderedProgress::new(5);
        progress.observe(6);
        progress.observe(8);

        assert_eq!(progress.frontier(), 5);
        assert_eq!(progress.holes().iter().copied().collect::<Vec<_>>(), vec![6, 8]);

        progress.observe(7);
        assert_eq!(progress.frontier(), 5);

        progress.observe(5);
        assert_eq!(progress.frontier(), 9);
        assert!(progress.holes().is_empty());
    }

    #[test]
    fn observing_below_frontier_is_ignored() {
        let mut progress = OrderedProgress::new(10);
        assert!(!progress.observe(3));
        assert_eq!(progress.frontier(), 10);
        assert!(progress.holes().is_empty());
        assert!(progress.is_done(3));
    }

    #[test]
    fn frontier_is_monotonic_and_done_is_stable_under_any_order() {
        for seed in 0..32u64 {
            let mut ids: Vec<u64> = (0..64).chain(0..16).collect();
            ids.shuffle(&mut StdRng::seed_from_u64(seed));

            let mut progress = OrderedProgress::new(0);
            let mut seen_done = Vec::new();
            let mut last_frontier = 0;
            for id in ids {
                progress.observe(id);
                assert!(progress.frontier() >= last_frontier, "seed {seed}");
                last_frontier = progress.frontier();
                seen_done.push(id);
                for done in &seen_done {
                    assert!(progress.is_done(*done), "seed {seed} lost {done}");
                }
                assert!(progress.holes().iter().all(|hole| *hole > progress.frontier()));
            }
            assert_eq!(progress.frontier(), 64);
            assert!(progress.holes().is_empty());
        }
    }

    #[test]
    fn load_discards_stale_holes_and_compacts() {
        let progress = OrderedProgress::load(10, [2, 10, 11, 15]);
        assert_eq!(progress.frontier(), 12);
        assert_eq!(progress.holes().iter().copied().collect::<Vec<_>>(), vec![15]);
        assert_eq!(
            progress.snapshot(),
            ProgressSnapshot {
                frontier: 12,
                holes: vec![15]
            }
        );
    }

    #[test]
    fn advance_to_drops_covered_holes_and_never_moves_backward() {
        let mut progress = OrderedProgress::load(0, [3, 301, 302, 400]);
        assert!(progress.advance_to(300));
        assert_eq!(progress.frontier(), 300);
        assert!(!progress.advance_to(100));
        assert_eq!(progress.frontier(), 300);

        progress.observe(300);
        assert_eq!(progress.frontier(), 303);
        assert_eq!(progress.holes().iter().copied().collect::<Vec<_>>(), vec![400]);
    }

    #[test]
    fn observe_range_ahead_of_frontier_records_holes() {
        let mut progress = OrderedProgress::new(0);
        progress.observe_range(10, 13);
        assert_eq!(progress.frontier(), 0);
        assert_eq!(progress.pending_in(8, 14).collect::<Vec<_>>(), vec![8, 9, 13]);

        progress.observe_range(0, 10);
        assert_eq!(progress.frontier(), 13);
    }
}
