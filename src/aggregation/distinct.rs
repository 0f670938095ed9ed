//! Distinct-user aggregation

use super::Aggregator;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Accumulator state for [`DistinctUsersAggregator`]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DistinctAccumulator {
    /// The distinct values seen so far
    pub values: HashSet<String>,
    /// Number of updates folded in, including duplicates
    pub updates: u64,
}

/// Counts distinct user ids with an exact set
///
/// Cardinality is exact rather than sketched. Window keys bound the set
/// size to the number of distinct users active in one window, which keeps
/// memory proportional to real traffic rather than to event volume.
#[derive(Debug, Clone, Default)]
pub struct DistinctUsersAggregator {
    acc: DistinctAccumulator,
}

impl Aggregator for DistinctUsersAggregator {
    type Input = String;
    type Output = u64;
    type Accumulator = DistinctAccumulator;

    fn new() -> Self {
        Self::default()
    }

    fn update(&mut self, user_id: String) {
        self.acc.values.insert(user_id);
        self.acc.updates += 1;
    }

    fn finalize(&self) -> u64 {
        self.acc.values.len() as u64
    }

    fn accumulator(&self) -> DistinctAccumulator {
        self.acc.clone()
    }

    fn merge(&mut self, other: DistinctAccumulator) {
        self.acc.values.extend(other.values);
        self.acc.updates += other.updates;
    }

    fn reset(&mut self) {
        self.acc = DistinctAccumulator::default();
    }

    fn count(&self) -> u64 {
        self.acc.updates
    }
}
