//! Count aggregation

use super::Aggregator;
use serde::{Deserialize, Serialize};

/// Accumulator state for [`CountAggregator`]
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct CountAccumulator {
    /// Weighted count
    pub count: u64,
    /// Number of updates folded in
    pub updates: u64,
}

/// Counts weighted occurrences
///
/// Each update adds its weight to the running count; the window pipelines
/// always use weight 1, so count equals the number of contributing events.
#[derive(Debug, Clone, Default)]
pub struct CountAggregator {
    acc: CountAccumulator,
}

impl Aggregator for CountAggregator {
    type Input = u64;
    type Output = u64;
    type Accumulator = CountAccumulator;

    fn new() -> Self {
        Self::default()
    }

    fn update(&mut self, weight: u64) {
        self.acc.count = self.acc.count.saturating_add(weight);
        self.acc.updates += 1;
    }

    fn finalize(&self) -> u64 {
        self.acc.count
    }

    fn accumulator(&self) -> CountAccumulator {
        self.acc
    }

    fn merge(&mut self, other: CountAccumulator) {
        self.acc.count = self.acc.count.saturating_add(other.count);
        self.acc.updates += other.updates;
    }

    fn reset(&mut self) {
        self.acc = CountAccumulator::default();
    }

    fn count(&self) -> u64 {
        self.acc.updates
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_count_basic() {
        let mut agg = CountAggregator::new();
        assert!(agg.is_empty());

        agg.update(1);
        agg.update(1);
        agg.update(1);

        assert_eq!(agg.finalize(), 3);
        assert_eq!(agg.count(), 3);
    }

    #[test]
    fn test_count_weighted() {
        let mut agg = CountAggregator::new();
        agg.update(5);
        agg.update(2);
        assert_eq!(agg.finalize(), 7);
        assert_eq!(agg.count(), 2);
    }

    #[test]
    fn test_count_merge() {
        let mut a = CountAggregator::new();
        a.update(1);
        a.update(1);

        let mut b = CountAggregator::new();
        b.update(1);

        a.merge(b.accumulator());
        assert_eq!(a.finalize(), 3);
        assert_eq!(a.count(), 3);
    }

    #[test]
    fn test_count_reset() {
        let mut agg = CountAggregator::new();
        agg.update(1);
        agg.reset();
        assert!(agg.is_empty());
        assert_eq!(agg.finalize(), 0);
    }

    #[test]
    fn test_count_saturates() {
        let mut agg = CountAggregator::new();
        agg.update(u64::MAX);
        agg.update(1);
        assert_eq!(agg.finalize(), u64::MAX);
    }
}
