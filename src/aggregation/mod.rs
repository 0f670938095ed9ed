//! Incremental aggregation for windowed metrics
//!
//! Aggregators are commutative and associative over their inputs: feeding the
//! same multiset of values in any order, or merging partial accumulators,
//! yields the same final result. That property is what lets a batch replay be
//! rejected wholesale at the window level instead of per value.

mod count;
mod distinct;

pub use count::CountAggregator;
pub use distinct::DistinctUsersAggregator;

use serde::{de::DeserializeOwned, Serialize};
use std::fmt::Debug;

use crate::event::ActivityEvent;
use crate::window::MetricId;

/// Core trait for incremental aggregation
pub trait Aggregator: Send + Sync + Debug {
    /// The type of values this aggregator accepts
    type Input: Clone;

    /// The type of the final aggregation result
    type Output: Clone;

    /// The serializable internal accumulator state
    type Accumulator: Clone + Serialize + DeserializeOwned;

    /// Create an empty aggregator
    fn new() -> Self
    where
        Self: Sized;

    /// Fold one value into the accumulator
    fn update(&mut self, value: Self::Input);

    /// Compute the final aggregation result
    fn finalize(&self) -> Self::Output;

    /// Current accumulator state
    fn accumulator(&self) -> Self::Accumulator;

    /// Merge another accumulator into this one
    fn merge(&mut self, other: Self::Accumulator);

    /// Reset to the empty state
    fn reset(&mut self);

    /// Number of values folded in so far
    fn count(&self) -> u64;

    /// Whether any values have been folded in
    fn is_empty(&self) -> bool {
        self.count() == 0
    }
}

/// Accumulator for one metric's window, dispatching to the concrete
/// aggregator the metric requires
#[derive(Debug, Clone)]
pub enum MetricAccumulator {
    /// Plain event count
    Count(CountAggregator),
    /// Distinct users
    DistinctUsers(DistinctUsersAggregator),
}

impl MetricAccumulator {
    /// The empty accumulator appropriate for `metric`
    pub fn for_metric(metric: MetricId) -> Self {
        if metric.is_distinct() {
            MetricAccumulator::DistinctUsers(DistinctUsersAggregator::new())
        } else {
            MetricAccumulator::Count(CountAggregator::new())
        }
    }

    /// Fold one event's contribution in
    pub fn apply(&mut self, event: &ActivityEvent) {
        match self {
            MetricAccumulator::Count(agg) => agg.update(1),
            MetricAccumulator::DistinctUsers(agg) => agg.update(event.user_id.clone()),
        }
    }

    /// The final aggregate value
    pub fn value(&self) -> u64 {
        match self {
            MetricAccumulator::Count(agg) => agg.finalize(),
            MetricAccumulator::DistinctUsers(agg) => agg.finalize(),
        }
    }

    /// Number of events folded in
    pub fn events(&self) -> u64 {
        match self {
            MetricAccumulator::Count(agg) => agg.count(),
            MetricAccumulator::DistinctUsers(agg) => agg.count(),
        }
    }
}
