//! Watermark tracking for out-of-order event streams
//!
//! A watermark is a timestamp threshold asserting that no further events with
//! event times at or below it are expected. The tracker computes it as the
//! maximum event time observed minus the configured allowed lateness, and it
//! never moves backwards.
//!
//! # Example
//!
//! ```rust
//! use activity_processor::watermark::{Watermark, WatermarkTracker};
//!
//! let mut tracker = WatermarkTracker::new(600_000); // 10 minutes of lateness
//! tracker.observe(1_000_000);
//! tracker.advance();
//! assert_eq!(tracker.current(), Watermark::new(400_000));
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::max;
use tracing::{debug, trace};

/// A watermark timestamp
///
/// All events with event times less than or equal to the watermark are
/// considered accounted for. Windows whose close threshold falls at or below
/// the watermark may be finalized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Watermark {
    /// The watermark timestamp in milliseconds since epoch
    pub timestamp: i64,
}

impl Watermark {
    /// Creates a new watermark with the given timestamp
    pub fn new(timestamp: i64) -> Self {
        Self { timestamp }
    }

    /// Creates a watermark from a DateTime
    pub fn from_datetime(dt: DateTime<Utc>) -> Self {
        Self {
            timestamp: dt.timestamp_millis(),
        }
    }

    /// Converts the watermark to a DateTime, saturating at the epoch bounds
    pub fn to_datetime(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp_millis(self.timestamp)
    }

    /// The minimum possible watermark, held before any event is observed
    pub fn min() -> Self {
        Self {
            timestamp: i64::MIN,
        }
    }

    /// Returns true if this is the minimum watermark
    pub fn is_min(&self) -> bool {
        self.timestamp == i64::MIN
    }

    /// Checks if the given timestamp falls at or below this watermark
    pub fn covers(&self, timestamp: i64) -> bool {
        timestamp <= self.timestamp
    }
}

impl Default for Watermark {
    fn default() -> Self {
        Self::min()
    }
}

impl std::fmt::Display for Watermark {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.to_datetime() {
            Some(dt) => write!(f, "Watermark({})", dt),
            None => write!(f, "Watermark({})", self.timestamp),
        }
    }
}

/// Tracks the watermark for a single partition
///
/// Observes event times as batches are processed, then advances the watermark
/// to `max_event_time - allowed_lateness` once per batch. Two invariants hold:
/// the watermark never decreases, and `advance` is deterministic given the
/// same sequence of observations.
#[derive(Debug, Clone)]
pub struct WatermarkTracker {
    /// Maximum allowed lateness in milliseconds
    allowed_lateness_ms: i64,
    /// Maximum event time observed so far
    max_event_time: i64,
    /// Current watermark
    current: Watermark,
}

impl WatermarkTracker {
    /// Creates a tracker that holds the watermark `allowed_lateness_ms` behind
    /// the maximum observed event time
    pub fn new(allowed_lateness_ms: i64) -> Self {
        Self {
            allowed_lateness_ms,
            max_event_time: i64::MIN,
            current: Watermark::min(),
        }
    }

    /// Records an event time without moving the watermark
    ///
    /// The watermark only moves on [`advance`](Self::advance), so all events
    /// of a batch are admitted against the watermark that held when the batch
    /// started.
    pub fn observe(&mut self, event_time_ms: i64) {
        trace!(event_time_ms, "observing event time");
        self.max_event_time = max(self.max_event_time, event_time_ms);
    }

    /// Advances the watermark to `max_event_time - allowed_lateness`
    ///
    /// Returns the new watermark if it moved forward, None otherwise. The
    /// watermark never regresses, even if no events have been observed since
    /// the last advance.
    pub fn advance(&mut self) -> Option<Watermark> {
        if self.max_event_time == i64::MIN {
            return None;
        }

        let candidate = Watermark::new(self.max_event_time.saturating_sub(self.allowed_lateness_ms));
        if candidate > self.current {
            self.current = candidate;
            debug!(watermark = %candidate, "advanced watermark");
            Some(candidate)
        } else {
            None
        }
    }

    /// Gets the current watermark without advancing it
    pub fn current(&self) -> Watermark {
        self.current
    }

    /// Restores the tracker from a checkpointed watermark
    ///
    /// Seeds `max_event_time` so that re-observing the events of replayed
    /// batches cannot move the watermark backwards.
    pub fn restore(&mut self, watermark: Watermark) {
        self.current = watermark;
        if !watermark.is_min() {
            self.max_event_time = max(
                self.max_event_time,
                watermark.timestamp.saturating_add(self.allowed_lateness_ms),
            );
        }
        debug!(watermark = %watermark, "restored watermark");
    }

    /// The configured allowed lateness in milliseconds
    pub fn allowed_lateness_ms(&self) -> i64 {
        self.allowed_lateness_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_watermark_ordering() {
        let wm1 = Watermark::new(1000);
        let wm2 = Watermark::new(2000);
        assert!(wm1 < wm2);
        assert!(wm2.covers(2000));
        assert!(!wm2.covers(2001));
    }

    #[test]
    fn test_tracker_basic() {
        let mut tracker = WatermarkTracker::new(5000);
        tracker.observe(10_000);
        tracker.observe(20_000);

        let wm = tracker.advance();
        assert_eq!(wm, Some(Watermark::new(15_000)));
        assert_eq!(tracker.current(), Watermark::new(15_000));
    }

    #[test]
    fn test_tracker_out_of_order_events() {
        let mut tracker = WatermarkTracker::new(10_000);
        tracker.observe(30_000);
        tracker.observe(20_000);
        tracker.observe(25_000);

        tracker.advance();
        // Driven by the max observed time, not the latest arrival
        assert_eq!(tracker.current(), Watermark::new(20_000));
    }

    #[test]
    fn test_tracker_never_regresses() {
        let mut tracker = WatermarkTracker::new(5000);
        tracker.observe(20_000);
        tracker.advance();
        let wm1 = tracker.current();

        tracker.observe(15_000);
        assert!(tracker.advance().is_none());
        assert_eq!(tracker.current(), wm1);
    }

    #[test]
    fn test_tracker_no_advance_before_first_event() {
        let mut tracker = WatermarkTracker::new(5000);
        assert!(tracker.advance().is_none());
        assert!(tracker.current().is_min());
    }

    #[test]
    fn test_tracker_observe_without_advance_keeps_watermark() {
        let mut tracker = WatermarkTracker::new(5000);
        tracker.observe(20_000);
        tracker.advance();

        // New observations alone do not move the watermark
        tracker.observe(50_000);
        assert_eq!(tracker.current(), Watermark::new(15_000));

        tracker.advance();
        assert_eq!(tracker.current(), Watermark::new(45_000));
    }

    #[test]
    fn test_tracker_restore() {
        let mut tracker = WatermarkTracker::new(5000);
        tracker.restore(Watermark::new(15_000));
        assert_eq!(tracker.current(), Watermark::new(15_000));

        // Replayed events below the restored level cannot regress it
        tracker.observe(10_000);
        assert!(tracker.advance().is_none());
        assert_eq!(tracker.current(), Watermark::new(15_000));

        // Fresh events advance it again
        tracker.observe(30_000);
        tracker.advance();
        assert_eq!(tracker.current(), Watermark::new(25_000));
    }

    #[test]
    fn test_tracker_advance_is_deterministic() {
        let mut a = WatermarkTracker::new(600_000);
        let mut b = WatermarkTracker::new(600_000);
        for ts in [1_000_000_i64, 999_000, 1_200_000, 800_000] {
            a.observe(ts);
            b.observe(ts);
        }
        a.advance();
        b.advance();
        assert_eq!(a.current(), b.current());
        assert_eq!(a.current(), Watermark::new(600_000));
    }
}
