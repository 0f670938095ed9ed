//! In-memory window state with idempotent batch application
//!
//! The store keys open windows by `(metric, group key, bounds)` and guards
//! every window with the id of the last batch that updated it. Re-applying a
//! batch after a crash therefore leaves all window state untouched, which is
//! what makes at-least-once delivery upstream safe.

use crate::aggregation::MetricAccumulator;
use crate::router::RoutedEvent;
use crate::watermark::Watermark;
use crate::window::assigner::TumblingWindowAssigner;
use crate::window::types::{WindowBounds, WindowId};
use std::collections::HashMap;
use tracing::{debug, trace};

/// State of one open window
#[derive(Debug, Clone)]
pub struct WindowState {
    pub accumulator: MetricAccumulator,
    /// Id of the last batch whose events were folded into this window
    pub last_updated_batch_id: u64,
}

/// A window finalized by watermark passage, ready for fan-out
#[derive(Debug, Clone)]
pub struct ClosedWindow {
    pub id: WindowId,
    /// Finalized metric value
    pub value: u64,
    /// Number of events folded in, duplicates included for distinct metrics
    pub event_count: u64,
}

/// Per-call summary of a batch application
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplySummary {
    /// Windows that accepted this batch's events
    pub windows_updated: u64,
    /// Windows that skipped this batch as a replay
    pub windows_replayed: u64,
    /// Events dropped because their window was already closed
    pub late_dropped: u64,
}

/// Holds all open windows for one partition
pub struct WindowStore {
    assigner: TumblingWindowAssigner,
    allowed_lateness_ms: i64,
    windows: HashMap<WindowId, WindowState>,
    late_dropped_total: u64,
}

impl WindowStore {
    pub fn new(window_size_ms: u64, allowed_lateness_ms: i64) -> Self {
        Self {
            assigner: TumblingWindowAssigner::from_millis(window_size_ms),
            allowed_lateness_ms,
            windows: HashMap::new(),
            late_dropped_total: 0,
        }
    }

    /// Whether a window with these bounds is closed under the given watermark
    fn is_closed(&self, bounds: &WindowBounds, watermark: Watermark) -> bool {
        let close_at = bounds
            .end
            .timestamp_millis()
            .saturating_add(self.allowed_lateness_ms);
        watermark.covers(close_at)
    }

    /// Folds a batch's events into their windows
    ///
    /// Two passes: events are first grouped by window id, then each touched
    /// window is updated in one step, guarded by `last_updated_batch_id`.
    /// A window only accepts a batch whose id is strictly greater than the
    /// last one it saw, so replaying a batch is a no-op even when the batch
    /// carries several events for the same window.
    ///
    /// Events whose window is already closed under `watermark` are dropped
    /// and counted, never partially applied.
    pub fn apply(
        &mut self,
        batch_id: u64,
        events: &[RoutedEvent],
        watermark: Watermark,
    ) -> ApplySummary {
        let mut summary = ApplySummary::default();

        // Pass 1: group events by the windows they land in.
        let mut grouped: HashMap<WindowId, Vec<&RoutedEvent>> = HashMap::new();
        for routed in events {
            let bounds = self.assigner.assign(routed.event.event_time);
            if self.is_closed(&bounds, watermark) {
                summary.late_dropped += 1;
                self.late_dropped_total += 1;
                trace!(
                    event_id = %routed.event.event_id,
                    window = %bounds,
                    watermark = %watermark,
                    "dropping event for closed window"
                );
                continue;
            }
            for metric in &routed.pipelines {
                let id = WindowId {
                    metric: *metric,
                    key: metric.group_key(&routed.event),
                    bounds,
                };
                grouped.entry(id).or_default().push(routed);
            }
        }

        // Pass 2: apply per window, once per batch.
        for (id, routed_events) in grouped {
            let state = self.windows.entry(id.clone()).or_insert_with(|| WindowState {
                accumulator: MetricAccumulator::for_metric(id.metric),
                last_updated_batch_id: 0,
            });

            if batch_id <= state.last_updated_batch_id {
                summary.windows_replayed += 1;
                trace!(
                    window = %id,
                    batch_id,
                    last_updated = state.last_updated_batch_id,
                    "skipping replayed batch for window"
                );
                continue;
            }

            for routed in routed_events {
                state.accumulator.apply(&routed.event);
            }
            state.last_updated_batch_id = batch_id;
            summary.windows_updated += 1;
        }

        debug!(
            batch_id,
            windows_updated = summary.windows_updated,
            windows_replayed = summary.windows_replayed,
            late_dropped = summary.late_dropped,
            "applied batch to window store"
        );
        summary
    }

    /// Removes and finalizes every window closed under the given watermark
    ///
    /// A window closes once `end + allowed_lateness <= watermark`. Results
    /// are sorted by bounds, then metric, then key, so eviction order is
    /// deterministic across runs.
    pub fn evict_closed(&mut self, watermark: Watermark) -> Vec<ClosedWindow> {
        let mut closed = Vec::new();
        self.windows.retain(|id, state| {
            let close_at = id
                .bounds
                .end
                .timestamp_millis()
                .saturating_add(self.allowed_lateness_ms);
            if watermark.covers(close_at) {
                closed.push(ClosedWindow {
                    id: id.clone(),
                    value: state.accumulator.value(),
                    event_count: state.accumulator.events(),
                });
                false
            } else {
                true
            }
        });

        closed.sort_by(|a, b| {
            a.id.bounds
                .cmp(&b.id.bounds)
                .then_with(|| a.id.metric.name().cmp(b.id.metric.name()))
                .then_with(|| a.id.key.to_key_string().cmp(&b.id.key.to_key_string()))
        });

        if !closed.is_empty() {
            debug!(
                count = closed.len(),
                watermark = %watermark,
                "evicted closed windows"
            );
        }
        closed
    }

    /// Number of currently open windows
    pub fn open_count(&self) -> usize {
        self.windows.len()
    }

    /// Total events dropped as too late over the store's lifetime
    pub fn late_dropped_total(&self) -> u64 {
        self.late_dropped_total
    }

    /// Looks up the state of one open window, mainly for inspection in tests
    pub fn get(&self, id: &WindowId) -> Option<&WindowState> {
        self.windows.get(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{ActivityEvent, EventType};
    use crate::window::types::MetricId;
    use chrono::{TimeZone, Utc};

    const WINDOW_MS: u64 = 300_000;
    const LATENESS_MS: i64 = 600_000;

    fn routed(event_id: &str, user_id: &str, event_type: EventType, ts_ms: i64) -> RoutedEvent {
        let ts = Utc.timestamp_millis_opt(ts_ms).unwrap();
        let mut event = ActivityEvent::new(event_id, user_id, event_type, ts);
        if event_type == EventType::PageView {
            event = event.with_page("/home");
        }
        if matches!(event_type, EventType::ProductView | EventType::AddToCart) {
            event = event.with_product("p-1");
        }
        RoutedEvent {
            pipelines: MetricId::pipelines_for(event_type),
            event,
        }
    }

    fn store() -> WindowStore {
        WindowStore::new(WINDOW_MS, LATENESS_MS)
    }

    #[test]
    fn test_apply_creates_windows_per_pipeline() {
        let mut s = store();
        let events = vec![routed("e1", "u1", EventType::PageView, 100_000)];
        let summary = s.apply(1, &events, Watermark::min());

        // Active-users and page-views windows for the same event
        assert_eq!(summary.windows_updated, 2);
        assert_eq!(s.open_count(), 2);
    }

    #[test]
    fn test_apply_replay_is_noop() {
        let mut s = store();
        let events = vec![
            routed("e1", "u1", EventType::PageView, 100_000),
            routed("e2", "u2", EventType::PageView, 110_000),
        ];
        s.apply(1, &events, Watermark::min());

        let id = WindowId {
            metric: MetricId::PageViews,
            key: crate::event::GroupKey::Page("/home".into()),
            bounds: TumblingWindowAssigner::from_millis(WINDOW_MS)
                .assign(Utc.timestamp_millis_opt(100_000).unwrap()),
        };
        let before = s.get(&id).unwrap().accumulator.value();
        assert_eq!(before, 2);

        // Replay with the same batch id
        let summary = s.apply(1, &events, Watermark::min());
        assert_eq!(summary.windows_updated, 0);
        assert_eq!(summary.windows_replayed, 2);
        assert_eq!(s.get(&id).unwrap().accumulator.value(), 2);
    }

    #[test]
    fn test_apply_same_batch_multiple_events_same_window() {
        let mut s = store();
        let events = vec![
            routed("e1", "u1", EventType::PageView, 100_000),
            routed("e2", "u1", EventType::PageView, 120_000),
            routed("e3", "u2", EventType::PageView, 140_000),
        ];
        s.apply(7, &events, Watermark::min());

        let id = WindowId {
            metric: MetricId::PageViews,
            key: crate::event::GroupKey::Page("/home".into()),
            bounds: TumblingWindowAssigner::from_millis(WINDOW_MS)
                .assign(Utc.timestamp_millis_opt(100_000).unwrap()),
        };
        // All three events of the batch land, not just the first
        assert_eq!(s.get(&id).unwrap().accumulator.value(), 3);
        assert_eq!(s.get(&id).unwrap().last_updated_batch_id, 7);
    }

    #[test]
    fn test_distinct_users_dedupe_within_window() {
        let mut s = store();
        let events = vec![
            routed("e1", "u1", EventType::PageView, 100_000),
            routed("e2", "u1", EventType::PageView, 120_000),
            routed("e3", "u2", EventType::PageView, 140_000),
        ];
        s.apply(1, &events, Watermark::min());

        let id = WindowId {
            metric: MetricId::ActiveUsers,
            key: crate::event::GroupKey::EventType("page_view".into()),
            bounds: TumblingWindowAssigner::from_millis(WINDOW_MS)
                .assign(Utc.timestamp_millis_opt(100_000).unwrap()),
        };
        assert_eq!(s.get(&id).unwrap().accumulator.value(), 2);
        assert_eq!(s.get(&id).unwrap().accumulator.events(), 3);
    }

    #[test]
    fn test_late_event_dropped_for_closed_window() {
        let mut s = store();
        // Window [0, 300_000) closes once watermark reaches 900_000
        let events = vec![routed("e1", "u1", EventType::PageView, 100_000)];
        let summary = s.apply(1, &events, Watermark::new(900_000));

        assert_eq!(summary.late_dropped, 1);
        assert_eq!(summary.windows_updated, 0);
        assert_eq!(s.open_count(), 0);
        assert_eq!(s.late_dropped_total(), 1);
    }

    #[test]
    fn test_late_event_within_lateness_accepted() {
        let mut s = store();
        // Watermark just shy of the close threshold
        let events = vec![routed("e1", "u1", EventType::PageView, 100_000)];
        let summary = s.apply(1, &events, Watermark::new(899_999));

        assert_eq!(summary.late_dropped, 0);
        assert_eq!(summary.windows_updated, 2);
    }

    #[test]
    fn test_evict_closed_finalizes_and_removes() {
        let mut s = store();
        let events = vec![
            routed("e1", "u1", EventType::PageView, 100_000),
            routed("e2", "u2", EventType::PageView, 400_000),
        ];
        s.apply(1, &events, Watermark::min());
        assert_eq!(s.open_count(), 4);

        // Close only the first window [0, 300_000)
        let closed = s.evict_closed(Watermark::new(900_000));
        assert_eq!(closed.len(), 2);
        assert_eq!(s.open_count(), 2);
        for window in &closed {
            assert_eq!(window.id.bounds.end.timestamp_millis(), 300_000);
            assert_eq!(window.value, 1);
        }
    }

    #[test]
    fn test_evict_order_is_deterministic() {
        let mut s = store();
        let events = vec![
            routed("e1", "u1", EventType::ProductView, 100_000),
            routed("e2", "u2", EventType::PageView, 110_000),
            routed("e3", "u3", EventType::AddToCart, 120_000),
        ];
        s.apply(1, &events, Watermark::min());

        let closed = s.evict_closed(Watermark::new(900_000));
        let names: Vec<&str> = closed.iter().map(|w| w.id.metric.name()).collect();
        let mut sorted = names.clone();
        sorted.sort();
        assert_eq!(names, sorted);
    }

    #[test]
    fn test_evict_nothing_before_close_threshold() {
        let mut s = store();
        let events = vec![routed("e1", "u1", EventType::PageView, 100_000)];
        s.apply(1, &events, Watermark::min());

        // Watermark past the window end but within lateness
        assert!(s.evict_closed(Watermark::new(600_000)).is_empty());
        assert_eq!(s.open_count(), 2);
    }
}
