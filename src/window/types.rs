//! Window identity types

use crate::event::{ActivityEvent, EventType, GroupKey};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Sentinel bucket for events missing the metric's grouping dimension
pub const UNKNOWN_GROUP: &str = "unknown";

/// The time bounds of a window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WindowBounds {
    /// Start time of the window (inclusive)
    pub start: DateTime<Utc>,
    /// End time of the window (exclusive)
    pub end: DateTime<Utc>,
}

impl WindowBounds {
    /// Create new window bounds
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        assert!(start < end, "window start must be before end");
        Self { start, end }
    }

    /// Duration of the window
    pub fn duration(&self) -> Duration {
        self.end.signed_duration_since(self.start)
    }

    /// Whether a timestamp falls within this window
    pub fn contains(&self, timestamp: DateTime<Utc>) -> bool {
        timestamp >= self.start && timestamp < self.end
    }
}

impl fmt::Display for WindowBounds {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{} - {})",
            self.start.format("%Y-%m-%d %H:%M:%S%.3f"),
            self.end.format("%Y-%m-%d %H:%M:%S%.3f")
        )
    }
}

impl PartialOrd for WindowBounds {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for WindowBounds {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.start
            .cmp(&other.start)
            .then_with(|| self.end.cmp(&other.end))
    }
}

/// The named metric pipelines computed over the activity stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricId {
    /// Distinct users per event type
    ActiveUsers,
    /// Page views per page
    PageViews,
    /// Product views per product
    ProductViews,
    /// Add-to-cart events per product
    AddToCart,
}

impl MetricId {
    /// Stable metric name used in sink keys and rows
    pub fn name(&self) -> &'static str {
        match self {
            MetricId::ActiveUsers => "active_users",
            MetricId::PageViews => "page_views",
            MetricId::ProductViews => "product_views",
            MetricId::AddToCart => "add_to_cart",
        }
    }

    /// Whether this metric accumulates a distinct-user count rather than a
    /// plain event count
    pub fn is_distinct(&self) -> bool {
        matches!(self, MetricId::ActiveUsers)
    }

    /// The grouping key this metric extracts from an event
    pub fn group_key(&self, event: &ActivityEvent) -> GroupKey {
        match self {
            MetricId::ActiveUsers => GroupKey::EventType(event.event_type.as_str().to_string()),
            MetricId::PageViews => GroupKey::Page(
                event
                    .page
                    .clone()
                    .unwrap_or_else(|| UNKNOWN_GROUP.to_string()),
            ),
            MetricId::ProductViews | MetricId::AddToCart => GroupKey::Product(
                event
                    .product_id
                    .clone()
                    .unwrap_or_else(|| UNKNOWN_GROUP.to_string()),
            ),
        }
    }

    /// Which metric pipelines an event of the given type feeds
    pub fn pipelines_for(event_type: EventType) -> Vec<MetricId> {
        match event_type {
            EventType::PageView => vec![MetricId::ActiveUsers, MetricId::PageViews],
            EventType::ProductView => vec![MetricId::ActiveUsers, MetricId::ProductViews],
            EventType::AddToCart => vec![MetricId::ActiveUsers, MetricId::AddToCart],
            EventType::Other => vec![MetricId::ActiveUsers],
        }
    }
}

impl fmt::Display for MetricId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Identity of one open or closed window
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WindowId {
    /// The metric this window aggregates
    pub metric: MetricId,
    /// The grouping dimension value
    pub key: GroupKey,
    /// Time bounds
    pub bounds: WindowBounds,
}

impl fmt::Display for WindowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}@{}", self.metric, self.key, self.bounds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(millis: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(millis).unwrap()
    }

    #[test]
    fn test_window_bounds_contains() {
        let bounds = WindowBounds::new(ts(1000), ts(2000));
        assert!(!bounds.contains(ts(999)));
        assert!(bounds.contains(ts(1000)));
        assert!(bounds.contains(ts(1999)));
        assert!(!bounds.contains(ts(2000)));
    }

    #[test]
    #[should_panic(expected = "window start must be before end")]
    fn test_window_bounds_invalid() {
        WindowBounds::new(ts(2000), ts(1000));
    }

    #[test]
    fn test_window_bounds_ordering() {
        let a = WindowBounds::new(ts(0), ts(1000));
        let b = WindowBounds::new(ts(1000), ts(2000));
        assert!(a < b);
    }

    #[test]
    fn test_metric_pipelines_for_event_types() {
        assert_eq!(
            MetricId::pipelines_for(EventType::PageView),
            vec![MetricId::ActiveUsers, MetricId::PageViews]
        );
        assert_eq!(
            MetricId::pipelines_for(EventType::Other),
            vec![MetricId::ActiveUsers]
        );
    }

    #[test]
    fn test_group_key_uses_unknown_sentinel() {
        let event = ActivityEvent::new("e1", "u1", EventType::PageView, ts(0));
        match MetricId::PageViews.group_key(&event) {
            GroupKey::Page(p) => assert_eq!(p, UNKNOWN_GROUP),
            other => panic!("expected page key, got {:?}", other),
        }
    }
}
