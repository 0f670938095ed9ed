//! Event validation and pipeline routing
//!
//! The router turns a [`RawActivityEvent`] into a validated [`ActivityEvent`]
//! and decides which metric pipelines the event feeds. Rejections are
//! per-event: one malformed payload never fails the batch it arrived in.
//!
//! # Example
//!
//! ```rust
//! use activity_processor::event::RawActivityEvent;
//! use activity_processor::router::{RouteOutcome, Router};
//!
//! let router = Router::new();
//! let raw = RawActivityEvent {
//!     user_id: Some("u-1".into()),
//!     event_type: Some("page_view".into()),
//!     event_time: Some("2026-08-30T12:00:00Z".into()),
//!     page: Some("/home".into()),
//!     ..Default::default()
//! };
//! assert!(matches!(router.route(raw), RouteOutcome::Accepted(_)));
//! ```

use crate::event::{ActivityEvent, EventType, RawActivityEvent};
use crate::window::MetricId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};
use uuid::Uuid;

/// A validated event together with the metric pipelines it feeds
#[derive(Debug, Clone)]
pub struct RoutedEvent {
    pub event: ActivityEvent,
    /// Pipelines determined by event type; never empty
    pub pipelines: Vec<MetricId>,
}

/// Why an event was rejected by the router
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectReason {
    /// Required `user_id` field is missing or empty
    MissingUserId,
    /// Required `event_type` field is missing or empty
    MissingEventType,
    /// Required `event_time` field is missing
    MissingEventTime,
    /// `event_time` is present but not a valid RFC 3339 timestamp
    InvalidEventTime(String),
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::MissingUserId => write!(f, "missing user_id"),
            RejectReason::MissingEventType => write!(f, "missing event_type"),
            RejectReason::MissingEventTime => write!(f, "missing event_time"),
            RejectReason::InvalidEventTime(raw) => {
                write!(f, "unparseable event_time: {:?}", raw)
            }
        }
    }
}

/// Outcome of routing a single raw event
#[derive(Debug, Clone)]
pub enum RouteOutcome {
    Accepted(RoutedEvent),
    Rejected(RejectReason),
}

/// Counters for router activity, shared across the pipeline
#[derive(Debug, Default)]
pub struct RouterStats {
    accepted: AtomicU64,
    rejected: AtomicU64,
    generated_ids: AtomicU64,
}

impl RouterStats {
    pub fn accepted(&self) -> u64 {
        self.accepted.load(Ordering::Relaxed)
    }

    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    /// Events accepted with a router-generated event id
    pub fn generated_ids(&self) -> u64 {
        self.generated_ids.load(Ordering::Relaxed)
    }
}

/// Validates raw events and assigns their metric pipelines
#[derive(Debug, Default)]
pub struct Router {
    stats: RouterStats,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validates a raw event and determines its pipelines
    ///
    /// Events missing `user_id`, `event_type`, or a parseable RFC 3339
    /// `event_time` are rejected. A missing `event_id` is filled in with a
    /// fresh UUID so downstream idempotence keys stay well-formed; unknown
    /// event types are accepted as [`EventType::Other`] and feed only the
    /// active-users pipeline.
    pub fn route(&self, raw: RawActivityEvent) -> RouteOutcome {
        let user_id = match raw.user_id.filter(|v| !v.is_empty()) {
            Some(v) => v,
            None => return self.reject(RejectReason::MissingUserId),
        };

        let event_type = match raw.event_type.as_deref().filter(|v| !v.is_empty()) {
            Some(v) => EventType::parse(v),
            None => return self.reject(RejectReason::MissingEventType),
        };

        let event_time = match raw.event_time {
            Some(ref ts) => match parse_event_time(ts) {
                Some(dt) => dt,
                None => return self.reject(RejectReason::InvalidEventTime(ts.clone())),
            },
            None => return self.reject(RejectReason::MissingEventTime),
        };

        let event_id = match raw.event_id.filter(|v| !v.is_empty()) {
            Some(v) => v,
            None => {
                self.stats.generated_ids.fetch_add(1, Ordering::Relaxed);
                Uuid::new_v4().to_string()
            }
        };

        let event = ActivityEvent {
            event_id,
            user_id,
            session_id: raw.session_id,
            event_type,
            page: raw.page,
            product_id: raw.product_id,
            category_id: raw.category_id,
            event_time,
            device: raw.device,
            browser: raw.browser,
            ip_address: raw.ip_address,
            country: raw.country,
            city: raw.city,
        };

        let pipelines = MetricId::pipelines_for(event.event_type);
        debug!(
            event_id = %event.event_id,
            event_type = %event.event_type,
            pipelines = pipelines.len(),
            "routed event"
        );

        self.stats.accepted.fetch_add(1, Ordering::Relaxed);
        RouteOutcome::Accepted(RoutedEvent { event, pipelines })
    }

    fn reject(&self, reason: RejectReason) -> RouteOutcome {
        warn!(reason = %reason, "rejected event");
        self.stats.rejected.fetch_add(1, Ordering::Relaxed);
        RouteOutcome::Rejected(reason)
    }

    pub fn stats(&self) -> &RouterStats {
        &self.stats
    }
}

fn parse_event_time(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_raw() -> RawActivityEvent {
        RawActivityEvent {
            event_id: Some("e-1".into()),
            user_id: Some("u-1".into()),
            event_type: Some("page_view".into()),
            event_time: Some("2026-08-30T12:00:00Z".into()),
            page: Some("/home".into()),
            ..Default::default()
        }
    }

    #[test]
    fn test_route_accepts_valid_event() {
        let router = Router::new();
        match router.route(valid_raw()) {
            RouteOutcome::Accepted(routed) => {
                assert_eq!(routed.event.event_id, "e-1");
                assert_eq!(routed.event.event_type, EventType::PageView);
                assert_eq!(
                    routed.pipelines,
                    vec![MetricId::ActiveUsers, MetricId::PageViews]
                );
            }
            RouteOutcome::Rejected(reason) => panic!("unexpected rejection: {reason}"),
        }
        assert_eq!(router.stats().accepted(), 1);
    }

    #[test]
    fn test_route_rejects_missing_user() {
        let router = Router::new();
        let mut raw = valid_raw();
        raw.user_id = None;
        assert!(matches!(
            router.route(raw),
            RouteOutcome::Rejected(RejectReason::MissingUserId)
        ));
        assert_eq!(router.stats().rejected(), 1);
    }

    #[test]
    fn test_route_rejects_empty_user() {
        let router = Router::new();
        let mut raw = valid_raw();
        raw.user_id = Some(String::new());
        assert!(matches!(
            router.route(raw),
            RouteOutcome::Rejected(RejectReason::MissingUserId)
        ));
    }

    #[test]
    fn test_route_rejects_bad_timestamp() {
        let router = Router::new();
        let mut raw = valid_raw();
        raw.event_time = Some("yesterday at noon".into());
        assert!(matches!(
            router.route(raw),
            RouteOutcome::Rejected(RejectReason::InvalidEventTime(_))
        ));
    }

    #[test]
    fn test_route_fills_missing_event_id() {
        let router = Router::new();
        let mut raw = valid_raw();
        raw.event_id = None;
        match router.route(raw) {
            RouteOutcome::Accepted(routed) => {
                assert!(!routed.event.event_id.is_empty());
            }
            RouteOutcome::Rejected(reason) => panic!("unexpected rejection: {reason}"),
        }
        assert_eq!(router.stats().generated_ids(), 1);
    }

    #[test]
    fn test_route_unknown_type_feeds_active_users_only() {
        let router = Router::new();
        let mut raw = valid_raw();
        raw.event_type = Some("checkout".into());
        match router.route(raw) {
            RouteOutcome::Accepted(routed) => {
                assert_eq!(routed.event.event_type, EventType::Other);
                assert_eq!(routed.pipelines, vec![MetricId::ActiveUsers]);
            }
            RouteOutcome::Rejected(reason) => panic!("unexpected rejection: {reason}"),
        }
    }

    #[test]
    fn test_route_accepts_offset_timezone() {
        let router = Router::new();
        let mut raw = valid_raw();
        raw.event_time = Some("2026-08-30T14:00:00+02:00".into());
        match router.route(raw) {
            RouteOutcome::Accepted(routed) => {
                assert_eq!(
                    routed.event.event_time.timestamp(),
                    chrono::DateTime::parse_from_rfc3339("2026-08-30T12:00:00Z")
                        .unwrap()
                        .timestamp()
                );
            }
            RouteOutcome::Rejected(reason) => panic!("unexpected rejection: {reason}"),
        }
    }
}
