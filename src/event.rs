//! User-activity event types
//!
//! Events arrive as loosely-typed JSON; [`RawActivityEvent`] accepts whatever
//! the transport delivered and [`ActivityEvent`] is the validated form the
//! engine operates on. Validation itself lives in the router.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of user activity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// A page was viewed
    PageView,
    /// A product detail page was viewed
    ProductView,
    /// A product was added to the cart
    AddToCart,
    /// Any other recognized activity
    Other,
}

impl EventType {
    /// Parse from the wire representation; unknown values map to [`EventType::Other`]
    pub fn parse(value: &str) -> Self {
        match value {
            "page_view" => EventType::PageView,
            "product_view" => EventType::ProductView,
            "add_to_cart" => EventType::AddToCart,
            _ => EventType::Other,
        }
    }

    /// Wire representation of this event type
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::PageView => "page_view",
            EventType::ProductView => "product_view",
            EventType::AddToCart => "add_to_cart",
            EventType::Other => "other",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An event exactly as delivered by the transport, before validation
///
/// Every field is optional: the transport is at-least-once and makes no
/// promises about payload shape. `event_time` stays a string here so a
/// malformed timestamp rejects the event instead of failing deserialization
/// of the whole poll.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawActivityEvent {
    pub event_id: Option<String>,
    pub user_id: Option<String>,
    pub session_id: Option<String>,
    pub event_type: Option<String>,
    pub page: Option<String>,
    pub product_id: Option<String>,
    pub category_id: Option<String>,
    /// RFC 3339 timestamp assigned by the producer
    pub event_time: Option<String>,
    pub device: Option<String>,
    pub browser: Option<String>,
    pub ip_address: Option<String>,
    pub country: Option<String>,
    pub city: Option<String>,
}

/// A validated, immutable user-activity event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityEvent {
    /// Unique within the retention horizon
    pub event_id: String,
    pub user_id: String,
    pub session_id: Option<String>,
    pub event_type: EventType,
    pub page: Option<String>,
    pub product_id: Option<String>,
    pub category_id: Option<String>,
    /// Producer-assigned timestamp (event time semantics)
    pub event_time: DateTime<Utc>,
    pub device: Option<String>,
    pub browser: Option<String>,
    pub ip_address: Option<String>,
    pub country: Option<String>,
    pub city: Option<String>,
}

impl ActivityEvent {
    /// Convenience constructor carrying only the fields the engine requires;
    /// dimensional attributes default to absent.
    pub fn new(
        event_id: impl Into<String>,
        user_id: impl Into<String>,
        event_type: EventType,
        event_time: DateTime<Utc>,
    ) -> Self {
        Self {
            event_id: event_id.into(),
            user_id: user_id.into(),
            session_id: None,
            event_type,
            page: None,
            product_id: None,
            category_id: None,
            event_time,
            device: None,
            browser: None,
            ip_address: None,
            country: None,
            city: None,
        }
    }

    /// Set the page dimension
    pub fn with_page(mut self, page: impl Into<String>) -> Self {
        self.page = Some(page.into());
        self
    }

    /// Set the product dimension
    pub fn with_product(mut self, product_id: impl Into<String>) -> Self {
        self.product_id = Some(product_id.into());
        self
    }

    /// Set the session dimension
    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }
}

/// Grouping dimension for a metric pipeline
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GroupKey {
    /// Grouped by event type
    EventType(String),
    /// Grouped by page path
    Page(String),
    /// Grouped by product identifier
    Product(String),
}

impl GroupKey {
    /// Stable string form used as the sink key column
    pub fn to_key_string(&self) -> String {
        match self {
            GroupKey::EventType(v) => format!("event_type:{}", v),
            GroupKey::Page(v) => format!("page:{}", v),
            GroupKey::Product(v) => format!("product:{}", v),
        }
    }

    /// The raw dimension value without its prefix
    pub fn value(&self) -> &str {
        match self {
            GroupKey::EventType(v) | GroupKey::Page(v) | GroupKey::Product(v) => v,
        }
    }
}

impl fmt::Display for GroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_key_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_type_parse_round_trip() {
        for name in ["page_view", "product_view", "add_to_cart", "other"] {
            assert_eq!(EventType::parse(name).as_str(), name);
        }
    }

    #[test]
    fn test_event_type_parse_unknown() {
        assert_eq!(EventType::parse("checkout"), EventType::Other);
        assert_eq!(EventType::parse(""), EventType::Other);
    }

    #[test]
    fn test_event_type_serde_snake_case() {
        let json = serde_json::to_string(&EventType::AddToCart).unwrap();
        assert_eq!(json, "\"add_to_cart\"");
    }

    #[test]
    fn test_raw_event_tolerates_missing_fields() {
        let raw: RawActivityEvent = serde_json::from_str("{}").unwrap();
        assert!(raw.user_id.is_none());
        assert!(raw.event_time.is_none());
    }

    #[test]
    fn test_raw_event_deserializes_full_payload() {
        let raw: RawActivityEvent = serde_json::from_str(
            r#"{
                "event_id": "e1",
                "user_id": "u1",
                "session_id": "s1",
                "event_type": "page_view",
                "page": "/home",
                "event_time": "2024-01-01T00:00:10Z",
                "device": "mobile",
                "country": "DE"
            }"#,
        )
        .unwrap();
        assert_eq!(raw.user_id.as_deref(), Some("u1"));
        assert_eq!(raw.page.as_deref(), Some("/home"));
        assert_eq!(raw.country.as_deref(), Some("DE"));
    }

    #[test]
    fn test_group_key_string_forms() {
        assert_eq!(
            GroupKey::Page("/home".to_string()).to_key_string(),
            "page:/home"
        );
        assert_eq!(GroupKey::Product("p-9".to_string()).value(), "p-9");
    }
}
