//! Windowing for time-based aggregation
//!
//! Events are bucketed into fixed-size, non-overlapping tumbling windows by
//! event time:
//!
//! ```text
//! Time:     0----5----10---15---20---25---30
//! Windows:  [----][----][----][----][----]
//! ```
//!
//! Each window is identified by its metric, grouping key, and bounds
//! ([`WindowId`]), carries one accumulator, and closes when the watermark
//! passes its end plus the allowed lateness. Closed windows are evicted in a
//! deterministic order and handed to the sinks.

pub mod assigner;
pub mod store;
pub mod types;

pub use assigner::TumblingWindowAssigner;
pub use store::{ApplySummary, ClosedWindow, WindowState, WindowStore};
pub use types::{MetricId, WindowBounds, WindowId, UNKNOWN_GROUP};
