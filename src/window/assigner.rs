//! Tumbling window assignment
//!
//! Fixed-size, non-overlapping windows: each event belongs to exactly one
//! window per metric, `[floor(t/size)*size, floor(t/size)*size + size)`.

use super::types::WindowBounds;
use chrono::{DateTime, Duration, TimeZone, Utc};

/// Assigns event timestamps to tumbling windows
#[derive(Debug, Clone)]
pub struct TumblingWindowAssigner {
    /// Size of each window
    size: Duration,
}

impl TumblingWindowAssigner {
    /// Create a new tumbling window assigner
    pub fn new(size: Duration) -> Self {
        assert!(size > Duration::zero(), "window size must be positive");
        Self { size }
    }

    /// Create an assigner from a size in milliseconds
    pub fn from_millis(size_ms: u64) -> Self {
        Self::new(Duration::milliseconds(size_ms as i64))
    }

    /// The window size
    pub fn size(&self) -> Duration {
        self.size
    }

    /// The bounds of the single window containing `timestamp`
    pub fn assign(&self, timestamp: DateTime<Utc>) -> WindowBounds {
        let ts_millis = timestamp.timestamp_millis();
        let size_millis = self.size.num_milliseconds();
        let aligned = ts_millis.div_euclid(size_millis) * size_millis;

        let start = Utc
            .timestamp_millis_opt(aligned)
            .single()
            .unwrap_or(timestamp);
        WindowBounds::new(start, start + self.size)
    }
}
