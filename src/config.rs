//! Configuration types for the activity stream processor
//!
//! All connection settings are explicit structures passed to components at
//! construction; there is no process-wide mutable state and nothing is read
//! from the environment at module load.

use crate::error::{ProcessorError, Result, WindowError};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Main processor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessorConfig {
    /// Window configuration
    #[serde(default)]
    pub window: WindowConfig,

    /// Watermark configuration
    #[serde(default)]
    pub watermark: WatermarkConfig,

    /// Micro-batch trigger configuration
    #[serde(default)]
    pub batch: BatchConfig,

    /// Sink delivery and retry configuration
    #[serde(default)]
    pub sink_retry: SinkRetryConfig,

    /// Checkpoint store configuration
    #[serde(default)]
    pub checkpoint: CheckpointConfig,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            window: WindowConfig::default(),
            watermark: WatermarkConfig::default(),
            batch: BatchConfig::default(),
            sink_retry: SinkRetryConfig::default(),
            checkpoint: CheckpointConfig::default(),
        }
    }
}

impl ProcessorConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.window.validate()?;
        self.watermark.validate()?;
        self.batch.validate()?;
        self.sink_retry.validate()?;
        Ok(())
    }
}

/// Window configuration
///
/// Only tumbling windows are supported: `slide_ms`, when given, must equal
/// `size_ms`. Validation rejects any other slide rather than silently
/// mis-assigning events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WindowConfig {
    /// Window size in milliseconds
    #[serde(default = "default_window_size")]
    pub size_ms: u64,

    /// Slide interval in milliseconds; must equal `size_ms` when set
    pub slide_ms: Option<u64>,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            size_ms: default_window_size(),
            slide_ms: None,
        }
    }
}

impl WindowConfig {
    /// Window size as a duration
    pub fn size(&self) -> Duration {
        Duration::from_millis(self.size_ms)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.size_ms == 0 {
            return Err(WindowError::InvalidWindowSize { size_ms: 0 }.into());
        }
        if let Some(slide_ms) = self.slide_ms {
            if slide_ms != self.size_ms {
                return Err(WindowError::UnsupportedSlide {
                    slide_ms,
                    size_ms: self.size_ms,
                }
                .into());
            }
        }
        Ok(())
    }
}

/// Watermark configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatermarkConfig {
    /// Grace period subtracted from the maximum observed event time, and also
    /// granted to a window past its nominal end before it closes
    #[serde(default = "default_allowed_lateness")]
    pub allowed_lateness_ms: u64,
}

impl Default for WatermarkConfig {
    fn default() -> Self {
        Self {
            allowed_lateness_ms: default_allowed_lateness(),
        }
    }
}

impl WatermarkConfig {
    /// Allowed lateness as a duration
    pub fn allowed_lateness(&self) -> Duration {
        Duration::from_millis(self.allowed_lateness_ms)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        Ok(())
    }
}

/// Micro-batch trigger configuration
///
/// A new batch is sealed either when the trigger interval elapses or when the
/// buffered event count reaches `max_batch_size`, whichever comes first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchConfig {
    /// Wall-clock trigger interval in milliseconds
    #[serde(default = "default_trigger_interval")]
    pub trigger_interval_ms: u64,

    /// Maximum number of events per batch
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            trigger_interval_ms: default_trigger_interval(),
            max_batch_size: default_max_batch_size(),
        }
    }
}

impl BatchConfig {
    /// Trigger interval as a duration
    pub fn trigger_interval(&self) -> Duration {
        Duration::from_millis(self.trigger_interval_ms)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.trigger_interval_ms == 0 {
            return Err(ProcessorError::Configuration {
                source: "trigger_interval_ms must be greater than 0".into(),
            });
        }
        if self.max_batch_size == 0 {
            return Err(ProcessorError::Configuration {
                source: "max_batch_size must be greater than 0".into(),
            });
        }
        Ok(())
    }
}

/// Sink delivery and retry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SinkRetryConfig {
    /// Maximum delivery attempts per sink per delivery round
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Base delay for exponential backoff (milliseconds)
    #[serde(default = "default_backoff_base")]
    pub backoff_base_ms: u64,

    /// Upper bound on a single backoff delay (milliseconds)
    #[serde(default = "default_backoff_max")]
    pub backoff_max_ms: u64,

    /// Maximum number of simultaneous sink deliveries per batch
    #[serde(default = "default_max_concurrent_sinks")]
    pub max_concurrent_sinks: usize,

    /// After this many failed delivery rounds the batch is dead-lettered and
    /// skipped with an alert; `None` holds the batch until resolved
    pub dead_letter_after_rounds: Option<u32>,
}

impl Default for SinkRetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base(),
            backoff_max_ms: default_backoff_max(),
            max_concurrent_sinks: default_max_concurrent_sinks(),
            dead_letter_after_rounds: None,
        }
    }
}

impl SinkRetryConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(ProcessorError::Configuration {
                source: "max_attempts must be greater than 0".into(),
            });
        }
        if self.max_concurrent_sinks == 0 {
            return Err(ProcessorError::Configuration {
                source: "max_concurrent_sinks must be greater than 0".into(),
            });
        }
        Ok(())
    }
}

/// Checkpoint store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    /// Directory for per-partition checkpoint files
    #[serde(default = "default_checkpoint_dir")]
    pub dir: PathBuf,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            dir: default_checkpoint_dir(),
        }
    }
}

/// Kafka consumer settings for the event source
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KafkaSourceConfig {
    /// Kafka bootstrap servers
    pub brokers: String,
    /// Topic carrying raw user-activity events
    pub topic: String,
    /// Consumer group id
    pub group_id: String,
    /// Poll timeout (milliseconds)
    #[serde(default = "default_poll_timeout")]
    pub poll_timeout_ms: u64,
}

/// Kafka producer settings for the republish sink
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KafkaRepublishConfig {
    /// Kafka bootstrap servers
    pub brokers: String,
    /// Topic for processed events
    pub topic: String,
    /// Client id for this producer
    #[serde(default = "default_republish_client_id")]
    pub client_id: String,
    /// Timeout for sending messages (milliseconds)
    #[serde(default = "default_send_timeout")]
    pub send_timeout_ms: u64,
}

/// Redis settings for the counters cache sink
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisCacheConfig {
    /// Redis connection URL
    pub url: String,
    /// Key prefix for namespace isolation
    #[serde(default = "default_cache_prefix")]
    pub key_prefix: String,
}

/// Relational warehouse settings for the durable store sink
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WarehouseConfig {
    /// Database connection URL
    pub url: String,
    /// Target table for closed-window rows
    #[serde(default = "default_warehouse_table")]
    pub table: String,
    /// Maximum pool connections
    #[serde(default = "default_warehouse_pool")]
    pub max_connections: u32,
}

fn default_window_size() -> u64 {
    300_000 // 5 minutes
}
fn default_allowed_lateness() -> u64 {
    600_000 // 10 minutes
}
fn default_trigger_interval() -> u64 {
    1_000
}
fn default_max_batch_size() -> usize {
    500
}
fn default_max_attempts() -> u32 {
    5
}
fn default_backoff_base() -> u64 {
    100
}
fn default_backoff_max() -> u64 {
    60_000
}
fn default_max_concurrent_sinks() -> usize {
    4
}
fn default_checkpoint_dir() -> PathBuf {
    PathBuf::from("/tmp/activity-processor/checkpoints")
}
fn default_poll_timeout() -> u64 {
    250
}
fn default_republish_client_id() -> String {
    "activity-processor".to_string()
}
fn default_send_timeout() -> u64 {
    30_000
}
fn default_cache_prefix() -> String {
    "user_activity:".to_string()
}
fn default_warehouse_table() -> String {
    "activity_window_aggregates".to_string()
}
fn default_warehouse_pool() -> u32 {
    5
}
