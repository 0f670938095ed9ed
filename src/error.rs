//! Error types for the activity stream processor
//!
//! Two conditions from the processing contract are deliberately *not* errors:
//! malformed events and late events are dropped and counted by the router and
//! the window store respectively, and never abort a batch. Everything that can
//! abort a batch commit or a partition loop is modeled here.

use thiserror::Error;

/// Main processor error type
#[derive(Error, Debug)]
pub enum ProcessorError {
    /// Window configuration or assignment errors
    #[error("window error: {0}")]
    Window(#[from] WindowError),

    /// Sink delivery errors
    #[error("sink error: {0}")]
    Sink(#[from] SinkError),

    /// Checkpoint persistence errors. Fatal to the partition loop: progressing
    /// without a durable checkpoint risks duplicate-or-lost accounting beyond
    /// what idempotent sinks can mask.
    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    /// Event source errors
    #[error("source error: {0}")]
    Source(#[from] SourceError),

    /// Configuration errors
    #[error("configuration error: {source}")]
    Configuration {
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Serialization/deserialization errors
    #[error("serialization error: {0}")]
    Serialization(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error for unexpected conditions
    #[error("unexpected error: {0}")]
    Unexpected(String),
}

/// Window configuration and lifecycle errors
#[derive(Error, Debug)]
pub enum WindowError {
    /// Window size is invalid
    #[error("invalid window size: {size_ms}ms, must be greater than 0")]
    InvalidWindowSize { size_ms: u64 },

    /// Slide interval differs from window size; only tumbling windows are supported
    #[error("unsupported slide interval: {slide_ms}ms for window size {size_ms}ms, slide must equal size (tumbling)")]
    UnsupportedSlide { slide_ms: u64, size_ms: u64 },

    /// Allowed lateness is invalid
    #[error("invalid allowed lateness: {lateness_ms}ms")]
    InvalidLateness { lateness_ms: u64 },
}

/// Sink delivery errors
///
/// The transient/permanent split drives the fan-out retry policy: transient
/// failures are retried with exponential backoff, permanent failures are
/// surfaced on the operator alert channel immediately.
#[derive(Error, Debug, Clone)]
pub enum SinkError {
    /// Network/timeout style failure; safe to retry
    #[error("transient failure in sink '{sink}': {reason}")]
    Transient { sink: String, reason: String },

    /// Schema mismatch or similar failure that retrying will not fix
    #[error("permanent failure in sink '{sink}': {reason}")]
    Permanent { sink: String, reason: String },
}

impl SinkError {
    /// Name of the sink that produced this error
    pub fn sink(&self) -> &str {
        match self {
            SinkError::Transient { sink, .. } => sink,
            SinkError::Permanent { sink, .. } => sink,
        }
    }

    /// Whether the fan-out coordinator should retry this failure
    pub fn is_transient(&self) -> bool {
        matches!(self, SinkError::Transient { .. })
    }
}

/// Checkpoint store errors
#[derive(Error, Debug)]
pub enum CheckpointError {
    /// Failed to persist a checkpoint
    #[error("checkpoint persist failed for partition {partition_id}: {reason}")]
    PersistFailed { partition_id: u32, reason: String },

    /// Failed to load a checkpoint at startup
    #[error("checkpoint load failed for partition {partition_id}: {reason}")]
    LoadFailed { partition_id: u32, reason: String },

    /// Checkpoint data could not be decoded
    #[error("corrupt checkpoint for partition {partition_id}: {reason}")]
    Corrupt { partition_id: u32, reason: String },
}

/// Event source errors
#[derive(Error, Debug)]
pub enum SourceError {
    /// Polling the transport failed
    #[error("poll failed for partition {partition_id}: {reason}")]
    PollFailed { partition_id: u32, reason: String },

    /// Seeking to a persisted offset failed
    #[error("seek to offset {offset} failed for partition {partition_id}: {reason}")]
    SeekFailed {
        partition_id: u32,
        offset: i64,
        reason: String,
    },
}

/// Result type alias for processor operations
pub type Result<T> = std::result::Result<T, ProcessorError>;

/// Result type alias for window operations
pub type WindowResult<T> = std::result::Result<T, WindowError>;

/// Result type alias for sink operations
pub type SinkResult<T> = std::result::Result<T, SinkError>;

/// Result type alias for checkpoint operations
pub type CheckpointResult<T> = std::result::Result<T, CheckpointError>;

/// Result type alias for source operations
pub type SourceResult<T> = std::result::Result<T, SourceError>;

impl From<serde_json::Error> for ProcessorError {
    fn from(err: serde_json::Error) -> Self {
        ProcessorError::Serialization(err.to_string())
    }
}

impl From<bincode::Error> for ProcessorError {
    fn from(err: bincode::Error) -> Self {
        ProcessorError::Serialization(err.to_string())
    }
}
