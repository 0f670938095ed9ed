//! Windowed aggregation and fan-out engine for user-activity event streams
//!
//! Raw activity events are validated, cut into sequenced micro-batches, and
//! folded into tumbling event-time windows under a watermark. Closed windows
//! and validated events fan out to a durable warehouse, a counter cache, and
//! a republish channel, all idempotent under the at-least-once replays the
//! checkpointing scheme produces.

pub mod aggregation;
pub mod batch;
pub mod checkpoint;
pub mod config;
pub mod error;
pub mod event;
pub mod pipeline;
pub mod router;
pub mod sink;
pub mod source;
pub mod watermark;
pub mod window;

// Re-export commonly used types
pub use aggregation::{Aggregator, MetricAccumulator};
pub use event::{ActivityEvent, EventType, GroupKey, RawActivityEvent};

pub use window::{
    ApplySummary, ClosedWindow, MetricId, TumblingWindowAssigner, WindowBounds, WindowId,
    WindowStore,
};

pub use error::{
    CheckpointError, ProcessorError, Result as ProcessorResult, SinkError, SourceError,
    WindowError,
};

pub use config::{
    BatchConfig, CheckpointConfig, KafkaRepublishConfig, KafkaSourceConfig, ProcessorConfig,
    RedisCacheConfig, SinkRetryConfig, WarehouseConfig, WatermarkConfig, WindowConfig,
};

pub use batch::{Batch, BatchSequencer};
pub use checkpoint::{Checkpoint, CheckpointStore, FileCheckpointStore, MemoryCheckpointStore};
pub use pipeline::{PartitionPipeline, PipelineStats};
pub use router::{RejectReason, RouteOutcome, RoutedEvent, Router};
pub use sink::{
    CacheSink, CounterStore, DurableStore, EventPublisher, FanOutCoordinator, FanOutOutcome,
    KafkaPublisher, MemoryCounterStore, MemoryPublisher, MemoryWarehouse, OperatorAlert,
    PostgresWarehouse, RedisCounterStore, RepublishSink, RepublishedEvent, Sink, SinkBatch,
    WarehouseSink, WindowRow,
};
pub use source::{ChannelSource, EventSource, KafkaEventSource, SourceRecord};
pub use watermark::{Watermark, WatermarkTracker};
