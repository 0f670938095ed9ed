//! Partition processing pipeline
//!
//! One [`PartitionPipeline`] owns everything for a single source partition:
//! router, sequencer, watermark tracker, window store, sink fan-out, and
//! checkpointing. Partitions share nothing mutable, so any number of them can
//! run in parallel, each on its own task.
//!
//! Per batch, the stages run strictly in order:
//!
//! ```text
//! poll -> route -> sequence -> apply to windows -> advance watermark
//!      -> evict closed -> fan out to sinks -> commit checkpoint
//! ```
//!
//! The checkpoint commit is always last. A crash anywhere before it replays
//! the batch on restart, and every stage downstream of the sequencer is
//! idempotent under that replay.

mod executor;

pub use executor::{PartitionPipeline, PipelineStats};
