//! The per-partition batch processing loop

use crate::batch::{Batch, BatchSequencer};
use crate::checkpoint::{Checkpoint, CheckpointStore};
use crate::config::ProcessorConfig;
use crate::error::Result;
use crate::router::{RouteOutcome, Router};
use crate::sink::{FanOutCoordinator, FanOutOutcome, OperatorAlert, Sink, SinkBatch};
use crate::source::EventSource;
use crate::watermark::WatermarkTracker;
use crate::window::WindowStore;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

/// Upper bound on a single source poll, so shutdown and trigger checks stay
/// responsive even when the trigger interval is long
const POLL_SLICE: Duration = Duration::from_millis(50);

/// Counters exposed by a running pipeline
#[derive(Debug, Default)]
pub struct PipelineStats {
    batches_committed: AtomicU64,
    events_accepted: AtomicU64,
    events_rejected: AtomicU64,
    late_dropped: AtomicU64,
    windows_closed: AtomicU64,
    batches_dead_lettered: AtomicU64,
}

impl PipelineStats {
    pub fn batches_committed(&self) -> u64 {
        self.batches_committed.load(Ordering::Relaxed)
    }

    pub fn events_accepted(&self) -> u64 {
        self.events_accepted.load(Ordering::Relaxed)
    }

    pub fn events_rejected(&self) -> u64 {
        self.events_rejected.load(Ordering::Relaxed)
    }

    pub fn late_dropped(&self) -> u64 {
        self.late_dropped.load(Ordering::Relaxed)
    }

    pub fn windows_closed(&self) -> u64 {
        self.windows_closed.load(Ordering::Relaxed)
    }

    pub fn batches_dead_lettered(&self) -> u64 {
        self.batches_dead_lettered.load(Ordering::Relaxed)
    }
}

/// Owns and drives all processing for one partition
pub struct PartitionPipeline<S: EventSource> {
    partition_id: u32,
    config: ProcessorConfig,
    source: S,
    router: Router,
    sequencer: BatchSequencer,
    watermark: WatermarkTracker,
    store: WindowStore,
    fanout: FanOutCoordinator,
    checkpoints: Arc<dyn CheckpointStore>,
    stats: Arc<PipelineStats>,
    /// Offset of the last record folded into a batch
    last_offset: i64,
}

impl<S: EventSource> PartitionPipeline<S> {
    pub fn new(
        partition_id: u32,
        config: ProcessorConfig,
        source: S,
        sinks: Vec<Arc<dyn Sink>>,
        checkpoints: Arc<dyn CheckpointStore>,
        alerts: mpsc::UnboundedSender<OperatorAlert>,
    ) -> Result<Self> {
        config.validate()?;

        let sequencer = BatchSequencer::new(partition_id, config.batch.max_batch_size);
        let watermark = WatermarkTracker::new(config.watermark.allowed_lateness_ms as i64);
        let store = WindowStore::new(
            config.window.size_ms,
            config.watermark.allowed_lateness_ms as i64,
        );
        let fanout = FanOutCoordinator::new(sinks, config.sink_retry.clone(), alerts);

        Ok(Self {
            partition_id,
            config,
            source,
            router: Router::new(),
            sequencer,
            watermark,
            store,
            fanout,
            checkpoints,
            stats: Arc::new(PipelineStats::default()),
            last_offset: -1,
        })
    }

    pub fn stats(&self) -> Arc<PipelineStats> {
        Arc::clone(&self.stats)
    }

    /// Loads the last checkpoint and positions every stage after it
    ///
    /// Window state is not snapshotted. The source resumes after the
    /// checkpointed offset, so only uncommitted batches are replayed;
    /// contributions committed batches made to still-open windows are not
    /// reconstructed after a restart.
    pub async fn recover(&mut self) -> Result<()> {
        let Some(checkpoint) = self.checkpoints.load(self.partition_id).await? else {
            info!(partition_id = self.partition_id, "no checkpoint, starting fresh");
            return Ok(());
        };

        self.sequencer.start_after(checkpoint.last_committed_batch_id);
        self.watermark.restore(checkpoint.watermark);
        self.last_offset = checkpoint.source_offset;
        self.source.seek(checkpoint.source_offset + 1).await?;

        info!(
            partition_id = self.partition_id,
            last_committed_batch_id = checkpoint.last_committed_batch_id,
            watermark = %checkpoint.watermark,
            source_offset = checkpoint.source_offset,
            "recovered from checkpoint"
        );
        Ok(())
    }

    /// Runs the loop until the shutdown signal flips to true
    ///
    /// Shutdown flushes and fully commits the in-flight batch before
    /// returning; a batch is never checkpointed partially delivered.
    pub async fn run(&mut self, shutdown: watch::Receiver<bool>) -> Result<()> {
        self.recover().await?;

        let trigger = Duration::from_millis(self.config.batch.trigger_interval_ms);
        let mut last_cut = tokio::time::Instant::now();

        info!(partition_id = self.partition_id, "pipeline running");

        loop {
            if *shutdown.borrow() {
                if let Some(batch) = self.sequencer.flush() {
                    self.process_batch(batch).await?;
                }
                info!(partition_id = self.partition_id, "pipeline stopped");
                return Ok(());
            }

            let budget = trigger
                .saturating_sub(last_cut.elapsed())
                .min(POLL_SLICE)
                .max(Duration::from_millis(1));
            let room = self
                .config
                .batch
                .max_batch_size
                .saturating_sub(self.sequencer.pending_len())
                .max(1);

            let records = self.source.poll(room, budget).await?;
            for record in records {
                self.last_offset = record.offset;
                match self.router.route(record.raw) {
                    RouteOutcome::Accepted(routed) => {
                        self.stats.events_accepted.fetch_add(1, Ordering::Relaxed);
                        if let Some(batch) = self.sequencer.push(routed) {
                            self.process_batch(batch).await?;
                            last_cut = tokio::time::Instant::now();
                        }
                    }
                    RouteOutcome::Rejected(_) => {
                        self.stats.events_rejected.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }

            if last_cut.elapsed() >= trigger {
                if let Some(batch) = self.sequencer.flush() {
                    self.process_batch(batch).await?;
                }
                last_cut = tokio::time::Instant::now();
            }
        }
    }

    /// Applies one batch through every stage, committing the checkpoint last
    pub async fn process_batch(&mut self, batch: Batch) -> Result<()> {
        let batch_id = batch.batch_id;

        // Admission is judged against the watermark as of the previous batch;
        // the advance happens once per batch, before closure evaluation. A
        // batch can therefore carry both a window's last events and the event
        // that closes it.
        let admission_watermark = self.watermark.current();
        for routed in &batch.events {
            self.watermark.observe(routed.event.event_time.timestamp_millis());
        }

        let summary = self.store.apply(batch_id, &batch.events, admission_watermark);
        self.stats
            .late_dropped
            .fetch_add(summary.late_dropped, Ordering::Relaxed);

        self.watermark.advance();
        let watermark = self.watermark.current();
        let closed = self.store.evict_closed(watermark);
        self.stats
            .windows_closed
            .fetch_add(closed.len() as u64, Ordering::Relaxed);

        let sink_batch = SinkBatch {
            partition_id: self.partition_id,
            batch_id,
            windows: closed,
            events: batch.events,
            watermark,
        };

        match self.fanout.deliver_all(&sink_batch).await {
            Ok(FanOutOutcome::Delivered) => {}
            Ok(FanOutOutcome::DeadLettered { failed_sinks }) => {
                self.stats
                    .batches_dead_lettered
                    .fetch_add(1, Ordering::Relaxed);
                warn!(
                    partition_id = self.partition_id,
                    batch_id,
                    sinks = ?failed_sinks,
                    "batch dead-lettered, committing past it"
                );
            }
            Err(err) => {
                error!(
                    partition_id = self.partition_id,
                    batch_id,
                    error = %err,
                    "unrecoverable sink failure, halting partition"
                );
                return Err(err.into());
            }
        }

        // Commit is the last action for a batch. A checkpoint failure is
        // fatal to this partition's loop.
        let checkpoint = Checkpoint::new(self.partition_id, batch_id, watermark, self.last_offset);
        self.checkpoints.save(&checkpoint).await?;
        self.stats.batches_committed.fetch_add(1, Ordering::Relaxed);

        Ok(())
    }

    /// The watermark tracker's current value, for inspection
    pub fn current_watermark(&self) -> crate::watermark::Watermark {
        self.watermark.current()
    }

    /// Open windows currently held by this partition
    pub fn open_windows(&self) -> usize {
        self.store.open_count()
    }
}
