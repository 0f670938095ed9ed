//! Sink fan-out with retries and operator alerting
//!
//! Every committed batch is delivered to all configured sinks before the
//! checkpoint moves. Delivery runs concurrently under a semaphore, each sink
//! retrying transient failures with exponential backoff. A sink that exhausts
//! a full round of attempts raises an operator alert; with a dead-letter
//! limit configured, a persistently failing batch is eventually parked so the
//! partition can make progress again.
//!
//! Sinks must be idempotent: the pipeline replays uncommitted batches after a
//! crash, and a batch may reach a sink more than once.

pub mod cache;
pub mod republish;
pub mod warehouse;

pub use cache::{CacheSink, CounterStore, MemoryCounterStore, RedisCounterStore};
pub use republish::{EventPublisher, KafkaPublisher, MemoryPublisher, RepublishSink, RepublishedEvent};
pub use warehouse::{DurableStore, MemoryWarehouse, PostgresWarehouse, WarehouseSink, WindowRow};

use crate::config::SinkRetryConfig;
use crate::error::{SinkError, SinkResult};
use crate::router::RoutedEvent;
use crate::watermark::Watermark;
use crate::window::ClosedWindow;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Everything the sinks receive for one batch
#[derive(Debug, Clone)]
pub struct SinkBatch {
    pub partition_id: u32,
    pub batch_id: u64,
    /// Windows closed by this batch's watermark advance
    pub windows: Vec<ClosedWindow>,
    /// The batch's accepted events, for republishing
    pub events: Vec<RoutedEvent>,
    /// Watermark after this batch
    pub watermark: Watermark,
}

impl SinkBatch {
    /// True when there is nothing for any sink to do
    pub fn is_empty(&self) -> bool {
        self.windows.is_empty() && self.events.is_empty()
    }
}

/// A delivery target for committed batches
#[async_trait]
pub trait Sink: Send + Sync {
    /// Stable name used in logs, alerts, and errors
    fn name(&self) -> &'static str;

    /// Delivers one batch; must be a no-op when the batch was already applied
    async fn deliver(&self, batch: &SinkBatch) -> SinkResult<()>;
}

/// Out-of-band notifications for the operator
#[derive(Debug, Clone)]
pub enum OperatorAlert {
    /// A sink exhausted a full round of retry attempts and will be retried
    SinkStalled {
        sink: String,
        partition_id: u32,
        batch_id: u64,
        rounds: u32,
        reason: String,
    },
    /// A sink returned an error retries cannot fix
    SinkFailedPermanently {
        sink: String,
        partition_id: u32,
        batch_id: u64,
        reason: String,
    },
    /// A batch was parked after repeated failure; the partition moved on
    BatchDeadLettered {
        partition_id: u32,
        batch_id: u64,
        sinks: Vec<String>,
    },
}

/// Result of fanning a batch out to all sinks
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FanOutOutcome {
    /// Every sink accepted the batch
    Delivered,
    /// Some sinks never accepted it; the batch was parked for those sinks
    DeadLettered { failed_sinks: Vec<String> },
}

/// Delivers batches to all sinks with bounded concurrency and retries
pub struct FanOutCoordinator {
    sinks: Vec<Arc<dyn Sink>>,
    retry: SinkRetryConfig,
    semaphore: Arc<Semaphore>,
    alerts: mpsc::UnboundedSender<OperatorAlert>,
}

impl FanOutCoordinator {
    pub fn new(
        sinks: Vec<Arc<dyn Sink>>,
        retry: SinkRetryConfig,
        alerts: mpsc::UnboundedSender<OperatorAlert>,
    ) -> Self {
        let semaphore = Arc::new(Semaphore::new(retry.max_concurrent_sinks));
        Self {
            sinks,
            retry,
            semaphore,
            alerts,
        }
    }

    /// Delivers a batch to every sink, returning once all have settled
    ///
    /// Succeeds only when every sink accepted the batch or was explicitly
    /// dead-lettered. A permanent sink failure with no dead-letter limit
    /// configured is unrecoverable and propagates as an error; the caller
    /// must not checkpoint past the batch.
    pub async fn deliver_all(&self, batch: &SinkBatch) -> SinkResult<FanOutOutcome> {
        if batch.is_empty() || self.sinks.is_empty() {
            return Ok(FanOutOutcome::Delivered);
        }

        let shared = Arc::new(batch.clone());
        let mut tasks = JoinSet::new();

        for sink in &self.sinks {
            let sink = Arc::clone(sink);
            let batch = Arc::clone(&shared);
            let semaphore = Arc::clone(&self.semaphore);
            let retry = self.retry.clone();
            let alerts = self.alerts.clone();

            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                deliver_with_retry(sink, &batch, &retry, &alerts).await
            });
        }

        let mut failed_sinks = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            let result = joined.map_err(|e| SinkError::Permanent {
                sink: "fanout".to_string(),
                reason: format!("sink task panicked: {e}"),
            })?;
            match result {
                SinkDelivery::Delivered => {}
                SinkDelivery::GaveUp(sink_name) => failed_sinks.push(sink_name),
                SinkDelivery::Unrecoverable(err) => return Err(err),
            }
        }

        if failed_sinks.is_empty() {
            debug!(
                partition_id = batch.partition_id,
                batch_id = batch.batch_id,
                sinks = self.sinks.len(),
                "batch delivered to all sinks"
            );
            Ok(FanOutOutcome::Delivered)
        } else {
            failed_sinks.sort();
            error!(
                partition_id = batch.partition_id,
                batch_id = batch.batch_id,
                sinks = ?failed_sinks,
                "dead-lettering batch after repeated sink failure"
            );
            let _ = self.alerts.send(OperatorAlert::BatchDeadLettered {
                partition_id: batch.partition_id,
                batch_id: batch.batch_id,
                sinks: failed_sinks.clone(),
            });
            Ok(FanOutOutcome::DeadLettered { failed_sinks })
        }
    }
}

enum SinkDelivery {
    Delivered,
    /// Dead-letter limit reached for this sink
    GaveUp(String),
    /// Permanent failure with no dead-letter limit configured
    Unrecoverable(SinkError),
}

async fn deliver_with_retry(
    sink: Arc<dyn Sink>,
    batch: &SinkBatch,
    retry: &SinkRetryConfig,
    alerts: &mpsc::UnboundedSender<OperatorAlert>,
) -> SinkDelivery {
    let mut rounds = 0u32;

    loop {
        let mut last_transient: Option<SinkError> = None;

        for attempt in 0..retry.max_attempts {
            match sink.deliver(batch).await {
                Ok(()) => return SinkDelivery::Delivered,
                Err(err) if err.is_transient() => {
                    let delay = backoff_delay(retry, attempt);
                    warn!(
                        sink = sink.name(),
                        partition_id = batch.partition_id,
                        batch_id = batch.batch_id,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient sink failure, backing off"
                    );
                    last_transient = Some(err);
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    error!(
                        sink = sink.name(),
                        partition_id = batch.partition_id,
                        batch_id = batch.batch_id,
                        error = %err,
                        "permanent sink failure"
                    );
                    let _ = alerts.send(OperatorAlert::SinkFailedPermanently {
                        sink: sink.name().to_string(),
                        partition_id: batch.partition_id,
                        batch_id: batch.batch_id,
                        reason: err.to_string(),
                    });
                    return if retry.dead_letter_after_rounds.is_some() {
                        SinkDelivery::GaveUp(sink.name().to_string())
                    } else {
                        SinkDelivery::Unrecoverable(err)
                    };
                }
            }
        }

        rounds += 1;
        let reason = last_transient
            .map(|e| e.to_string())
            .unwrap_or_else(|| "unknown".to_string());
        let _ = alerts.send(OperatorAlert::SinkStalled {
            sink: sink.name().to_string(),
            partition_id: batch.partition_id,
            batch_id: batch.batch_id,
            rounds,
            reason,
        });

        if let Some(limit) = retry.dead_letter_after_rounds {
            if rounds >= limit {
                info!(
                    sink = sink.name(),
                    partition_id = batch.partition_id,
                    batch_id = batch.batch_id,
                    rounds,
                    "giving up on sink for this batch"
                );
                return SinkDelivery::GaveUp(sink.name().to_string());
            }
        }
    }
}

/// Exponential backoff: `base * 2^attempt`, capped at the configured max
fn backoff_delay(retry: &SinkRetryConfig, attempt: u32) -> Duration {
    let exp = retry
        .backoff_base_ms
        .saturating_mul(1u64 << attempt.min(20));
    Duration::from_millis(exp.min(retry.backoff_max_ms))
}
