//! Event sources
//!
//! A source hands the pipeline raw events together with their transport
//! offsets. Delivery is at-least-once: after a crash the source is sought
//! back to the last committed offset and re-delivers everything after it.
//! [`KafkaEventSource`] is the production implementation; [`ChannelSource`]
//! feeds the pipeline from an in-process channel for tests and replays.

use crate::error::{SourceError, SourceResult};
use crate::event::RawActivityEvent;
use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::{Message, Offset};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::KafkaSourceConfig;

/// A raw event paired with its transport offset
#[derive(Debug, Clone)]
pub struct SourceRecord {
    pub raw: RawActivityEvent,
    /// Monotonically increasing offset within the partition
    pub offset: i64,
}

/// Supplies raw events to one partition pipeline
#[async_trait]
pub trait EventSource: Send {
    /// Polls for up to `max` records, waiting at most `timeout` for the first
    ///
    /// An empty vec means the source was idle for the whole timeout.
    async fn poll(&mut self, max: usize, timeout: Duration) -> SourceResult<Vec<SourceRecord>>;

    /// Repositions the source so the next poll starts at `offset`
    async fn seek(&mut self, offset: i64) -> SourceResult<()>;
}

/// In-process source backed by a bounded channel
///
/// Records arrive pre-assigned with offsets. Seeking filters out anything
/// below the sought offset, mirroring how a replayed transport would skip
/// already-committed records.
pub struct ChannelSource {
    partition_id: u32,
    receiver: mpsc::Receiver<SourceRecord>,
    resume_from: i64,
}

impl ChannelSource {
    pub fn new(partition_id: u32, receiver: mpsc::Receiver<SourceRecord>) -> Self {
        Self {
            partition_id,
            receiver,
            resume_from: i64::MIN,
        }
    }

    /// Creates a source together with a sender for feeding it
    pub fn with_capacity(partition_id: u32, capacity: usize) -> (mpsc::Sender<SourceRecord>, Self) {
        let (tx, rx) = mpsc::channel(capacity);
        (tx, Self::new(partition_id, rx))
    }
}

#[async_trait]
impl EventSource for ChannelSource {
    async fn poll(&mut self, max: usize, timeout: Duration) -> SourceResult<Vec<SourceRecord>> {
        let mut records = Vec::new();

        // Wait for the first record, then drain whatever is ready.
        match tokio::time::timeout(timeout, self.receiver.recv()).await {
            Ok(Some(record)) => {
                if record.offset >= self.resume_from {
                    records.push(record);
                }
            }
            Ok(None) | Err(_) => return Ok(records),
        }

        while records.len() < max {
            match self.receiver.try_recv() {
                Ok(record) => {
                    if record.offset >= self.resume_from {
                        records.push(record);
                    }
                }
                Err(_) => break,
            }
        }

        Ok(records)
    }

    async fn seek(&mut self, offset: i64) -> SourceResult<()> {
        debug!(
            partition_id = self.partition_id,
            offset, "channel source sought"
        );
        self.resume_from = offset;
        Ok(())
    }
}

/// Kafka-backed event source for one topic partition
///
/// Payloads are JSON; records that fail to decode are surfaced as empty raw
/// events so the router rejects and counts them rather than the poll failing.
pub struct KafkaEventSource {
    consumer: StreamConsumer,
    topic: String,
    partition_id: u32,
    poll_timeout: Duration,
}

impl KafkaEventSource {
    pub fn new(config: &KafkaSourceConfig, partition_id: u32) -> SourceResult<Self> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &config.brokers)
            .set("group.id", &config.group_id)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "earliest")
            .create()
            .map_err(|e| SourceError::PollFailed {
                partition_id,
                reason: format!("failed to create consumer: {e}"),
            })?;

        consumer
            .subscribe(&[config.topic.as_str()])
            .map_err(|e| SourceError::PollFailed {
                partition_id,
                reason: format!("failed to subscribe to {}: {e}", config.topic),
            })?;

        info!(
            partition_id,
            topic = %config.topic,
            brokers = %config.brokers,
            "kafka source subscribed"
        );

        Ok(Self {
            consumer,
            topic: config.topic.clone(),
            partition_id,
            poll_timeout: Duration::from_millis(config.poll_timeout_ms),
        })
    }

    fn decode(&self, payload: Option<&[u8]>) -> RawActivityEvent {
        match payload {
            Some(bytes) => serde_json::from_slice(bytes).unwrap_or_else(|e| {
                warn!(
                    partition_id = self.partition_id,
                    error = %e,
                    "undecodable payload, passing empty event to router"
                );
                RawActivityEvent::default()
            }),
            None => {
                warn!(partition_id = self.partition_id, "message with no payload");
                RawActivityEvent::default()
            }
        }
    }
}

#[async_trait]
impl EventSource for KafkaEventSource {
    async fn poll(&mut self, max: usize, timeout: Duration) -> SourceResult<Vec<SourceRecord>> {
        let mut records = Vec::new();
        let deadline = tokio::time::Instant::now() + timeout;

        while records.len() < max {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                break;
            }
            let wait = remaining.min(self.poll_timeout);

            match tokio::time::timeout(wait, self.consumer.recv()).await {
                Ok(Ok(message)) => {
                    records.push(SourceRecord {
                        raw: self.decode(message.payload()),
                        offset: message.offset(),
                    });
                }
                Ok(Err(e)) => {
                    return Err(SourceError::PollFailed {
                        partition_id: self.partition_id,
                        reason: e.to_string(),
                    })
                }
                // Idle for this slice of the deadline
                Err(_) => break,
            }
        }

        Ok(records)
    }

    async fn seek(&mut self, offset: i64) -> SourceResult<()> {
        self.consumer
            .seek(
                &self.topic,
                self.partition_id as i32,
                Offset::Offset(offset),
                Duration::from_secs(10),
            )
            .map_err(|e| SourceError::SeekFailed {
                partition_id: self.partition_id,
                offset,
                reason: e.to_string(),
            })?;

        info!(
            partition_id = self.partition_id,
            topic = %self.topic,
            offset,
            "kafka source sought"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(offset: i64) -> SourceRecord {
        SourceRecord {
            raw: RawActivityEvent {
                user_id: Some(format!("u-{offset}")),
                event_type: Some("page_view".into()),
                event_time: Some("2026-08-30T12:00:00Z".into()),
                ..Default::default()
            },
            offset,
        }
    }

    #[tokio::test]
    async fn test_channel_source_polls_available_records() {
        let (tx, mut source) = ChannelSource::with_capacity(0, 16);
        for offset in 0..3 {
            tx.send(record(offset)).await.unwrap();
        }

        let records = source
            .poll(10, Duration::from_millis(50))
            .await
            .unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].offset, 0);
        assert_eq!(records[2].offset, 2);
    }

    #[tokio::test]
    async fn test_channel_source_respects_max() {
        let (tx, mut source) = ChannelSource::with_capacity(0, 16);
        for offset in 0..5 {
            tx.send(record(offset)).await.unwrap();
        }

        let records = source
            .poll(2, Duration::from_millis(50))
            .await
            .unwrap();
        assert_eq!(records.len(), 2);
    }

    #[tokio::test]
    async fn test_channel_source_idle_returns_empty() {
        let (_tx, mut source) = ChannelSource::with_capacity(0, 16);
        let records = source
            .poll(10, Duration::from_millis(10))
            .await
            .unwrap();
        assert!(records.is_empty());
    }

    #[tokio::test]
    async fn test_channel_source_seek_skips_committed_records() {
        let (tx, mut source) = ChannelSource::with_capacity(0, 16);
        source.seek(2).await.unwrap();

        for offset in 0..4 {
            tx.send(record(offset)).await.unwrap();
        }

        let records = source
            .poll(10, Duration::from_millis(50))
            .await
            .unwrap();
        let offsets: Vec<i64> = records.iter().map(|r| r.offset).collect();
        assert_eq!(offsets, vec![2, 3]);
    }
}
