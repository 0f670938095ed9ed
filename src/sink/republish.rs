//! Republish sink: processed events back onto the bus
//!
//! Every accepted event of a committed batch is forwarded to a downstream
//! topic, enriched with the batch id and a processing timestamp. Messages are
//! keyed by `event_id`, so downstream consumers that key their own dedupe on
//! it can collapse replays.

use super::{Sink, SinkBatch};
use crate::config::KafkaRepublishConfig;
use crate::error::{SinkError, SinkResult};
use crate::event::ActivityEvent;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rdkafka::config::ClientConfig;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, info};

const SINK_NAME: &str = "republish";

/// Wire format of a forwarded event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepublishedEvent {
    #[serde(flatten)]
    pub event: ActivityEvent,
    /// Batch the event was committed in
    pub batch_id: u64,
    /// When the engine processed the event
    pub processed_at: DateTime<Utc>,
}

/// Transport behind the republish sink
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publishes one keyed message
    async fn publish(&self, key: &str, payload: &[u8]) -> SinkResult<()>;
}

/// Forwards a batch's accepted events downstream
pub struct RepublishSink {
    publisher: Box<dyn EventPublisher>,
}

impl RepublishSink {
    pub fn new(publisher: Box<dyn EventPublisher>) -> Self {
        Self { publisher }
    }
}

#[async_trait]
impl Sink for RepublishSink {
    fn name(&self) -> &'static str {
        SINK_NAME
    }

    async fn deliver(&self, batch: &SinkBatch) -> SinkResult<()> {
        if batch.events.is_empty() {
            return Ok(());
        }

        let processed_at = Utc::now();
        for routed in &batch.events {
            let forwarded = RepublishedEvent {
                event: routed.event.clone(),
                batch_id: batch.batch_id,
                processed_at,
            };
            let payload =
                serde_json::to_vec(&forwarded).map_err(|e| SinkError::Permanent {
                    sink: SINK_NAME.to_string(),
                    reason: format!("failed to encode event {}: {e}", routed.event.event_id),
                })?;
            self.publisher
                .publish(&routed.event.event_id, &payload)
                .await?;
        }

        debug!(
            partition_id = batch.partition_id,
            batch_id = batch.batch_id,
            events = batch.events.len(),
            "republished batch events"
        );
        Ok(())
    }
}

/// Kafka producer behind the republish sink
pub struct KafkaPublisher {
    producer: FutureProducer,
    topic: String,
    send_timeout: Duration,
}

impl KafkaPublisher {
    pub fn new(config: &KafkaRepublishConfig) -> SinkResult<Self> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &config.brokers)
            .set("client.id", &config.client_id)
            .set("acks", "all")
            .set("enable.idempotence", "true")
            .create()
            .map_err(|e| SinkError::Permanent {
                sink: SINK_NAME.to_string(),
                reason: format!("failed to create producer: {e}"),
            })?;

        info!(
            topic = %config.topic,
            brokers = %config.brokers,
            "republish producer created"
        );
        Ok(Self {
            producer,
            topic: config.topic.clone(),
            send_timeout: Duration::from_millis(config.send_timeout_ms),
        })
    }
}

#[async_trait]
impl EventPublisher for KafkaPublisher {
    async fn publish(&self, key: &str, payload: &[u8]) -> SinkResult<()> {
        let record = FutureRecord::to(&self.topic).key(key).payload(payload);

        self.producer
            .send(record, Timeout::After(self.send_timeout))
            .await
            .map_err(|(err, _)| classify_kafka(err))?;
        Ok(())
    }
}

/// Broker hiccups are worth retrying; malformed messages are not
fn classify_kafka(err: rdkafka::error::KafkaError) -> SinkError {
    use rdkafka::types::RDKafkaErrorCode;

    let permanent = matches!(
        err.rdkafka_error_code(),
        Some(RDKafkaErrorCode::MessageSizeTooLarge)
            | Some(RDKafkaErrorCode::InvalidMessage)
            | Some(RDKafkaErrorCode::UnknownTopic)
            | Some(RDKafkaErrorCode::UnknownTopicOrPartition)
    );
    if permanent {
        SinkError::Permanent {
            sink: SINK_NAME.to_string(),
            reason: err.to_string(),
        }
    } else {
        SinkError::Transient {
            sink: SINK_NAME.to_string(),
            reason: err.to_string(),
        }
    }
}

/// In-memory publisher recording messages for tests
#[derive(Default)]
pub struct MemoryPublisher {
    messages: Mutex<Vec<(String, Vec<u8>)>>,
}

impl MemoryPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// All published messages in order, as `(key, payload)`
    pub fn messages(&self) -> Vec<(String, Vec<u8>)> {
        self.messages
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Decodes all payloads as republished events
    pub fn decoded(&self) -> Vec<RepublishedEvent> {
        self.messages()
            .into_iter()
            .filter_map(|(_, payload)| serde_json::from_slice(&payload).ok())
            .collect()
    }
}

#[async_trait]
impl EventPublisher for MemoryPublisher {
    async fn publish(&self, key: &str, payload: &[u8]) -> SinkResult<()> {
        self.messages
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((key.to_string(), payload.to_vec()));
        Ok(())
    }
}
