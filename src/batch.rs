//! Micro-batch sequencing
//!
//! Accepted events are buffered and cut into batches carrying a per-partition
//! sequence number. Batch ids are contiguous, starting at 1, and the id is
//! assigned at cut time, so a batch's identity is stable across replays. The
//! flush cadence itself is driven by the pipeline loop: a batch is cut when
//! the buffer reaches the size cap or the trigger interval elapses.

use crate::router::RoutedEvent;
use chrono::{DateTime, Utc};
use tracing::debug;

/// One micro-batch of accepted events for a single partition
#[derive(Debug, Clone)]
pub struct Batch {
    pub partition_id: u32,
    /// Contiguous per-partition sequence number, starting at 1
    pub batch_id: u64,
    pub events: Vec<RoutedEvent>,
    /// Wall-clock time the batch was cut
    pub ingest_time: DateTime<Utc>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

/// Buffers accepted events and cuts them into sequenced batches
#[derive(Debug)]
pub struct BatchSequencer {
    partition_id: u32,
    next_batch_id: u64,
    max_batch_size: usize,
    pending: Vec<RoutedEvent>,
}

impl BatchSequencer {
    pub fn new(partition_id: u32, max_batch_size: usize) -> Self {
        Self {
            partition_id,
            next_batch_id: 1,
            max_batch_size,
            pending: Vec::new(),
        }
    }

    /// Seeds the sequence after recovery so the next cut batch continues the
    /// committed run without gaps or reuse
    pub fn start_after(&mut self, last_committed_batch_id: u64) {
        self.next_batch_id = last_committed_batch_id + 1;
        debug!(
            partition_id = self.partition_id,
            next_batch_id = self.next_batch_id,
            "sequencer resumed after committed batch"
        );
    }

    /// Buffers an event, cutting a batch if the buffer hits the size cap
    pub fn push(&mut self, event: RoutedEvent) -> Option<Batch> {
        self.pending.push(event);
        if self.pending.len() >= self.max_batch_size {
            self.flush()
        } else {
            None
        }
    }

    /// Cuts a batch from whatever is buffered; returns None when empty
    ///
    /// An elapsed trigger interval with no buffered events produces no batch,
    /// so idle periods never consume sequence numbers.
    pub fn flush(&mut self) -> Option<Batch> {
        if self.pending.is_empty() {
            return None;
        }
        let batch = Batch {
            partition_id: self.partition_id,
            batch_id: self.next_batch_id,
            events: std::mem::take(&mut self.pending),
            ingest_time: Utc::now(),
        };
        self.next_batch_id += 1;
        debug!(
            partition_id = batch.partition_id,
            batch_id = batch.batch_id,
            events = batch.len(),
            "cut batch"
        );
        Some(batch)
    }

    /// Number of buffered events waiting for the next cut
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// The id the next cut batch will carry
    pub fn next_batch_id(&self) -> u64 {
        self.next_batch_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{ActivityEvent, EventType};
    use crate::window::MetricId;
    use chrono::TimeZone;

    fn routed(event_id: &str) -> RoutedEvent {
        let ts = Utc.timestamp_millis_opt(1_000_000).unwrap();
        RoutedEvent {
            event: ActivityEvent::new(event_id, "u1", EventType::PageView, ts),
            pipelines: MetricId::pipelines_for(EventType::PageView),
        }
    }

    #[test]
    fn test_flush_empty_produces_no_batch() {
        let mut seq = BatchSequencer::new(0, 10);
        assert!(seq.flush().is_none());
        assert_eq!(seq.next_batch_id(), 1);
    }

    #[test]
    fn test_batch_ids_contiguous() {
        let mut seq = BatchSequencer::new(0, 10);

        seq.push(routed("e1"));
        let b1 = seq.flush().unwrap();
        seq.push(routed("e2"));
        let b2 = seq.flush().unwrap();
        // An idle interval in between must not burn an id
        assert!(seq.flush().is_none());
        seq.push(routed("e3"));
        let b3 = seq.flush().unwrap();

        assert_eq!(b1.batch_id, 1);
        assert_eq!(b2.batch_id, 2);
        assert_eq!(b3.batch_id, 3);
    }

    #[test]
    fn test_push_cuts_at_size_cap() {
        let mut seq = BatchSequencer::new(3, 2);
        assert!(seq.push(routed("e1")).is_none());
        let batch = seq.push(routed("e2")).unwrap();

        assert_eq!(batch.partition_id, 3);
        assert_eq!(batch.len(), 2);
        assert_eq!(seq.pending_len(), 0);
    }

    #[test]
    fn test_start_after_resumes_sequence() {
        let mut seq = BatchSequencer::new(0, 10);
        seq.start_after(41);
        seq.push(routed("e1"));
        let batch = seq.flush().unwrap();
        assert_eq!(batch.batch_id, 42);
    }
}
