//! Terminal handler for dead-letter queues.
//!
//! The sink never re-enqueues and never fails: whatever arrives is logged and
//! kept in a bounded ring for operators.

use std::collections::VecDeque;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{error, warn};
use tripful_core::{DeadLetterPayload, JobId, JobView, QueueName};

use super::dispatcher::{HandlerServices, JobHandler};
use crate::service::service_names;

/// Default number of records kept by [`DeadLetterLog`].
pub const DEFAULT_CAPACITY: usize = 1000;

/// One job that reached a dead-letter queue.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterRecord {
    /// Dead-letter queue the entry arrived on.
    pub dlq: QueueName,
    /// Id of the entry on the dead-letter queue.
    pub job_id: JobId,
    /// `None` when the entry did not carry a readable dead-letter payload.
    pub original_queue: Option<QueueName>,
    pub original_job_id: Option<JobId>,
    pub payload: serde_json::Value,
    pub error: Option<String>,
    pub recorded_at: u64,
}

struct Ring {
    records: VecDeque<DeadLetterRecord>,
    total: u64,
}

/// Bounded in-memory history of dead-lettered jobs, newest last.
pub struct DeadLetterLog {
    capacity: usize,
    ring: Mutex<Ring>,
}

impl std::fmt::Debug for DeadLetterLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeadLetterLog")
            .field("capacity", &self.capacity)
            .field("len", &self.len())
            .finish()
    }
}

impl DeadLetterLog {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            ring: Mutex::new(Ring {
                records: VecDeque::with_capacity(capacity),
                total: 0,
            }),
        }
    }

    pub fn record(&self, record: DeadLetterRecord) {
        let mut ring = self.ring.lock();
        if ring.records.len() == self.capacity {
            ring.records.pop_front();
        }
        ring.records.push_back(record);
        ring.total += 1;
    }

    /// Up to `limit` records, newest first.
    #[must_use]
    pub fn recent(&self, limit: usize) -> Vec<DeadLetterRecord> {
        self.ring
            .lock()
            .records
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.ring.lock().records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Records ever seen, including those evicted from the ring.
    #[must_use]
    pub fn total_recorded(&self) -> u64 {
        self.ring.lock().total
    }
}

impl Default for DeadLetterLog {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

// ---------------------------------------------------------------------------
// DeadLetterSink
// ---------------------------------------------------------------------------

/// Handler bound to every dead-letter queue.
///
/// Records into the `dead-letter-log` service when it is available.
#[derive(Debug, Default, Clone, Copy)]
pub struct DeadLetterSink;

const SINK_DEPENDENCIES: &[&str] = &[service_names::DEAD_LETTER_LOG, service_names::CLOCK];

#[async_trait]
impl JobHandler for DeadLetterSink {
    fn dependencies(&self) -> &[&'static str] {
        SINK_DEPENDENCIES
    }

    async fn handle(&self, job: &JobView, services: &HandlerServices) -> anyhow::Result<()> {
        let parsed = job.payload_as::<DeadLetterPayload>();

        error!(
            queue = %job.queue,
            job_id = %job.id,
            data = %job.payload,
            "Job moved to dead letter queue"
        );

        let recorded_at = services.clock().map_or(0, |clock| clock.now());
        let record = match parsed {
            Ok(entry) => DeadLetterRecord {
                dlq: job.queue,
                job_id: job.id,
                original_queue: Some(entry.original_queue),
                original_job_id: Some(entry.job_id),
                payload: entry.payload,
                error: Some(entry.error),
                recorded_at,
            },
            Err(err) => {
                warn!(job_id = %job.id, error = %err, "dead-letter entry has unexpected shape, recording raw");
                DeadLetterRecord {
                    dlq: job.queue,
                    job_id: job.id,
                    original_queue: None,
                    original_job_id: None,
                    payload: job.payload.clone(),
                    error: None,
                    recorded_at,
                }
            }
        };

        match services.get::<DeadLetterLog>(service_names::DEAD_LETTER_LOG) {
            Some(log) => log.record(record),
            None => warn!(job_id = %job.id, "no dead-letter log available, entry only logged"),
        }
        Ok(())
    }
}
