//! Durable queue capability consumed by [`JobQueue`](super::JobQueue).
//!
//! A [`JobStore`] only knows how to insert, claim, and conditionally update job
//! records atomically. Retry policy, dead-letter routing, and schema checks
//! live in the queue; the store never interprets payloads.

use async_trait::async_trait;
use serde::Serialize;
use tripful_core::{Job, JobId, JobState, QueueName};

/// Result of inserting a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// A new record was written.
    Inserted(JobId),
    /// A non-terminal job with the same `(queue, singleton_key)` already exists.
    Duplicate(JobId),
}

impl InsertOutcome {
    /// The id callers should hand back to producers.
    #[must_use]
    pub fn id(self) -> JobId {
        match self {
            InsertOutcome::Inserted(id) | InsertOutcome::Duplicate(id) => id,
        }
    }
}

/// State an in-flight job moves to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NextState {
    Completed,
    /// Back to pending, eligible again at `scheduled_at`.
    Retry { scheduled_at: u64, error: String },
    DeadLettered { error: String },
}

/// Compare-and-swap update of one in-flight job.
///
/// Applies only if the job is still `InFlight` with `attempts ==
/// expected_attempts`, i.e. the same claim the caller holds. A claim that was
/// reclaimed and handed to another worker in the meantime is stale.
#[derive(Debug, Clone)]
pub struct Transition {
    pub id: JobId,
    pub expected_attempts: u32,
    pub next: NextState,
    pub at: u64,
    /// Inserted in the same atomic step when the transition applies.
    pub follow_up: Option<Job>,
}

/// Result of [`JobStore::apply`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionOutcome {
    Applied,
    /// The job exists but is not in the expected claim.
    Stale(JobState),
    NotFound,
}

/// Per-queue job counts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub queue: QueueName,
    pub pending: u64,
    pub in_flight: u64,
    pub completed: u64,
    pub dead_lettered: u64,
}

impl QueueStats {
    #[must_use]
    pub fn empty(queue: QueueName) -> Self {
        Self {
            queue,
            pending: 0,
            in_flight: 0,
            completed: 0,
            dead_lettered: 0,
        }
    }

    pub fn count(&mut self, state: JobState) {
        match state {
            JobState::Pending => self.pending += 1,
            JobState::InFlight => self.in_flight += 1,
            JobState::Completed => self.completed += 1,
            JobState::DeadLettered => self.dead_lettered += 1,
        }
    }
}

/// Pluggable persistence backend for the job queue.
/// Implementations: in-memory, redb (embedded), `PostgreSQL`.
///
/// Every method is atomic with respect to every other call on the same store.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Persist a new pending job, honouring `singleton_key` de-duplication.
    async fn insert(&self, job: Job) -> anyhow::Result<InsertOutcome>;

    /// Claim up to `max_batch` due jobs in (`scheduled_at`, `seq`) order.
    ///
    /// Each returned job has been moved to `InFlight` via [`Job::mark_claimed`];
    /// no other caller can receive it until it is released or its lease expires.
    async fn claim_due(&self, now: u64, max_batch: usize) -> anyhow::Result<Vec<Job>>;

    /// Load a single job by id.
    async fn get(&self, id: JobId) -> anyhow::Result<Option<Job>>;

    /// Conditionally move an in-flight job to its next state.
    async fn apply(&self, transition: Transition) -> anyhow::Result<TransitionOutcome>;

    /// In-flight jobs whose lease ended at or before `now`.
    async fn expired_leases(&self, now: u64, limit: usize) -> anyhow::Result<Vec<Job>>;

    /// Delete terminal jobs of `queue` that finished at or before `finished_before`.
    async fn purge_finished(&self, queue: QueueName, finished_before: u64) -> anyhow::Result<u64>;

    /// Counts per queue. Queues with no jobs may be omitted.
    async fn stats(&self) -> anyhow::Result<Vec<QueueStats>>;

    /// Jobs matching the filters, oldest first.
    async fn list(
        &self,
        queue: Option<QueueName>,
        state: Option<JobState>,
        limit: usize,
    ) -> anyhow::Result<Vec<Job>>;
}

/// Applies `next` to a job already known to hold the expected claim.
///
/// Shared by the record-oriented backends so state bookkeeping stays identical.
pub(crate) fn apply_next_state(job: &mut Job, next: &NextState, at: u64) {
    job.claimed_at = None;
    job.lease_expires_at = None;
    match next {
        NextState::Completed => {
            job.state = JobState::Completed;
            job.finished_at = Some(at);
        }
        NextState::Retry {
            scheduled_at,
            error,
        } => {
            job.state = JobState::Pending;
            job.scheduled_at = *scheduled_at;
            job.last_error = Some(error.clone());
        }
        NextState::DeadLettered { error } => {
            job.state = JobState::DeadLettered;
            job.finished_at = Some(at);
            job.last_error = Some(error.clone());
        }
    }
}

/// Checks whether `job` still holds the claim a transition expects.
pub(crate) fn check_claim(job: &Job, expected_attempts: u32) -> TransitionOutcome {
    if job.state == JobState::InFlight && job.attempts == expected_attempts {
        TransitionOutcome::Applied
    } else {
        TransitionOutcome::Stale(job.state)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn in_flight() -> Job {
        let mut job = Job::new_pending(QueueName::InvitationSend, json!({}), 0);
        job.max_attempts = 3;
        job.visibility_timeout_ms = 100;
        job.mark_claimed(10);
        job
    }

    #[test]
    fn retry_clears_lease_and_reschedules() {
        let mut job = in_flight();
        apply_next_state(
            &mut job,
            &NextState::Retry {
                scheduled_at: 500,
                error: "boom".to_string(),
            },
            20,
        );
        assert_eq!(job.state, JobState::Pending);
        assert_eq!(job.scheduled_at, 500);
        assert_eq!(job.last_error.as_deref(), Some("boom"));
        assert!(job.lease_expires_at.is_none());
        assert!(job.finished_at.is_none());
    }

    #[test]
    fn terminal_states_stamp_finish_time() {
        let mut job = in_flight();
        apply_next_state(&mut job, &NextState::Completed, 30);
        assert_eq!(job.state, JobState::Completed);
        assert_eq!(job.finished_at, Some(30));

        let mut job = in_flight();
        apply_next_state(
            &mut job,
            &NextState::DeadLettered {
                error: "gone".to_string(),
            },
            40,
        );
        assert_eq!(job.state, JobState::DeadLettered);
        assert_eq!(job.finished_at, Some(40));
    }

    #[test]
    fn claim_check_requires_same_delivery() {
        let job = in_flight();
        assert_eq!(check_claim(&job, 1), TransitionOutcome::Applied);
        assert_eq!(check_claim(&job, 2), TransitionOutcome::Stale(JobState::InFlight));

        let pending = Job::new_pending(QueueName::InvitationSend, json!({}), 0);
        assert_eq!(check_claim(&pending, 0), TransitionOutcome::Stale(JobState::Pending));
    }

    #[test]
    fn stats_count_by_state() {
        let mut stats = QueueStats::empty(QueueName::InvitationSend);
        stats.count(JobState::Pending);
        stats.count(JobState::Pending);
        stats.count(JobState::DeadLettered);
        assert_eq!(stats.pending, 2);
        assert_eq!(stats.dead_lettered, 1);
        assert_eq!(stats.in_flight, 0);
    }
}
