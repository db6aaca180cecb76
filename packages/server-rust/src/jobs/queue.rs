//! Job lifecycle on top of a [`JobStore`]: validation, retry, dead-lettering.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde_json::Value;
use tracing::{debug, error, info, warn};
use tripful_core::clock::duration_millis;
use tripful_core::{
    default_definitions, ClockSource, DeadLetterPayload, Job, JobDefinition, JobId, JobPayload,
    JobState, QueueName, RetryPolicy, ValidationResult,
};

use super::error::JobError;
use super::metrics;
use super::store::{InsertOutcome, JobStore, NextState, QueueStats, Transition, TransitionOutcome};

/// Summary recorded when an expired lease is treated as a failure.
pub const VISIBILITY_EXPIRED: &str = "visibility timeout expired";

// ---------------------------------------------------------------------------
// Options and outcomes
// ---------------------------------------------------------------------------

/// Per-call enqueue options.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnqueueOptions {
    /// Delay before the job becomes eligible.
    pub delay: Option<Duration>,
    /// Absolute eligibility time (millis since epoch). Wins over `delay`.
    pub start_after: Option<u64>,
    /// At most one live job per `(queue, singleton_key)`.
    pub singleton_key: Option<String>,
}

impl EnqueueOptions {
    #[must_use]
    pub fn delayed(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn singleton(key: impl Into<String>) -> Self {
        Self {
            singleton_key: Some(key.into()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn start_after(mut self, at: u64) -> Self {
        self.start_after = Some(at);
        self
    }
}

/// Why a delivery failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    pub summary: String,
    /// `false` skips the remaining retry budget.
    pub retryable: bool,
}

impl Failure {
    #[must_use]
    pub fn retryable(summary: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
            retryable: true,
        }
    }

    #[must_use]
    pub fn permanent(summary: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
            retryable: false,
        }
    }

    /// A retryable failure carrying the full error chain.
    #[must_use]
    pub fn from_error(err: &anyhow::Error) -> Self {
        Self::retryable(format!("{err:#}"))
    }
}

/// What [`JobQueue::fail`] did with the job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    /// Back to pending; eligible again at `next_attempt_at`.
    Retried { next_attempt_at: u64 },
    /// Terminal. `dead_letter_job` is the entry written to the dead-letter
    /// queue, if the definition has one.
    DeadLettered { dead_letter_job: Option<JobId> },
    /// The job was not in flight (already terminal, or reclaimed); nothing changed.
    Ignored,
}

// ---------------------------------------------------------------------------
// JobQueue
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Definitions {
    by_queue: HashMap<QueueName, Arc<JobDefinition>>,
    /// Dead-letter targets defined as bare sinks on behalf of their source.
    implicit_sinks: HashSet<QueueName>,
}

struct QueueInner {
    store: Arc<dyn JobStore>,
    clock: Arc<dyn ClockSource>,
    definitions: RwLock<Definitions>,
}

/// Durable job queue. Clones share the same store and definitions.
#[derive(Clone)]
pub struct JobQueue {
    inner: Arc<QueueInner>,
}

impl std::fmt::Debug for JobQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobQueue")
            .field("queues", &self.queues())
            .finish_non_exhaustive()
    }
}

impl JobQueue {
    /// Creates a queue with no definitions.
    #[must_use]
    pub fn new(store: Arc<dyn JobStore>, clock: Arc<dyn ClockSource>) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                store,
                clock,
                definitions: RwLock::new(Definitions::default()),
            }),
        }
    }

    /// Creates a queue with the production queue table.
    ///
    /// # Errors
    ///
    /// Returns an error if the built-in table is inconsistent.
    pub fn with_defaults(
        store: Arc<dyn JobStore>,
        clock: Arc<dyn ClockSource>,
    ) -> Result<Self, JobError> {
        let queue = Self::new(store, clock);
        for definition in default_definitions() {
            queue.define(definition)?;
        }
        Ok(queue)
    }

    /// Current time according to the queue's clock.
    #[must_use]
    pub fn now(&self) -> u64 {
        self.inner.clock.now()
    }

    /// Registers a queue definition.
    ///
    /// A dead-letter target with no definition yet is defined as a sink. A
    /// later explicit definition of that target replaces the sink.
    ///
    /// # Errors
    ///
    /// `InvalidDefinition` if the definition is inconsistent,
    /// `DuplicateDefinition` if the queue is already defined.
    pub fn define(&self, definition: JobDefinition) -> Result<(), JobError> {
        definition
            .check()
            .map_err(|reason| JobError::InvalidDefinition {
                queue: definition.queue,
                reason,
            })?;

        let mut definitions = self.inner.definitions.write();
        let replaces_sink = definitions.implicit_sinks.remove(&definition.queue);
        if !replaces_sink && definitions.by_queue.contains_key(&definition.queue) {
            return Err(JobError::DuplicateDefinition {
                queue: definition.queue,
            });
        }
        if let Some(dlq) = definition.dead_letter {
            if !definitions.by_queue.contains_key(&dlq) {
                definitions
                    .by_queue
                    .insert(dlq, Arc::new(JobDefinition::dead_letter_sink(dlq)));
                definitions.implicit_sinks.insert(dlq);
            }
        }
        debug!(
            queue = %definition.queue,
            max_attempts = definition.max_attempts,
            dead_letter = ?definition.dead_letter,
            "queue defined"
        );
        definitions
            .by_queue
            .insert(definition.queue, Arc::new(definition));
        Ok(())
    }

    /// Returns the definition for `queue`.
    #[must_use]
    pub fn definition(&self, queue: QueueName) -> Option<JobDefinition> {
        self.inner
            .definitions
            .read()
            .by_queue
            .get(&queue)
            .map(|d| JobDefinition::clone(d))
    }

    /// Defined queues, in declaration order of [`QueueName`].
    #[must_use]
    pub fn queues(&self) -> Vec<QueueName> {
        let mut queues: Vec<QueueName> = self
            .inner
            .definitions
            .read()
            .by_queue
            .keys()
            .copied()
            .collect();
        queues.sort();
        queues
    }

    /// Defined dead-letter queues.
    #[must_use]
    pub fn dead_letter_queues(&self) -> Vec<QueueName> {
        self.queues()
            .into_iter()
            .filter(|q| q.is_dead_letter())
            .collect()
    }

    fn lookup(&self, queue: QueueName) -> Option<Arc<JobDefinition>> {
        self.inner.definitions.read().by_queue.get(&queue).cloned()
    }

    // -- producers ----------------------------------------------------------

    /// Validates and persists a pending job.
    ///
    /// A singleton key that is already held by a live job returns that job's id.
    ///
    /// # Errors
    ///
    /// `UnknownQueue` if the queue has no definition, `InvalidPayload` if the
    /// schema rejects the payload, `Store` on persistence failure.
    pub async fn enqueue(
        &self,
        queue: QueueName,
        payload: Value,
        options: EnqueueOptions,
    ) -> Result<JobId, JobError> {
        let definition = self.lookup(queue).ok_or_else(|| JobError::UnknownQueue {
            name: queue.to_string(),
        })?;
        if let ValidationResult::Invalid { errors } = definition.schema.validate(&payload) {
            return Err(JobError::InvalidPayload { queue, errors });
        }

        let now = self.now();
        let mut job = Job::new_pending(queue, payload, now);
        job.max_attempts = definition.max_attempts;
        job.visibility_timeout_ms = duration_millis(definition.visibility_timeout);
        job.scheduled_at = match (options.start_after, options.delay) {
            (Some(at), _) => at,
            (None, Some(delay)) => now.saturating_add(duration_millis(delay)),
            (None, None) => now,
        };
        job.singleton_key = options.singleton_key;

        match self.inner.store.insert(job).await? {
            InsertOutcome::Inserted(id) => {
                metrics::job_enqueued(queue);
                debug!(queue = %queue, job_id = %id, "job enqueued");
                Ok(id)
            }
            InsertOutcome::Duplicate(id) => {
                debug!(queue = %queue, job_id = %id, "singleton job already queued");
                Ok(id)
            }
        }
    }

    /// String form of [`enqueue`](Self::enqueue), for callers that only know queue names.
    ///
    /// # Errors
    ///
    /// `UnknownQueue` if `queue` is not a known queue name; otherwise as `enqueue`.
    pub async fn enqueue_named(
        &self,
        queue: &str,
        payload: Value,
        options: EnqueueOptions,
    ) -> Result<JobId, JobError> {
        let name: QueueName = queue.parse().map_err(|_| JobError::UnknownQueue {
            name: queue.to_string(),
        })?;
        self.enqueue(name, payload, options).await
    }

    /// Enqueues a typed payload on its own queue.
    ///
    /// # Errors
    ///
    /// As [`enqueue`](Self::enqueue), plus `Serialization` if the payload cannot be encoded.
    pub async fn enqueue_typed<P: JobPayload>(
        &self,
        payload: &P,
        options: EnqueueOptions,
    ) -> Result<JobId, JobError> {
        let value = serde_json::to_value(payload)?;
        self.enqueue(P::QUEUE, value, options).await
    }

    // -- workers ------------------------------------------------------------

    /// Claims up to `max_batch` due jobs.
    ///
    /// # Errors
    ///
    /// `Store` if the backend is unavailable.
    pub async fn claim_due(&self, max_batch: usize) -> Result<Vec<Job>, JobError> {
        if max_batch == 0 {
            return Ok(Vec::new());
        }
        Ok(self.inner.store.claim_due(self.now(), max_batch).await?)
    }

    /// Polls [`claim_due`](Self::claim_due) until jobs are available or `timeout` elapses.
    ///
    /// Returns an empty batch on timeout.
    ///
    /// # Errors
    ///
    /// `Store` if the backend is unavailable.
    pub async fn claim_due_wait(
        &self,
        max_batch: usize,
        timeout: Duration,
        poll_interval: Duration,
    ) -> Result<Vec<Job>, JobError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let jobs = self.claim_due(max_batch).await?;
            if !jobs.is_empty() {
                return Ok(jobs);
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(jobs);
            }
            tokio::time::sleep(poll_interval.min(deadline - now)).await;
        }
    }

    /// Marks a job completed. Completing a job that is not in flight is a no-op.
    ///
    /// # Errors
    ///
    /// `JobNotFound` for unknown ids, `Store` on persistence failure.
    pub async fn complete(&self, id: JobId) -> Result<(), JobError> {
        self.complete_delivery(id, None).await
    }

    /// Completes the delivery numbered `attempt`; a later redelivery is left untouched.
    ///
    /// # Errors
    ///
    /// As [`complete`](Self::complete).
    pub async fn complete_attempt(&self, id: JobId, attempt: u32) -> Result<(), JobError> {
        self.complete_delivery(id, Some(attempt)).await
    }

    async fn complete_delivery(&self, id: JobId, attempt: Option<u32>) -> Result<(), JobError> {
        let job = self.load(id).await?;
        if job.state != JobState::InFlight {
            debug!(job_id = %id, state = %job.state, "complete ignored: job not in flight");
            return Ok(());
        }

        let outcome = self
            .inner
            .store
            .apply(Transition {
                id,
                expected_attempts: attempt.unwrap_or(job.attempts),
                next: NextState::Completed,
                at: self.now(),
                follow_up: None,
            })
            .await?;
        match outcome {
            TransitionOutcome::Applied => {
                debug!(queue = %job.queue, job_id = %id, "job completed");
                Ok(())
            }
            TransitionOutcome::Stale(state) => {
                debug!(job_id = %id, state = %state, "complete ignored: claim superseded");
                Ok(())
            }
            TransitionOutcome::NotFound => Err(JobError::JobNotFound { id }),
        }
    }

    /// Records a failed delivery and retries or dead-letters the job.
    ///
    /// # Errors
    ///
    /// `JobNotFound` for unknown ids, `Serialization` if the dead-letter
    /// record cannot be built, `Store` on persistence failure.
    pub async fn fail(&self, id: JobId, failure: Failure) -> Result<FailOutcome, JobError> {
        self.fail_delivery(id, None, failure).await
    }

    /// Fails the delivery numbered `attempt`; a later redelivery is left untouched.
    ///
    /// # Errors
    ///
    /// As [`fail`](Self::fail).
    pub async fn fail_attempt(
        &self,
        id: JobId,
        attempt: u32,
        failure: Failure,
    ) -> Result<FailOutcome, JobError> {
        self.fail_delivery(id, Some(attempt), failure).await
    }

    async fn fail_delivery(
        &self,
        id: JobId,
        attempt: Option<u32>,
        failure: Failure,
    ) -> Result<FailOutcome, JobError> {
        let job = self.load(id).await?;
        if job.state != JobState::InFlight {
            debug!(job_id = %id, state = %job.state, "fail ignored: job not in flight");
            return Ok(FailOutcome::Ignored);
        }

        let definition = self.lookup(job.queue);
        let now = self.now();
        let expected_attempts = attempt.unwrap_or(job.attempts);

        if failure.retryable && job.has_attempts_left() {
            let retry = definition
                .as_ref()
                .map_or_else(RetryPolicy::default, |d| d.retry.clone());
            let next_attempt_at = now.saturating_add(duration_millis(retry.delay_for(job.attempts)));
            let outcome = self
                .inner
                .store
                .apply(Transition {
                    id,
                    expected_attempts,
                    next: NextState::Retry {
                        scheduled_at: next_attempt_at,
                        error: failure.summary.clone(),
                    },
                    at: now,
                    follow_up: None,
                })
                .await?;
            return Ok(match outcome {
                TransitionOutcome::Applied => {
                    warn!(
                        queue = %job.queue,
                        job_id = %id,
                        attempt = job.attempts,
                        max_attempts = job.max_attempts,
                        next_attempt_at,
                        error = %failure.summary,
                        "job failed, retry scheduled"
                    );
                    FailOutcome::Retried { next_attempt_at }
                }
                TransitionOutcome::Stale(_) => FailOutcome::Ignored,
                TransitionOutcome::NotFound => return Err(JobError::JobNotFound { id }),
            });
        }

        let follow_up = match definition.as_ref().and_then(|d| d.dead_letter) {
            Some(dlq) => Some(self.dead_letter_job(dlq, &job, &failure.summary, now)?),
            None => None,
        };
        let dead_letter_job = follow_up.as_ref().map(|j| j.id);
        let outcome = self
            .inner
            .store
            .apply(Transition {
                id,
                expected_attempts,
                next: NextState::DeadLettered {
                    error: failure.summary.clone(),
                },
                at: now,
                follow_up,
            })
            .await?;
        match outcome {
            TransitionOutcome::Applied => {
                metrics::job_dead_lettered(job.queue);
                error!(
                    queue = %job.queue,
                    job_id = %id,
                    attempts = job.attempts,
                    dead_letter_job = ?dead_letter_job,
                    error = %failure.summary,
                    "job dead-lettered"
                );
                Ok(FailOutcome::DeadLettered { dead_letter_job })
            }
            TransitionOutcome::Stale(_) => Ok(FailOutcome::Ignored),
            TransitionOutcome::NotFound => Err(JobError::JobNotFound { id }),
        }
    }

    fn dead_letter_job(
        &self,
        dlq: QueueName,
        job: &Job,
        summary: &str,
        now: u64,
    ) -> Result<Job, JobError> {
        let record = DeadLetterPayload {
            original_queue: job.queue,
            job_id: job.id,
            payload: job.payload.clone(),
            error: summary.to_string(),
            attempts: job.attempts,
            dead_lettered_at: now,
        };
        let mut entry = Job::new_pending(dlq, serde_json::to_value(&record)?, now);
        if let Some(definition) = self.lookup(dlq) {
            entry.max_attempts = definition.max_attempts;
            entry.visibility_timeout_ms = duration_millis(definition.visibility_timeout);
        }
        Ok(entry)
    }

    // -- maintenance --------------------------------------------------------

    /// Fails every in-flight job whose lease has expired, as if its handler had failed.
    ///
    /// Returns how many jobs were retried or dead-lettered.
    ///
    /// # Errors
    ///
    /// `Store` on persistence failure.
    pub async fn reclaim_expired(&self, limit: usize) -> Result<usize, JobError> {
        let expired = self.inner.store.expired_leases(self.now(), limit).await?;
        let mut reclaimed = 0;
        for job in expired {
            let outcome = self
                .fail_attempt(job.id, job.attempts, Failure::retryable(VISIBILITY_EXPIRED))
                .await?;
            if outcome != FailOutcome::Ignored {
                metrics::job_reclaimed(job.queue);
                warn!(queue = %job.queue, job_id = %job.id, attempt = job.attempts, "lease expired, job reclaimed");
                reclaimed += 1;
            }
        }
        Ok(reclaimed)
    }

    /// Deletes terminal jobs older than their queue's retention.
    ///
    /// # Errors
    ///
    /// `Store` on persistence failure.
    pub async fn purge_finished(&self) -> Result<u64, JobError> {
        let now = self.now();
        let definitions: Vec<Arc<JobDefinition>> =
            self.inner.definitions.read().by_queue.values().cloned().collect();
        let mut purged = 0;
        for definition in definitions {
            let cutoff = now.saturating_sub(duration_millis(definition.retention));
            purged += self
                .inner
                .store
                .purge_finished(definition.queue, cutoff)
                .await?;
        }
        if purged > 0 {
            info!(purged, "finished jobs purged");
        }
        Ok(purged)
    }

    // -- inspection ---------------------------------------------------------

    /// Counts per defined queue, including queues with no jobs.
    ///
    /// # Errors
    ///
    /// `Store` on persistence failure.
    pub async fn stats(&self) -> Result<Vec<QueueStats>, JobError> {
        let mut stats = self.inner.store.stats().await?;
        for queue in self.queues() {
            if !stats.iter().any(|s| s.queue == queue) {
                stats.push(QueueStats::empty(queue));
            }
        }
        stats.sort_by_key(|s| s.queue);
        Ok(stats)
    }

    /// Loads a job record.
    ///
    /// # Errors
    ///
    /// `Store` on persistence failure.
    pub async fn get(&self, id: JobId) -> Result<Option<Job>, JobError> {
        Ok(self.inner.store.get(id).await?)
    }

    /// Jobs matching the filters, oldest first.
    ///
    /// # Errors
    ///
    /// `Store` on persistence failure.
    pub async fn list(
        &self,
        queue: Option<QueueName>,
        state: Option<JobState>,
        limit: usize,
    ) -> Result<Vec<Job>, JobError> {
        Ok(self.inner.store.list(queue, state, limit).await?)
    }

    async fn load(&self, id: JobId) -> Result<Job, JobError> {
        self.get(id).await?.ok_or(JobError::JobNotFound { id })
    }
}
