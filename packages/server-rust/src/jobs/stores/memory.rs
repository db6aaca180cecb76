//! In-memory [`JobStore`] for tests and single-process deployments.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use parking_lot::Mutex;
use tripful_core::{Job, JobId, JobState, QueueName};

use crate::jobs::store::{
    apply_next_state, check_claim, InsertOutcome, JobStore, NextState, QueueStats, Transition,
    TransitionOutcome,
};

/// Jobs held in a single mutex-guarded map.
///
/// A `(scheduled_at, seq)` index over pending jobs makes `claim_due` a range
/// scan. Every operation holds the lock for its whole duration, which gives
/// the atomicity the queue needs.
#[derive(Debug, Default)]
pub struct MemoryJobStore {
    inner: Mutex<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    jobs: HashMap<JobId, Job>,
    due: BTreeMap<(u64, u64), JobId>,
    singletons: HashMap<(QueueName, String), JobId>,
    next_seq: u64,
}

impl Inner {
    fn insert(&mut self, mut job: Job) -> InsertOutcome {
        if let Some(key) = &job.singleton_key {
            if let Some(existing) = self.singletons.get(&(job.queue, key.clone())) {
                let live = self
                    .jobs
                    .get(existing)
                    .is_some_and(|j| !j.state.is_terminal());
                if live {
                    return InsertOutcome::Duplicate(*existing);
                }
            }
            self.singletons.insert((job.queue, key.clone()), job.id);
        }

        self.next_seq += 1;
        job.seq = self.next_seq;
        let id = job.id;
        if job.state == JobState::Pending {
            self.due.insert((job.scheduled_at, job.seq), id);
        }
        self.jobs.insert(id, job);
        InsertOutcome::Inserted(id)
    }

    fn release_singleton(&mut self, job: &Job) {
        if let Some(key) = &job.singleton_key {
            let slot = (job.queue, key.clone());
            if self.singletons.get(&slot) == Some(&job.id) {
                self.singletons.remove(&slot);
            }
        }
    }
}

impl MemoryJobStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored jobs in every state.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().jobs.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn insert(&self, job: Job) -> anyhow::Result<InsertOutcome> {
        Ok(self.inner.lock().insert(job))
    }

    async fn claim_due(&self, now: u64, max_batch: usize) -> anyhow::Result<Vec<Job>> {
        let mut inner = self.inner.lock();
        let keys: Vec<(u64, u64)> = inner
            .due
            .range(..=(now, u64::MAX))
            .take(max_batch)
            .map(|(key, _)| *key)
            .collect();

        let mut claimed = Vec::with_capacity(keys.len());
        for key in keys {
            let Some(id) = inner.due.remove(&key) else {
                continue;
            };
            if let Some(job) = inner.jobs.get_mut(&id) {
                job.mark_claimed(now);
                claimed.push(job.clone());
            }
        }
        Ok(claimed)
    }

    async fn get(&self, id: JobId) -> anyhow::Result<Option<Job>> {
        Ok(self.inner.lock().jobs.get(&id).cloned())
    }

    async fn apply(&self, transition: Transition) -> anyhow::Result<TransitionOutcome> {
        let mut inner = self.inner.lock();
        let Some(job) = inner.jobs.get_mut(&transition.id) else {
            return Ok(TransitionOutcome::NotFound);
        };
        let outcome = check_claim(job, transition.expected_attempts);
        if outcome != TransitionOutcome::Applied {
            return Ok(outcome);
        }

        apply_next_state(job, &transition.next, transition.at);
        let updated = job.clone();
        match transition.next {
            NextState::Retry { .. } => {
                inner
                    .due
                    .insert((updated.scheduled_at, updated.seq), updated.id);
            }
            NextState::Completed | NextState::DeadLettered { .. } => {
                inner.release_singleton(&updated);
            }
        }
        if let Some(follow_up) = transition.follow_up {
            inner.insert(follow_up);
        }
        Ok(TransitionOutcome::Applied)
    }

    async fn expired_leases(&self, now: u64, limit: usize) -> anyhow::Result<Vec<Job>> {
        let inner = self.inner.lock();
        let mut expired: Vec<Job> = inner
            .jobs
            .values()
            .filter(|job| {
                job.state == JobState::InFlight
                    && job.lease_expires_at.is_some_and(|at| at <= now)
            })
            .cloned()
            .collect();
        expired.sort_by_key(|job| (job.lease_expires_at, job.seq));
        expired.truncate(limit);
        Ok(expired)
    }

    async fn purge_finished(&self, queue: QueueName, finished_before: u64) -> anyhow::Result<u64> {
        let mut inner = self.inner.lock();
        let before = inner.jobs.len();
        inner.jobs.retain(|_, job| {
            !(job.queue == queue
                && job.state.is_terminal()
                && job.finished_at.is_some_and(|at| at <= finished_before))
        });
        Ok((before - inner.jobs.len()) as u64)
    }

    async fn stats(&self) -> anyhow::Result<Vec<QueueStats>> {
        let inner = self.inner.lock();
        let mut by_queue: BTreeMap<QueueName, QueueStats> = BTreeMap::new();
        for job in inner.jobs.values() {
            by_queue
                .entry(job.queue)
                .or_insert_with(|| QueueStats::empty(job.queue))
                .count(job.state);
        }
        Ok(by_queue.into_values().collect())
    }

    async fn list(
        &self,
        queue: Option<QueueName>,
        state: Option<JobState>,
        limit: usize,
    ) -> anyhow::Result<Vec<Job>> {
        let inner = self.inner.lock();
        let mut jobs: Vec<Job> = inner
            .jobs
            .values()
            .filter(|job| queue.map_or(true, |q| job.queue == q))
            .filter(|job| state.map_or(true, |s| job.state == s))
            .cloned()
            .collect();
        jobs.sort_by_key(|job| job.seq);
        jobs.truncate(limit);
        Ok(jobs)
    }
}
