//! Embedded durable [`JobStore`] backed by redb.
//!
//! Jobs are MsgPack-encoded (`rmp-serde`) under their id. Two index tables
//! keep claiming and de-duplication cheap: `due` maps a zero-padded
//! `scheduled_at:seq` key to pending job ids, `singletons` maps
//! `queue:key` to the live job holding it. Every mutation is a single redb
//! write transaction, run on the blocking pool.
//!
//! A record that no longer decodes (unknown queue, truncated bytes) is moved
//! to `jobs_quarantine` when it comes due and skipped by every scan, so one
//! bad row never stalls the rest of the queue.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use redb::{Database, ReadableTable, Table, TableDefinition, WriteTransaction};
use tracing::{error, info};
use tripful_core::{Job, JobId, JobState, QueueName};

use crate::jobs::store::{
    apply_next_state, check_claim, InsertOutcome, JobStore, NextState, QueueStats, Transition,
    TransitionOutcome,
};

const JOBS: TableDefinition<&str, &[u8]> = TableDefinition::new("jobs");
const DUE: TableDefinition<&str, &str> = TableDefinition::new("jobs_due");
const SINGLETONS: TableDefinition<&str, &str> = TableDefinition::new("jobs_singletons");
const META: TableDefinition<&str, u64> = TableDefinition::new("jobs_meta");
const QUARANTINE: TableDefinition<&str, &[u8]> = TableDefinition::new("jobs_quarantine");

const NEXT_SEQ: &str = "next_seq";

fn due_key(scheduled_at: u64, seq: u64) -> String {
    format!("{scheduled_at:020}:{seq:020}")
}

fn singleton_slot(queue: QueueName, key: &str) -> String {
    format!("{queue}:{key}")
}

fn encode(job: &Job) -> anyhow::Result<Vec<u8>> {
    rmp_serde::to_vec_named(job).context("encode job")
}

fn decode(bytes: &[u8]) -> anyhow::Result<Job> {
    rmp_serde::from_slice(bytes).context("decode job")
}

fn load<T>(table: &T, id: &str) -> anyhow::Result<Option<Job>>
where
    T: ReadableTable<&'static str, &'static [u8]>,
{
    match table.get(id)? {
        Some(guard) => Ok(Some(decode(guard.value())?)),
        None => Ok(None),
    }
}

/// All tables of one write transaction.
struct Tables<'txn> {
    jobs: Table<'txn, &'static str, &'static [u8]>,
    due: Table<'txn, &'static str, &'static str>,
    singletons: Table<'txn, &'static str, &'static str>,
    meta: Table<'txn, &'static str, u64>,
    quarantine: Table<'txn, &'static str, &'static [u8]>,
}

impl<'txn> Tables<'txn> {
    fn open(txn: &'txn WriteTransaction) -> anyhow::Result<Self> {
        Ok(Self {
            jobs: txn.open_table(JOBS)?,
            due: txn.open_table(DUE)?,
            singletons: txn.open_table(SINGLETONS)?,
            meta: txn.open_table(META)?,
            quarantine: txn.open_table(QUARANTINE)?,
        })
    }

    fn put(&mut self, job: &Job) -> anyhow::Result<()> {
        let bytes = encode(job)?;
        self.jobs.insert(job.id.to_string().as_str(), bytes.as_slice())?;
        Ok(())
    }

    fn insert(&mut self, mut job: Job) -> anyhow::Result<InsertOutcome> {
        let id = job.id.to_string();
        if let Some(key) = &job.singleton_key {
            let slot = singleton_slot(job.queue, key);
            let holder = self.singletons.get(slot.as_str())?.map(|g| g.value().to_string());
            if let Some(holder) = holder {
                // An undecodable holder cannot be live.
                if let Ok(Some(existing)) = load(&self.jobs, &holder) {
                    if !existing.state.is_terminal() {
                        return Ok(InsertOutcome::Duplicate(existing.id));
                    }
                }
            }
            self.singletons.insert(slot.as_str(), id.as_str())?;
        }

        let seq = self.meta.get(NEXT_SEQ)?.map_or(0, |g| g.value()) + 1;
        self.meta.insert(NEXT_SEQ, seq)?;
        job.seq = seq;
        if job.state == JobState::Pending {
            self.due
                .insert(due_key(job.scheduled_at, seq).as_str(), id.as_str())?;
        }
        self.put(&job)?;
        Ok(InsertOutcome::Inserted(job.id))
    }

    /// Moves the raw record out of `jobs` so it is never claimed again.
    fn quarantine_record(&mut self, id: &str, err: &anyhow::Error) -> anyhow::Result<()> {
        error!(job_id = id, error = %format!("{err:#}"), "quarantining undecodable job record");
        let raw = self.jobs.remove(id)?.map(|g| g.value().to_vec());
        if let Some(raw) = raw {
            self.quarantine.insert(id, raw.as_slice())?;
        }
        Ok(())
    }

    fn release_singleton(&mut self, job: &Job) -> anyhow::Result<()> {
        if let Some(key) = &job.singleton_key {
            let slot = singleton_slot(job.queue, key);
            let id = job.id.to_string();
            let held = self
                .singletons
                .get(slot.as_str())?
                .is_some_and(|g| g.value() == id);
            if held {
                self.singletons.remove(slot.as_str())?;
            }
        }
        Ok(())
    }
}

/// redb-backed job store. Cheap to clone.
#[derive(Clone)]
pub struct RedbJobStore {
    db: Arc<Database>,
}

impl std::fmt::Debug for RedbJobStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedbJobStore").finish_non_exhaustive()
    }
}

impl RedbJobStore {
    /// Opens or creates the database file at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or the tables cannot be created.
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let db = Database::create(path)
            .with_context(|| format!("open redb job store at {}", path.display()))?;
        let store = Self { db: Arc::new(db) };
        store.init_tables()?;
        info!(path = %path.display(), "redb job store opened");
        Ok(store)
    }

    /// Creates a store that lives only in memory.
    ///
    /// # Errors
    ///
    /// Returns an error if redb fails to initialise the backend.
    pub fn in_memory() -> anyhow::Result<Self> {
        let db = Database::builder()
            .create_with_backend(redb::backends::InMemoryBackend::new())
            .context("create in-memory redb job store")?;
        let store = Self { db: Arc::new(db) };
        store.init_tables()?;
        Ok(store)
    }

    fn init_tables(&self) -> anyhow::Result<()> {
        let txn = self.db.begin_write()?;
        Tables::open(&txn)?;
        txn.commit()?;
        Ok(())
    }

    async fn blocking<T, F>(&self, f: F) -> anyhow::Result<T>
    where
        F: FnOnce(&Database) -> anyhow::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let db = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || f(&db)).await?
    }

    /// Runs `f` inside one write transaction and commits it.
    async fn write<T, F>(&self, f: F) -> anyhow::Result<T>
    where
        F: FnOnce(&mut Tables<'_>) -> anyhow::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        self.blocking(move |db| {
            let txn = db.begin_write()?;
            let out = {
                let mut tables = Tables::open(&txn)?;
                f(&mut tables)?
            };
            txn.commit()?;
            Ok(out)
        })
        .await
    }

    /// Decodes every stored job.
    async fn scan(&self) -> anyhow::Result<Vec<Job>> {
        self.blocking(|db| {
            let txn = db.begin_read()?;
            let table = txn.open_table(JOBS)?;
            let mut jobs = Vec::new();
            for entry in table.iter()? {
                let (key, value) = entry?;
                match decode(value.value()) {
                    Ok(job) => jobs.push(job),
                    Err(err) => {
                        error!(job_id = key.value(), error = %format!("{err:#}"), "skipping undecodable job record");
                    }
                }
            }
            Ok(jobs)
        })
        .await
    }

    /// Ids of records set aside because they could not be decoded.
    ///
    /// # Errors
    ///
    /// Returns an error if the read transaction fails.
    pub async fn quarantined(&self) -> anyhow::Result<Vec<String>> {
        self.blocking(|db| {
            let txn = db.begin_read()?;
            let table = txn.open_table(QUARANTINE)?;
            let mut ids = Vec::new();
            for entry in table.iter()? {
                let (key, _) = entry?;
                ids.push(key.value().to_string());
            }
            Ok(ids)
        })
        .await
    }
}

#[async_trait]
impl JobStore for RedbJobStore {
    async fn insert(&self, job: Job) -> anyhow::Result<InsertOutcome> {
        self.write(move |tables| tables.insert(job)).await
    }

    async fn claim_due(&self, now: u64, max_batch: usize) -> anyhow::Result<Vec<Job>> {
        self.write(move |tables| {
            let bound = due_key(now, u64::MAX);
            let mut claimed = Vec::with_capacity(max_batch);
            // Every visited due key is removed, so each round makes progress.
            while claimed.len() < max_batch {
                let mut entries = Vec::new();
                for entry in tables
                    .due
                    .range(..=bound.as_str())?
                    .take(max_batch - claimed.len())
                {
                    let (key, id) = entry?;
                    entries.push((key.value().to_string(), id.value().to_string()));
                }
                if entries.is_empty() {
                    break;
                }

                for (key, id) in entries {
                    tables.due.remove(key.as_str())?;
                    match load(&tables.jobs, &id) {
                        Ok(Some(mut job)) => {
                            job.mark_claimed(now);
                            tables.put(&job)?;
                            claimed.push(job);
                        }
                        Ok(None) => {}
                        Err(err) => tables.quarantine_record(&id, &err)?,
                    }
                }
            }
            Ok(claimed)
        })
        .await
    }

    async fn get(&self, id: JobId) -> anyhow::Result<Option<Job>> {
        self.blocking(move |db| {
            let txn = db.begin_read()?;
            let table = txn.open_table(JOBS)?;
            load(&table, &id.to_string())
        })
        .await
    }

    async fn apply(&self, transition: Transition) -> anyhow::Result<TransitionOutcome> {
        self.write(move |tables| {
            let Some(mut job) = load(&tables.jobs, &transition.id.to_string())? else {
                return Ok(TransitionOutcome::NotFound);
            };
            let outcome = check_claim(&job, transition.expected_attempts);
            if outcome != TransitionOutcome::Applied {
                return Ok(outcome);
            }

            apply_next_state(&mut job, &transition.next, transition.at);
            match transition.next {
                NextState::Retry { .. } => {
                    let id = job.id.to_string();
                    tables
                        .due
                        .insert(due_key(job.scheduled_at, job.seq).as_str(), id.as_str())?;
                }
                NextState::Completed | NextState::DeadLettered { .. } => {
                    tables.release_singleton(&job)?;
                }
            }
            tables.put(&job)?;
            if let Some(follow_up) = transition.follow_up {
                tables.insert(follow_up)?;
            }
            Ok(TransitionOutcome::Applied)
        })
        .await
    }

    async fn expired_leases(&self, now: u64, limit: usize) -> anyhow::Result<Vec<Job>> {
        let mut expired: Vec<Job> = self
            .scan()
            .await?
            .into_iter()
            .filter(|job| {
                job.state == JobState::InFlight
                    && job.lease_expires_at.is_some_and(|at| at <= now)
            })
            .collect();
        expired.sort_by_key(|job| (job.lease_expires_at, job.seq));
        expired.truncate(limit);
        Ok(expired)
    }

    async fn purge_finished(&self, queue: QueueName, finished_before: u64) -> anyhow::Result<u64> {
        self.write(move |tables| {
            let mut doomed = Vec::new();
            for entry in tables.jobs.iter()? {
                let (key, value) = entry?;
                let Ok(job) = decode(value.value()) else {
                    continue;
                };
                if job.queue == queue
                    && job.state.is_terminal()
                    && job.finished_at.is_some_and(|at| at <= finished_before)
                {
                    doomed.push(key.value().to_string());
                }
            }
            for key in &doomed {
                tables.jobs.remove(key.as_str())?;
            }
            Ok(doomed.len() as u64)
        })
        .await
    }

    async fn stats(&self) -> anyhow::Result<Vec<QueueStats>> {
        let mut by_queue: BTreeMap<QueueName, QueueStats> = BTreeMap::new();
        for job in self.scan().await? {
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
        let mut jobs: Vec<Job> = self
            .scan()
            .await?
            .into_iter()
            .filter(|job| queue.map_or(true, |q| job.queue == q))
            .filter(|job| state.map_or(true, |s| job.state == s))
            .collect();
        jobs.sort_by_key(|job| job.seq);
        jobs.truncate(limit);
        Ok(jobs)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn pending(queue: QueueName, at: u64) -> Job {
        let mut job = Job::new_pending(queue, json!({"phoneNumber": "+15551234567"}), at);
        job.max_attempts = 2;
        job.visibility_timeout_ms = 500;
        job
    }

    #[test]
    fn due_keys_sort_numerically() {
        assert!(due_key(9, 1) < due_key(10, 0));
        assert!(due_key(10, 2) < due_key(10, 11));
        assert!(due_key(10, 5) <= due_key(10, u64::MAX));
    }

    #[tokio::test]
    async fn claim_complete_cycle_in_memory() {
        let store = RedbJobStore::in_memory().unwrap();
        let job = pending(QueueName::InvitationSend, 100);
        store.insert(job.clone()).await.unwrap();

        assert!(store.claim_due(99, 5).await.unwrap().is_empty());
        let claimed = store.claim_due(100, 5).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].attempts, 1);
        assert_eq!(claimed[0].lease_expires_at, Some(600));

        let outcome = store
            .apply(Transition {
                id: job.id,
                expected_attempts: 1,
                next: NextState::Completed,
                at: 150,
                follow_up: None,
            })
            .await
            .unwrap();
        assert_eq!(outcome, TransitionOutcome::Applied);
        let stored = store.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.state, JobState::Completed);
        assert_eq!(stored.payload["phoneNumber"], "+15551234567");
    }

    #[tokio::test]
    async fn jobs_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobs.redb");
        let job = pending(QueueName::NotificationDeliver, 0);
        let mut keyed = pending(QueueName::EventReminders, 0);
        keyed.singleton_key = Some("event-reminders:1".into());
        {
            let store = RedbJobStore::open(&path).unwrap();
            store.insert(job.clone()).await.unwrap();
            store.insert(keyed.clone()).await.unwrap();
        }

        let store = RedbJobStore::open(&path).unwrap();
        let mut again = pending(QueueName::EventReminders, 0);
        again.singleton_key = Some("event-reminders:1".into());
        assert_eq!(
            store.insert(again).await.unwrap(),
            InsertOutcome::Duplicate(keyed.id)
        );

        let claimed = store.claim_due(0, 10).await.unwrap();
        let ids: Vec<JobId> = claimed.iter().map(|j| j.id).collect();
        assert_eq!(ids, vec![job.id, keyed.id]);
    }

    #[tokio::test]
    async fn dead_letter_and_purge() {
        let store = RedbJobStore::in_memory().unwrap();
        let job = pending(QueueName::InvitationSend, 0);
        store.insert(job.clone()).await.unwrap();
        store.claim_due(0, 1).await.unwrap();

        let dlq = Job::new_pending(QueueName::InvitationSendDlq, json!({"jobId": job.id}), 10);
        store
            .apply(Transition {
                id: job.id,
                expected_attempts: 1,
                next: NextState::DeadLettered {
                    error: "unreachable".into(),
                },
                at: 10,
                follow_up: Some(dlq.clone()),
            })
            .await
            .unwrap();

        let stats = store.stats().await.unwrap();
        let send = stats
            .iter()
            .find(|s| s.queue == QueueName::InvitationSend)
            .unwrap();
        assert_eq!(send.dead_lettered, 1);
        let dlq_pending = store
            .list(Some(QueueName::InvitationSendDlq), Some(JobState::Pending), 10)
            .await
            .unwrap();
        assert_eq!(dlq_pending[0].id, dlq.id);

        assert_eq!(store.purge_finished(QueueName::InvitationSend, 10).await.unwrap(), 1);
        assert!(store.get(job.id).await.unwrap().is_none());
    }
}
