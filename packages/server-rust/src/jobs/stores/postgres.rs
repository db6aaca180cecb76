//! `PostgreSQL` [`JobStore`] for multi-process deployments.
//!
//! Claiming uses `FOR UPDATE SKIP LOCKED` so concurrent workers in different
//! processes never pick the same row. Singleton de-duplication is enforced by
//! a partial unique index over live jobs.
//!
//! Rows that fail to decode (unknown queue or state) are skipped by reads and
//! dead-lettered with the decode error when claimed.

use std::collections::BTreeMap;

use anyhow::Context;
use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{PgConnection, Row};
use tracing::{error, info};
use tripful_core::{Job, JobId, JobState, QueueName};
use uuid::Uuid;

use crate::jobs::store::{
    apply_next_state, check_claim, InsertOutcome, JobStore, QueueStats, Transition,
    TransitionOutcome,
};

const SCHEMA: &[&str] = &[
    r"CREATE TABLE IF NOT EXISTS jobs (
        id UUID PRIMARY KEY,
        queue TEXT NOT NULL,
        payload JSONB NOT NULL,
        attempts INTEGER NOT NULL DEFAULT 0,
        max_attempts INTEGER NOT NULL,
        state TEXT NOT NULL,
        enqueued_at BIGINT NOT NULL,
        scheduled_at BIGINT NOT NULL,
        last_attempt_at BIGINT,
        claimed_at BIGINT,
        visibility_timeout_ms BIGINT NOT NULL,
        lease_expires_at BIGINT,
        finished_at BIGINT,
        last_error TEXT,
        singleton_key TEXT,
        seq BIGSERIAL NOT NULL
    )",
    r"CREATE INDEX IF NOT EXISTS jobs_due_idx
        ON jobs (scheduled_at, seq) WHERE state = 'pending'",
    r"CREATE INDEX IF NOT EXISTS jobs_lease_idx
        ON jobs (lease_expires_at) WHERE state = 'in-flight'",
    r"CREATE UNIQUE INDEX IF NOT EXISTS jobs_singleton_idx
        ON jobs (queue, singleton_key)
        WHERE singleton_key IS NOT NULL AND state IN ('pending', 'in-flight')",
];

const COLUMNS: &str = "id, queue, payload, attempts, max_attempts, state, enqueued_at, \
    scheduled_at, last_attempt_at, claimed_at, visibility_timeout_ms, lease_expires_at, \
    finished_at, last_error, singleton_key, seq";

fn to_db(v: u64) -> i64 {
    i64::try_from(v).unwrap_or(i64::MAX)
}

fn from_db(v: i64) -> u64 {
    u64::try_from(v).unwrap_or(0)
}

fn count_to_db(v: u32) -> i32 {
    i32::try_from(v).unwrap_or(i32::MAX)
}

fn count_from_db(v: i32) -> u32 {
    u32::try_from(v).unwrap_or(0)
}

fn job_from_row(row: &PgRow) -> anyhow::Result<Job> {
    let queue: String = row.try_get("queue")?;
    let state: String = row.try_get("state")?;
    let opt = |name: &str| -> anyhow::Result<Option<u64>> {
        Ok(row.try_get::<Option<i64>, _>(name)?.map(from_db))
    };
    Ok(Job {
        id: JobId::from_uuid(row.try_get::<Uuid, _>("id")?),
        queue: queue.parse()?,
        payload: row.try_get("payload")?,
        attempts: count_from_db(row.try_get("attempts")?),
        max_attempts: count_from_db(row.try_get("max_attempts")?),
        state: JobState::parse(&state).with_context(|| format!("unknown job state `{state}`"))?,
        enqueued_at: from_db(row.try_get("enqueued_at")?),
        scheduled_at: from_db(row.try_get("scheduled_at")?),
        last_attempt_at: opt("last_attempt_at")?,
        claimed_at: opt("claimed_at")?,
        visibility_timeout_ms: from_db(row.try_get("visibility_timeout_ms")?),
        lease_expires_at: opt("lease_expires_at")?,
        finished_at: opt("finished_at")?,
        last_error: row.try_get("last_error")?,
        singleton_key: row.try_get("singleton_key")?,
        seq: from_db(row.try_get("seq")?),
    })
}

/// Decodes `rows`, logging and dropping the ones that fail.
fn decode_rows(rows: &[PgRow]) -> Vec<Job> {
    rows.iter()
        .filter_map(|row| match job_from_row(row) {
            Ok(job) => Some(job),
            Err(err) => {
                let id = row.try_get::<Uuid, _>("id").ok();
                error!(job_id = ?id, error = %format!("{err:#}"), "skipping undecodable job row");
                None
            }
        })
        .collect()
}

async fn insert_row(conn: &mut PgConnection, job: &Job) -> anyhow::Result<InsertOutcome> {
    let inserted = sqlx::query(
        r"INSERT INTO jobs (id, queue, payload, attempts, max_attempts, state, enqueued_at,
                scheduled_at, visibility_timeout_ms, singleton_key)
          VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
          ON CONFLICT DO NOTHING
          RETURNING id",
    )
    .bind(*job.id.as_uuid())
    .bind(job.queue.as_str())
    .bind(&job.payload)
    .bind(count_to_db(job.attempts))
    .bind(count_to_db(job.max_attempts))
    .bind(job.state.as_str())
    .bind(to_db(job.enqueued_at))
    .bind(to_db(job.scheduled_at))
    .bind(to_db(job.visibility_timeout_ms))
    .bind(job.singleton_key.as_deref())
    .fetch_optional(&mut *conn)
    .await?;
    if inserted.is_some() {
        return Ok(InsertOutcome::Inserted(job.id));
    }

    let existing: Uuid = sqlx::query_scalar(
        r"SELECT id FROM jobs
          WHERE queue = $1 AND singleton_key = $2 AND state IN ('pending', 'in-flight')",
    )
    .bind(job.queue.as_str())
    .bind(job.singleton_key.as_deref())
    .fetch_one(&mut *conn)
    .await
    .with_context(|| format!("insert of job {} conflicted without a live singleton", job.id))?;
    Ok(InsertOutcome::Duplicate(JobId::from_uuid(existing)))
}

/// Job store over a `PostgreSQL` connection pool.
#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: PgPool,
}

impl PostgresJobStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connects a pool to `database_url`.
    ///
    /// # Errors
    ///
    /// Returns an error if the database is unreachable.
    pub async fn connect(database_url: &str, max_connections: u32) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .context("connect to postgres")?;
        Ok(Self::new(pool))
    }

    /// Creates the `jobs` table and its indexes if they do not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if any DDL statement fails.
    pub async fn initialize(&self) -> anyhow::Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        info!("postgres job store schema ready");
        Ok(())
    }

    /// Dead-letters a claimed row that does not decode so it is never claimed again.
    async fn quarantine(&self, row: &PgRow, err: &anyhow::Error, now: u64) -> anyhow::Result<()> {
        let id: Uuid = row.try_get("id")?;
        let reason = format!("{err:#}");
        error!(job_id = %id, error = %reason, "quarantining undecodable job row");
        sqlx::query(
            r"UPDATE jobs SET state = 'dead-lettered', claimed_at = NULL,
                lease_expires_at = NULL, finished_at = $2, last_error = $3
              WHERE id = $1",
        )
        .bind(id)
        .bind(to_db(now))
        .bind(reason)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    async fn insert(&self, job: Job) -> anyhow::Result<InsertOutcome> {
        let mut conn = self.pool.acquire().await?;
        insert_row(&mut conn, &job).await
    }

    async fn claim_due(&self, now: u64, max_batch: usize) -> anyhow::Result<Vec<Job>> {
        let sql = format!(
            r"WITH due AS (
                SELECT id FROM jobs
                WHERE state = 'pending' AND scheduled_at <= $1
                ORDER BY scheduled_at, seq
                LIMIT $2
                FOR UPDATE SKIP LOCKED
              )
              UPDATE jobs AS j SET
                state = 'in-flight',
                attempts = j.attempts + 1,
                last_attempt_at = $1,
                claimed_at = $1,
                lease_expires_at = $1 + j.visibility_timeout_ms
              FROM due WHERE j.id = due.id
              RETURNING {}",
            COLUMNS
                .split(", ")
                .map(|c| format!("j.{}", c.trim()))
                .collect::<Vec<_>>()
                .join(", ")
        );
        let rows = sqlx::query(&sql)
            .bind(to_db(now))
            .bind(i64::try_from(max_batch).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await?;
        let mut jobs = Vec::with_capacity(rows.len());
        for row in &rows {
            match job_from_row(row) {
                Ok(job) => jobs.push(job),
                Err(err) => self.quarantine(row, &err, now).await?,
            }
        }
        jobs.sort_by_key(|job| (job.scheduled_at, job.seq));
        Ok(jobs)
    }

    async fn get(&self, id: JobId) -> anyhow::Result<Option<Job>> {
        let row = sqlx::query(&format!("SELECT {COLUMNS} FROM jobs WHERE id = $1"))
            .bind(*id.as_uuid())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn apply(&self, transition: Transition) -> anyhow::Result<TransitionOutcome> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(&format!("SELECT {COLUMNS} FROM jobs WHERE id = $1 FOR UPDATE"))
            .bind(*transition.id.as_uuid())
            .fetch_optional(&mut *tx)
            .await?;
        let Some(row) = row else {
            return Ok(TransitionOutcome::NotFound);
        };
        let mut job = job_from_row(&row)
            .with_context(|| format!("job {} cannot be decoded", transition.id))?;
        let outcome = check_claim(&job, transition.expected_attempts);
        if outcome != TransitionOutcome::Applied {
            return Ok(outcome);
        }

        apply_next_state(&mut job, &transition.next, transition.at);
        sqlx::query(
            r"UPDATE jobs SET state = $2, scheduled_at = $3, claimed_at = NULL,
                lease_expires_at = NULL, finished_at = $4, last_error = $5
              WHERE id = $1",
        )
        .bind(*job.id.as_uuid())
        .bind(job.state.as_str())
        .bind(to_db(job.scheduled_at))
        .bind(job.finished_at.map(to_db))
        .bind(job.last_error.as_deref())
        .execute(&mut *tx)
        .await?;
        if let Some(follow_up) = &transition.follow_up {
            insert_row(&mut tx, follow_up).await?;
        }
        tx.commit().await?;
        Ok(TransitionOutcome::Applied)
    }

    async fn expired_leases(&self, now: u64, limit: usize) -> anyhow::Result<Vec<Job>> {
        let rows = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM jobs
             WHERE state = 'in-flight' AND lease_expires_at <= $1
             ORDER BY lease_expires_at, seq LIMIT $2"
        ))
        .bind(to_db(now))
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;
        Ok(decode_rows(&rows))
    }

    async fn purge_finished(&self, queue: QueueName, finished_before: u64) -> anyhow::Result<u64> {
        let result = sqlx::query(
            r"DELETE FROM jobs
              WHERE queue = $1 AND state IN ('completed', 'dead-lettered') AND finished_at <= $2",
        )
        .bind(queue.as_str())
        .bind(to_db(finished_before))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn stats(&self) -> anyhow::Result<Vec<QueueStats>> {
        let rows = sqlx::query("SELECT queue, state, COUNT(*) AS n FROM jobs GROUP BY queue, state")
            .fetch_all(&self.pool)
            .await?;
        let mut by_queue: BTreeMap<QueueName, QueueStats> = BTreeMap::new();
        for row in rows {
            let queue: String = row.try_get("queue")?;
            let state: String = row.try_get("state")?;
            let (Ok(queue), Some(state)) = (queue.parse::<QueueName>(), JobState::parse(&state)) else {
                error!(queue = %queue, state = %state, "skipping stats for unknown queue or state");
                continue;
            };
            let n = from_db(row.try_get("n")?);
            let stats = by_queue
                .entry(queue)
                .or_insert_with(|| QueueStats::empty(queue));
            match state {
                JobState::Pending => stats.pending = n,
                JobState::InFlight => stats.in_flight = n,
                JobState::Completed => stats.completed = n,
                JobState::DeadLettered => stats.dead_lettered = n,
            }
        }
        Ok(by_queue.into_values().collect())
    }

    async fn list(
        &self,
        queue: Option<QueueName>,
        state: Option<JobState>,
        limit: usize,
    ) -> anyhow::Result<Vec<Job>> {
        let rows = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM jobs
             WHERE ($1::TEXT IS NULL OR queue = $1) AND ($2::TEXT IS NULL OR state = $2)
             ORDER BY seq LIMIT $3"
        ))
        .bind(queue.map(QueueName::as_str))
        .bind(state.map(JobState::as_str))
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;
        Ok(decode_rows(&rows))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn column_conversions_saturate() {
        assert_eq!(to_db(u64::MAX), i64::MAX);
        assert_eq!(from_db(-5), 0);
        assert_eq!(count_from_db(3), 3);
        assert_eq!(count_to_db(u32::MAX), i32::MAX);
    }

    #[test]
    fn schema_covers_every_column() {
        let table = SCHEMA[0];
        for column in COLUMNS.split(", ") {
            assert!(table.contains(column.trim()), "missing column {column}");
        }
    }
}
