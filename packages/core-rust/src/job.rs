//! Job records and their lifecycle states.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::queue::QueueName;

/// Unique identifier assigned to a job at enqueue time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    /// Generates a fresh random id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wraps an existing UUID.
    #[must_use]
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the underlying UUID.
    #[must_use]
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Lifecycle state of a job.
///
/// State machine: `Pending -> InFlight -> (Completed | Pending | DeadLettered)`.
/// `Completed` and `DeadLettered` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobState {
    /// Waiting for its scheduled time and a free worker.
    Pending,
    /// Claimed by exactly one worker.
    InFlight,
    /// Handler succeeded.
    Completed,
    /// Retry budget exhausted or failure was permanent.
    DeadLettered,
}

impl JobState {
    /// Returns the persisted name of this state.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::InFlight => "in-flight",
            JobState::Completed => "completed",
            JobState::DeadLettered => "dead-lettered",
        }
    }

    /// Parses a persisted state name.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(JobState::Pending),
            "in-flight" => Some(JobState::InFlight),
            "completed" => Some(JobState::Completed),
            "dead-lettered" => Some(JobState::DeadLettered),
            _ => None,
        }
    }

    /// Whether no further transitions are possible.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Completed | JobState::DeadLettered)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted job record.
///
/// All timestamps are milliseconds since the Unix epoch. The record is owned by
/// the job store; handlers only ever see a [`JobView`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub queue: QueueName,
    pub payload: serde_json::Value,
    /// Number of deliveries so far. Incremented when the job is claimed.
    pub attempts: u32,
    pub max_attempts: u32,
    pub state: JobState,
    pub enqueued_at: u64,
    /// Earliest time the job may be claimed.
    pub scheduled_at: u64,
    pub last_attempt_at: Option<u64>,
    /// Start of the current claim; `None` unless in flight.
    pub claimed_at: Option<u64>,
    /// How long a claim stays valid, copied from the queue's definition.
    pub visibility_timeout_ms: u64,
    /// End of the current claim; past it the job may be reclaimed.
    pub lease_expires_at: Option<u64>,
    /// Time the job reached a terminal state.
    pub finished_at: Option<u64>,
    /// Summary of the most recent failure.
    pub last_error: Option<String>,
    /// De-duplication key; at most one non-terminal job per `(queue, key)`.
    pub singleton_key: Option<String>,
    /// Store-assigned insertion sequence, breaks ties on `scheduled_at`.
    pub seq: u64,
}

impl Job {
    /// Builds a new pending job due immediately, with a single attempt.
    ///
    /// The store assigns `seq` on insert.
    #[must_use]
    pub fn new_pending(queue: QueueName, payload: serde_json::Value, now: u64) -> Self {
        Self {
            id: JobId::new(),
            queue,
            payload,
            attempts: 0,
            max_attempts: 1,
            state: JobState::Pending,
            enqueued_at: now,
            scheduled_at: now,
            last_attempt_at: None,
            claimed_at: None,
            visibility_timeout_ms: 0,
            lease_expires_at: None,
            finished_at: None,
            last_error: None,
            singleton_key: None,
            seq: 0,
        }
    }

    /// Read view handed to handlers.
    #[must_use]
    pub fn view(&self) -> JobView {
        JobView {
            id: self.id,
            queue: self.queue,
            payload: self.payload.clone(),
            attempt: self.attempts,
        }
    }

    /// Whether the retry budget allows another delivery after the current one.
    #[must_use]
    pub fn has_attempts_left(&self) -> bool {
        self.attempts < self.max_attempts
    }

    /// Moves a pending job in flight for one more delivery.
    pub fn mark_claimed(&mut self, now: u64) {
        self.state = JobState::InFlight;
        self.attempts = self.attempts.saturating_add(1);
        self.last_attempt_at = Some(now);
        self.claimed_at = Some(now);
        self.lease_expires_at = Some(now.saturating_add(self.visibility_timeout_ms));
    }

    /// Whether the job is due for claiming at `now`.
    #[must_use]
    pub fn is_due(&self, now: u64) -> bool {
        self.state == JobState::Pending && self.scheduled_at <= now
    }
}

/// What a handler sees of a job: identity and data, no bookkeeping.
#[derive(Debug, Clone, PartialEq)]
pub struct JobView {
    pub id: JobId,
    pub queue: QueueName,
    pub payload: serde_json::Value,
    /// 1-based delivery number of this execution.
    pub attempt: u32,
}

impl JobView {
    /// Deserializes the payload into a typed value.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload does not match `T`.
    pub fn payload_as<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn new_job_is_pending_with_no_attempts() {
        let job = Job::new_pending(QueueName::InvitationSend, json!({}), 10);
        assert_eq!(job.state, JobState::Pending);
        assert_eq!(job.attempts, 0);
        assert_eq!(job.scheduled_at, 10);
        assert!(job.has_attempts_left());
        assert!(job.claimed_at.is_none());
        assert!(job.is_due(10));
        assert!(!job.is_due(9));
    }

    #[test]
    fn claiming_counts_a_delivery_and_starts_a_lease() {
        let mut job = Job::new_pending(QueueName::InvitationSend, json!({}), 0);
        job.max_attempts = 2;
        job.visibility_timeout_ms = 300;

        job.mark_claimed(1_000);
        assert_eq!(job.state, JobState::InFlight);
        assert_eq!(job.attempts, 1);
        assert_eq!(job.lease_expires_at, Some(1_300));
        assert!(job.has_attempts_left());
        assert!(!job.is_due(5_000));

        job.mark_claimed(2_000);
        assert_eq!(job.attempts, 2);
        assert!(!job.has_attempts_left());
    }

    #[test]
    fn state_names_parse_back() {
        for state in [
            JobState::Pending,
            JobState::InFlight,
            JobState::Completed,
            JobState::DeadLettered,
        ] {
            assert_eq!(JobState::parse(state.as_str()), Some(state));
        }
        assert_eq!(JobState::parse("running"), None);
    }

    #[test]
    fn only_completed_and_dead_lettered_are_terminal() {
        assert!(!JobState::Pending.is_terminal());
        assert!(!JobState::InFlight.is_terminal());
        assert!(JobState::Completed.is_terminal());
        assert!(JobState::DeadLettered.is_terminal());
    }

    #[test]
    fn job_id_display_parses_back() {
        let id = JobId::new();
        assert_eq!(id.to_string().parse::<JobId>().unwrap(), id);
    }

    #[test]
    fn view_exposes_payload_and_attempt() {
        let mut job = Job::new_pending(
            QueueName::NotificationDeliver,
            json!({"phoneNumber": "+15551234567", "message": "hi"}),
            0,
        );
        job.attempts = 2;
        let view = job.view();
        assert_eq!(view.id, job.id);
        assert_eq!(view.attempt, 2);
        assert_eq!(view.payload["message"], "hi");
    }

    #[test]
    fn record_survives_msgpack() {
        let job = Job::new_pending(QueueName::EventReminders, json!({"a": 1}), 5);
        let bytes = rmp_serde::to_vec_named(&job).expect("serialize");
        let decoded: Job = rmp_serde::from_slice(&bytes).expect("deserialize");
        assert_eq!(decoded, job);
    }
}
