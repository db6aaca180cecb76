//! Job definitions: per-queue retry policy, visibility window, and dead-letter routing.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::payload::{InvitationSendPayload, JobPayload, NotificationBatchPayload, NotificationDeliverPayload};
use crate::queue::QueueName;
use crate::schema::PayloadSchema;

/// Delay applied before a failed job becomes eligible again.
///
/// Delays are a pure function of the attempt count so retry timing can be
/// predicted exactly in tests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Delay after the first failed attempt.
    pub base_delay: Duration,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
    /// Double the delay after every further failure.
    pub exponential: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(10),
            max_delay: Duration::from_secs(3600),
            exponential: true,
        }
    }
}

impl RetryPolicy {
    /// Fixed delay between attempts.
    #[must_use]
    pub fn fixed(delay: Duration) -> Self {
        Self {
            base_delay: delay,
            max_delay: delay,
            exponential: false,
        }
    }

    /// Delay to wait after `attempts` deliveries have failed.
    ///
    /// `attempts == 0` is treated as the first failure.
    #[must_use]
    pub fn delay_for(&self, attempts: u32) -> Duration {
        let delay = if self.exponential {
            let exponent = attempts.max(1) - 1;
            let factor = 1_u32.checked_shl(exponent).unwrap_or(u32::MAX);
            self.base_delay.saturating_mul(factor)
        } else {
            self.base_delay
        };
        delay.min(self.max_delay)
    }
}

/// Declares how one queue's jobs are processed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDefinition {
    pub queue: QueueName,
    pub schema: PayloadSchema,
    /// Number of deliveries before the job is dead-lettered. Must be at least 1.
    pub max_attempts: u32,
    pub retry: RetryPolicy,
    /// Queue that receives exhausted jobs. `None` for terminal queues.
    pub dead_letter: Option<QueueName>,
    /// How long a claim may stay in flight before it is reclaimed.
    pub visibility_timeout: Duration,
    /// How long terminal jobs are kept before purging.
    pub retention: Duration,
}

const DEFAULT_VISIBILITY: Duration = Duration::from_secs(15 * 60);
const DEFAULT_RETENTION: Duration = Duration::from_secs(14 * 24 * 3600);

impl JobDefinition {
    /// Creates a definition with a single attempt and no dead-letter target.
    #[must_use]
    pub fn new(queue: QueueName, schema: PayloadSchema) -> Self {
        Self {
            queue,
            schema,
            max_attempts: 1,
            retry: RetryPolicy::default(),
            dead_letter: None,
            visibility_timeout: DEFAULT_VISIBILITY,
            retention: DEFAULT_RETENTION,
        }
    }

    /// Terminal definition for a dead-letter queue: one attempt, no further routing.
    #[must_use]
    pub fn dead_letter_sink(queue: QueueName) -> Self {
        Self::new(queue, PayloadSchema::any())
    }

    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    #[must_use]
    pub fn with_dead_letter(mut self, queue: QueueName) -> Self {
        self.dead_letter = Some(queue);
        self
    }

    #[must_use]
    pub fn with_visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    /// Checks the definition's internal consistency.
    ///
    /// # Errors
    ///
    /// Returns a description of the first problem found.
    pub fn check(&self) -> Result<(), String> {
        if self.max_attempts == 0 {
            return Err(format!("{}: max_attempts must be at least 1", self.queue));
        }
        if let Some(dlq) = self.dead_letter {
            if dlq == self.queue {
                return Err(format!("{}: cannot dead-letter into itself", self.queue));
            }
            if !dlq.is_dead_letter() {
                return Err(format!(
                    "{}: dead-letter target {dlq} is not a dead-letter queue",
                    self.queue
                ));
            }
        }
        if self.queue.is_dead_letter() && self.dead_letter.is_some() {
            return Err(format!("{}: dead-letter queues are terminal", self.queue));
        }
        Ok(())
    }
}

/// The production queue table.
#[must_use]
pub fn default_definitions() -> Vec<JobDefinition> {
    let sms_retry = RetryPolicy {
        base_delay: Duration::from_secs(10),
        max_delay: Duration::from_secs(3600),
        exponential: true,
    };
    let week = Duration::from_secs(7 * 24 * 3600);

    vec![
        JobDefinition::dead_letter_sink(QueueName::NotificationDeliverDlq),
        JobDefinition::new(QueueName::NotificationDeliver, NotificationDeliverPayload::schema())
            .with_max_attempts(3)
            .with_retry(sms_retry.clone())
            .with_visibility_timeout(Duration::from_secs(300))
            .with_dead_letter(QueueName::NotificationDeliverDlq)
            .with_retention(week),
        JobDefinition::dead_letter_sink(QueueName::InvitationSendDlq),
        JobDefinition::new(QueueName::InvitationSend, InvitationSendPayload::schema())
            .with_max_attempts(3)
            .with_retry(sms_retry)
            .with_visibility_timeout(Duration::from_secs(300))
            .with_dead_letter(QueueName::InvitationSendDlq)
            .with_retention(week),
        JobDefinition::new(QueueName::NotificationBatch, NotificationBatchPayload::schema())
            .with_retention(Duration::from_secs(3600)),
        JobDefinition::new(QueueName::EventReminders, PayloadSchema::any()),
        JobDefinition::new(QueueName::DailyItineraries, PayloadSchema::any()),
    ]
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn exponential_delays_double_until_capped() {
        let policy = RetryPolicy {
            base_delay: Duration::from_secs(10),
            max_delay: Duration::from_secs(60),
            exponential: true,
        };
        assert_eq!(policy.delay_for(0), Duration::from_secs(10));
        assert_eq!(policy.delay_for(1), Duration::from_secs(10));
        assert_eq!(policy.delay_for(2), Duration::from_secs(20));
        assert_eq!(policy.delay_for(3), Duration::from_secs(40));
        assert_eq!(policy.delay_for(4), Duration::from_secs(60));
        assert_eq!(policy.delay_for(40), Duration::from_secs(60));
    }

    #[test]
    fn fixed_policy_never_grows() {
        let policy = RetryPolicy::fixed(Duration::from_millis(250));
        assert_eq!(policy.delay_for(1), Duration::from_millis(250));
        assert_eq!(policy.delay_for(9), Duration::from_millis(250));
    }

    #[test]
    fn check_rejects_zero_attempts() {
        let def = JobDefinition::new(QueueName::InvitationSend, PayloadSchema::any())
            .with_max_attempts(0);
        assert!(def.check().is_err());
    }

    #[test]
    fn check_rejects_bad_dead_letter_targets() {
        let def = JobDefinition::new(QueueName::InvitationSend, PayloadSchema::any())
            .with_dead_letter(QueueName::NotificationBatch);
        assert!(def.check().unwrap_err().contains("not a dead-letter queue"));

        let def = JobDefinition::dead_letter_sink(QueueName::InvitationSendDlq)
            .with_dead_letter(QueueName::InvitationSendDlq);
        assert!(def.check().unwrap_err().contains("into itself"));

        let def = JobDefinition::dead_letter_sink(QueueName::InvitationSendDlq)
            .with_dead_letter(QueueName::NotificationDeliverDlq);
        assert!(def.check().unwrap_err().contains("terminal"));
    }

    #[test]
    fn default_table_is_consistent() {
        let defs = default_definitions();
        assert_eq!(defs.len(), QueueName::ALL.len());
        for def in &defs {
            def.check().unwrap();
            if let Some(dlq) = def.dead_letter {
                assert!(defs.iter().any(|d| d.queue == dlq));
            }
        }
        let send = defs
            .iter()
            .find(|d| d.queue == QueueName::InvitationSend)
            .unwrap();
        assert_eq!(send.max_attempts, 3);
        assert_eq!(send.dead_letter, Some(QueueName::InvitationSendDlq));
    }

    proptest! {
        #[test]
        fn delay_is_monotonic_and_bounded(
            base_ms in 1_u64..10_000,
            max_ms in 1_u64..1_000_000,
            attempts in 0_u32..64,
        ) {
            let policy = RetryPolicy {
                base_delay: Duration::from_millis(base_ms),
                max_delay: Duration::from_millis(max_ms),
                exponential: true,
            };
            let current = policy.delay_for(attempts);
            let next = policy.delay_for(attempts + 1);
            prop_assert!(current <= policy.max_delay);
            prop_assert!(next >= current);
            prop_assert_eq!(current, policy.delay_for(attempts));
        }
    }
}
