use tripful_core::{JobId, QueueName};

/// Errors surfaced by [`JobQueue`](super::JobQueue) and the dispatcher.
///
/// `UnknownQueue`, `DuplicateDefinition`, `InvalidDefinition` and
/// `UnregisteredHandler` are configuration errors; `Store` wraps
/// infrastructure failures from the backing [`JobStore`](super::JobStore).
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("unknown queue: {name}")]
    UnknownQueue { name: String },

    #[error("payload rejected by `{queue}` schema: {}", .errors.join("; "))]
    InvalidPayload { queue: QueueName, errors: Vec<String> },

    #[error("queue `{queue}` is already defined")]
    DuplicateDefinition { queue: QueueName },

    #[error("invalid definition for `{queue}`: {reason}")]
    InvalidDefinition { queue: QueueName, reason: String },

    #[error("job {id} not found")]
    JobNotFound { id: JobId },

    #[error("no handler registered for queue `{queue}`")]
    UnregisteredHandler { queue: QueueName },

    #[error("payload serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("job store error: {0:#}")]
    Store(#[source] anyhow::Error),
}

impl JobError {
    /// Whether the error reflects a setup mistake rather than a runtime fault.
    #[must_use]
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            JobError::UnknownQueue { .. }
                | JobError::DuplicateDefinition { .. }
                | JobError::InvalidDefinition { .. }
                | JobError::UnregisteredHandler { .. }
        )
    }
}

impl From<anyhow::Error> for JobError {
    fn from(err: anyhow::Error) -> Self {
        JobError::Store(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_payload_lists_every_problem() {
        let err = JobError::InvalidPayload {
            queue: QueueName::InvitationSend,
            errors: vec!["missing field `phoneNumber`".into(), "unknown field `x`".into()],
        };
        assert_eq!(
            err.to_string(),
            "payload rejected by `invitation-send` schema: missing field `phoneNumber`; unknown field `x`"
        );
    }

    #[test]
    fn configuration_errors_are_classified() {
        assert!(JobError::UnknownQueue { name: "nope".into() }.is_configuration());
        assert!(JobError::UnregisteredHandler {
            queue: QueueName::EventReminders
        }
        .is_configuration());
        assert!(!JobError::Store(anyhow::anyhow!("down")).is_configuration());
    }
}
