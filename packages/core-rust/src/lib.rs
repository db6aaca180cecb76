//! Tripful core — queue names, job records, retry policy, and payload schemas.

pub mod clock;
pub mod definition;
pub mod job;
pub mod payload;
pub mod queue;
pub mod schema;

pub use clock::{ClockSource, ManualClock, SystemClock};
pub use definition::{default_definitions, JobDefinition, RetryPolicy};
pub use job::{Job, JobId, JobState, JobView};
pub use payload::{
    DeadLetterPayload, InvitationSendPayload, JobPayload, NotificationBatchPayload,
    NotificationDeliverPayload,
};
pub use queue::{QueueName, UnknownQueueName};
pub use schema::{FieldDef, FieldKind, PayloadSchema, ValidationResult};
