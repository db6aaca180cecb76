//! Durable job queue, worker dispatcher, and dead-letter handling.

pub mod dead_letter;
pub mod dispatcher;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod queue;
pub mod schedule;
pub mod store;
pub mod stores;

pub use dead_letter::{DeadLetterLog, DeadLetterRecord, DeadLetterSink};
pub use dispatcher::{
    DispatchReport, DispatcherConfig, DispatcherHandle, HandlerServices, JobHandler,
    WorkerDispatcher,
};
pub use error::JobError;
pub use handlers::{
    DailyItineraryHandler, EventReminderHandler, NotificationBatchHandler, SmsDeliveryHandler,
};
pub use queue::{EnqueueOptions, FailOutcome, Failure, JobQueue};
pub use schedule::{default_schedules, Maintenance, MaintenanceTask, Schedule, Scheduler};
pub use store::{InsertOutcome, JobStore, NextState, QueueStats, Transition, TransitionOutcome};
pub use stores::MemoryJobStore;
