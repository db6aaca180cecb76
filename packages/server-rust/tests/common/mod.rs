#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tripful_core::{ClockSource, JobDefinition, ManualClock, PayloadSchema, QueueName, RetryPolicy};
use tripful_server::jobs::{
    DeadLetterLog, DeadLetterSink, DispatcherConfig, JobQueue, MemoryJobStore,
    SmsDeliveryHandler, WorkerDispatcher,
};
use tripful_server::service::{service_names, ApplicationContext, SmsService};

/// Transport that rejects every message.
#[derive(Default)]
pub struct FailingSmsService {
    pub attempts: AtomicU32,
}

#[async_trait]
impl SmsService for FailingSmsService {
    async fn send_message(&self, _phone_number: &str, _message: &str) -> anyhow::Result<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        anyhow::bail!("carrier rejected message")
    }
}

pub struct Harness {
    pub dispatcher: WorkerDispatcher,
    pub queue: JobQueue,
    pub clock: Arc<ManualClock>,
    pub dead_letters: Arc<DeadLetterLog>,
}

pub fn invitation() -> Value {
    json!({"phoneNumber": "+15551234567", "message": "You're invited to Lisbon"})
}

/// `invitation-send` with `max_attempts`, 10s exponential backoff, and a DLQ.
pub fn invitation_definition(max_attempts: u32) -> JobDefinition {
    JobDefinition::new(QueueName::InvitationSend, PayloadSchema::any())
        .with_max_attempts(max_attempts)
        .with_retry(RetryPolicy {
            base_delay: Duration::from_secs(10),
            max_delay: Duration::from_secs(3600),
            exponential: true,
        })
        .with_dead_letter(QueueName::InvitationSendDlq)
}

/// Dispatcher over an in-memory store with the SMS handler and DLQ sink bound.
pub fn harness(max_attempts: u32, sms: Arc<dyn SmsService>) -> Harness {
    let clock = Arc::new(ManualClock::new(1_700_000_000_000));
    let dyn_clock: Arc<dyn ClockSource> = clock.clone();
    let queue = JobQueue::new(Arc::new(MemoryJobStore::new()), dyn_clock.clone());
    queue.define(invitation_definition(max_attempts)).unwrap();

    let context = ApplicationContext::new()
        .with_seed(service_names::CLOCK, dyn_clock)
        .with_seed(service_names::SMS_SERVICE, sms)
        .with_seed(service_names::DEAD_LETTER_LOG, DeadLetterLog::default());
    let dead_letters = context
        .get::<DeadLetterLog>(service_names::DEAD_LETTER_LOG)
        .unwrap();

    let mut dispatcher = WorkerDispatcher::new(
        queue.clone(),
        context,
        DispatcherConfig {
            batch_size: 10,
            ..DispatcherConfig::default()
        },
    );
    dispatcher
        .register(QueueName::InvitationSend, Arc::new(SmsDeliveryHandler))
        .unwrap();
    dispatcher
        .register_dead_letter_sinks(Arc::new(DeadLetterSink))
        .unwrap();

    Harness {
        dispatcher,
        queue,
        clock,
        dead_letters,
    }
}
