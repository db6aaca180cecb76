//! Wiring shared by the worker binary and integration tests.
//!
//! The registry builds `sms-service`, `trip-directory`, `job-queue`, and
//! `dead-letter-log` on top of the seeded `config` and `clock`; the dispatcher
//! then binds the built-in handlers against that context.

use std::sync::Arc;

use anyhow::Context;
use tracing::info;
use tripful_core::{ClockSource, QueueName};

use crate::config::{AppConfig, StoreKind};
use crate::jobs::dead_letter::DEFAULT_CAPACITY;
use crate::jobs::{
    DailyItineraryHandler, DeadLetterLog, DeadLetterSink, DispatcherConfig, EventReminderHandler,
    JobQueue, JobStore, MemoryJobStore, NotificationBatchHandler, SmsDeliveryHandler,
    WorkerDispatcher,
};
use crate::service::registry::{ApplicationContext, ServiceDescriptor, ServiceRegistry};
use crate::service::service_names;
use crate::service::{SmsService, TripDirectory};

/// Queues served by [`SmsDeliveryHandler`].
pub const SMS_QUEUES: [QueueName; 2] = [QueueName::NotificationDeliver, QueueName::InvitationSend];

/// Opens the store selected by `config.store`.
///
/// # Errors
///
/// Returns an error if the backend cannot be opened, or was not compiled in.
pub async fn open_store(config: &AppConfig) -> anyhow::Result<Arc<dyn JobStore>> {
    match config.store {
        StoreKind::Memory => {
            info!("using in-memory job store; jobs do not survive restarts");
            Ok(Arc::new(MemoryJobStore::new()))
        }
        #[cfg(feature = "redb")]
        StoreKind::Redb => Ok(Arc::new(crate::jobs::stores::RedbJobStore::open(
            &config.redb_path,
        )?)),
        #[cfg(feature = "postgres")]
        StoreKind::Postgres => {
            let url = config
                .database_url
                .as_deref()
                .context("--database-url is required for the postgres store")?;
            let store =
                crate::jobs::stores::PostgresJobStore::connect(url, config.max_connections).await?;
            store.initialize().await?;
            Ok(Arc::new(store))
        }
        #[allow(unreachable_patterns)]
        other => anyhow::bail!("store {other:?} is not enabled in this build"),
    }
}

/// Seeds available to every factory.
#[must_use]
pub fn initial_context(config: AppConfig, clock: Arc<dyn ClockSource>) -> ApplicationContext {
    ApplicationContext::new()
        .with_seed(service_names::CONFIG, config)
        .with_seed(service_names::CLOCK, clock)
}

/// Descriptors for the built-in services.
///
/// # Errors
///
/// Returns an error if a descriptor name is registered twice.
pub fn service_registry(
    store: Arc<dyn JobStore>,
    sms: Arc<dyn SmsService>,
    trips: Arc<dyn TripDirectory>,
) -> anyhow::Result<ServiceRegistry> {
    let mut registry = ServiceRegistry::new();
    registry.register(ServiceDescriptor::new(
        service_names::SMS_SERVICE,
        &[],
        move |_| Ok(sms),
    ))?;
    registry.register(ServiceDescriptor::new(
        service_names::TRIP_DIRECTORY,
        &[],
        move |_| Ok(trips),
    ))?;
    registry.register(ServiceDescriptor::new(
        service_names::DEAD_LETTER_LOG,
        &[],
        |_| Ok(DeadLetterLog::new(DEFAULT_CAPACITY)),
    ))?;
    registry.register(ServiceDescriptor::new(
        service_names::JOB_QUEUE,
        &[service_names::CLOCK],
        move |ctx| {
            let clock = ctx
                .instance::<Arc<dyn ClockSource>>(service_names::CLOCK)
                .context("clock seed missing")?;
            Ok(JobQueue::with_defaults(store, clock)?)
        },
    ))?;
    Ok(registry)
}

/// Builds the application context from the built-in registry.
///
/// # Errors
///
/// Returns an error if registration or any factory fails.
pub fn build_context(
    config: AppConfig,
    clock: Arc<dyn ClockSource>,
    store: Arc<dyn JobStore>,
    sms: Arc<dyn SmsService>,
    trips: Arc<dyn TripDirectory>,
) -> anyhow::Result<ApplicationContext> {
    let context = service_registry(store, sms, trips)?.build(initial_context(config, clock))?;
    Ok(context)
}

/// The job queue built by [`service_registry`].
///
/// # Errors
///
/// Returns an error if `context` has no `job-queue`.
pub fn job_queue(context: &ApplicationContext) -> anyhow::Result<JobQueue> {
    context
        .instance::<JobQueue>(service_names::JOB_QUEUE)
        .context("job-queue is not registered")
}

/// A dispatcher with the SMS, scheduled fan-out, and dead-letter handlers bound.
///
/// # Errors
///
/// Returns an error if a handler dependency is missing from `context`.
pub fn dispatcher(
    context: &ApplicationContext,
    config: DispatcherConfig,
) -> anyhow::Result<WorkerDispatcher> {
    let queue = job_queue(context)?;
    let mut dispatcher = WorkerDispatcher::new(queue, context.clone(), config);
    let sms = Arc::new(SmsDeliveryHandler);
    for queue in SMS_QUEUES {
        dispatcher.register(queue, sms.clone())?;
    }
    dispatcher.register(QueueName::NotificationBatch, Arc::new(NotificationBatchHandler))?;
    dispatcher.register(QueueName::EventReminders, Arc::new(EventReminderHandler))?;
    dispatcher.register(QueueName::DailyItineraries, Arc::new(DailyItineraryHandler))?;
    dispatcher.register_dead_letter_sinks(Arc::new(DeadLetterSink))?;
    info!(queues = ?dispatcher.handled_queues(), "handlers bound");
    Ok(dispatcher)
}
