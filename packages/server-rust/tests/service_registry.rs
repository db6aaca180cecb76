use std::sync::Arc;

use serde_json::json;
use tripful_core::{JobState, ManualClock, QueueName};
use tripful_server::app;
use tripful_server::jobs::{EnqueueOptions, JobQueue, MemoryJobStore};
use tripful_server::service::{
    service_names, ApplicationContext, InMemoryTripDirectory, MockSmsService, RegistryError,
    ServiceDescriptor, ServiceRegistry,
};
use tripful_server::AppConfig;

/// A producer built on top of the registry's job queue.
struct InvitationSender {
    queue: JobQueue,
}

fn builtin_registry() -> ServiceRegistry {
    app::service_registry(
        Arc::new(MemoryJobStore::new()),
        Arc::new(MockSmsService::new()),
        Arc::new(InMemoryTripDirectory::new()),
    )
    .unwrap()
}

fn seeds() -> ApplicationContext {
    app::initial_context(AppConfig::default(), Arc::new(ManualClock::new(0)))
}

#[tokio::test]
async fn dependent_service_sees_the_built_queue() {
    let mut registry = builtin_registry();
    // Registered before its dependency; build order still resolves it after.
    registry
        .register(ServiceDescriptor::new(
            "invitation-sender",
            &[service_names::JOB_QUEUE],
            |ctx| {
                let queue = ctx
                    .instance::<JobQueue>(service_names::JOB_QUEUE)
                    .ok_or_else(|| anyhow::anyhow!("job-queue not visible"))?;
                Ok(InvitationSender { queue })
            },
        ))
        .unwrap();

    let context = registry.build(seeds()).unwrap();
    let names: Vec<&str> = context.names().collect();
    let queue_at = names.iter().position(|n| *n == service_names::JOB_QUEUE).unwrap();
    let sender_at = names.iter().position(|n| *n == "invitation-sender").unwrap();
    assert!(queue_at < sender_at);

    let sender = context.require::<InvitationSender>("invitation-sender").unwrap();
    let id = sender
        .queue
        .enqueue(
            QueueName::InvitationSend,
            json!({"phoneNumber": "+15551234567", "message": "hi"}),
            EnqueueOptions::default(),
        )
        .await
        .unwrap();

    let queue = app::job_queue(&context).unwrap();
    assert_eq!(queue.get(id).await.unwrap().unwrap().state, JobState::Pending);
}

#[test]
fn cycle_is_reported_before_any_factory_runs() {
    let mut registry = ServiceRegistry::new();
    registry
        .register(ServiceDescriptor::new("trips", &["members"], |_| {
            Ok::<_, anyhow::Error>(1_u8)
        }))
        .unwrap();
    registry
        .register(ServiceDescriptor::new("members", &["trips"], |_| {
            Ok::<_, anyhow::Error>(2_u8)
        }))
        .unwrap();

    match registry.build(ApplicationContext::new()) {
        Err(RegistryError::CyclicDependency { cycle, .. }) => {
            assert_eq!(cycle.first(), cycle.last());
            assert!(cycle.contains(&"trips".to_string()));
            assert!(cycle.contains(&"members".to_string()));
        }
        other => panic!("expected cycle, got {other:?}"),
    }
}

#[test]
fn missing_dependency_names_both_sides() {
    let mut registry = builtin_registry();
    registry
        .register(ServiceDescriptor::new("push", &["apns-client"], |_| {
            Ok::<_, anyhow::Error>(())
        }))
        .unwrap();

    let err = registry.build(seeds()).unwrap_err();
    assert!(matches!(
        err,
        RegistryError::MissingDependency { ref service, ref dependency }
            if service == "push" && dependency == "apns-client"
    ));
}

#[test]
fn duplicate_names_are_rejected() {
    let mut registry = builtin_registry();
    let err = registry
        .register(ServiceDescriptor::new(service_names::JOB_QUEUE, &[], |_| {
            Ok::<_, anyhow::Error>(())
        }))
        .unwrap_err();
    assert!(matches!(err, RegistryError::DuplicateService { .. }));

    // A descriptor may not shadow a seed either.
    let mut registry = builtin_registry();
    registry
        .register(ServiceDescriptor::new(service_names::CONFIG, &[], |_| {
            Ok::<_, anyhow::Error>(())
        }))
        .unwrap();
    assert!(matches!(
        registry.build(seeds()),
        Err(RegistryError::DuplicateService { name }) if name == "config"
    ));
}

#[test]
fn factory_failure_names_the_service() {
    let mut registry = builtin_registry();
    registry
        .register(ServiceDescriptor::new(
            "calendar-sync",
            &[service_names::CONFIG],
            |_| -> anyhow::Result<()> { anyhow::bail!("calendar credentials missing") },
        ))
        .unwrap();

    match registry.build(seeds()) {
        Err(RegistryError::Factory { service, source }) => {
            assert_eq!(service, "calendar-sync");
            assert!(source.to_string().contains("credentials"));
        }
        other => panic!("expected factory error, got {other:?}"),
    }
}
