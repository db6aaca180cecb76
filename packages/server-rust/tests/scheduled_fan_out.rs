use std::sync::Arc;

use tripful_core::{ClockSource, JobState, ManualClock, QueueName};
use tripful_server::app;
use tripful_server::config::{AppConfig, StoreKind};
use tripful_server::jobs::{default_schedules, DispatcherConfig, MemoryJobStore, Scheduler};
use tripful_server::service::{
    InMemoryTripDirectory, MockSmsService, NotificationPrefs, SmsService, TripDirectory,
    TripMember, UpcomingEvent,
};

const NOW: u64 = 1_700_000_000_000;

#[tokio::test]
async fn scheduled_reminder_reaches_going_members_by_sms() {
    let clock: Arc<dyn ClockSource> = Arc::new(ManualClock::new(NOW));
    let sms = Arc::new(MockSmsService::new());
    let directory = Arc::new(InMemoryTripDirectory::new());
    directory.add_event(UpcomingEvent {
        id: "walking-tour".into(),
        trip_id: "lisbon".into(),
        trip_name: "Lisbon".into(),
        name: "Alfama walking tour".into(),
        location: None,
        starts_at: NOW + 60 * 60_000,
    });
    for (user_id, phone_number) in [("ana", "+15550000001"), ("rui", "+15550000002")] {
        directory.add_member(
            "lisbon",
            TripMember {
                user_id: user_id.into(),
                phone_number: phone_number.into(),
                prefs: NotificationPrefs::default(),
            },
        );
    }

    let transport: Arc<dyn SmsService> = sms.clone();
    let trips: Arc<dyn TripDirectory> = directory;
    let config = AppConfig {
        store: StoreKind::Memory,
        ..AppConfig::default()
    };
    let context = app::build_context(
        config,
        clock,
        Arc::new(MemoryJobStore::new()),
        transport,
        trips,
    )
    .unwrap();
    let queue = app::job_queue(&context).unwrap();
    let dispatcher = app::dispatcher(
        &context,
        DispatcherConfig {
            batch_size: 10,
            ..DispatcherConfig::default()
        },
    )
    .unwrap();

    let mut scheduler = Scheduler::new(queue.clone(), default_schedules());
    assert_eq!(scheduler.fire_due().await, 2);
    assert_eq!(scheduler.fire_due().await, 0);

    // scan -> batch -> one delivery per member
    for _ in 0..3 {
        dispatcher.run_once().await.unwrap();
    }

    let mut sent: Vec<(String, String)> = sms
        .sent()
        .into_iter()
        .map(|m| (m.phone_number, m.message))
        .collect();
    sent.sort();
    let message = "Lisbon: Alfama walking tour starts in 1 hour".to_string();
    assert_eq!(
        sent,
        vec![
            ("+15550000001".to_string(), message.clone()),
            ("+15550000002".to_string(), message),
        ]
    );

    for queue_name in [
        QueueName::EventReminders,
        QueueName::DailyItineraries,
        QueueName::NotificationBatch,
        QueueName::NotificationDeliver,
    ] {
        let stats = queue.stats().await.unwrap();
        let stats = stats.iter().find(|s| s.queue == queue_name).unwrap();
        assert_eq!(stats.dead_lettered, 0, "{queue_name}");
        assert_eq!(stats.pending + stats.in_flight, 0, "{queue_name}");
    }
    assert!(queue
        .list(None, Some(JobState::DeadLettered), 10)
        .await
        .unwrap()
        .is_empty());
}
