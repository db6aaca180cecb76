mod common;

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use tripful_core::{JobId, JobState, JobView, ManualClock, QueueName};
use tripful_server::jobs::{
    DispatcherConfig, EnqueueOptions, HandlerServices, JobHandler, JobQueue, MemoryJobStore,
    WorkerDispatcher,
};
use tripful_server::service::{ApplicationContext, MockSmsService, ShutdownController};

use common::{harness, invitation, FailingSmsService};

#[tokio::test]
async fn invitation_is_delivered_and_completed() {
    let sms = Arc::new(MockSmsService::new());
    let h = harness(3, sms.clone());
    let id = h
        .queue
        .enqueue(QueueName::InvitationSend, invitation(), EnqueueOptions::default())
        .await
        .unwrap();

    let report = h.dispatcher.run_once().await.unwrap();
    assert_eq!(report.completed, 1);

    let job = h.queue.get(id).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Completed);
    assert_eq!(job.attempts, 1);
    assert_eq!(sms.sent().len(), 1);
    assert_eq!(sms.sent()[0].message, "You're invited to Lisbon");

    assert_eq!(h.dispatcher.run_once().await.unwrap().claimed, 0);
    assert!(h.dead_letters.is_empty());
}

#[tokio::test]
async fn join_my_trip_invitation_is_sent_once_and_completed() {
    let sms = Arc::new(MockSmsService::new());
    let h = harness(3, sms.clone());
    let id = h
        .queue
        .enqueue(
            QueueName::InvitationSend,
            json!({"phoneNumber": "+15551234567", "message": "Join my trip"}),
            EnqueueOptions::default(),
        )
        .await
        .unwrap();

    let report = h.dispatcher.run_once().await.unwrap();
    assert_eq!((report.claimed, report.completed), (1, 1));

    let sent = sms.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].phone_number, "+15551234567");
    assert_eq!(sent[0].message, "Join my trip");
    let job = h.queue.get(id).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Completed);
    assert_eq!(job.attempts, 1);
}

#[tokio::test]
async fn exhausted_job_reaches_the_dead_letter_sink() {
    let sms = Arc::new(FailingSmsService::default());
    let h = harness(2, sms.clone());
    let id = h
        .queue
        .enqueue(QueueName::InvitationSend, invitation(), EnqueueOptions::default())
        .await
        .unwrap();

    assert_eq!(h.dispatcher.run_once().await.unwrap().retried, 1);
    h.clock.advance(Duration::from_secs(10));
    assert_eq!(h.dispatcher.run_once().await.unwrap().dead_lettered, 1);

    let job = h.queue.get(id).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::DeadLettered);
    assert_eq!(job.attempts, 2);
    assert_eq!(sms.attempts.load(Ordering::SeqCst), 2);

    // The follow-up entry is processed by the sink on the next pass.
    let report = h.dispatcher.run_once().await.unwrap();
    assert_eq!(report.claimed, 1);
    assert_eq!(report.completed, 1);

    let records = h.dead_letters.recent(10);
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].dlq, QueueName::InvitationSendDlq);
    assert_eq!(records[0].original_queue, Some(QueueName::InvitationSend));
    assert_eq!(records[0].original_job_id, Some(id));
    assert!(records[0]
        .error
        .as_deref()
        .unwrap()
        .contains("carrier rejected message"));
}

#[tokio::test]
async fn three_attempts_dead_letter_exactly_once() {
    let sms = Arc::new(FailingSmsService::default());
    let h = harness(3, sms.clone());
    h.queue
        .enqueue(QueueName::InvitationSend, invitation(), EnqueueOptions::default())
        .await
        .unwrap();

    assert_eq!(h.dispatcher.run_once().await.unwrap().retried, 1);
    h.clock.advance(Duration::from_secs(10));
    assert_eq!(h.dispatcher.run_once().await.unwrap().retried, 1);
    // Second retry waits twice as long.
    h.clock.advance(Duration::from_secs(10));
    assert_eq!(h.dispatcher.run_once().await.unwrap().claimed, 0);
    h.clock.advance(Duration::from_secs(10));
    assert_eq!(h.dispatcher.run_once().await.unwrap().dead_lettered, 1);

    for _ in 0..3 {
        h.clock.advance(Duration::from_secs(3600));
        h.dispatcher.run_once().await.unwrap();
    }
    assert_eq!(sms.attempts.load(Ordering::SeqCst), 3);
    assert_eq!(h.dead_letters.total_recorded(), 1);
    assert_eq!(
        h.queue
            .list(Some(QueueName::InvitationSendDlq), None, 10)
            .await
            .unwrap()
            .len(),
        1
    );
}

#[tokio::test]
async fn completing_twice_changes_nothing() {
    let h = harness(3, Arc::new(MockSmsService::new()));
    let id = h
        .queue
        .enqueue(QueueName::InvitationSend, invitation(), EnqueueOptions::default())
        .await
        .unwrap();
    h.queue.claim_due(1).await.unwrap();

    h.queue.complete(id).await.unwrap();
    let first = h.queue.get(id).await.unwrap().unwrap();
    h.clock.advance(Duration::from_secs(5));
    h.queue.complete(id).await.unwrap();
    let second = h.queue.get(id).await.unwrap().unwrap();

    assert_eq!(first, second);
    assert_eq!(second.state, JobState::Completed);
}

struct Tally {
    seen: Mutex<HashMap<JobId, u32>>,
}

#[async_trait]
impl JobHandler for Tally {
    async fn handle(&self, job: &JobView, _services: &HandlerServices) -> anyhow::Result<()> {
        tokio::time::sleep(Duration::from_millis(1)).await;
        *self.seen.lock().entry(job.id).or_default() += 1;
        Ok(())
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_workers_claim_each_job_once() {
    const JOBS: usize = 60;
    let queue = JobQueue::with_defaults(
        Arc::new(MemoryJobStore::new()),
        Arc::new(ManualClock::new(1_000)),
    )
    .unwrap();
    let tally = Arc::new(Tally {
        seen: Mutex::new(HashMap::new()),
    });
    let mut dispatcher = WorkerDispatcher::new(
        queue.clone(),
        ApplicationContext::new(),
        DispatcherConfig {
            worker_count: 4,
            batch_size: 3,
            poll_interval: Duration::from_millis(5),
            ..DispatcherConfig::default()
        },
    );
    dispatcher
        .register(QueueName::InvitationSend, tally.clone())
        .unwrap();

    let mut ids = Vec::with_capacity(JOBS);
    for _ in 0..JOBS {
        ids.push(
            queue
                .enqueue(QueueName::InvitationSend, invitation(), EnqueueOptions::default())
                .await
                .unwrap(),
        );
    }

    let shutdown = Arc::new(ShutdownController::new());
    let handle = dispatcher.start(Arc::clone(&shutdown));
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while tally.seen.lock().len() < JOBS && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(handle.shutdown().await);

    {
        let seen = tally.seen.lock();
        assert_eq!(seen.len(), JOBS);
        assert!(seen.values().all(|&count| count == 1));
    }
    for id in ids {
        assert_eq!(
            queue.get(id).await.unwrap().unwrap().state,
            JobState::Completed
        );
    }
}
