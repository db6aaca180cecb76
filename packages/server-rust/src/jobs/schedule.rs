//! Recurring enqueues and periodic queue maintenance.
//!
//! Both run as [`BackgroundRunnable`]s. The scheduler enqueues each schedule
//! once per time slot; the singleton key `"<queue>:<slot>"` keeps several
//! worker processes from enqueueing the same slot twice while it is live.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{debug, info, warn};
use tripful_core::clock::duration_millis;
use tripful_core::QueueName;

use super::queue::{EnqueueOptions, JobQueue};
use crate::service::worker::BackgroundRunnable;

/// A queue that receives one job every `every`.
#[derive(Debug, Clone, PartialEq)]
pub struct Schedule {
    pub queue: QueueName,
    pub every: Duration,
    pub payload: Value,
}

impl Schedule {
    #[must_use]
    pub fn new(queue: QueueName, every: Duration) -> Self {
        Self {
            queue,
            every,
            payload: json!({}),
        }
    }

    #[must_use]
    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    /// Index of the slot containing `now`.
    #[must_use]
    pub fn slot(&self, now: u64) -> u64 {
        now / duration_millis(self.every).max(1)
    }

    #[must_use]
    pub fn singleton_key(&self, slot: u64) -> String {
        format!("{}:{slot}", self.queue)
    }
}

/// Reminder scan every 5 minutes, itinerary digest every 15 minutes.
#[must_use]
pub fn default_schedules() -> Vec<Schedule> {
    vec![
        Schedule::new(QueueName::EventReminders, Duration::from_secs(5 * 60)),
        Schedule::new(QueueName::DailyItineraries, Duration::from_secs(15 * 60)),
    ]
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

/// On-demand scheduler tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerTask {
    /// Enqueue every schedule whose current slot has not been enqueued yet.
    FireDue,
}

/// Enqueues recurring jobs on each tick.
#[derive(Debug)]
pub struct Scheduler {
    queue: JobQueue,
    schedules: Vec<Schedule>,
    last_slot: HashMap<QueueName, u64>,
}

impl Scheduler {
    #[must_use]
    pub fn new(queue: JobQueue, schedules: Vec<Schedule>) -> Self {
        Self {
            queue,
            schedules,
            last_slot: HashMap::new(),
        }
    }

    /// Enqueues each schedule whose slot changed since the last call.
    ///
    /// Returns how many schedules fired.
    pub async fn fire_due(&mut self) -> usize {
        let now = self.queue.now();
        let mut fired = 0;
        for schedule in &self.schedules {
            let slot = schedule.slot(now);
            if self.last_slot.get(&schedule.queue) == Some(&slot) {
                continue;
            }
            let options = EnqueueOptions::singleton(schedule.singleton_key(slot));
            match self
                .queue
                .enqueue(schedule.queue, schedule.payload.clone(), options)
                .await
            {
                Ok(job_id) => {
                    debug!(queue = %schedule.queue, slot, job_id = %job_id, "scheduled job enqueued");
                    self.last_slot.insert(schedule.queue, slot);
                    fired += 1;
                }
                Err(err) => {
                    warn!(queue = %schedule.queue, slot, error = %err, "scheduled enqueue failed");
                }
            }
        }
        fired
    }
}

#[async_trait]
impl BackgroundRunnable for Scheduler {
    type Task = SchedulerTask;

    fn name(&self) -> &'static str {
        "scheduler"
    }

    /// A restarted worker catches up on the current slot right away.
    fn tick_on_start(&self) -> bool {
        true
    }

    async fn run(&mut self, task: SchedulerTask) {
        match task {
            SchedulerTask::FireDue => {
                self.fire_due().await;
            }
        }
    }

    async fn on_tick(&mut self) {
        self.fire_due().await;
    }

    async fn shutdown(&mut self) {
        debug!("scheduler stopped");
    }
}

// ---------------------------------------------------------------------------
// Maintenance
// ---------------------------------------------------------------------------

/// On-demand maintenance passes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaintenanceTask {
    /// Fail jobs whose lease has expired.
    Reclaim,
    /// Delete terminal jobs past retention.
    Purge,
}

/// Reclaims expired leases and purges old jobs on every tick.
#[derive(Debug)]
pub struct Maintenance {
    queue: JobQueue,
    reclaim_batch: usize,
}

impl Maintenance {
    #[must_use]
    pub fn new(queue: JobQueue, reclaim_batch: usize) -> Self {
        Self {
            queue,
            reclaim_batch: reclaim_batch.max(1),
        }
    }

    async fn reclaim(&self) {
        match self.queue.reclaim_expired(self.reclaim_batch).await {
            Ok(0) => {}
            Ok(n) => info!(reclaimed = n, "expired leases reclaimed"),
            Err(err) => warn!(error = %err, "lease reclaim failed"),
        }
    }

    async fn purge(&self) {
        if let Err(err) = self.queue.purge_finished().await {
            warn!(error = %err, "purge failed");
        }
    }
}

#[async_trait]
impl BackgroundRunnable for Maintenance {
    type Task = MaintenanceTask;

    fn name(&self) -> &'static str {
        "maintenance"
    }

    async fn run(&mut self, task: MaintenanceTask) {
        match task {
            MaintenanceTask::Reclaim => self.reclaim().await,
            MaintenanceTask::Purge => self.purge().await,
        }
    }

    async fn on_tick(&mut self) {
        self.reclaim().await;
        self.purge().await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tripful_core::{JobState, ManualClock};

    use super::*;
    use crate::jobs::stores::MemoryJobStore;
    use crate::service::worker::BackgroundWorker;

    fn queue(at: u64) -> (JobQueue, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(at));
        let queue = JobQueue::with_defaults(Arc::new(MemoryJobStore::new()), clock.clone()).unwrap();
        (queue, clock)
    }

    #[test]
    fn slots_and_keys() {
        let schedule = Schedule::new(QueueName::EventReminders, Duration::from_secs(300));
        assert_eq!(schedule.slot(0), 0);
        assert_eq!(schedule.slot(299_999), 0);
        assert_eq!(schedule.slot(300_000), 1);
        assert_eq!(schedule.singleton_key(4), "event-reminders:4");
    }

    #[tokio::test]
    async fn fires_once_per_slot() {
        let (queue, clock) = queue(0);
        let mut scheduler = Scheduler::new(queue.clone(), default_schedules());

        assert_eq!(scheduler.fire_due().await, 2);
        assert_eq!(scheduler.fire_due().await, 0);

        clock.advance(Duration::from_secs(5 * 60));
        assert_eq!(scheduler.fire_due().await, 1);

        let reminders = queue
            .list(Some(QueueName::EventReminders), None, 10)
            .await
            .unwrap();
        assert_eq!(reminders.len(), 2);
        assert_eq!(
            reminders[1].singleton_key.as_deref(),
            Some("event-reminders:1")
        );
    }

    #[tokio::test]
    async fn overlapping_schedulers_share_a_slot() {
        let (queue, _) = queue(1_000);
        let mut first = Scheduler::new(queue.clone(), default_schedules());
        let mut second = Scheduler::new(queue.clone(), default_schedules());
        first.fire_due().await;
        second.fire_due().await;

        let pending = queue
            .list(None, Some(JobState::Pending), 10)
            .await
            .unwrap();
        assert_eq!(pending.len(), 2);
    }

    #[tokio::test]
    async fn maintenance_reclaims_expired_leases() {
        let (queue, clock) = queue(0);
        let id = queue
            .enqueue(
                QueueName::InvitationSend,
                json!({"phoneNumber": "+15551234567", "message": "hi"}),
                EnqueueOptions::default(),
            )
            .await
            .unwrap();
        queue.claim_due(1).await.unwrap();
        clock.advance(Duration::from_secs(600));

        let mut maintenance = Maintenance::new(queue.clone(), 10);
        maintenance.run(MaintenanceTask::Reclaim).await;

        let job = queue.get(id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Pending);
        assert_eq!(job.attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn scheduler_runs_on_background_ticks() {
        let (queue, _) = queue(0);
        let mut worker = BackgroundWorker::start(
            Scheduler::new(queue.clone(), default_schedules()),
            Duration::from_secs(1),
        );
        // The start-up tick enqueues before the first interval elapses.
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(queue.list(None, None, 10).await.unwrap().len(), 2);

        tokio::time::sleep(Duration::from_millis(1_000)).await;
        let stats = worker.stop().await;
        assert_eq!(stats.ticks, 2);
        // Same slot on the manual clock, so the interval tick adds nothing.
        assert_eq!(queue.list(None, None, 10).await.unwrap().len(), 2);
    }
}
