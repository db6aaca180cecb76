//! Worker lifecycle: readiness, shutdown signalling, and in-flight job tracking.
//!
//! Health state lives in an `ArcSwap`. Running jobs are counted per queue
//! behind RAII guards; the last guard to drop wakes anyone draining, so the
//! dispatcher can report which queues held up shutdown.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use tokio::sync::{watch, Notify};
use tracing::{info, warn};
use tripful_core::QueueName;

/// Process lifecycle state.
///
/// State machine: Starting -> Ready -> Draining -> Stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    /// Context is being built; no jobs are claimed yet.
    Starting,
    /// Dispatcher loops are claiming jobs.
    Ready,
    /// No new claims; running jobs are finishing.
    Draining,
    /// Every in-flight job has settled.
    Stopped,
}

impl HealthState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            HealthState::Starting => "starting",
            HealthState::Ready => "ready",
            HealthState::Draining => "draining",
            HealthState::Stopped => "stopped",
        }
    }
}

/// Running job counts keyed by queue; empty queues are removed.
#[derive(Debug, Default)]
struct InFlightJobs {
    by_queue: Mutex<BTreeMap<QueueName, u64>>,
    drained: Notify,
}

impl InFlightJobs {
    fn enter(&self, queue: QueueName) {
        *self.by_queue.lock().entry(queue).or_insert(0) += 1;
    }

    fn leave(&self, queue: QueueName) {
        let mut by_queue = self.by_queue.lock();
        if let Some(count) = by_queue.get_mut(&queue) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                by_queue.remove(&queue);
            }
        }
        if by_queue.is_empty() {
            self.drained.notify_waiters();
        }
    }

    fn total(&self) -> u64 {
        self.by_queue.lock().values().sum()
    }
}

/// Coordinates graceful shutdown of the dispatcher and admin surface.
///
/// 1. Probes read `health_state()`
/// 2. Dispatcher loops watch `shutdown_receiver()` and stop claiming
/// 3. Each running job holds an [`InFlightGuard`] for its queue
/// 4. `wait_for_drain()` resolves once every guard is dropped
#[derive(Debug)]
pub struct ShutdownController {
    shutdown_signal: watch::Sender<bool>,
    in_flight: Arc<InFlightJobs>,
    health_state: Arc<ArcSwap<HealthState>>,
    started_at: Instant,
}

impl ShutdownController {
    /// Creates a controller in the `Starting` state.
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            shutdown_signal: tx,
            in_flight: Arc::new(InFlightJobs::default()),
            health_state: Arc::new(ArcSwap::from_pointee(HealthState::Starting)),
            started_at: Instant::now(),
        }
    }

    pub fn set_ready(&self) {
        self.health_state.store(Arc::new(HealthState::Ready));
    }

    /// Receiver flipped to `true` when shutdown begins.
    #[must_use]
    pub fn shutdown_receiver(&self) -> watch::Receiver<bool> {
        self.shutdown_signal.subscribe()
    }

    /// Moves to `Draining` and signals every receiver.
    pub fn trigger_shutdown(&self) {
        self.health_state.store(Arc::new(HealthState::Draining));
        // Receivers may already be gone.
        let _ = self.shutdown_signal.send(true);
        info!(in_flight = ?self.in_flight_by_queue(), "shutdown triggered, draining jobs");
    }

    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown_signal.borrow()
    }

    #[must_use]
    pub fn health_state(&self) -> HealthState {
        **self.health_state.load()
    }

    /// Marks one job of `queue` as running until the guard is dropped, even if
    /// its handler panics.
    #[must_use]
    pub fn in_flight_guard(&self, queue: QueueName) -> InFlightGuard {
        self.in_flight.enter(queue);
        InFlightGuard {
            in_flight: Arc::clone(&self.in_flight),
            queue,
        }
    }

    #[must_use]
    pub fn in_flight_count(&self) -> u64 {
        self.in_flight.total()
    }

    /// Running jobs per queue; queues with none are omitted.
    #[must_use]
    pub fn in_flight_by_queue(&self) -> BTreeMap<QueueName, u64> {
        self.in_flight.by_queue.lock().clone()
    }

    #[must_use]
    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Waits up to `timeout` for running jobs to finish.
    ///
    /// Returns `true` and moves to `Stopped` once none remain; returns `false`
    /// on timeout and stays `Draining`. Jobs abandoned this way are recovered
    /// by lease expiry on the next start.
    pub async fn wait_for_drain(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            // Registered before the check so a drop in between still wakes us.
            let drained = self.in_flight.drained.notified();
            if self.in_flight.total() == 0 {
                self.health_state.store(Arc::new(HealthState::Stopped));
                return true;
            }
            if tokio::time::timeout_at(deadline, drained).await.is_err() {
                warn!(stuck = ?self.in_flight_by_queue(), "drain timed out with jobs still running");
                return false;
            }
        }
    }
}

impl Default for ShutdownController {
    fn default() -> Self {
        Self::new()
    }
}

/// Decrements its queue's in-flight count on drop.
#[derive(Debug)]
pub struct InFlightGuard {
    in_flight: Arc<InFlightJobs>,
    queue: QueueName,
}

impl InFlightGuard {
    #[must_use]
    pub fn queue(&self) -> QueueName {
        self.queue
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight.leave(self.queue);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_moves_forward() {
        let controller = ShutdownController::new();
        assert_eq!(controller.health_state(), HealthState::Starting);
        assert!(!controller.is_shutting_down());

        controller.set_ready();
        assert_eq!(controller.health_state(), HealthState::Ready);

        controller.trigger_shutdown();
        assert_eq!(controller.health_state(), HealthState::Draining);
        assert!(controller.is_shutting_down());
    }

    #[test]
    fn guards_track_running_jobs_per_queue() {
        let controller = ShutdownController::new();
        let first = controller.in_flight_guard(QueueName::InvitationSend);
        let second = controller.in_flight_guard(QueueName::InvitationSend);
        let reminder = controller.in_flight_guard(QueueName::EventReminders);
        assert_eq!(controller.in_flight_count(), 3);
        assert_eq!(
            controller.in_flight_by_queue(),
            BTreeMap::from([(QueueName::InvitationSend, 2), (QueueName::EventReminders, 1)])
        );

        drop(first);
        drop(reminder);
        assert_eq!(
            controller.in_flight_by_queue(),
            BTreeMap::from([(QueueName::InvitationSend, 1)])
        );
        assert_eq!(second.queue(), QueueName::InvitationSend);
        drop(second);
        assert_eq!(controller.in_flight_count(), 0);
        assert!(controller.in_flight_by_queue().is_empty());
    }

    #[test]
    fn guard_released_when_job_task_panics() {
        let controller = ShutdownController::new();
        let guard = controller.in_flight_guard(QueueName::NotificationDeliver);
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || {
            let _guard = guard;
            panic!("handler blew up");
        }));
        assert!(result.is_err());
        assert_eq!(controller.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn receivers_see_shutdown() {
        let controller = ShutdownController::new();
        let mut rx = controller.shutdown_receiver();
        assert!(!*rx.borrow());

        controller.trigger_shutdown();
        rx.changed().await.unwrap();
        assert!(*rx.borrow());
    }

    #[tokio::test]
    async fn drain_waits_for_running_jobs() {
        let controller = ShutdownController::new();
        controller.set_ready();
        let guard = controller.in_flight_guard(QueueName::NotificationBatch);
        controller.trigger_shutdown();

        let release = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            drop(guard);
        });

        assert!(controller.wait_for_drain(Duration::from_secs(2)).await);
        assert_eq!(controller.health_state(), HealthState::Stopped);
        release.await.unwrap();
    }

    #[tokio::test]
    async fn drain_times_out_with_stuck_job() {
        let controller = ShutdownController::new();
        let _guard = controller.in_flight_guard(QueueName::DailyItineraries);
        controller.trigger_shutdown();

        assert!(!controller.wait_for_drain(Duration::from_millis(50)).await);
        assert_eq!(controller.health_state(), HealthState::Draining);
        assert_eq!(
            controller.in_flight_by_queue(),
            BTreeMap::from([(QueueName::DailyItineraries, 1)])
        );
    }
}
