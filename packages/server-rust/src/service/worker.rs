//! Background worker for periodic and on-demand tasks.
//!
//! A `BackgroundWorker<R>` owns one tokio task that feeds tasks from an mpsc
//! channel to a [`BackgroundRunnable`] and calls its `on_tick` hook on a fixed
//! interval. The recurring scheduler and queue maintenance both run on it,
//! each inside a `background` span named after the runnable.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, info_span, Instrument};

/// Channel capacity for submitted tasks.
const TASK_CAPACITY: usize = 256;

// ---------------------------------------------------------------------------
// BackgroundRunnable trait
// ---------------------------------------------------------------------------

/// Work executed by a [`BackgroundWorker`].
#[async_trait]
pub trait BackgroundRunnable: Send + 'static {
    /// On-demand task type.
    type Task: Send + 'static;

    /// Short name used in logs, e.g. `"scheduler"`.
    fn name(&self) -> &'static str;

    /// Whether `on_tick` also runs once right after start.
    fn tick_on_start(&self) -> bool {
        false
    }

    async fn run(&mut self, task: Self::Task);

    /// Called once per tick interval. Default is a no-op.
    async fn on_tick(&mut self) {}

    /// Called once after the loop exits. Default is a no-op.
    async fn shutdown(&mut self) {}
}

// ---------------------------------------------------------------------------
// BackgroundWorker
// ---------------------------------------------------------------------------

/// Ticks and tasks a worker has completed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub ticks: u64,
    pub tasks: u64,
}

#[derive(Debug, Default)]
struct Counters {
    ticks: AtomicU64,
    tasks: AtomicU64,
}

/// Handle to a running background task.
///
/// Ticks that fall behind are delayed rather than bunched, so a slow
/// `on_tick` never runs back to back.
pub struct BackgroundWorker<R: BackgroundRunnable> {
    name: &'static str,
    tx: Option<mpsc::Sender<R::Task>>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    handle: Option<tokio::task::JoinHandle<()>>,
    counters: Arc<Counters>,
}

impl<R: BackgroundRunnable> std::fmt::Debug for BackgroundWorker<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackgroundWorker")
            .field("name", &self.name)
            .field("running", &self.is_running())
            .field("stats", &self.stats())
            .finish()
    }
}

impl<R: BackgroundRunnable> BackgroundWorker<R> {
    /// Spawns the worker. The first interval tick fires one `tick_interval`
    /// after start, preceded by an immediate one if the runnable asks for it.
    pub fn start(mut runnable: R, tick_interval: Duration) -> Self {
        let name = runnable.name();
        let (tx, mut rx) = mpsc::channel::<R::Task>(TASK_CAPACITY);
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
        let counters = Arc::new(Counters::default());
        let seen = Arc::clone(&counters);

        let task = async move {
            let mut ticker = tokio::time::interval(tick_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately; skip it.
            ticker.tick().await;
            if runnable.tick_on_start() {
                runnable.on_tick().await;
                seen.ticks.fetch_add(1, Ordering::Relaxed);
            }

            loop {
                tokio::select! {
                    task = rx.recv() => {
                        match task {
                            Some(t) => {
                                runnable.run(t).await;
                                seen.tasks.fetch_add(1, Ordering::Relaxed);
                            }
                            None => break,
                        }
                    }
                    _ = ticker.tick() => {
                        runnable.on_tick().await;
                        seen.ticks.fetch_add(1, Ordering::Relaxed);
                    }
                    _ = &mut shutdown_rx => {
                        break;
                    }
                }
            }

            runnable.shutdown().await;
            debug!(
                ticks = seen.ticks.load(Ordering::Relaxed),
                tasks = seen.tasks.load(Ordering::Relaxed),
                "background worker stopped"
            );
        };
        let handle = tokio::spawn(task.instrument(info_span!("background", worker = name)));
        info!(worker = name, tick_ms = tick_interval.as_millis(), "background worker started");

        Self {
            name,
            tx: Some(tx),
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
            counters,
        }
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    #[must_use]
    pub fn stats(&self) -> WorkerStats {
        WorkerStats {
            ticks: self.counters.ticks.load(Ordering::Relaxed),
            tasks: self.counters.tasks.load(Ordering::Relaxed),
        }
    }

    /// Queues a task for the worker.
    ///
    /// # Errors
    ///
    /// Returns an error if the worker has been stopped.
    pub async fn submit(&self, task: R::Task) -> anyhow::Result<()> {
        match &self.tx {
            Some(tx) => tx
                .send(task)
                .await
                .map_err(|_| anyhow::anyhow!("worker channel closed")),
            None => Err(anyhow::anyhow!("worker not running")),
        }
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Signals the loop to exit, waits for `shutdown` to return, and reports
    /// what the worker did.
    pub async fn stop(&mut self) -> WorkerStats {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        self.tx.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
        self.stats()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;

    use super::*;

    #[derive(Default)]
    struct Seen {
        runs: AtomicU32,
        ticks: AtomicU32,
        shutdowns: AtomicU32,
    }

    struct Recorder(Arc<Seen>, bool);

    #[async_trait]
    impl BackgroundRunnable for Recorder {
        type Task = u32;

        fn name(&self) -> &'static str {
            "recorder"
        }

        fn tick_on_start(&self) -> bool {
            self.1
        }

        async fn run(&mut self, task: u32) {
            self.0.runs.fetch_add(task, Ordering::SeqCst);
        }

        async fn on_tick(&mut self) {
            self.0.ticks.fetch_add(1, Ordering::SeqCst);
        }

        async fn shutdown(&mut self) {
            self.0.shutdowns.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn runs_submitted_tasks_then_shuts_down() {
        let counters = Arc::new(Seen::default());
        let mut worker =
            BackgroundWorker::start(Recorder(counters.clone(), false), Duration::from_secs(60));
        assert!(worker.is_running());
        assert_eq!(worker.name(), "recorder");

        worker.submit(1).await.unwrap();
        worker.submit(2).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(counters.runs.load(Ordering::SeqCst), 3);

        let stats = worker.stop().await;
        assert_eq!(stats, WorkerStats { ticks: 0, tasks: 2 });
        assert_eq!(counters.shutdowns.load(Ordering::SeqCst), 1);
        assert!(!worker.is_running());
        assert!(worker.submit(4).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn ticks_follow_the_interval() {
        let counters = Arc::new(Seen::default());
        let mut worker =
            BackgroundWorker::start(Recorder(counters.clone(), false), Duration::from_secs(1));

        tokio::time::sleep(Duration::from_millis(3_500)).await;
        assert_eq!(worker.stop().await.ticks, 3);
        assert_eq!(counters.ticks.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn tick_on_start_runs_before_the_first_interval() {
        let counters = Arc::new(Seen::default());
        let mut worker =
            BackgroundWorker::start(Recorder(counters.clone(), true), Duration::from_secs(1));

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(counters.ticks.load(Ordering::SeqCst), 1);
        tokio::time::sleep(Duration::from_millis(1_000)).await;
        assert_eq!(worker.stop().await.ticks, 2);
    }
}
