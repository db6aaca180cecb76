//! Routes claimed jobs to their handlers and settles the outcome.
//!
//! Each job's handler runs on its own tokio task, so a panic or a slow handler
//! affects only that job's bookkeeping. Every execution is wrapped in a `job`
//! tracing span carrying `queue`, `job_id`, and `attempt`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, info_span, warn, Instrument};
use tripful_core::{ClockSource, Job, JobView, QueueName};

use super::error::JobError;
use super::metrics;
use super::queue::{FailOutcome, Failure, JobQueue};
use crate::service::registry::{ApplicationContext, RegistryError};
use crate::service::service_names;
use crate::service::shutdown::{InFlightGuard, ShutdownController};

/// Summary recorded when a handler panics.
pub const HANDLER_PANICKED: &str = "handler panicked";

// ---------------------------------------------------------------------------
// JobHandler
// ---------------------------------------------------------------------------

/// Processes jobs of one or more queues.
///
/// An `Err` is a retryable failure; the queue's retry policy decides whether
/// the job runs again.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Services this handler reads from the application context.
    fn dependencies(&self) -> &[&'static str] {
        &[]
    }

    async fn handle(&self, job: &JobView, services: &HandlerServices) -> anyhow::Result<()>;
}

/// Read-only view of the services a handler declared.
#[derive(Debug, Clone, Default)]
pub struct HandlerServices {
    context: ApplicationContext,
}

impl HandlerServices {
    #[must_use]
    pub fn new(context: ApplicationContext) -> Self {
        Self { context }
    }

    #[must_use]
    pub fn get<T: Send + Sync + 'static>(&self, name: &str) -> Option<Arc<T>> {
        self.context.get(name)
    }

    /// # Errors
    ///
    /// `NotFound` if the handler did not declare `name`, `TypeMismatch` if it is not a `T`.
    pub fn require<T: Send + Sync + 'static>(&self, name: &str) -> Result<Arc<T>, RegistryError> {
        self.context.require(name)
    }

    /// Clones a handle-typed service, e.g. `Arc<dyn SmsService>`.
    #[must_use]
    pub fn instance<T: Clone + Send + Sync + 'static>(&self, name: &str) -> Option<T> {
        self.context.instance(name)
    }

    /// The shared clock, if declared.
    #[must_use]
    pub fn clock(&self) -> Option<Arc<dyn ClockSource>> {
        self.instance::<Arc<dyn ClockSource>>(service_names::CLOCK)
    }
}

#[derive(Clone)]
struct Registration {
    handler: Arc<dyn JobHandler>,
    services: Arc<HandlerServices>,
}

// ---------------------------------------------------------------------------
// Configuration and reports
// ---------------------------------------------------------------------------

/// Tuning for [`WorkerDispatcher::start`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatcherConfig {
    /// Concurrent claim loops.
    pub worker_count: usize,
    /// Jobs claimed per loop iteration.
    pub batch_size: usize,
    /// Sleep between claims when the queue is idle.
    pub poll_interval: Duration,
    /// Upper bound for the backoff applied after store errors.
    pub max_poll_backoff: Duration,
    /// How long shutdown waits for running jobs.
    pub drain_timeout: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            worker_count: 3,
            batch_size: 1,
            poll_interval: Duration::from_secs(1),
            max_poll_backoff: Duration::from_secs(30),
            drain_timeout: Duration::from_secs(30),
        }
    }
}

/// How one claimed job was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Settled {
    Completed,
    Retried,
    DeadLettered,
    Ignored,
    Error,
}

/// Outcome counts for one claimed batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub claimed: usize,
    pub completed: usize,
    pub retried: usize,
    pub dead_lettered: usize,
    /// Settled by someone else first (stale claim).
    pub ignored: usize,
    /// Bookkeeping failed; the lease will expire and the job will be reclaimed.
    pub errors: usize,
}

impl DispatchReport {
    fn record(&mut self, settled: Settled) {
        match settled {
            Settled::Completed => self.completed += 1,
            Settled::Retried => self.retried += 1,
            Settled::DeadLettered => self.dead_lettered += 1,
            Settled::Ignored => self.ignored += 1,
            Settled::Error => self.errors += 1,
        }
    }
}

// ---------------------------------------------------------------------------
// WorkerDispatcher
// ---------------------------------------------------------------------------

/// Pulls due jobs from a [`JobQueue`] and invokes the registered handlers.
pub struct WorkerDispatcher {
    queue: JobQueue,
    context: ApplicationContext,
    config: DispatcherConfig,
    handlers: HashMap<QueueName, Registration>,
}

impl std::fmt::Debug for WorkerDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut queues: Vec<&QueueName> = self.handlers.keys().collect();
        queues.sort();
        f.debug_struct("WorkerDispatcher")
            .field("config", &self.config)
            .field("handlers", &queues)
            .finish_non_exhaustive()
    }
}

impl WorkerDispatcher {
    #[must_use]
    pub fn new(queue: JobQueue, context: ApplicationContext, config: DispatcherConfig) -> Self {
        Self {
            queue,
            context,
            config,
            handlers: HashMap::new(),
        }
    }

    #[must_use]
    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    #[must_use]
    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// Binds `handler` to `queue`.
    ///
    /// # Errors
    ///
    /// `NotFound` if a declared dependency is missing from the context,
    /// `DuplicateService` if the queue already has a handler.
    pub fn register(
        &mut self,
        queue: QueueName,
        handler: Arc<dyn JobHandler>,
    ) -> Result<(), RegistryError> {
        if self.handlers.contains_key(&queue) {
            return Err(RegistryError::DuplicateService {
                name: queue.to_string(),
            });
        }
        for dependency in handler.dependencies() {
            if !self.context.contains(dependency) {
                return Err(RegistryError::NotFound {
                    name: (*dependency).to_string(),
                });
            }
        }
        let services = HandlerServices::new(self.context.scoped(handler.dependencies().iter().copied()));
        debug!(queue = %queue, dependencies = ?handler.dependencies(), "handler registered");
        self.handlers.insert(
            queue,
            Registration {
                handler,
                services: Arc::new(services),
            },
        );
        Ok(())
    }

    /// Binds `sink` to every dead-letter queue the job queue defines.
    ///
    /// # Errors
    ///
    /// As [`register`](Self::register).
    pub fn register_dead_letter_sinks(&mut self, sink: Arc<dyn JobHandler>) -> Result<(), RegistryError> {
        for dlq in self.queue.dead_letter_queues() {
            self.register(dlq, Arc::clone(&sink))?;
        }
        Ok(())
    }

    /// Queues with a bound handler.
    #[must_use]
    pub fn handled_queues(&self) -> Vec<QueueName> {
        let mut queues: Vec<QueueName> = self.handlers.keys().copied().collect();
        queues.sort();
        queues
    }

    /// Claims one batch and processes it to completion.
    ///
    /// # Errors
    ///
    /// `Store` if the claim itself fails. Per-job failures never surface here.
    pub async fn run_once(&self) -> Result<DispatchReport, JobError> {
        self.run_batch(None).await
    }

    async fn run_batch(&self, shutdown: Option<&ShutdownController>) -> Result<DispatchReport, JobError> {
        let jobs = self.queue.claim_due(self.config.batch_size).await?;
        let mut report = DispatchReport {
            claimed: jobs.len(),
            ..DispatchReport::default()
        };
        if jobs.is_empty() {
            return Ok(report);
        }

        let mut running = JoinSet::new();
        for job in jobs {
            let guard = shutdown.map(|s| s.in_flight_guard(job.queue));
            let registration = self.handlers.get(&job.queue).cloned();
            let span = info_span!("job", queue = %job.queue, job_id = %job.id, attempt = job.attempts);
            running.spawn(execute(self.queue.clone(), registration, job, guard).instrument(span));
        }
        while let Some(joined) = running.join_next().await {
            match joined {
                Ok(settled) => report.record(settled),
                Err(err) => {
                    error!(error = %err, "job bookkeeping task failed");
                    report.record(Settled::Error);
                }
            }
        }
        Ok(report)
    }

    /// Spawns `worker_count` claim loops that run until `shutdown` is triggered.
    #[must_use]
    pub fn start(self, shutdown: Arc<ShutdownController>) -> DispatcherHandle {
        let dispatcher = Arc::new(self);
        let loops = (0..dispatcher.config.worker_count.max(1))
            .map(|worker| {
                let dispatcher = Arc::clone(&dispatcher);
                let shutdown = Arc::clone(&shutdown);
                tokio::spawn(
                    async move { dispatcher.claim_loop(&shutdown).await }
                        .instrument(info_span!("dispatcher", worker)),
                )
            })
            .collect();
        info!(
            workers = dispatcher.config.worker_count,
            batch_size = dispatcher.config.batch_size,
            queues = ?dispatcher.handled_queues(),
            "dispatcher started"
        );
        DispatcherHandle {
            loops,
            shutdown,
            drain_timeout: dispatcher.config.drain_timeout,
        }
    }

    async fn claim_loop(&self, shutdown: &ShutdownController) {
        let mut stop = shutdown.shutdown_receiver();
        let mut backoff = self.config.poll_interval;

        while !*stop.borrow() {
            let wait = match self.run_batch(Some(shutdown)).await {
                Ok(report) if report.claimed > 0 => {
                    backoff = self.config.poll_interval;
                    continue;
                }
                Ok(_) => {
                    backoff = self.config.poll_interval;
                    self.config.poll_interval
                }
                Err(err) => {
                    metrics::claim_error();
                    warn!(error = %err, retry_in_ms = backoff.as_millis(), "claim failed, backing off");
                    let wait = backoff;
                    backoff = next_backoff(backoff, self.config.max_poll_backoff);
                    wait
                }
            };
            tokio::select! {
                _ = stop.changed() => {}
                () = tokio::time::sleep(wait) => {}
            }
        }
        debug!("claim loop stopped");
    }
}

/// Doubles the claim-error backoff, capped at `max`.
fn next_backoff(current: Duration, max: Duration) -> Duration {
    current.saturating_mul(2).min(max)
}

/// Runs one job's handler and settles the result.
async fn execute(
    queue: JobQueue,
    registration: Option<Registration>,
    job: Job,
    _guard: Option<InFlightGuard>,
) -> Settled {
    let started = Instant::now();
    let Some(registration) = registration else {
        let err = JobError::UnregisteredHandler { queue: job.queue };
        error!(error = %err, "no handler, dead-lettering");
        return settle_failure(&queue, &job, Failure::permanent(err.to_string()), started).await;
    };

    let view = job.view();
    let handler = Arc::clone(&registration.handler);
    let services = Arc::clone(&registration.services);
    let task: JoinHandle<anyhow::Result<()>> = tokio::spawn(
        async move { handler.handle(&view, &services).await }.in_current_span(),
    );

    let failure = match task.await {
        Ok(Ok(())) => {
            return match queue.complete_attempt(job.id, job.attempts).await {
                Ok(()) => {
                    metrics::job_completed(job.queue, started.elapsed());
                    debug!(elapsed_ms = started.elapsed().as_millis(), "job completed");
                    Settled::Completed
                }
                Err(err) => {
                    error!(error = %err, "failed to record completion");
                    Settled::Error
                }
            };
        }
        Ok(Err(err)) => Failure::from_error(&err),
        Err(join) if join.is_panic() => Failure::retryable(HANDLER_PANICKED),
        Err(_) => Failure::retryable("handler cancelled"),
    };
    settle_failure(&queue, &job, failure, started).await
}

async fn settle_failure(queue: &JobQueue, job: &Job, failure: Failure, started: Instant) -> Settled {
    metrics::job_failed(job.queue, started.elapsed());
    warn!(error = %failure.summary, retryable = failure.retryable, "job failed");
    match queue.fail_attempt(job.id, job.attempts, failure).await {
        Ok(FailOutcome::Retried { .. }) => Settled::Retried,
        Ok(FailOutcome::DeadLettered { .. }) => Settled::DeadLettered,
        Ok(FailOutcome::Ignored) => Settled::Ignored,
        Err(err) => {
            error!(error = %err, "failed to record failure");
            Settled::Error
        }
    }
}

// ---------------------------------------------------------------------------
// DispatcherHandle
// ---------------------------------------------------------------------------

/// Running claim loops started by [`WorkerDispatcher::start`].
#[derive(Debug)]
pub struct DispatcherHandle {
    loops: Vec<JoinHandle<()>>,
    shutdown: Arc<ShutdownController>,
    drain_timeout: Duration,
}

impl DispatcherHandle {
    /// Stops claiming, waits for running jobs, then joins the loops.
    ///
    /// Returns `false` if the drain timed out; the remaining loops are aborted
    /// and their jobs are recovered once their leases expire.
    pub async fn shutdown(self) -> bool {
        self.shutdown.trigger_shutdown();
        let drained = self.shutdown.wait_for_drain(self.drain_timeout).await;
        for handle in self.loops {
            if drained {
                let _ = handle.await;
            } else {
                handle.abort();
            }
        }
        if drained {
            info!("dispatcher drained");
        } else {
            warn!(timeout_secs = self.drain_timeout.as_secs(), "dispatcher drain timed out");
        }
        drained
    }
}
