//! `tripful-worker`: runs the job dispatcher, recurring schedules, queue
//! maintenance, and the optional admin HTTP surface until Ctrl-C.

use std::sync::Arc;

use clap::Parser;
use tracing::{info, warn};
use tripful_core::{ClockSource, SystemClock};

use tripful_server::admin::{AdminServer, AppState};
use tripful_server::app;
use tripful_server::config::WorkerArgs;
use tripful_server::jobs::{default_schedules, DeadLetterLog, Maintenance, Scheduler};
use tripful_server::service::{
    service_names, BackgroundWorker, InMemoryTripDirectory, MockSmsService, ShutdownController,
    SmsService, TripDirectory,
};
use tripful_server::telemetry;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = WorkerArgs::parse();
    let config = args.app_config();
    let dispatcher_config = args.dispatcher_config();
    telemetry::init_tracing(config.log_format);
    if let Some(addr) = config.metrics_addr {
        telemetry::init_metrics(addr)?;
    }

    let store = app::open_store(&config).await?;
    let clock: Arc<dyn ClockSource> = Arc::new(SystemClock);
    let sms: Arc<dyn SmsService> = Arc::new(MockSmsService::new());
    let trips: Arc<dyn TripDirectory> = Arc::new(InMemoryTripDirectory::new());
    let context = app::build_context(config.clone(), clock, store, sms, trips)?;
    let queue = app::job_queue(&context)?;
    let dispatcher = app::dispatcher(&context, dispatcher_config)?;

    let mut scheduler = BackgroundWorker::start(
        Scheduler::new(queue.clone(), default_schedules()),
        config.schedule_tick,
    );
    let mut maintenance = BackgroundWorker::start(
        Maintenance::new(queue.clone(), config.reclaim_batch),
        config.maintenance_tick,
    );

    let shutdown = Arc::new(ShutdownController::new());
    let admin = match config.admin_addr {
        Some(addr) => {
            let dead_letters = context
                .get::<DeadLetterLog>(service_names::DEAD_LETTER_LOG)
                .ok_or_else(|| anyhow::anyhow!("dead-letter-log is not registered"))?;
            let state = AppState {
                shutdown: Arc::clone(&shutdown),
                queue: queue.clone(),
                dead_letters,
            };
            let mut server = AdminServer::new(addr, state, config.admin_request_timeout);
            server.start().await?;
            let mut stop = shutdown.shutdown_receiver();
            Some(tokio::spawn(server.serve(async move {
                let _ = stop.wait_for(|stopping| *stopping).await;
            })))
        }
        None => None,
    };

    let handle = dispatcher.start(Arc::clone(&shutdown));
    shutdown.set_ready();
    info!(store = ?config.store, "tripful worker ready");

    tokio::signal::ctrl_c().await?;
    info!("interrupt received, shutting down");

    if !handle.shutdown().await {
        warn!("some jobs were still running; their leases will expire and they will be retried");
    }
    scheduler.stop().await;
    maintenance.stop().await;
    if let Some(admin) = admin {
        match admin.await {
            Ok(Err(err)) => warn!(error = %err, "admin server failed"),
            Err(err) => warn!(error = %err, "admin server task failed"),
            Ok(Ok(())) => {}
        }
    }
    info!("tripful worker stopped");
    Ok(())
}
