//! Worker process configuration.
//!
//! Command-line flags (each with a `TRIPFUL_*` environment fallback) are
//! parsed into [`WorkerArgs`] and converted into the plain structs the rest of
//! the crate consumes: [`AppConfig`] and [`DispatcherConfig`].

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};

use crate::jobs::DispatcherConfig;

/// Backing store for the job queue.
///
/// Defaults to redb when that feature is compiled in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum StoreKind {
    /// Process-local; jobs are lost on exit.
    #[cfg_attr(not(feature = "redb"), default)]
    Memory,
    /// Embedded redb file.
    #[cfg_attr(feature = "redb", default)]
    Redb,
    /// Shared `PostgreSQL` database.
    Postgres,
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, Parser)]
#[command(name = "tripful-worker")]
#[command(about = "Runs the Tripful background job dispatcher")]
pub struct WorkerArgs {
    /// Job store backend
    #[arg(long, value_enum, env = "TRIPFUL_STORE", default_value_t = StoreKind::default())]
    pub store: StoreKind,

    /// Database file for `--store redb`
    #[arg(long, env = "TRIPFUL_REDB_PATH", default_value = "tripful-jobs.redb")]
    pub redb_path: PathBuf,

    /// Connection string for `--store postgres`
    #[arg(long, env = "TRIPFUL_DATABASE_URL")]
    pub database_url: Option<String>,

    /// Concurrent claim loops
    #[arg(long, env = "TRIPFUL_WORKERS", default_value_t = 3)]
    pub workers: usize,

    /// Jobs claimed per loop iteration
    #[arg(long, env = "TRIPFUL_BATCH_SIZE", default_value_t = 1)]
    pub batch_size: usize,

    /// Idle poll interval in milliseconds
    #[arg(long, env = "TRIPFUL_POLL_INTERVAL_MS", default_value_t = 1000)]
    pub poll_interval_ms: u64,

    /// Bind address for the admin HTTP surface; disabled when absent
    #[arg(long, env = "TRIPFUL_ADMIN_ADDR")]
    pub admin_addr: Option<SocketAddr>,

    /// Bind address for the Prometheus exporter; disabled when absent
    #[arg(long, env = "TRIPFUL_METRICS_ADDR")]
    pub metrics_addr: Option<SocketAddr>,

    #[arg(long, value_enum, env = "TRIPFUL_LOG_FORMAT", default_value = "pretty")]
    pub log_format: LogFormat,

    /// Seconds to wait for running jobs on shutdown
    #[arg(long, env = "TRIPFUL_DRAIN_TIMEOUT_SECS", default_value_t = 30)]
    pub drain_timeout_secs: u64,
}

/// Process-wide settings, seeded into the service registry as `config`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppConfig {
    pub store: StoreKind,
    pub redb_path: PathBuf,
    pub database_url: Option<String>,
    pub admin_addr: Option<SocketAddr>,
    pub metrics_addr: Option<SocketAddr>,
    pub log_format: LogFormat,
    /// Maximum pool size for the `PostgreSQL` store.
    pub max_connections: u32,
    /// Interval between scheduler ticks.
    pub schedule_tick: Duration,
    /// Interval between lease reclaim and purge passes.
    pub maintenance_tick: Duration,
    /// Expired leases handled per maintenance pass.
    pub reclaim_batch: usize,
    /// Upper bound for admin requests.
    pub admin_request_timeout: Duration,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            store: StoreKind::default(),
            redb_path: PathBuf::from("tripful-jobs.redb"),
            database_url: None,
            admin_addr: None,
            metrics_addr: None,
            log_format: LogFormat::Pretty,
            max_connections: 10,
            schedule_tick: Duration::from_secs(30),
            maintenance_tick: Duration::from_secs(60),
            reclaim_batch: 100,
            admin_request_timeout: Duration::from_secs(10),
        }
    }
}

impl WorkerArgs {
    #[must_use]
    pub fn app_config(&self) -> AppConfig {
        AppConfig {
            store: self.store,
            redb_path: self.redb_path.clone(),
            database_url: self.database_url.clone(),
            admin_addr: self.admin_addr,
            metrics_addr: self.metrics_addr,
            log_format: self.log_format,
            max_connections: u32::try_from(self.workers.max(1) * 2).unwrap_or(u32::MAX),
            ..AppConfig::default()
        }
    }

    /// Dispatcher tuning; zero counts are raised to one.
    #[must_use]
    pub fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            worker_count: self.workers.max(1),
            batch_size: self.batch_size.max(1),
            poll_interval: Duration::from_millis(self.poll_interval_ms.max(1)),
            drain_timeout: Duration::from_secs(self.drain_timeout_secs),
            ..DispatcherConfig::default()
        }
    }
}
