//! Tripful server — service registry, durable job queue, and worker dispatcher.

pub mod admin;
pub mod app;
pub mod config;
pub mod jobs;
pub mod service;
pub mod telemetry;

pub use config::{AppConfig, WorkerArgs};
pub use jobs::{JobError, JobQueue, WorkerDispatcher};
pub use service::{ApplicationContext, RegistryError, ServiceRegistry};
