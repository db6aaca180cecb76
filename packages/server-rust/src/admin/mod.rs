//! Admin HTTP surface: health checks, queue statistics, and recent dead letters.
//!
//! Follows a deferred startup: `new()` assembles state, `start()` binds the
//! listener, and `serve()` accepts requests until the shutdown future resolves.

pub mod handlers;

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::jobs::{DeadLetterLog, JobQueue};
use crate::service::ShutdownController;

pub use handlers::{
    dead_letters_handler, health_handler, liveness_handler, queues_handler, readiness_handler,
};

/// Shared state handed to every admin handler.
#[derive(Clone)]
pub struct AppState {
    pub shutdown: Arc<ShutdownController>,
    pub queue: JobQueue,
    pub dead_letters: Arc<DeadLetterLog>,
}

/// Builds the admin router.
///
/// Routes:
/// - `GET /health` -- state, in-flight jobs, uptime
/// - `GET /health/live` -- liveness check
/// - `GET /health/ready` -- readiness check
/// - `GET /queues` -- per-queue job counts
/// - `GET /dead-letters?limit=` -- most recent dead-lettered jobs
pub fn build_router(state: AppState, request_timeout: Duration) -> Router {
    let layers = ServiceBuilder::new()
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            request_timeout,
        ));

    Router::new()
        .route("/health", get(health_handler))
        .route("/health/live", get(liveness_handler))
        .route("/health/ready", get(readiness_handler))
        .route("/queues", get(queues_handler))
        .route("/dead-letters", get(dead_letters_handler))
        .layer(layers)
        .with_state(state)
}

/// Owns the admin listener.
pub struct AdminServer {
    addr: SocketAddr,
    router: Router,
    listener: Option<TcpListener>,
}

impl AdminServer {
    #[must_use]
    pub fn new(addr: SocketAddr, state: AppState, request_timeout: Duration) -> Self {
        Self {
            addr,
            router: build_router(state, request_timeout),
            listener: None,
        }
    }

    /// Binds the listener and returns the bound address.
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be bound.
    pub async fn start(&mut self) -> anyhow::Result<SocketAddr> {
        let listener = TcpListener::bind(self.addr)
            .await
            .with_context(|| format!("binding admin listener on {}", self.addr))?;
        let bound = listener.local_addr()?;
        info!(addr = %bound, "admin listener bound");
        self.listener = Some(listener);
        Ok(bound)
    }

    /// Serves requests until `shutdown` resolves.
    ///
    /// # Errors
    ///
    /// Returns an error if `start()` was not called or the server fails.
    pub async fn serve(self, shutdown: impl Future<Output = ()> + Send + 'static) -> anyhow::Result<()> {
        let listener = self
            .listener
            .context("start() must be called before serve()")?;
        axum::serve(listener, self.router)
            .with_graceful_shutdown(shutdown)
            .await?;
        info!("admin server stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tripful_core::SystemClock;

    use super::*;
    use crate::jobs::MemoryJobStore;

    fn state() -> AppState {
        AppState {
            shutdown: Arc::new(ShutdownController::new()),
            queue: JobQueue::with_defaults(Arc::new(MemoryJobStore::new()), Arc::new(SystemClock))
                .unwrap(),
            dead_letters: Arc::new(DeadLetterLog::default()),
        }
    }

    #[tokio::test]
    async fn start_binds_to_os_assigned_port() {
        let mut server = AdminServer::new(
            "127.0.0.1:0".parse().unwrap(),
            state(),
            Duration::from_secs(5),
        );
        let addr = server.start().await.unwrap();
        assert!(addr.port() > 0);
        server.serve(async {}).await.unwrap();
    }

    #[tokio::test]
    async fn serve_without_start_is_an_error() {
        let server = AdminServer::new(
            "127.0.0.1:0".parse().unwrap(),
            state(),
            Duration::from_secs(5),
        );
        let err = server.serve(async {}).await.unwrap_err();
        assert!(err.to_string().contains("start() must be called"));
    }
}
