//! HTTP caller API: run scenarios on request and browse their reports.

pub mod error;
pub mod routes;

use axum::routing::{get, post};
use axum::Router;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

use crate::client::{Client, ResultsStore};
use crate::core::errors::Result;

#[derive(Clone)]
pub struct AppState {
    pub client: Arc<Client>,
    pub results: Arc<ResultsStore>,
    worker_running: Arc<AtomicBool>,
}

impl AppState {
    pub fn new(client: Client) -> Self {
        Self {
            client: Arc::new(client),
            results: Arc::new(ResultsStore::new()),
            worker_running: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn set_worker_running(&self, running: bool) {
        self.worker_running.store(running, Ordering::Relaxed);
    }

    pub fn worker_running(&self) -> bool {
        self.worker_running.load(Ordering::Relaxed)
    }
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(routes::server_info))
        .route("/workerstatus", get(routes::worker_status))
        .route(
            "/workflows",
            get(routes::list_runs).delete(routes::clear_runs),
        )
        .route(
            "/workflows/{id}",
            get(routes::get_run).delete(routes::delete_run),
        )
        .route("/runWorkflow", post(routes::run_workflow))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the API on `listener` until `shutdown` resolves.
pub async fn serve(
    listener: TcpListener,
    state: AppState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    axum::serve(listener, create_router(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}
