//! HTTP intake server
//!
//! Binds to loopback only: hooks on the same machine POST raw events here
//! and get an id back as soon as the row is durable. Nothing on this
//! surface waits on an LLM - the endpoints are a thin shim over the queue
//! and the session registry, which is what keeps the hook path inside its
//! latency budget.

mod sessions;

pub use sessions::{get_stats, init_session, post_observation, post_summary};

use crate::memory::SqliteMemoryStore;
use crate::procs::{OrphanReaper, ProcessTracker};
use crate::queue::{EventQueue, QueueError};
use axum::{http::StatusCode, response::IntoResponse, routing, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;

/// State shared across the intake handlers
#[derive(Clone)]
pub struct AppState {
    pub queue: Arc<EventQueue>,
    pub memory: Arc<SqliteMemoryStore>,
    pub tracker: Arc<ProcessTracker>,
    pub reaper: Arc<OrphanReaper>,
}

/// API error responses
/// Converted to HTTP status codes via IntoResponse
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    /// Duplicate summary request for a session that already has one in flight
    Conflict(String),
    /// The embedded store refused the write
    StorageUnavailable(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::StorageUnavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg),
        };

        tracing::error!("API error: {} - {}", status, message);

        (status, message).into_response()
    }
}

impl From<QueueError> for ApiError {
    fn from(e: QueueError) -> Self {
        match e {
            QueueError::DuplicatePending { .. } => ApiError::Conflict(e.to_string()),
            QueueError::Storage(_) | QueueError::Pool(_) => {
                ApiError::StorageUnavailable(e.to_string())
            }
        }
    }
}

/// Build the intake router.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/sessions/init", routing::post(init_session))
        .route("/api/sessions/observations", routing::post(post_observation))
        .route("/api/sessions/summary", routing::post(post_summary))
        .route("/api/stats", routing::get(get_stats))
        .with_state(state)
}

/// Start the intake server; resolves when `shutdown_rx` fires and in-flight
/// requests have drained.
pub async fn start_server(
    bind_addr: SocketAddr,
    state: AppState,
    shutdown_rx: tokio::sync::oneshot::Receiver<()>,
) -> anyhow::Result<()> {
    let app = build_router(state);

    let listener = TcpListener::bind(bind_addr).await?;
    tracing::info!("Intake listening on {}", bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_rx.await.ok();
        })
        .await?;

    tracing::info!("Intake server shut down gracefully");
    Ok(())
}
