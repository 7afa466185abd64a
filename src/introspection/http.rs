use std::net::SocketAddr;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use tower_http::cors::{Any, CorsLayer};

use crate::supervisor::Supervisor;

/// The introspection routes:
/// - `GET /api/worker`: supervisor identity and counters
/// - `GET /api/jobs`: snapshots of every tracked job
/// - `GET /api/jobs/:id`: one job, 404 when untracked
pub fn router(supervisor: Supervisor) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/worker", get(worker_handler))
        .route("/api/jobs", get(list_jobs_handler))
        .route("/api/jobs/:id", get(get_job_handler))
        .layer(cors)
        .with_state(supervisor)
}

/// Serve the read-only introspection API until the process exits.
pub async fn run_introspection(addr: SocketAddr, supervisor: Supervisor) {
    let app = router(supervisor);

    tracing::info!(addr = %addr, "Starting introspection server");

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(addr = %addr, error = %e, "Failed to bind introspection server");
            return;
        }
    };

    if let Err(e) = axum::serve(listener, app).await {
        tracing::error!(error = %e, "Introspection server failed");
    }
}

async fn worker_handler(State(supervisor): State<Supervisor>) -> impl IntoResponse {
    Json(supervisor.worker_snapshot().await)
}

async fn list_jobs_handler(State(supervisor): State<Supervisor>) -> impl IntoResponse {
    Json(supervisor.job_snapshots().await)
}

async fn get_job_handler(
    State(supervisor): State<Supervisor>,
    Path(job_id): Path<String>,
) -> impl IntoResponse {
    match supervisor.job_snapshot(&job_id).await {
        Some(snapshot) => Json(snapshot).into_response(),
        None => (StatusCode::NOT_FOUND, format!("no such job: {job_id}")).into_response(),
    }
}
