//! axum HTTP server: `AppState`, CORS, route table.
//!
//! Structurally grounded on the teacher's `server.rs` - a flat `AppState`
//! held directly in `State<AppState>` extractors, a restrictive CORS layer
//! built from configured origins, `TraceLayer` for request logging - with
//! the audit-service routes replaced by the ones `spec.md` §6 names.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::http::{header, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use sqlx::SqlitePool;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::api;
use crate::config::Config;
use crate::error::ReviewError;
use crate::metrics::MetricsRegistry;
use crate::poller::Poller;
use crate::scheduler::Scheduler;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub write_pool: SqlitePool,
    pub read_pool: SqlitePool,
    pub scheduler: Arc<Scheduler>,
    pub poller: Arc<Poller>,
    pub metrics: Arc<MetricsRegistry>,
}

pub fn build_router(state: AppState) -> Router {
    let cors = build_cors_layer(&state.config.server.cors_allowed_origins);

    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(api::metrics_text))
        .route("/webhook/{platform}", post(api::webhook))
        .route("/polling/status", get(api::polling_status))
        .route("/polling/start", post(api::polling_start))
        .route("/polling/stop", post(api::polling_stop))
        .route("/polling/repos", get(api::polling_repos))
        .route("/polling/repos/{repo_id}/trigger", post(api::trigger_review))
        .route("/stats/reviews", get(api::list_reviews))
        .route("/stats/review/{task_id}/full", get(api::review_full))
        .route("/stats/review/{task_id}/export", get(api::review_export))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind and serve until the process is signalled to stop.
pub async fn run(state: AppState) -> crate::error::Result<()> {
    let addr = format!("{}:{}", state.config.server.host, state.config.server.port);
    let socket_addr: SocketAddr = addr
        .parse()
        .map_err(|e| ReviewError::Fatal(format!("invalid server address {addr}: {e}")))?;

    let app = build_router(state);

    info!(%socket_addr, "API server listening");
    let listener = tokio::net::TcpListener::bind(&socket_addr)
        .await
        .map_err(|e| ReviewError::Fatal(format!("failed to bind {socket_addr}: {e}")))?;

    axum::serve(listener, app)
        .await
        .map_err(|e| ReviewError::Fatal(format!("server error: {e}")))?;

    Ok(())
}

fn build_cors_layer(allowed_origins: &[String]) -> CorsLayer {
    CorsLayer::new()
        .allow_origin(
            allowed_origins
                .iter()
                .filter_map(|o| o.parse().ok())
                .collect::<Vec<header::HeaderValue>>(),
        )
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION, header::ACCEPT])
        .allow_credentials(false)
        .max_age(Duration::from_secs(3600))
}

async fn health_check() -> impl IntoResponse {
    Json(HealthResponse { status: "healthy", version: env!("CARGO_PKG_VERSION") })
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

impl IntoResponse for ReviewError {
    fn into_response(self) -> Response {
        let status = match &self {
            ReviewError::Validation(_) => StatusCode::BAD_REQUEST,
            ReviewError::Auth(_) => StatusCode::UNAUTHORIZED,
            ReviewError::Db(crate::db::DbError::NotFound(_)) => StatusCode::NOT_FOUND,
            ReviewError::Db(crate::db::DbError::Conflict(_)) => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = Json(ErrorResponse { error: self.to_string(), status: status.as_u16() });
        (status, body).into_response()
    }
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
    status: u16,
}
