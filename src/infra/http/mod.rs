//! Operational HTTP surface: liveness and pipeline status.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use serde::Serialize;
use sqlx::Error as SqlxError;

use crate::application::{
    error::{AppError, ErrorReport},
    metrics::{Alert, MetricsReporter, MetricsSnapshot},
    render::{PoolStats, RendererPool},
    repos::JobQueue,
};
use crate::domain::entities::QueueCounts;
use crate::infra::db::PostgresRepositories;

#[derive(Clone)]
pub struct HttpState {
    /// `None` when running on the in-memory queue.
    pub database: Option<PostgresRepositories>,
    pub queue: Arc<dyn JobQueue>,
    pub pool: RendererPool,
    pub reporter: Arc<MetricsReporter>,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub pool: PoolStats,
    pub queue: QueueCounts,
    pub metrics: MetricsSnapshot,
    pub alerts: Vec<Alert>,
}

pub fn build_router(state: HttpState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .with_state(state)
}

async fn health(State(state): State<HttpState>) -> Response {
    match &state.database {
        Some(database) => db_health_response(database.health_check().await),
        None => StatusCode::NO_CONTENT.into_response(),
    }
}

async fn status(State(state): State<HttpState>) -> Result<Json<StatusResponse>, AppError> {
    let queue = state.queue.counts().await?;
    let metrics = state.reporter.metrics();
    metrics.set_queue_depth(queue.depth());

    Ok(Json(StatusResponse {
        pool: state.pool.stats(),
        queue,
        metrics: metrics.snapshot(),
        alerts: metrics.evaluate_alerts(state.reporter.thresholds()),
    }))
}

fn db_health_response(result: Result<(), SqlxError>) -> Response {
    match result {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => {
            let mut response = StatusCode::SERVICE_UNAVAILABLE.into_response();
            ErrorReport::from_error(
                "infra::http::db_health",
                StatusCode::SERVICE_UNAVAILABLE,
                &err,
            )
            .attach(&mut response);
            response
        }
    }
}
