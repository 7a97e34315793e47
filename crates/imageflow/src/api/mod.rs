use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use std::sync::Arc;

use crate::api::models::{ErrorBody, SubmitRequest, SubmitResponse};
use crate::jobs::{JobId, JobStore};
use crate::metrics::Metrics;
use crate::queue::WorkQueue;
use crate::submit::{submit, SubmitError};

pub mod models;

#[derive(Clone)]
pub struct ApiState {
    pub store: Arc<dyn JobStore>,
    pub queue: Arc<dyn WorkQueue>,
    pub queue_name: String,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/jobs", post(submit_job))
        .route("/jobs/:id", get(get_job))
        // Metrics
        .route("/metrics", get(metrics))
        .route("/metrics/prom", get(metrics_prom))
        // Health
        .route("/health", get(health))
        .with_state(state)
}

fn internal_err<E: std::fmt::Display>(e: E) -> (StatusCode, Json<ErrorBody>) {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorBody::new(format!("internal error: {e}"))),
    )
}

pub async fn get_job(Path(id): Path<i64>, State(state): State<ApiState>) -> Response {
    match state.store.get(JobId(id)).await {
        Ok(Some(job)) => (StatusCode::OK, Json(job)).into_response(),
        Ok(None) => (StatusCode::NOT_FOUND, Json(ErrorBody::new("job not found"))).into_response(),
        Err(e) => internal_err(e).into_response(),
    }
}

pub async fn submit_job(
    State(state): State<ApiState>,
    Json(body): Json<SubmitRequest>,
) -> Result<(StatusCode, Json<SubmitResponse>), (StatusCode, Json<ErrorBody>)> {
    let source = std::path::Path::new(&body.file_path);

    match submit(&*state.store, &*state.queue, source, &body.email).await {
        Ok(job_id) => Ok((StatusCode::CREATED, Json(SubmitResponse { job_id }))),
        Err(SubmitError::Invalid(msg)) => Err((StatusCode::BAD_REQUEST, Json(ErrorBody::new(msg)))),
        Err(SubmitError::Publish { job_id, source }) => {
            tracing::error!(job_id = %job_id, error = %source, "job recorded but not queued");
            Err((
                StatusCode::BAD_GATEWAY,
                Json(ErrorBody {
                    error: format!("queue unavailable: {source}"),
                    job_id: Some(job_id),
                }),
            ))
        }
        Err(e @ SubmitError::Store(_)) => Err(internal_err(e)),
    }
}

pub async fn metrics(
    State(state): State<ApiState>,
) -> Result<Json<Metrics>, (StatusCode, Json<ErrorBody>)> {
    Metrics::snapshot(&*state.store, &*state.queue, &state.queue_name)
        .await
        .map(Json)
        .map_err(internal_err)
}

pub async fn metrics_prom(State(state): State<ApiState>) -> Response {
    match Metrics::snapshot(&*state.store, &*state.queue, &state.queue_name).await {
        Ok(m) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            m.render_prometheus(),
        )
            .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("metrics error: {e}"),
        )
            .into_response(),
    }
}

pub async fn health() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}
