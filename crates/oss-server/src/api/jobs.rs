//! Dead-letter queue introspection.
//!
//! Provides:
//! - GET  /api/jobs/dead?organization_id=&limit= - list dead jobs
//! - POST /api/jobs/{id}/replay - requeue one dead job

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use oss_core::{Job, QueueError};

use super::ApiError;
use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/dead", get(list_dead))
        .route("/{id}/replay", post(replay))
}

#[derive(Debug, Serialize)]
struct JobSummary {
    id: String,
    organization_id: String,
    job_type: String,
    status: String,
    attempts: i64,
    max_attempts: i64,
    last_error: Option<String>,
    run_at: chrono::DateTime<chrono::Utc>,
    finished_at: Option<chrono::DateTime<chrono::Utc>>,
}

fn job_to_summary(job: Job) -> JobSummary {
    JobSummary {
        id: job.id,
        organization_id: job.organization_id,
        job_type: job.job_type,
        status: job.status.as_str().to_string(),
        attempts: job.attempts,
        max_attempts: job.max_attempts,
        last_error: job.last_error,
        run_at: job.run_at,
        finished_at: job.finished_at,
    }
}

#[derive(Debug, Deserialize)]
struct DeadQuery {
    organization_id: String,
    limit: Option<i64>,
}

async fn list_dead(
    State(state): State<AppState>,
    Query(query): Query<DeadQuery>,
) -> impl IntoResponse {
    let limit = query.limit.unwrap_or(50).clamp(1, 500);
    match state.queue.list_dead(&query.organization_id, limit).await {
        Ok(jobs) => {
            let summaries: Vec<JobSummary> = jobs.into_iter().map(job_to_summary).collect();
            (StatusCode::OK, Json(summaries)).into_response()
        }
        Err(err) => {
            tracing::error!("failed to list dead jobs: {err}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ApiError::internal("failed to list dead jobs")),
            )
                .into_response()
        }
    }
}

async fn replay(State(state): State<AppState>, Path(id): Path<String>) -> impl IntoResponse {
    match state.queue.replay(&id).await {
        Ok(job) => (StatusCode::OK, Json(job_to_summary(job))).into_response(),
        Err(QueueError::JobNotFound(id)) => (
            StatusCode::NOT_FOUND,
            Json(ApiError::not_found(format!("job not found: {id}"))),
        )
            .into_response(),
        Err(QueueError::NotDead(id)) => (
            StatusCode::CONFLICT,
            Json(ApiError::new(
                "not_dead",
                format!("job {id} is not in the dead-letter state"),
            )),
        )
            .into_response(),
        Err(err) => {
            tracing::error!("failed to replay job: {err}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ApiError::internal("failed to replay job")),
            )
                .into_response()
        }
    }
}
