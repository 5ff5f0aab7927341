//! Mailbox sync controls.
//!
//! Provides:
//! - POST /api/mailboxes/{id}/backfill - enqueue a full backfill
//! - POST /api/mailboxes/{id}/history - enqueue an incremental sync
//! - POST /api/mailboxes/{id}/pause - pause syncing for N minutes
//! - POST /api/mailboxes/{id}/resume - clear the pause, restart the cadence
//! - GET  /api/mailboxes/{id}/sync - sync summary for the ops dashboard

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use oss_core::{MailboxError, SyncControlError, SyncController};

use super::ApiError;
use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/{id}/backfill", post(trigger_backfill))
        .route("/{id}/history", post(trigger_history))
        .route("/{id}/pause", post(pause))
        .route("/{id}/resume", post(resume))
        .route("/{id}/sync", get(sync_summary))
}

fn controller(state: &AppState) -> SyncController {
    SyncController::new(state.db.clone(), state.queue.clone())
}

fn map_error(err: SyncControlError) -> (StatusCode, Json<ApiError>) {
    match err {
        SyncControlError::Mailbox(MailboxError::NotFound(what)) => (
            StatusCode::NOT_FOUND,
            Json(ApiError::not_found(format!("mailbox not found: {what}"))),
        ),
        other => {
            tracing::error!("mailbox sync control failed: {other}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ApiError::internal("sync control failed")),
            )
        }
    }
}

#[derive(Debug, Deserialize)]
struct OrgScoped {
    organization_id: String,
}

#[derive(Debug, Serialize)]
struct EnqueuedResponse {
    job_id: String,
}

async fn trigger_backfill(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<OrgScoped>,
) -> impl IntoResponse {
    match controller(&state)
        .trigger_backfill(&body.organization_id, &id)
        .await
    {
        Ok(job_id) => (StatusCode::ACCEPTED, Json(EnqueuedResponse { job_id })).into_response(),
        Err(err) => map_error(err).into_response(),
    }
}

async fn trigger_history(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<OrgScoped>,
) -> impl IntoResponse {
    match controller(&state)
        .trigger_history_sync(&body.organization_id, &id)
        .await
    {
        Ok(job_id) => (StatusCode::ACCEPTED, Json(EnqueuedResponse { job_id })).into_response(),
        Err(err) => map_error(err).into_response(),
    }
}

#[derive(Debug, Deserialize)]
struct PauseRequest {
    organization_id: String,
    minutes: i64,
    reason: Option<String>,
}

#[derive(Debug, Serialize)]
struct PauseResponse {
    mailbox_id: String,
    paused_until: Option<chrono::DateTime<chrono::Utc>>,
    pause_reason: Option<String>,
}

async fn pause(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<PauseRequest>,
) -> impl IntoResponse {
    match controller(&state)
        .pause(&body.organization_id, &id, body.minutes, body.reason.as_deref())
        .await
    {
        Ok(mailbox) => (
            StatusCode::OK,
            Json(PauseResponse {
                mailbox_id: mailbox.id,
                paused_until: mailbox.paused_until,
                pause_reason: mailbox.pause_reason,
            }),
        )
            .into_response(),
        Err(err) => map_error(err).into_response(),
    }
}

async fn resume(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<OrgScoped>,
) -> impl IntoResponse {
    match controller(&state).resume(&body.organization_id, &id).await {
        Ok((_, job_id)) => {
            (StatusCode::ACCEPTED, Json(EnqueuedResponse { job_id })).into_response()
        }
        Err(err) => map_error(err).into_response(),
    }
}

async fn sync_summary(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<OrgScoped>,
) -> impl IntoResponse {
    match controller(&state).summary(&query.organization_id, &id).await {
        Ok(summary) => (StatusCode::OK, Json(summary)).into_response(),
        Err(err) => map_error(err).into_response(),
    }
}
