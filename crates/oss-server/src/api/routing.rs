//! Routing simulation and collision administration.
//!
//! Provides:
//! - POST /api/routing/simulate - dry-run the routing evaluator
//! - GET  /api/routing/collisions?organization_id= - list collision groups
//! - POST /api/routing/collisions/backfill - assign missing collision groups

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use oss_core::{CanonicalRepository, Direction, RoutingInput, RoutingRepository, simulate};

use super::ApiError;
use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/simulate", post(simulate_routing))
        .route("/collisions", get(list_collisions))
        .route("/collisions/backfill", post(collision_backfill))
}

#[derive(Debug, Deserialize)]
struct SimulateRequest {
    organization_id: String,
    recipient: Option<String>,
    sender_email: Option<String>,
    direction: Option<String>,
}

async fn simulate_routing(
    State(state): State<AppState>,
    Json(body): Json<SimulateRequest>,
) -> impl IntoResponse {
    let direction = match body.direction.as_deref() {
        None => Direction::Inbound,
        Some(value) => match Direction::from_str(value) {
            Some(direction) => direction,
            None => {
                return (
                    StatusCode::BAD_REQUEST,
                    Json(ApiError::new(
                        "invalid_direction",
                        format!("unknown direction {value:?}"),
                    )),
                )
                    .into_response();
            }
        },
    };

    let routing = RoutingRepository::new(state.db.clone());
    let allowlist = match routing.list_allowlist(&body.organization_id).await {
        Ok(allowlist) => allowlist,
        Err(err) => {
            tracing::error!("failed to load allowlist: {err}");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ApiError::internal("failed to load allowlist")),
            )
                .into_response();
        }
    };
    let rules = match routing.list_rules(&body.organization_id).await {
        Ok(rules) => rules,
        Err(err) => {
            tracing::error!("failed to load routing rules: {err}");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ApiError::internal("failed to load routing rules")),
            )
                .into_response();
        }
    };

    let decision = simulate(
        &allowlist,
        &rules,
        &RoutingInput {
            recipient: body.recipient.map(|r| r.to_lowercase()),
            sender_email: body.sender_email.map(|s| s.to_lowercase()),
            direction,
        },
    );
    (StatusCode::OK, Json(decision)).into_response()
}

#[derive(Debug, Deserialize)]
struct OrgScoped {
    organization_id: String,
}

#[derive(Debug, Serialize)]
struct CollisionGroupResponse {
    id: String,
    message_count: i64,
    created_at: chrono::DateTime<chrono::Utc>,
}

async fn list_collisions(
    State(state): State<AppState>,
    Query(query): Query<OrgScoped>,
) -> impl IntoResponse {
    let repo = CanonicalRepository::new(state.db.clone());
    match repo.list_collision_groups(&query.organization_id).await {
        Ok(groups) => {
            let response: Vec<CollisionGroupResponse> = groups
                .into_iter()
                .map(|group| CollisionGroupResponse {
                    id: group.id,
                    message_count: group.message_count,
                    created_at: group.created_at,
                })
                .collect();
            (StatusCode::OK, Json(response)).into_response()
        }
        Err(err) => {
            tracing::error!("failed to list collision groups: {err}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ApiError::internal("failed to list collision groups")),
            )
                .into_response()
        }
    }
}

#[derive(Debug, Serialize)]
struct CollisionBackfillResponse {
    assigned: usize,
}

async fn collision_backfill(
    State(state): State<AppState>,
    Json(body): Json<OrgScoped>,
) -> impl IntoResponse {
    let repo = CanonicalRepository::new(state.db.clone());
    match repo
        .assign_missing_collision_groups(&body.organization_id)
        .await
    {
        Ok(assigned) => (StatusCode::OK, Json(CollisionBackfillResponse { assigned })).into_response(),
        Err(err) => {
            tracing::error!("collision backfill failed: {err}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ApiError::internal("collision backfill failed")),
            )
                .into_response()
        }
    }
}
