//! Admin control surface consumed by the external API layer.

use axum::Router;
use serde::Serialize;

use crate::AppState;

mod jobs;
mod mailboxes;
mod routing;

pub fn router() -> Router<AppState> {
    Router::new()
        .nest("/mailboxes", mailboxes::router())
        .nest("/jobs", jobs::router())
        .nest("/routing", routing::router())
}

/// Error response for API errors.
#[derive(Debug, Serialize)]
pub(crate) struct ApiError {
    error: String,
    message: String,
}

impl ApiError {
    pub(crate) fn new(error: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            message: message.into(),
        }
    }

    pub(crate) fn not_found(message: impl Into<String>) -> Self {
        Self::new("not_found", message)
    }

    pub(crate) fn internal(message: impl Into<String>) -> Self {
        Self::new("internal_error", message)
    }
}
