//! Admin routes for the failed-message store.
//!
//! Failed messages are inbound events whose processing retries were exhausted.
//! Operators can inspect them, retry them through the handler, mark them
//! resolved, or clear them.

use axum::{
    Json, Router,
    extract::{Extension, Path, Query},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::json;

use chatrelay_core::MessageId;
use chatrelay_infra::AdminHandle;

use crate::app::errors;

#[derive(Debug, Deserialize)]
pub struct ClearQuery {
    #[serde(default)]
    pub only_resolved: bool,
}

pub fn router() -> Router {
    Router::new()
        .route("/", get(list_failed).delete(clear_failed))
        .route("/retry-all", post(retry_all))
        .route("/:id", get(get_failed))
        .route("/:id/retry", post(retry_one))
        .route("/:id/resolve", post(resolve))
}

/// GET /admin/failed-messages - Newest first, with per-status counts
pub async fn list_failed(Extension(admin): Extension<AdminHandle>) -> impl IntoResponse {
    let store = admin.processing.store();
    Json(json!({
        "items": store.list(),
        "stats": store.stats(),
    }))
}

/// GET /admin/failed-messages/:id
pub async fn get_failed(
    Extension(admin): Extension<AdminHandle>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id = MessageId::new(id);
    match admin.processing.store().get(&id) {
        Some(message) => Json(message).into_response(),
        None => errors::json_error(StatusCode::NOT_FOUND, "not_found", format!("failed message not found: {id}")),
    }
}

/// POST /admin/failed-messages/:id/retry - Re-run the handler once
pub async fn retry_one(
    Extension(admin): Extension<AdminHandle>,
    Path(id): Path<String>,
) -> axum::response::Response {
    match admin.processing.retry_failed(&MessageId::new(id)).await {
        Ok(outcome) => Json(outcome).into_response(),
        Err(err) => errors::admin_error_to_response(err),
    }
}

/// POST /admin/failed-messages/:id/resolve - Mark handled without retrying
pub async fn resolve(
    Extension(admin): Extension<AdminHandle>,
    Path(id): Path<String>,
) -> axum::response::Response {
    match admin.processing.store().mark_resolved(&MessageId::new(id)) {
        Ok(message) => Json(message).into_response(),
        Err(err) => errors::admin_error_to_response(err),
    }
}

/// POST /admin/failed-messages/retry-all
pub async fn retry_all(Extension(admin): Extension<AdminHandle>) -> impl IntoResponse {
    Json(admin.processing.retry_all_failed().await)
}

/// DELETE /admin/failed-messages?only_resolved=bool
pub async fn clear_failed(
    Extension(admin): Extension<AdminHandle>,
    Query(query): Query<ClearQuery>,
) -> impl IntoResponse {
    let removed = admin.processing.store().clear(query.only_resolved);
    Json(json!({ "removed": removed }))
}
