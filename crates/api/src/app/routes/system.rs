use axum::{Json, extract::Extension, response::IntoResponse};
use serde_json::json;

use chatrelay_infra::{AdminHandle, RetryQueuesSnapshot};

/// GET /health
pub async fn health(Extension(admin): Extension<AdminHandle>) -> impl IntoResponse {
    let connection = *admin.connection.borrow();
    Json(json!({
        "status": "ok",
        "broker": connection,
    }))
}

/// GET /admin/retry-queues - Depth and totals of both retry queues
pub async fn retry_queues(Extension(admin): Extension<AdminHandle>) -> Json<RetryQueuesSnapshot> {
    Json(admin.snapshot())
}
