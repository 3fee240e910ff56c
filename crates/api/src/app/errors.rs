use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use chatrelay_infra::retry::AdminError;

pub fn admin_error_to_response(err: AdminError) -> axum::response::Response {
    let message = err.to_string();
    match err {
        AdminError::NotFound(_) => json_error(StatusCode::NOT_FOUND, "not_found", message),
        AdminError::AlreadyRetrying(_) => json_error(StatusCode::CONFLICT, "already_retrying", message),
        AdminError::AlreadyResolved(_) => json_error(StatusCode::CONFLICT, "already_resolved", message),
    }
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}
