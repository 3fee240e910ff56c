use axum::{Router, routing::get};

pub mod failed_messages;
pub mod system;

/// Router for everything under `/admin`.
pub fn router() -> Router {
    Router::new()
        .route("/retry-queues", get(system::retry_queues))
        .nest("/failed-messages", failed_messages::router())
}
