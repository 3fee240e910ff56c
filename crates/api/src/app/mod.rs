//! Admin HTTP application wiring (Axum router).
//!
//! - `routes/`: HTTP routes + handlers (failed messages, queue status, health)
//! - `errors.rs`: consistent error responses

use std::sync::Arc;

use axum::{Extension, Router, routing::get};
use tower::ServiceBuilder;

use chatrelay_infra::AdminHandle;

use crate::middleware;

pub mod errors;
pub mod routes;

/// Build the admin router (public entrypoint used by `main.rs`).
///
/// With `token` set, everything under `/admin` requires
/// `Authorization: Bearer <token>`; `/health` stays open.
pub fn build_app(admin: AdminHandle, token: Option<String>) -> Router {
    let mut protected = routes::router();
    if let Some(token) = token {
        let auth_state = middleware::AdminAuth {
            token: Arc::from(token),
        };
        protected = protected.layer(axum::middleware::from_fn_with_state(
            auth_state,
            middleware::admin_auth,
        ));
    }

    Router::new()
        .route("/health", get(routes::system::health))
        .nest("/admin", protected)
        .layer(ServiceBuilder::new().layer(Extension(admin)))
}
