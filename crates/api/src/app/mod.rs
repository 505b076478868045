//! HTTP API application wiring (Axum router + service wiring).
//!
//! - `services.rs`: store, engine and queue wiring
//! - `routes/`: HTTP routes + handlers
//! - `dto.rs`: request validation and JSON mapping helpers
//! - `errors.rs`: consistent error responses

use std::sync::Arc;

use axum::{routing::get, Extension, Router};
use tower::ServiceBuilder;

pub mod dto;
pub mod errors;
pub mod routes;
pub mod services;

use services::AppServices;

/// Build the full HTTP router around already-wired services.
///
/// The router never executes transfers; callers start the executor with
/// [`AppServices::spawn_executor`].
pub fn build_app(services: Arc<AppServices>) -> Router {
    Router::new()
        .route("/health", get(routes::system::health))
        .merge(routes::router())
        .layer(ServiceBuilder::new().layer(Extension(services)))
}
