use axum::Router;

pub mod ledger;
pub mod system;

/// Router for the ledger endpoints.
pub fn router() -> Router {
    Router::new().nest("/ledger", ledger::router())
}
