use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Extension, Path},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};

use ledgerline_core::AccountId;
use ledgerline_infra::jobs::JobId;

use crate::app::dto::{self, TransferBody};
use crate::app::errors;
use crate::app::services::AppServices;

pub fn router() -> Router {
    Router::new()
        .route("/transfer", post(submit_transfer))
        .route("/status/:job_id", get(get_transfer_status))
        .route("/status/:job_id/cancel", post(cancel_transfer))
        .route("/balance/:account_id", get(get_balance))
}

/// Validate and enqueue; the transfer itself runs on a worker.
pub async fn submit_transfer(
    Extension(services): Extension<Arc<AppServices>>,
    body: Result<Json<TransferBody>, JsonRejection>,
) -> axum::response::Response {
    let Json(body) = match body {
        Ok(body) => body,
        Err(rejection) => return errors::validation_error(rejection.body_text()),
    };

    let request = match body.validate() {
        Ok(request) => request,
        Err(resp) => return resp,
    };

    match services.queue().enqueue(request).await {
        Ok(handle) => (StatusCode::ACCEPTED, Json(dto::queued_to_json(&handle))).into_response(),
        Err(e) => errors::job_store_error_to_response(e),
    }
}

pub async fn get_transfer_status(
    Extension(services): Extension<Arc<AppServices>>,
    Path(job_id): Path<String>,
) -> axum::response::Response {
    let Some(job_id) = dto::parse_uuid(&job_id).map(JobId::from_uuid) else {
        return errors::not_found();
    };

    match services.queue().status(job_id).await {
        Ok(Some(view)) => (StatusCode::OK, Json(dto::job_view_to_json(&view))).into_response(),
        Ok(None) => errors::not_found(),
        Err(e) => errors::job_store_error_to_response(e),
    }
}

/// Only queued jobs can be cancelled; anything else is a 409.
pub async fn cancel_transfer(
    Extension(services): Extension<Arc<AppServices>>,
    Path(job_id): Path<String>,
) -> axum::response::Response {
    let Some(job_id) = dto::parse_uuid(&job_id).map(JobId::from_uuid) else {
        return errors::not_found();
    };

    match services.queue().cancel(job_id).await {
        Ok(view) => (StatusCode::OK, Json(dto::job_view_to_json(&view))).into_response(),
        Err(e) => errors::job_store_error_to_response(e),
    }
}

pub async fn get_balance(
    Extension(services): Extension<Arc<AppServices>>,
    Path(account_id): Path<String>,
) -> axum::response::Response {
    let Some(account_id) = dto::parse_uuid(&account_id).map(AccountId::from_uuid) else {
        return errors::validation_error("accountId must be a UUID");
    };

    match services.balance(account_id).await {
        Ok(balance) => (StatusCode::OK, Json(balance)).into_response(),
        Err(e) => errors::store_error_to_response(e),
    }
}
