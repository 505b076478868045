use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use ledgerline_infra::jobs::JobStoreError;
use ledgerline_infra::store::StoreError;

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

pub fn validation_error(message: impl Into<String>) -> axum::response::Response {
    json_error(StatusCode::BAD_REQUEST, "validation_error", message)
}

pub fn job_store_error_to_response(err: JobStoreError) -> axum::response::Response {
    match err {
        JobStoreError::NotFound(_) => not_found(),
        JobStoreError::AlreadyExists(id) => {
            json_error(StatusCode::CONFLICT, "conflict", format!("job {id} already exists"))
        }
        e @ JobStoreError::NotCancellable { .. } => {
            json_error(StatusCode::CONFLICT, "not_cancellable", e.to_string())
        }
        JobStoreError::Storage(msg) => {
            tracing::error!(error = %msg, "job store failure");
            json_error(StatusCode::SERVICE_UNAVAILABLE, "storage_unavailable", msg)
        }
    }
}

pub fn store_error_to_response(err: StoreError) -> axum::response::Response {
    tracing::error!(error = %err, "ledger store failure");
    match &err {
        StoreError::Unavailable(_) | StoreError::Conflict(_) => json_error(
            StatusCode::SERVICE_UNAVAILABLE,
            "storage_unavailable",
            err.to_string(),
        ),
        _ => json_error(StatusCode::INTERNAL_SERVER_ERROR, "store_error", err.to_string()),
    }
}

/// Body returned for job ids the queue does not know.
pub fn not_found() -> axum::response::Response {
    (StatusCode::NOT_FOUND, axum::Json(json!({ "status": "not_found" }))).into_response()
}
