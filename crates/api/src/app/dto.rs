use serde::Deserialize;
use serde_json::json;

use ledgerline_accounting::TransferRequest;
use ledgerline_core::{AccountId, Money};
use ledgerline_infra::jobs::{JobHandle, JobView};

use crate::app::errors;

// -------------------------
// Request DTOs
// -------------------------

/// Transfer submission body. Fields are optional here so that a missing field
/// is reported through `validate` as a `validation_error`.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferBody {
    pub from_account_id: Option<String>,
    pub to_account_id: Option<String>,
    pub amount: Option<String>,
    pub description: Option<String>,
    pub idempotency_key: Option<String>,
}

impl TransferBody {
    pub fn validate(self) -> Result<TransferRequest, axum::response::Response> {
        let from = parse_account_id("fromAccountId", self.from_account_id.as_deref())?;
        let to = parse_account_id("toAccountId", self.to_account_id.as_deref())?;

        let Some(raw_amount) = self.amount else {
            return Err(errors::validation_error("amount is required"));
        };
        if !is_money_format(&raw_amount) {
            return Err(errors::validation_error(format!(
                "Invalid money format: '{raw_amount}'"
            )));
        }
        let amount =
            Money::parse(&raw_amount).map_err(|e| errors::validation_error(e.to_string()))?;

        let Some(description) = self.description else {
            return Err(errors::validation_error("description is required"));
        };

        let mut request = TransferRequest::new(from, to, amount, description);
        if let Some(key) = self.idempotency_key {
            request = request.with_idempotency_key(key);
        }
        Ok(request)
    }
}

fn parse_account_id(
    field: &'static str,
    raw: Option<&str>,
) -> Result<AccountId, axum::response::Response> {
    let raw = raw.ok_or_else(|| errors::validation_error(format!("{field} is required")))?;
    parse_uuid(raw)
        .map(AccountId::from_uuid)
        .ok_or_else(|| errors::validation_error(format!("{field} must be a UUID")))
}

pub fn parse_uuid(raw: &str) -> Option<uuid::Uuid> {
    uuid::Uuid::parse_str(raw.trim()).ok()
}

/// Digits, optionally followed by a point and one or two digits (`10`, `10.5`, `10.50`).
fn is_money_format(raw: &str) -> bool {
    let (whole, fraction) = match raw.split_once('.') {
        Some((whole, fraction)) => (whole, Some(fraction)),
        None => (raw, None),
    };
    let all_digits = |s: &str| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit());

    all_digits(whole)
        && fraction.is_none_or(|f| (1..=2).contains(&f.len()) && all_digits(f))
}

// -------------------------
// Response mapping
// -------------------------

pub fn queued_to_json(handle: &JobHandle) -> serde_json::Value {
    json!({
        "status": handle.status,
        "message": "Transfer is being processed in the background",
        "jobId": handle.job_id,
        "trackUrl": handle.track_url(),
    })
}

pub fn job_view_to_json(view: &JobView) -> serde_json::Value {
    json!({
        "jobId": view.job_id,
        "status": view.status,
        "attempts": view.attempts,
        "maxAttempts": view.max_attempts,
        "result": view.result,
        "error": view.error,
        "scheduledAt": view.scheduled_at,
        "createdAt": view.created_at,
        "updatedAt": view.updated_at,
    })
}
