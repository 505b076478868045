use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use ledgerline_accounting::{Account, Posting, TransferRequest};
use ledgerline_api::app::services::AppServices;
use ledgerline_api::config::ApiConfig;
use ledgerline_core::{AccountId, Money};
use ledgerline_infra::jobs::{InMemoryJobStore, JobExecutorHandle, RetryPolicy};
use ledgerline_infra::store::{InMemoryLedgerStore, LedgerStore};
use reqwest::StatusCode;
use serde_json::json;

struct TestServer {
    base_url: String,
    ledger: Arc<InMemoryLedgerStore>,
    treasury: AccountId,
    handle: tokio::task::JoinHandle<()>,
    _executor: Option<JobExecutorHandle>,
}

impl TestServer {
    async fn spawn() -> Self {
        Self::spawn_with(true).await
    }

    /// `run_workers = false` leaves submitted jobs queued.
    async fn spawn_with(run_workers: bool) -> Self {
        let mut config = ApiConfig::default();
        config.retry_policy = RetryPolicy::fixed(3, Duration::from_millis(10));
        config.executor = config
            .executor
            .with_workers(2)
            .with_poll_interval(Duration::from_millis(5));

        let ledger = InMemoryLedgerStore::arc();
        let treasury = AccountId::new();
        ledger
            .insert_account(&Account::new(treasury, "treasury", "USD"))
            .await
            .unwrap();

        let services = Arc::new(AppServices::new(
            ledger.clone(),
            InMemoryJobStore::arc(),
            &config,
        ));
        let executor = run_workers.then(|| services.spawn_executor());

        // Same router as prod, bound to an ephemeral port.
        let app = ledgerline_api::app::build_app(services);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind ephemeral port");
        let addr = listener.local_addr().unwrap();
        let base_url = format!("http://{}", addr);

        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base_url,
            ledger,
            treasury,
            handle,
            _executor: executor,
        }
    }

    /// New account funded from the treasury with `opening`.
    async fn funded_account(&self, opening: &str) -> AccountId {
        let id = AccountId::new();
        self.ledger
            .insert_account(&Account::new(id, "customer", "USD"))
            .await
            .unwrap();
        let amount = Money::parse(opening).unwrap();
        if amount.is_positive() {
            let seed = TransferRequest::new(self.treasury, id, amount, "opening balance");
            let posting = Posting::transfer(&seed, amount, Utc::now()).unwrap();
            self.ledger.seed_posting(&posting).await.unwrap();
        }
        id
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn submit(
    client: &reqwest::Client,
    base_url: &str,
    body: serde_json::Value,
) -> (StatusCode, serde_json::Value) {
    let res = client
        .post(format!("{}/ledger/transfer", base_url))
        .json(&body)
        .send()
        .await
        .unwrap();
    let status = res.status();
    (status, res.json().await.unwrap())
}

async fn get_json(client: &reqwest::Client, url: String) -> (StatusCode, serde_json::Value) {
    let res = client.get(url).send().await.unwrap();
    let status = res.status();
    (status, res.json().await.unwrap())
}

async fn job_finished_eventually(
    client: &reqwest::Client,
    base_url: &str,
    track_url: &str,
) -> serde_json::Value {
    // Execution is asynchronous; poll until the job reaches a terminal state.
    for _ in 0..200 {
        let (status, body) = get_json(client, format!("{}{}", base_url, track_url)).await;
        assert_eq!(status, StatusCode::OK);

        if body["status"] == "completed" || body["status"] == "failed" {
            return body;
        }

        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    panic!("job {track_url} did not finish within timeout");
}

async fn balance_of(client: &reqwest::Client, base_url: &str, id: AccountId) -> String {
    let (status, body) = get_json(client, format!("{}/ledger/balance/{}", base_url, id)).await;
    assert_eq!(status, StatusCode::OK);
    body["balance"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn health_is_ok() {
    let srv = TestServer::spawn().await;

    let res = reqwest::get(format!("{}/health", srv.base_url)).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
}

#[tokio::test]
async fn transfer_is_queued_then_completed() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let a = srv.funded_account("100.00").await;
    let b = srv.funded_account("0").await;

    let (status, queued) = submit(
        &client,
        &srv.base_url,
        json!({
            "fromAccountId": a.to_string(),
            "toAccountId": b.to_string(),
            "amount": "40.00",
            "description": "rent",
            "idempotencyKey": "k-1",
        }),
    )
    .await;

    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(queued["status"], "queued");
    assert_eq!(
        queued["message"],
        "Transfer is being processed in the background"
    );
    let job_id = queued["jobId"].as_str().unwrap();
    let track_url = queued["trackUrl"].as_str().unwrap();
    assert_eq!(track_url, format!("/ledger/status/{job_id}"));

    let done = job_finished_eventually(&client, &srv.base_url, track_url).await;
    assert_eq!(done["status"], "completed");
    assert_eq!(done["jobId"], job_id);
    assert_eq!(done["attempts"], 1);
    assert!(done["error"].is_null());

    let entries = done["result"]["entries"].as_array().unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0]["direction"], "DEBIT");
    assert_eq!(entries[0]["amount"], "40.00");
    assert_eq!(entries[1]["direction"], "CREDIT");
    assert_eq!(done["result"]["transaction"]["idempotencyKey"], "k-1");

    assert_eq!(balance_of(&client, &srv.base_url, a).await, "60.00");
    assert_eq!(balance_of(&client, &srv.base_url, b).await, "40.00");
}

#[tokio::test]
async fn replayed_idempotency_key_fails_without_second_posting() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let a = srv.funded_account("100.00").await;
    let b = srv.funded_account("0").await;
    let body = json!({
        "fromAccountId": a.to_string(),
        "toAccountId": b.to_string(),
        "amount": "40.00",
        "description": "rent",
        "idempotencyKey": "k-replay",
    });

    let (_, first) = submit(&client, &srv.base_url, body.clone()).await;
    let track_url = first["trackUrl"].as_str().unwrap();
    let first = job_finished_eventually(&client, &srv.base_url, track_url).await;
    assert_eq!(first["status"], "completed");

    let (status, second) = submit(&client, &srv.base_url, body).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let second =
        job_finished_eventually(&client, &srv.base_url, second["trackUrl"].as_str().unwrap()).await;

    assert_eq!(second["status"], "failed");
    assert_eq!(second["error"]["kind"], "duplicate_request");
    // Caller errors are not retried.
    assert_eq!(second["attempts"], 1);

    assert_eq!(balance_of(&client, &srv.base_url, a).await, "60.00");
    assert_eq!(balance_of(&client, &srv.base_url, b).await, "40.00");
}

#[tokio::test]
async fn insufficient_funds_is_a_terminal_failure() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let a = srv.funded_account("10.00").await;
    let b = srv.funded_account("0").await;

    let (_, queued) = submit(
        &client,
        &srv.base_url,
        json!({
            "fromAccountId": a.to_string(),
            "toAccountId": b.to_string(),
            "amount": "10.01",
            "description": "too much",
        }),
    )
    .await;

    let track_url = queued["trackUrl"].as_str().unwrap();
    let done = job_finished_eventually(&client, &srv.base_url, track_url).await;
    assert_eq!(done["status"], "failed");
    assert_eq!(done["error"]["kind"], "insufficient_funds");
    assert_eq!(done["error"]["retryable"], false);
    assert!(done["result"].is_null());

    assert_eq!(balance_of(&client, &srv.base_url, a).await, "10.00");
}

#[tokio::test]
async fn zero_amount_is_rejected_by_the_engine() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let a = srv.funded_account("5.00").await;
    let b = srv.funded_account("0").await;

    let (status, queued) = submit(
        &client,
        &srv.base_url,
        json!({
            "fromAccountId": a.to_string(),
            "toAccountId": b.to_string(),
            "amount": "0.00",
            "description": "nothing",
        }),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let track_url = queued["trackUrl"].as_str().unwrap();
    let done = job_finished_eventually(&client, &srv.base_url, track_url).await;
    assert_eq!(done["status"], "failed");
    assert_eq!(done["error"]["kind"], "invalid_amount");
}

#[tokio::test]
async fn malformed_bodies_are_rejected_before_queueing() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();
    let a = AccountId::new().to_string();
    let b = AccountId::new().to_string();

    let cases = [
        json!({ "fromAccountId": "nope", "toAccountId": b, "amount": "1.00", "description": "x" }),
        json!({ "fromAccountId": a, "toAccountId": b, "amount": "1.005", "description": "x" }),
        json!({ "fromAccountId": a, "toAccountId": b, "amount": "-1", "description": "x" }),
        json!({ "fromAccountId": a, "toAccountId": b, "amount": "1.00" }),
        json!({ "fromAccountId": a, "toAccountId": b, "amount": 1, "description": "x" }),
    ];

    for body in cases {
        let (status, err) = submit(&client, &srv.base_url, body.clone()).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "body {body} was accepted");
        assert_eq!(err["error"], "validation_error");
        assert!(err["message"].is_string());
    }
}

#[tokio::test]
async fn unknown_job_is_not_found() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();

    for id in [uuid::Uuid::now_v7().to_string(), "garbage".to_string()] {
        let (status, body) =
            get_json(&client, format!("{}/ledger/status/{}", srv.base_url, id)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body, json!({ "status": "not_found" }));
    }
}

#[tokio::test]
async fn queued_job_can_be_cancelled_once() {
    let srv = TestServer::spawn_with(false).await;
    let client = reqwest::Client::new();

    let a = srv.funded_account("50.00").await;
    let b = srv.funded_account("0").await;

    let (_, queued) = submit(
        &client,
        &srv.base_url,
        json!({
            "fromAccountId": a.to_string(),
            "toAccountId": b.to_string(),
            "amount": "5.00",
            "description": "cancel me",
        }),
    )
    .await;
    let track_url = queued["trackUrl"].as_str().unwrap();

    let (status, body) = get_json(&client, format!("{}{}", srv.base_url, track_url)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "queued");
    assert_eq!(body["attempts"], 0);

    let cancel_url = format!("{}{}/cancel", srv.base_url, track_url);
    let res = client.post(&cancel_url).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["status"], "cancelled");

    let res = client.post(&cancel_url).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::CONFLICT);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["error"], "not_cancellable");

    assert_eq!(balance_of(&client, &srv.base_url, a).await, "50.00");
}

#[tokio::test]
async fn balance_of_account_without_entries_is_zero() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();
    let id = AccountId::new();

    let (status, body) = get_json(&client, format!("{}/ledger/balance/{}", srv.base_url, id)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["accountId"], id.to_string());
    assert_eq!(body["balance"], "0.00");
    assert_eq!(body["currency"], "USD");

    let url = format!("{}/ledger/balance/not-a-uuid", srv.base_url);
    let (status, body) = get_json(&client, url).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "validation_error");
}

#[tokio::test]
async fn concurrent_submissions_never_overdraw() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let a = srv.funded_account("100.00").await;
    let b = srv.funded_account("0").await;

    let mut track_urls = Vec::new();
    for i in 0..8 {
        let (status, queued) = submit(
            &client,
            &srv.base_url,
            json!({
                "fromAccountId": a.to_string(),
                "toAccountId": b.to_string(),
                "amount": "30.00",
                "description": format!("burst {i}"),
            }),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        track_urls.push(queued["trackUrl"].as_str().unwrap().to_string());
    }

    let mut completed = 0;
    for url in &track_urls {
        let done = job_finished_eventually(&client, &srv.base_url, url).await;
        match done["status"].as_str().unwrap() {
            "completed" => completed += 1,
            _ => assert_eq!(done["error"]["kind"], "insufficient_funds"),
        }
    }

    assert_eq!(completed, 3);
    assert_eq!(balance_of(&client, &srv.base_url, a).await, "10.00");
    assert_eq!(balance_of(&client, &srv.base_url, b).await, "90.00");
}
