#![deny(unsafe_code)]

pub mod config;

pub use config::ServiceConfig;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use payout_adapters::DevPasscodeChannel;
use payout_core::{
    AuditReport, Auditor, BatchCorrection, Clock, CorrectionOutcome, FeeBreakdown, FeeCalculator,
    FeeConfigRow, Journal, JournalEntry, JournalEntryKind, Money, OtpChallenge, PasscodeChannel,
    PaymentMethod, PayoutError, Rate, ReloadableFeeTable, StoreError, Stores, SystemClock,
    Withdrawal, WithdrawalFee, WithdrawalOrchestrator, WithdrawalStatus,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

#[derive(Clone)]
pub struct ServiceState {
    pub fee_table: Arc<ReloadableFeeTable>,
    pub calculator: FeeCalculator,
    pub auditor: Arc<Auditor>,
    pub withdrawals: Arc<WithdrawalOrchestrator>,
    pub journal: Arc<Journal>,
    backend: &'static str,
}

impl ServiceState {
    pub async fn bootstrap(config: ServiceConfig) -> Result<Self, ServiceError> {
        let channel = passcode_channel(&config)?;
        let stores = Stores::bootstrap(config.storage.clone()).await?;
        Self::assemble(&config, stores, channel, Arc::new(SystemClock)).await
    }

    /// Wire the engine over already-opened stores and a passcode channel.
    pub async fn assemble(
        config: &ServiceConfig,
        stores: Stores,
        channel: Arc<dyn PasscodeChannel>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ServiceError> {
        let fee_table = Arc::new(ReloadableFeeTable::new(config.fee_table()?));
        let calculator = FeeCalculator::new(fee_table.clone());
        let journal = Arc::new(Journal::bootstrap(stores.journal.clone()).await?);
        let backend = stores.backend_label();

        let auditor = Auditor::new(
            stores.payouts.clone(),
            calculator.clone(),
            journal.clone(),
            clock.clone(),
            config.withdrawal.store_timeout(),
        );
        let withdrawals = WithdrawalOrchestrator::new(
            stores,
            calculator.clone(),
            channel,
            journal.clone(),
            clock,
            config.withdrawal.clone(),
        )?;

        info!(
            backend,
            fee_rows = fee_table.snapshot().len(),
            "payout service state assembled"
        );

        Ok(Self {
            fee_table,
            calculator,
            auditor: Arc::new(auditor),
            withdrawals: Arc::new(withdrawals),
            journal,
            backend,
        })
    }

    pub fn backend(&self) -> &'static str {
        self.backend
    }
}

pub fn build_router(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/fees/config", get(get_fee_config).put(replace_fee_config))
        .route("/v1/fees/sale", post(quote_sale))
        .route("/v1/fees/subscription", post(quote_subscription))
        .route("/v1/fees/withdrawal", post(quote_withdrawal))
        .route("/v1/audit/users/:user_id", get(audit_user))
        .route("/v1/audit/users/:user_id/corrections", post(correct_user))
        .route(
            "/v1/audit/transactions/:transaction_id/correction",
            post(correct_transaction),
        )
        .route("/v1/users/:user_id/balance", get(get_balance))
        .route("/v1/withdrawals", post(request_withdrawal))
        .route("/v1/withdrawals/confirm", post(confirm_withdrawal))
        .route("/v1/withdrawals/:withdrawal_id/status", post(transition_withdrawal))
        .route("/v1/journal", get(list_journal_entries))
        .with_state(state)
}

/// The passcode channel the configuration asks for. Only the development
/// channel ships with the service, so it has to be enabled explicitly.
pub fn passcode_channel(
    config: &ServiceConfig,
) -> Result<Arc<dyn PasscodeChannel>, ServiceError> {
    if !config.dev_passcodes {
        return Err(PayoutError::Configuration(
            "no passcode delivery channel configured; set dev_passcodes for local runs"
                .to_string(),
        )
        .into());
    }
    if config.passcode_secret.trim().is_empty() {
        return Err(
            PayoutError::Configuration("passcode_secret must not be empty".to_string()).into(),
        );
    }
    let retention = Duration::from_secs(config.withdrawal.challenge_ttl_secs.unsigned_abs());
    tracing::warn!("development passcode channel enabled; codes are logged, not delivered");
    Ok(Arc::new(
        DevPasscodeChannel::new(&config.passcode_secret).with_retention(retention),
    ))
}

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("core engine error: {0}")]
    Core(#[from] PayoutError),
    #[error("configuration error: {0}")]
    Config(#[from] ::config::ConfigError),
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{message}")]
    Http { status: StatusCode, message: String },
    #[error(transparent)]
    Core(#[from] PayoutError),
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self::Http {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }
}

/// HTTP status for an engine error.
pub fn status_for(err: &PayoutError) -> StatusCode {
    match err {
        PayoutError::InvalidInput(_) | PayoutError::Validation(_) => StatusCode::BAD_REQUEST,
        PayoutError::NotFound(_) | PayoutError::Store(StoreError::NotFound(_)) => {
            StatusCode::NOT_FOUND
        }
        PayoutError::AuditInProgress(_) | PayoutError::Store(StoreError::Conflict(_)) => {
            StatusCode::CONFLICT
        }
        PayoutError::NegativeNetAmount { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        PayoutError::Store(_) | PayoutError::PasscodeChannel { .. } => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        PayoutError::Configuration(_)
        | PayoutError::Journal(_)
        | PayoutError::InvariantViolation(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Http { status, message } => (
                status,
                Json(serde_json::json!({ "error": message, "kind": "request" })),
            )
                .into_response(),
            ApiError::Core(err) => (
                status_for(&err),
                Json(serde_json::json!({ "error": err.to_string(), "kind": err.kind() })),
            )
                .into_response(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
    service: &'static str,
    store_backend: &'static str,
}

async fn health(State(state): State<ServiceState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        service: "payout-service",
        store_backend: state.backend,
    })
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct FeeConfigBody {
    rows: Vec<FeeConfigRow>,
}

async fn get_fee_config(State(state): State<ServiceState>) -> Json<FeeConfigBody> {
    Json(FeeConfigBody {
        rows: state.fee_table.snapshot().rows(),
    })
}

async fn replace_fee_config(
    State(state): State<ServiceState>,
    Json(body): Json<FeeConfigBody>,
) -> Result<Json<FeeConfigBody>, ApiError> {
    // A bad table from the caller is a request error, not a server fault.
    state.fee_table.reload(body.rows).map_err(|err| match err {
        PayoutError::Configuration(message) => ApiError::bad_request(message),
        other => ApiError::Core(other),
    })?;
    Ok(Json(FeeConfigBody {
        rows: state.fee_table.snapshot().rows(),
    }))
}

#[derive(Debug, Clone, Deserialize)]
struct SaleQuoteRequest {
    gross_amount: Money,
    payment_method: PaymentMethod,
    settlement_days: Option<u16>,
    affiliate_commission_percent: Option<Rate>,
}

async fn quote_sale(
    State(state): State<ServiceState>,
    Json(request): Json<SaleQuoteRequest>,
) -> Result<Json<FeeBreakdown>, ApiError> {
    let settlement_days = request
        .settlement_days
        .unwrap_or_else(|| request.payment_method.standard_settlement_days());
    let breakdown = state.calculator.compute_sale_fee(
        request.gross_amount,
        request.payment_method,
        settlement_days,
        request.affiliate_commission_percent,
    )?;
    Ok(Json(breakdown))
}

#[derive(Debug, Clone, Deserialize)]
struct SubscriptionQuoteRequest {
    gross_amount: Money,
    payment_method: PaymentMethod,
}

async fn quote_subscription(
    State(state): State<ServiceState>,
    Json(request): Json<SubscriptionQuoteRequest>,
) -> Result<Json<FeeBreakdown>, ApiError> {
    let breakdown = state
        .calculator
        .compute_subscription_fee(request.gross_amount, request.payment_method)?;
    Ok(Json(breakdown))
}

#[derive(Debug, Clone, Deserialize)]
struct WithdrawalQuoteRequest {
    requested_amount: Money,
}

async fn quote_withdrawal(
    State(state): State<ServiceState>,
    Json(request): Json<WithdrawalQuoteRequest>,
) -> Result<Json<WithdrawalFee>, ApiError> {
    Ok(Json(
        state
            .calculator
            .compute_withdrawal_fee(request.requested_amount)?,
    ))
}

async fn audit_user(
    State(state): State<ServiceState>,
    Path(user_id): Path<String>,
) -> Result<Json<AuditReport>, ApiError> {
    Ok(Json(state.auditor.audit_user_transactions(&user_id).await?))
}

async fn correct_user(
    State(state): State<ServiceState>,
    Path(user_id): Path<String>,
) -> Result<Json<BatchCorrection>, ApiError> {
    Ok(Json(state.auditor.correct_all_divergent(&user_id).await?))
}

async fn correct_transaction(
    State(state): State<ServiceState>,
    Path(transaction_id): Path<String>,
) -> Result<Json<CorrectionOutcome>, ApiError> {
    Ok(Json(state.auditor.apply_correction(&transaction_id).await?))
}

#[derive(Debug, Clone, Serialize)]
struct BalanceResponse {
    user_id: String,
    available_balance: Money,
}

async fn get_balance(
    State(state): State<ServiceState>,
    Path(user_id): Path<String>,
) -> Result<Json<BalanceResponse>, ApiError> {
    let available_balance = state.withdrawals.available_balance(&user_id).await?;
    Ok(Json(BalanceResponse {
        user_id,
        available_balance,
    }))
}

#[derive(Debug, Clone, Deserialize)]
struct WithdrawalRequestBody {
    user_id: String,
    amount: Money,
    bank_account_id: String,
}

async fn request_withdrawal(
    State(state): State<ServiceState>,
    Json(body): Json<WithdrawalRequestBody>,
) -> Result<Json<OtpChallenge>, ApiError> {
    if body.user_id.trim().is_empty() {
        return Err(ApiError::bad_request("user_id is required"));
    }
    let challenge = state
        .withdrawals
        .request_withdrawal(&body.user_id, body.amount, &body.bank_account_id)
        .await?;
    Ok(Json(challenge))
}

#[derive(Debug, Clone, Deserialize)]
struct ConfirmWithdrawalBody {
    user_id: String,
    code: String,
}

async fn confirm_withdrawal(
    State(state): State<ServiceState>,
    Json(body): Json<ConfirmWithdrawalBody>,
) -> Result<Json<Withdrawal>, ApiError> {
    if body.code.trim().is_empty() {
        return Err(ApiError::bad_request("code is required"));
    }
    let withdrawal = state
        .withdrawals
        .confirm_withdrawal(&body.user_id, body.code.trim())
        .await?;
    Ok(Json(withdrawal))
}

#[derive(Debug, Clone, Deserialize)]
struct StatusChangeBody {
    status: WithdrawalStatus,
}

async fn transition_withdrawal(
    State(state): State<ServiceState>,
    Path(withdrawal_id): Path<String>,
    Json(body): Json<StatusChangeBody>,
) -> Result<Json<Withdrawal>, ApiError> {
    Ok(Json(
        state
            .withdrawals
            .transition_withdrawal(&withdrawal_id, body.status)
            .await?,
    ))
}

#[derive(Debug, Clone, Deserialize)]
struct JournalQuery {
    kind: Option<String>,
    subject_id: Option<String>,
    user_id: Option<String>,
    limit: Option<usize>,
    offset: Option<usize>,
    order: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
struct JournalResponse {
    backend: &'static str,
    chain_valid: bool,
    total: usize,
    returned: usize,
    items: Vec<JournalEntry>,
}

async fn list_journal_entries(
    State(state): State<ServiceState>,
    Query(query): Query<JournalQuery>,
) -> Result<Json<JournalResponse>, ApiError> {
    let kind_filter = match query.kind.as_deref() {
        None => None,
        Some(value) => Some(
            JournalEntryKind::parse(&value.to_ascii_lowercase()).map_err(|_| {
                ApiError::bad_request(format!(
                    "invalid kind '{}'; expected one of: fee_correction, withdrawal_committed, withdrawal_status_changed",
                    value
                ))
            })?,
        ),
    };

    let chain_valid = state.journal.verify_chain().await;
    let mut entries = state.journal.entries().await;

    if let Some(kind) = kind_filter {
        entries.retain(|entry| entry.kind == kind);
    }
    if let Some(subject_id) = query.subject_id.as_deref() {
        entries.retain(|entry| entry.subject_id == subject_id);
    }
    if let Some(user_id) = query.user_id.as_deref() {
        entries.retain(|entry| entry.user_id == user_id);
    }

    let order = query
        .order
        .as_deref()
        .unwrap_or("asc")
        .to_ascii_lowercase();
    if order == "desc" {
        entries.reverse();
    } else if order != "asc" {
        return Err(ApiError::bad_request(format!(
            "invalid order '{}'; expected asc or desc",
            order
        )));
    }

    let total = entries.len();
    let offset = query.offset.unwrap_or(0);
    let limit = query.limit.unwrap_or(100).min(1000);
    let items = entries
        .into_iter()
        .skip(offset)
        .take(limit)
        .collect::<Vec<_>>();
    let returned = items.len();

    Ok(Json(JournalResponse {
        backend: state.backend,
        chain_valid,
        total,
        returned,
        items,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use payout_core::{
        BankAccount, BankAccountStatus, FeeTable, MemoryStore, Transaction, TransactionStatus,
        WithdrawalRejection,
    };
    use tower::ServiceExt;

    const USER: &str = "merchant-1";

    struct Harness {
        app: Router,
        store: MemoryStore,
        channel: Arc<DevPasscodeChannel>,
    }

    async fn harness() -> Harness {
        let config = ServiceConfig::default();
        let store = MemoryStore::new();
        let channel = Arc::new(DevPasscodeChannel::new("service-test-secret"));
        let state = ServiceState::assemble(
            &config,
            Stores::memory(store.clone()),
            channel.clone(),
            Arc::new(SystemClock),
        )
        .await
        .unwrap();
        Harness {
            app: build_router(state),
            store,
            channel,
        }
    }

    /// Approved pix sale of 100.00 (net 93.52) plus an approved account.
    async fn seed_merchant(store: &MemoryStore) -> Transaction {
        let calculator = FeeCalculator::new(Arc::new(FeeTable::defaults()));
        let breakdown = calculator
            .compute_sale_fee(Money::from_minor(10_000), PaymentMethod::Pix, 0, None)
            .unwrap();
        let transaction = Transaction::from_breakdown(
            USER,
            PaymentMethod::Pix,
            0,
            None,
            TransactionStatus::Approved,
            &breakdown,
        );
        store.insert_transaction(transaction.clone()).await;
        store
            .upsert_bank_account(BankAccount {
                id: "acct-1".to_string(),
                user_id: USER.to_string(),
                status: BankAccountStatus::Approved,
            })
            .await;
        transaction
    }

    async fn send(app: &Router, method: &str, uri: &str, body: Option<serde_json::Value>) -> Response {
        let request = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => request
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => request.body(Body::empty()).unwrap(),
        };
        app.clone().oneshot(request).await.unwrap()
    }

    async fn json_body(response: Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn bootstrap_refuses_to_run_without_a_passcode_channel() {
        let err = ServiceState::bootstrap(ServiceConfig::default())
            .await
            .err()
            .unwrap();
        assert!(err.to_string().contains("dev_passcodes"));

        let config = ServiceConfig {
            dev_passcodes: true,
            passcode_secret: " ".to_string(),
            ..ServiceConfig::default()
        };
        assert!(passcode_channel(&config).is_err());

        let config = ServiceConfig {
            dev_passcodes: true,
            ..ServiceConfig::default()
        };
        let state = ServiceState::bootstrap(config).await.unwrap();
        assert_eq!(state.backend, "memory");
    }

    #[tokio::test]
    async fn health_reports_store_backend() {
        let harness = harness().await;
        let response = send(&harness.app, "GET", "/v1/health", None).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["store_backend"], "memory");
    }

    #[tokio::test]
    async fn sale_quote_returns_breakdown() {
        let harness = harness().await;
        let response = send(
            &harness.app,
            "POST",
            "/v1/fees/sale",
            Some(serde_json::json!({
                "gross_amount": 10000,
                "payment_method": "pix"
            })),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["platform_fee"], 648);
        assert_eq!(body["acquirer_fee"], 0);
        assert_eq!(body["net_amount"], 9352);
    }

    #[tokio::test]
    async fn withdrawal_quote_is_flat() {
        let harness = harness().await;
        let response = send(
            &harness.app,
            "POST",
            "/v1/fees/withdrawal",
            Some(serde_json::json!({ "requested_amount": 5000 })),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["fee"], 490);
        assert_eq!(body["net_amount"], 4510);
    }

    #[tokio::test]
    async fn negative_net_quote_is_unprocessable() {
        let harness = harness().await;
        let response = send(
            &harness.app,
            "POST",
            "/v1/fees/sale",
            Some(serde_json::json!({
                "gross_amount": 100,
                "payment_method": "pix"
            })),
        )
        .await;
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        let body = json_body(response).await;
        assert_eq!(body["kind"], "negative_net_amount");
    }

    #[tokio::test]
    async fn unconfigured_settlement_term_is_a_configuration_error() {
        let harness = harness().await;
        let response = send(
            &harness.app,
            "POST",
            "/v1/fees/sale",
            Some(serde_json::json!({
                "gross_amount": 10000,
                "payment_method": "credit_card",
                "settlement_days": 45
            })),
        )
        .await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = json_body(response).await;
        assert_eq!(body["kind"], "configuration");
    }

    #[tokio::test]
    async fn fee_table_reload_changes_quotes_and_rejects_bad_rows() {
        let harness = harness().await;
        let response = send(
            &harness.app,
            "PUT",
            "/v1/fees/config",
            Some(serde_json::json!({
                "rows": [
                    { "operation": "sale", "method": "pix", "settlement_days": 0,
                      "percent_fee": "2.00", "fixed_fee": 0 },
                    { "operation": "withdrawal", "method": "pix", "settlement_days": 0,
                      "percent_fee": 0, "fixed_fee": 250 }
                ]
            })),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);

        let response = send(
            &harness.app,
            "POST",
            "/v1/fees/sale",
            Some(serde_json::json!({ "gross_amount": 10000, "payment_method": "pix" })),
        )
        .await;
        assert_eq!(json_body(response).await["net_amount"], 9800);

        let response = send(
            &harness.app,
            "PUT",
            "/v1/fees/config",
            Some(serde_json::json!({
                "rows": [
                    { "operation": "withdrawal", "method": "pix", "settlement_days": 0,
                      "percent_fee": 1, "fixed_fee": 250 }
                ]
            })),
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = send(&harness.app, "GET", "/v1/fees/config", None).await;
        let body = json_body(response).await;
        assert_eq!(body["rows"].as_array().map(Vec::len), Some(2));
    }

    #[tokio::test]
    async fn audit_reports_and_corrects_drift() {
        let harness = harness().await;
        let transaction = seed_merchant(&harness.store).await;
        let mut drifted = transaction.fees;
        drifted.net_amount = Money::from_minor(9_000);
        harness
            .store
            .overwrite_fee_fields(&transaction.id, drifted)
            .await
            .unwrap();

        let response = send(&harness.app, "GET", "/v1/audit/users/merchant-1", None).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["summary"]["divergent"], 1);

        let uri = format!("/v1/audit/transactions/{}/correction", transaction.id);
        let response = send(&harness.app, "POST", &uri, None).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["outcome"], "applied");

        let response = send(&harness.app, "POST", &uri, None).await;
        assert_eq!(json_body(response).await["outcome"], "already_correct");

        let response = send(&harness.app, "GET", "/v1/users/merchant-1/balance", None).await;
        assert_eq!(json_body(response).await["available_balance"], 9352);

        let response = send(
            &harness.app,
            "POST",
            "/v1/audit/transactions/missing/correction",
            None,
        )
        .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn withdrawal_flow_over_http() {
        let harness = harness().await;
        seed_merchant(&harness.store).await;

        let response = send(
            &harness.app,
            "POST",
            "/v1/withdrawals",
            Some(serde_json::json!({
                "user_id": USER,
                "amount": 5000,
                "bank_account_id": "acct-1"
            })),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        let challenge = json_body(response).await;
        assert_eq!(challenge["fee"], 490);
        assert_eq!(challenge["available_balance"], 9352);
        let challenge_id = challenge["challenge_id"].as_str().unwrap().to_string();
        let code = harness.channel.issued_code(&challenge_id).unwrap();

        let response = send(
            &harness.app,
            "POST",
            "/v1/withdrawals/confirm",
            Some(serde_json::json!({ "user_id": USER, "code": code })),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        let withdrawal = json_body(response).await;
        assert_eq!(withdrawal["status"], "pending");
        assert_eq!(withdrawal["idempotency_key"], challenge_id.as_str());
        let withdrawal_id = withdrawal["id"].as_str().unwrap().to_string();

        let response = send(&harness.app, "GET", "/v1/users/merchant-1/balance", None).await;
        assert_eq!(json_body(response).await["available_balance"], 4352);

        let response = send(
            &harness.app,
            "POST",
            &format!("/v1/withdrawals/{withdrawal_id}/status"),
            Some(serde_json::json!({ "status": "approved" })),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["status"], "approved");

        // Cooldown applies to the next request.
        let response = send(
            &harness.app,
            "POST",
            "/v1/withdrawals",
            Some(serde_json::json!({
                "user_id": USER,
                "amount": 1000,
                "bank_account_id": "acct-1"
            })),
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = json_body(response).await;
        assert_eq!(body["kind"], "validation");
        assert!(body["error"]
            .as_str()
            .unwrap()
            .contains("wait 15 more minute(s)"));

        let response = send(
            &harness.app,
            "GET",
            &format!("/v1/journal?subject_id={withdrawal_id}"),
            None,
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["chain_valid"], true);
        assert_eq!(body["total"], 2);
        assert_eq!(body["items"][0]["kind"], "withdrawal_committed");
        assert_eq!(body["items"][1]["kind"], "withdrawal_status_changed");
    }

    #[tokio::test]
    async fn wrong_passcode_is_a_validation_error() {
        let harness = harness().await;
        seed_merchant(&harness.store).await;

        let response = send(
            &harness.app,
            "POST",
            "/v1/withdrawals",
            Some(serde_json::json!({
                "user_id": USER,
                "amount": 2000,
                "bank_account_id": "acct-1"
            })),
        )
        .await;
        let challenge = json_body(response).await;
        let challenge_id = challenge["challenge_id"].as_str().unwrap();
        let code = harness.channel.issued_code(challenge_id).unwrap();
        let wrong = if code == "000000" { "111111" } else { "000000" };

        let response = send(
            &harness.app,
            "POST",
            "/v1/withdrawals/confirm",
            Some(serde_json::json!({ "user_id": USER, "code": wrong })),
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = json_body(response).await;
        let expected = PayoutError::from(WithdrawalRejection::PasscodeMismatch {
            attempts_remaining: 4,
        });
        assert_eq!(body["error"], expected.to_string());
    }

    #[tokio::test]
    async fn withdrawal_for_unknown_account_is_rejected() {
        let harness = harness().await;
        seed_merchant(&harness.store).await;

        let response = send(
            &harness.app,
            "POST",
            "/v1/withdrawals",
            Some(serde_json::json!({
                "user_id": USER,
                "amount": 2000,
                "bank_account_id": "acct-unknown"
            })),
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(response).await["kind"], "validation");
    }

    #[tokio::test]
    async fn journal_rejects_invalid_filters() {
        let harness = harness().await;
        let response = send(&harness.app, "GET", "/v1/journal?kind=bogus", None).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let response = send(&harness.app, "GET", "/v1/journal?order=sideways", None).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn store_errors_map_to_service_unavailable() {
        let timeout = PayoutError::Store(StoreError::Timeout {
            operation: "balance_inputs",
            after_ms: 5,
        });
        assert_eq!(status_for(&timeout), StatusCode::SERVICE_UNAVAILABLE);
        let conflict = PayoutError::Store(StoreError::Conflict("dup".to_string()));
        assert_eq!(status_for(&conflict), StatusCode::CONFLICT);
        assert_eq!(
            status_for(&PayoutError::AuditInProgress(USER.to_string())),
            StatusCode::CONFLICT
        );
    }
}
