//! HTTP request handlers.

use std::str::FromStr;
use std::sync::Arc;

use axum::{
    Json,
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use chrono::Utc;
use utoipa::OpenApi;

use billing_types::ports::SignatureHeaders;
use billing_types::{
    AppError, BillingRepository, CancelRequest, CreatePaymentLinkRequest, HistoryQuery,
    PaymentIntentId, PaymentLinkResponse, PaymentProvider, PaymentStatusQuery,
    PaymentStatusResponse, ProviderError, PurchaseRequest, PurchaseResponse, RenewRequest,
    SubscriptionId, SubscriptionView, SuspendRequest, ValidationError, VerificationError,
};

use crate::BillingService;
use crate::openapi::ApiDoc;

/// Application state shared across handlers.
pub struct AppState<R: BillingRepository> {
    pub service: Arc<BillingService<R>>,
    /// SHA-256 hashes of the accepted API keys
    pub api_key_hashes: Vec<String>,
}

/// Wrapper to implement IntoResponse for AppError (orphan rule workaround).
pub struct ApiError(pub AppError);

impl From<AppError> for ApiError {
    fn from(err: AppError) -> Self {
        ApiError(err)
    }
}

impl From<ValidationError> for ApiError {
    fn from(err: ValidationError) -> Self {
        ApiError(err.into())
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match &self.0 {
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::IllegalTransition { .. } | AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::Verification(VerificationError::UnknownIntent(_)) => StatusCode::NOT_FOUND,
            AppError::Verification(_) => StatusCode::UNAUTHORIZED,
            AppError::Provider(ProviderError::NotConfigured(_)) => StatusCode::BAD_REQUEST,
            AppError::Provider(e) if e.is_retryable() => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Provider(_) => StatusCode::BAD_GATEWAY,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self.0, code = status.as_u16(), "Request failed");
        }

        let mut body = serde_json::json!({
            "error": self.0.to_string(),
            "code": status.as_u16()
        });
        if let AppError::Provider(e) = &self.0 {
            body["retryable"] = e.is_retryable().into();
        }

        (status, Json(body)).into_response()
    }
}

fn parse_path<T: FromStr>(raw: &str, what: &str) -> Result<T, ApiError> {
    raw.parse::<T>()
        .map_err(|_| ValidationError::Invalid(format!("Invalid {}: {}", what, raw)).into())
}

fn parse_provider(raw: &str) -> Result<PaymentProvider, ApiError> {
    Ok(raw.parse::<PaymentProvider>()?)
}

/// Lower-cased header map handed to signature verification.
fn signature_headers(headers: &HeaderMap) -> SignatureHeaders {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
        })
        .collect()
}

/// Health check endpoint.
pub async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "healthy" }))
}

pub async fn openapi_json() -> impl IntoResponse {
    Json(ApiDoc::openapi())
}

// ─────────────────────────────────────────────────────────────────────────────
// Wallets
// ─────────────────────────────────────────────────────────────────────────────

/// Get (or open) the wallet of an owner.
#[tracing::instrument(skip(state))]
pub async fn get_wallet<R: BillingRepository>(
    State(state): State<Arc<AppState<R>>>,
    Path(owner_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let wallet = state.service.wallet_for_owner(&owner_id).await?;
    Ok(Json(wallet))
}

/// List a wallet's ledger entries, newest first.
#[tracing::instrument(skip(state))]
pub async fn list_transactions<R: BillingRepository>(
    State(state): State<Arc<AppState<R>>>,
    Path(owner_id): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let wallet = state.service.wallet_for_owner(&owner_id).await?;
    let page = state
        .service
        .ledger()
        .history(wallet.id, query.page, query.limit)
        .await?;
    Ok(Json(page))
}

/// Buy from the wallet balance.
#[tracing::instrument(skip(state, req), fields(reference = %req.reference))]
pub async fn purchase<R: BillingRepository>(
    State(state): State<Arc<AppState<R>>>,
    Path(owner_id): Path<String>,
    Json(req): Json<PurchaseRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let response = state.service.purchase_with_wallet(&owner_id, req).await?;
    let status = match &response {
        PurchaseResponse::Completed { .. } => StatusCode::OK,
        PurchaseResponse::InsufficientBalance { .. } => StatusCode::PAYMENT_REQUIRED,
    };
    Ok((status, Json(response)))
}

#[tracing::instrument(skip(state))]
pub async fn freeze_wallet<R: BillingRepository>(
    State(state): State<Arc<AppState<R>>>,
    Path(owner_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let wallet = state.service.wallet_for_owner(&owner_id).await?;
    let wallet = state.service.ledger().freeze(wallet.id).await?;
    Ok(Json(wallet))
}

#[tracing::instrument(skip(state))]
pub async fn unfreeze_wallet<R: BillingRepository>(
    State(state): State<Arc<AppState<R>>>,
    Path(owner_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let wallet = state.service.wallet_for_owner(&owner_id).await?;
    let wallet = state.service.ledger().unfreeze(wallet.id).await?;
    Ok(Json(wallet))
}

// ─────────────────────────────────────────────────────────────────────────────
// Payments
// ─────────────────────────────────────────────────────────────────────────────

/// Create (or return the existing) hosted payment link.
#[tracing::instrument(skip(state, req), fields(provider = %req.provider, payer = %req.payer_ref))]
pub async fn create_payment_link<R: BillingRepository>(
    State(state): State<Arc<AppState<R>>>,
    Json(req): Json<CreatePaymentLinkRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let intent = state.service.create_payment_link(req).await?;
    Ok((
        StatusCode::CREATED,
        Json(PaymentLinkResponse::from_intent(&intent)),
    ))
}

#[tracing::instrument(skip(state))]
pub async fn payment_status<R: BillingRepository>(
    State(state): State<Arc<AppState<R>>>,
    Path((provider, payment_id)): Path<(String, String)>,
    Query(query): Query<PaymentStatusQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let provider = parse_provider(&provider)?;
    let id: PaymentIntentId = parse_path(&payment_id, "payment id")?;
    let intent = state.service.payment_status(provider, id, query.wait).await?;
    Ok(Json(PaymentStatusResponse::from(&intent)))
}

/// Provider notification endpoint. Authenticated by signature, not API key.
#[tracing::instrument(skip(state, headers, body), fields(body_len = body.len()))]
pub async fn provider_webhook<R: BillingRepository>(
    State(state): State<Arc<AppState<R>>>,
    Path(provider): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let provider = parse_provider(&provider)?;
    let intent = state
        .service
        .handle_notification(provider, &body, &signature_headers(&headers))
        .await?;
    Ok(Json(serde_json::json!({
        "received": true,
        "payment_id": intent.id,
        "status": intent.status,
    })))
}

// ─────────────────────────────────────────────────────────────────────────────
// Subscriptions
// ─────────────────────────────────────────────────────────────────────────────

#[tracing::instrument(skip(state))]
pub async fn get_subscription<R: BillingRepository>(
    State(state): State<Arc<AppState<R>>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let id: SubscriptionId = parse_path(&id, "subscription id")?;
    let subscription = state.service.subscriptions().get(id).await?;
    Ok(Json(SubscriptionView::at(subscription, Utc::now())))
}

#[tracing::instrument(skip(state))]
pub async fn list_owner_subscriptions<R: BillingRepository>(
    State(state): State<Arc<AppState<R>>>,
    Path(owner_ref): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let now = Utc::now();
    let subscriptions = state
        .service
        .subscriptions()
        .list_for_owner(&owner_ref)
        .await?
        .into_iter()
        .map(|s| SubscriptionView::at(s, now))
        .collect::<Vec<_>>();
    Ok(Json(subscriptions))
}

#[tracing::instrument(skip(state, body))]
pub async fn renew_subscription<R: BillingRepository>(
    State(state): State<Arc<AppState<R>>>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let id: SubscriptionId = parse_path(&id, "subscription id")?;
    // An empty body renews without recording a payment.
    let req: RenewRequest = if body.is_empty() {
        RenewRequest::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| ValidationError::Invalid(format!("Invalid renew request: {}", e)))?
    };
    let subscription = state.service.renew_subscription(id, req).await?;
    Ok(Json(SubscriptionView::at(subscription, Utc::now())))
}

#[tracing::instrument(skip(state, req))]
pub async fn cancel_subscription<R: BillingRepository>(
    State(state): State<Arc<AppState<R>>>,
    Path(id): Path<String>,
    Json(req): Json<CancelRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let id: SubscriptionId = parse_path(&id, "subscription id")?;
    let subscription = state.service.cancel_subscription(id, req).await?;
    Ok(Json(SubscriptionView::at(subscription, Utc::now())))
}

#[tracing::instrument(skip(state, req))]
pub async fn suspend_subscription<R: BillingRepository>(
    State(state): State<Arc<AppState<R>>>,
    Path(id): Path<String>,
    Json(req): Json<SuspendRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let id: SubscriptionId = parse_path(&id, "subscription id")?;
    let subscription = state.service.subscriptions().suspend(id, req.reason).await?;
    Ok(Json(SubscriptionView::at(subscription, Utc::now())))
}

#[tracing::instrument(skip(state))]
pub async fn resume_subscription<R: BillingRepository>(
    State(state): State<Arc<AppState<R>>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let id: SubscriptionId = parse_path(&id, "subscription id")?;
    let subscription = state.service.subscriptions().resume(id).await?;
    Ok(Json(SubscriptionView::at(subscription, Utc::now())))
}

// ─────────────────────────────────────────────────────────────────────────────
// Reference data
// ─────────────────────────────────────────────────────────────────────────────

pub async fn get_rates<R: BillingRepository>(
    State(state): State<Arc<AppState<R>>>,
) -> impl IntoResponse {
    Json(state.service.rates())
}

pub async fn get_amount_limits<R: BillingRepository>(
    State(state): State<Arc<AppState<R>>>,
) -> impl IntoResponse {
    Json(state.service.amount_limits())
}

#[cfg(test)]
mod tests {
    use super::*;
    use billing_types::{SubscriptionAction, SubscriptionStatus};

    #[test]
    fn test_error_status_mapping() {
        let cases = [
            (
                AppError::Validation(ValidationError::NonPositiveAmount),
                StatusCode::BAD_REQUEST,
            ),
            (AppError::NotFound("x".into()), StatusCode::NOT_FOUND),
            (
                AppError::IllegalTransition {
                    from: SubscriptionStatus::Cancelled,
                    action: SubscriptionAction::Renew,
                },
                StatusCode::CONFLICT,
            ),
            (
                AppError::Verification(VerificationError::SignatureMismatch),
                StatusCode::UNAUTHORIZED,
            ),
            (
                AppError::Verification(VerificationError::UnknownIntent("r".into())),
                StatusCode::NOT_FOUND,
            ),
            (
                AppError::Provider(ProviderError::Timeout(15)),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (
                AppError::Provider(ProviderError::Malformed("eof".into())),
                StatusCode::BAD_GATEWAY,
            ),
            (
                AppError::Provider(ProviderError::NotConfigured(PaymentProvider::Kashier)),
                StatusCode::BAD_REQUEST,
            ),
            (AppError::Internal("boom".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, expected) in cases {
            assert_eq!(ApiError(err).status(), expected);
        }
    }

    #[test]
    fn test_signature_headers_are_lowercased() {
        let mut headers = HeaderMap::new();
        headers.insert("X-Sandbox-Signature", "abc".parse().unwrap());
        let map = signature_headers(&headers);
        assert_eq!(map.get("x-sandbox-signature").map(String::as_str), Some("abc"));
    }

    #[test]
    fn test_parse_path_rejects_garbage() {
        assert!(parse_path::<SubscriptionId>("nope", "subscription id").is_err());
        assert!(parse_provider("paypal").is_err());
        assert_eq!(parse_provider("sandbox").ok(), Some(PaymentProvider::Sandbox));
    }
}
