//! # Billing Client SDK
//!
//! A typed Rust client for the Billing API.

use billing_types::{
    CancelRequest, CreatePaymentLinkRequest, CurrencyLimits, PaymentIntentId,
    PaymentLinkResponse, PaymentProvider, PaymentStatusResponse, PurchaseRequest,
    PurchaseResponse, RatesResponse, RenewRequest, SubscriptionId, SubscriptionView,
    SuspendRequest, TransactionPage, Wallet,
};
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;

/// Error type for client operations.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error: {status} - {message}")]
    Api {
        status: u16,
        message: String,
        /// Set by the server when retrying the same request may succeed
        retryable: bool,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ClientError {
    /// Whether the request may succeed if sent again unchanged.
    pub fn is_retryable(&self) -> bool {
        match self {
            ClientError::Http(e) => e.is_timeout() || e.is_connect(),
            ClientError::Api { retryable, .. } => *retryable,
            ClientError::Json(_) => false,
        }
    }
}

/// Billing API client.
pub struct BillingClient {
    base_url: String,
    api_key: Option<String>,
    http: Client,
}

impl BillingClient {
    /// Creates a new client.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: None,
            http: Client::new(),
        }
    }

    /// Sets the API key sent as a bearer token.
    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    /// Checks if the API is healthy.
    pub async fn health(&self) -> Result<bool, ClientError> {
        let resp = self
            .http
            .get(format!("{}/health", self.base_url))
            .send()
            .await?;
        Ok(resp.status().is_success())
    }

    pub async fn rates(&self) -> Result<RatesResponse, ClientError> {
        self.get("/api/rates").await
    }

    pub async fn amount_limits(&self) -> Result<Vec<CurrencyLimits>, ClientError> {
        self.get("/api/amount-limits").await
    }

    /// Gets an owner's wallet, opening it on first use.
    pub async fn wallet(&self, owner_id: &str) -> Result<Wallet, ClientError> {
        self.get(&format!("/api/wallets/{}", owner_id)).await
    }

    /// Lists an owner's ledger entries, newest first.
    pub async fn transactions(
        &self,
        owner_id: &str,
        page: Option<u32>,
        limit: Option<u32>,
    ) -> Result<TransactionPage, ClientError> {
        let mut query = Vec::new();
        if let Some(page) = page {
            query.push(format!("page={}", page));
        }
        if let Some(limit) = limit {
            query.push(format!("limit={}", limit));
        }
        let mut path = format!("/api/wallets/{}/transactions", owner_id);
        if !query.is_empty() {
            path = format!("{}?{}", path, query.join("&"));
        }
        self.get(&path).await
    }

    /// Buys from the wallet balance.
    ///
    /// An insufficient balance is returned as
    /// [`PurchaseResponse::InsufficientBalance`], not as an error.
    pub async fn purchase(
        &self,
        owner_id: &str,
        req: &PurchaseRequest,
    ) -> Result<PurchaseResponse, ClientError> {
        let resp = self
            .authorized(
                self.http
                    .post(format!("{}/api/wallets/{}/purchases", self.base_url, owner_id)),
            )
            .json(req)
            .send()
            .await?;
        if resp.status() == StatusCode::PAYMENT_REQUIRED {
            let body = resp.text().await?;
            return Ok(serde_json::from_str(&body)?);
        }
        self.handle_response(resp).await
    }

    pub async fn freeze_wallet(&self, owner_id: &str) -> Result<Wallet, ClientError> {
        self.post_empty(&format!("/api/wallets/{}/freeze", owner_id))
            .await
    }

    pub async fn unfreeze_wallet(&self, owner_id: &str) -> Result<Wallet, ClientError> {
        self.post_empty(&format!("/api/wallets/{}/unfreeze", owner_id))
            .await
    }

    /// Creates a hosted payment link, or returns the one already open for
    /// the same request.
    pub async fn create_payment_link(
        &self,
        req: &CreatePaymentLinkRequest,
    ) -> Result<PaymentLinkResponse, ClientError> {
        self.post("/api/payments/links", req).await
    }

    /// Gets a payment's status; with `wait` the server polls the provider
    /// until the payment settles or its poll window closes.
    pub async fn payment_status(
        &self,
        provider: PaymentProvider,
        payment_id: PaymentIntentId,
        wait: bool,
    ) -> Result<PaymentStatusResponse, ClientError> {
        self.get(&format!(
            "/api/payments/{}/{}/status?wait={}",
            provider.as_str().to_ascii_lowercase(),
            payment_id,
            wait
        ))
        .await
    }

    pub async fn subscription(&self, id: SubscriptionId) -> Result<SubscriptionView, ClientError> {
        self.get(&format!("/api/subscriptions/{}", id)).await
    }

    pub async fn owner_subscriptions(
        &self,
        owner_ref: &str,
    ) -> Result<Vec<SubscriptionView>, ClientError> {
        self.get(&format!("/api/owners/{}/subscriptions", owner_ref))
            .await
    }

    pub async fn renew_subscription(
        &self,
        id: SubscriptionId,
        req: &RenewRequest,
    ) -> Result<SubscriptionView, ClientError> {
        self.post(&format!("/api/subscriptions/{}/renew", id), req)
            .await
    }

    pub async fn cancel_subscription(
        &self,
        id: SubscriptionId,
        req: &CancelRequest,
    ) -> Result<SubscriptionView, ClientError> {
        self.post(&format!("/api/subscriptions/{}/cancel", id), req)
            .await
    }

    pub async fn suspend_subscription(
        &self,
        id: SubscriptionId,
        reason: &str,
    ) -> Result<SubscriptionView, ClientError> {
        let req = SuspendRequest {
            reason: reason.to_string(),
        };
        self.post(&format!("/api/subscriptions/{}/suspend", id), &req)
            .await
    }

    pub async fn resume_subscription(
        &self,
        id: SubscriptionId,
    ) -> Result<SubscriptionView, ClientError> {
        self.post_empty(&format!("/api/subscriptions/{}/resume", id))
            .await
    }

    fn authorized(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => req.bearer_auth(key),
            None => req,
        }
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, ClientError> {
        let req = self.authorized(self.http.get(format!("{}{}", self.base_url, path)));
        let resp = req.send().await?;
        self.handle_response(resp).await
    }

    async fn post<T: DeserializeOwned, B: serde::Serialize>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ClientError> {
        let req = self
            .authorized(self.http.post(format!("{}{}", self.base_url, path)))
            .json(body);
        let resp = req.send().await?;
        self.handle_response(resp).await
    }

    async fn post_empty<T: DeserializeOwned>(&self, path: &str) -> Result<T, ClientError> {
        let req = self.authorized(self.http.post(format!("{}{}", self.base_url, path)));
        let resp = req.send().await?;
        self.handle_response(resp).await
    }

    async fn handle_response<T: DeserializeOwned>(
        &self,
        resp: reqwest::Response,
    ) -> Result<T, ClientError> {
        let status = resp.status();
        if status.is_success() {
            let body = resp.text().await?;
            Ok(serde_json::from_str(&body)?)
        } else {
            let body = resp.text().await.unwrap_or_default();
            Err(api_error(status.as_u16(), body))
        }
    }
}

/// Reads the server's `{"error", "code", "retryable"}` body, falling back
/// to the raw text.
fn api_error(status: u16, body: String) -> ClientError {
    let parsed = serde_json::from_str::<serde_json::Value>(&body).ok();
    let retryable = parsed
        .as_ref()
        .and_then(|v| v.get("retryable"))
        .and_then(|v| v.as_bool())
        .unwrap_or(false);
    let message = parsed
        .as_ref()
        .and_then(|v| v.get("error"))
        .and_then(|v| v.as_str())
        .map(String::from)
        .unwrap_or(body);
    ClientError::Api {
        status,
        message,
        retryable,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_with_trailing_slash() {
        let client = BillingClient::new("http://localhost:3000/");
        assert_eq!(client.base_url, "http://localhost:3000");
    }

    #[test]
    fn test_client_with_api_key() {
        let client = BillingClient::new("http://localhost:3000").with_api_key("sk_test");
        assert_eq!(client.api_key, Some("sk_test".to_string()));
    }

    #[test]
    fn test_api_error_from_json_body() {
        let err = api_error(
            503,
            r#"{"error":"provider timed out","code":503,"retryable":true}"#.into(),
        );
        match &err {
            ClientError::Api {
                status,
                message,
                retryable,
            } => {
                assert_eq!(*status, 503);
                assert_eq!(message, "provider timed out");
                assert!(*retryable);
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert!(err.is_retryable());
    }

    #[test]
    fn test_api_error_from_plain_body() {
        let err = api_error(502, "Bad Gateway".into());
        match err {
            ClientError::Api {
                message, retryable, ..
            } => {
                assert_eq!(message, "Bad Gateway");
                assert!(!retryable);
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }
}
