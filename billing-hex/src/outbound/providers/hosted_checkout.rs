//! Adapter for hosted-checkout providers reached over HTTPS.
//!
//! One adapter type serves every real provider; they differ in base URL,
//! credentials, accepted currencies and how notifications are signed.
//!
//! Wire contract:
//! - `POST {base}/v1/checkout/sessions` opens a session and answers
//!   `{"id", "url", "expires_at"?}`
//! - `GET {base}/v1/checkout/sessions/{id}` answers a payment document
//! - notifications carry a payment document in the body

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use billing_types::ports::{
    CheckoutRequest, CheckoutSession, ProviderNotification, ProviderPaymentStatus,
    SignatureHeaders,
};
use billing_types::{
    Currency, PaymentProvider, PaymentProviderAdapter, ProviderError, VerificationError,
};

use super::PaymentDocument;
use crate::security::{sign_payload, verify_signature};

/// How a provider signs its notifications.
#[derive(Debug, Clone, PartialEq)]
pub enum SignatureScheme {
    /// Hex HMAC-SHA256 of the raw body in `header`.
    HexHmacSha256 { header: String },
    /// `t=<unix seconds>,v1=<hex HMAC-SHA256 of "{t}.{body}">` in `header`;
    /// timestamps further than `tolerance` from now are rejected.
    TimestampedHmacSha256 { header: String, tolerance: Duration },
}

#[derive(Debug, Clone)]
pub struct HostedCheckoutConfig {
    pub provider: PaymentProvider,
    pub base_url: String,
    pub api_key: String,
    pub webhook_secret: String,
    /// Accepted currencies, preferred first
    pub currencies: Vec<Currency>,
    pub signature: SignatureScheme,
    pub timeout: Duration,
}

pub struct HostedCheckoutProvider {
    config: HostedCheckoutConfig,
    client: reqwest::Client,
}

#[derive(Serialize)]
struct CreateSessionBody<'a> {
    reference: String,
    amount: String,
    currency: &'a str,
    method: &'a str,
    purpose: &'a str,
    customer_reference: &'a str,
    expires_at: DateTime<Utc>,
}

#[derive(Deserialize)]
struct SessionCreated {
    id: String,
    url: String,
    #[serde(default)]
    expires_at: Option<DateTime<Utc>>,
}

impl HostedCheckoutProvider {
    pub fn new(config: HostedCheckoutConfig) -> Result<Self, ProviderError> {
        if config.currencies.is_empty() {
            return Err(ProviderError::NotConfigured(config.provider));
        }
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| ProviderError::Network(e.to_string()))?;
        Ok(Self { config, client })
    }

    fn sessions_url(&self) -> String {
        format!(
            "{}/v1/checkout/sessions",
            self.config.base_url.trim_end_matches('/')
        )
    }

    fn transport_error(&self, err: reqwest::Error) -> ProviderError {
        if err.is_timeout() {
            ProviderError::Timeout(self.config.timeout.as_secs())
        } else if err.is_decode() {
            ProviderError::Malformed(err.to_string())
        } else {
            ProviderError::Network(err.to_string())
        }
    }

    async fn read_json<T: serde::de::DeserializeOwned>(
        &self,
        response: reqwest::Response,
    ) -> Result<T, ProviderError> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Status {
                status: status.as_u16(),
                body,
            });
        }
        response.json::<T>().await.map_err(|e| self.transport_error(e))
    }

    fn check_signature(
        &self,
        raw_body: &[u8],
        headers: &SignatureHeaders,
        now: DateTime<Utc>,
    ) -> Result<(), VerificationError> {
        let secret = &self.config.webhook_secret;
        match &self.config.signature {
            SignatureScheme::HexHmacSha256 { header } => {
                let signature = headers
                    .get(&header.to_ascii_lowercase())
                    .ok_or(VerificationError::MissingSignature)?;
                if verify_signature(raw_body, signature, secret) {
                    Ok(())
                } else {
                    Err(VerificationError::SignatureMismatch)
                }
            }
            SignatureScheme::TimestampedHmacSha256 { header, tolerance } => {
                let value = headers
                    .get(&header.to_ascii_lowercase())
                    .ok_or(VerificationError::MissingSignature)?;
                let (timestamp, signature) =
                    parse_timestamped(value).ok_or(VerificationError::MissingSignature)?;

                let age_secs = now.timestamp().saturating_sub(timestamp);
                if age_secs.unsigned_abs() > tolerance.as_secs() {
                    return Err(VerificationError::StaleTimestamp { age_secs });
                }

                let mut signed = timestamp.to_string().into_bytes();
                signed.push(b'.');
                signed.extend_from_slice(raw_body);
                if verify_signature(&signed, signature, secret) {
                    Ok(())
                } else {
                    Err(VerificationError::SignatureMismatch)
                }
            }
        }
    }
}

/// Splits `t=...,v1=...` into its timestamp and signature.
fn parse_timestamped(value: &str) -> Option<(i64, &str)> {
    let mut timestamp = None;
    let mut signature = None;
    for part in value.split(',') {
        match part.trim().split_once('=') {
            Some(("t", t)) => timestamp = t.parse::<i64>().ok(),
            Some(("v1", v)) => signature = Some(v),
            _ => {}
        }
    }
    Some((timestamp?, signature?))
}

/// Header value for a timestamped signature, as a provider would send it.
pub fn timestamped_signature(raw_body: &[u8], secret: &str, timestamp: i64) -> String {
    let mut signed = timestamp.to_string().into_bytes();
    signed.push(b'.');
    signed.extend_from_slice(raw_body);
    format!("t={},v1={}", timestamp, sign_payload(&signed, secret))
}

#[async_trait::async_trait]
impl PaymentProviderAdapter for HostedCheckoutProvider {
    fn provider(&self) -> PaymentProvider {
        self.config.provider
    }

    fn supported_currencies(&self) -> &[Currency] {
        &self.config.currencies
    }

    #[tracing::instrument(skip(self, req), fields(provider = %self.config.provider, intent_id = %req.intent_id))]
    async fn create_checkout(&self, req: CheckoutRequest) -> Result<CheckoutSession, ProviderError> {
        let body = CreateSessionBody {
            reference: req.intent_id.to_string(),
            amount: req.amount.amount().to_string(),
            currency: req.amount.currency().code(),
            method: req.method.as_str(),
            purpose: req.purpose.as_str(),
            customer_reference: &req.payer_ref,
            expires_at: req.expires_at,
        };

        let response = self
            .client
            .post(self.sessions_url())
            .bearer_auth(&self.config.api_key)
            .header("Idempotency-Key", &req.idempotency_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;
        let created: SessionCreated = self.read_json(response).await?;

        tracing::debug!(session_id = %created.id, "Checkout session opened");
        Ok(CheckoutSession {
            external_reference: created.id,
            payment_url: created.url,
            expires_at: created.expires_at,
        })
    }

    fn verify_notification(
        &self,
        raw_body: &[u8],
        headers: &SignatureHeaders,
    ) -> Result<ProviderNotification, VerificationError> {
        self.check_signature(raw_body, headers, Utc::now())?;
        let document: PaymentDocument = serde_json::from_slice(raw_body)
            .map_err(|e| VerificationError::MalformedPayload(e.to_string()))?;
        document
            .into_notification()
            .map_err(VerificationError::MalformedPayload)
    }

    #[tracing::instrument(skip(self), fields(provider = %self.config.provider))]
    async fn query_status(
        &self,
        external_reference: &str,
    ) -> Result<ProviderPaymentStatus, ProviderError> {
        let response = self
            .client
            .get(format!("{}/{}", self.sessions_url(), external_reference))
            .bearer_auth(&self.config.api_key)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;
        let document: PaymentDocument = self.read_json(response).await?;
        document.payment_status().map_err(ProviderError::Malformed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use axum::{
        Json, Router,
        extract::{Path, State},
        http::{HeaderMap, StatusCode},
        routing::{get, post},
    };
    use billing_types::{Money, PaymentIntentId, PaymentMethod, PaymentPurpose, PaymentStatus};
    use rust_decimal_macros::dec;
    use serde_json::{Value, json};

    const SECRET: &str = "whsec_hosted";

    fn config(base_url: String, signature: SignatureScheme) -> HostedCheckoutConfig {
        HostedCheckoutConfig {
            provider: PaymentProvider::Paymob,
            base_url,
            api_key: "sk_test".into(),
            webhook_secret: SECRET.into(),
            currencies: vec![Currency::EGP],
            signature,
            timeout: Duration::from_secs(5),
        }
    }

    fn hex_scheme() -> SignatureScheme {
        SignatureScheme::HexHmacSha256 {
            header: "X-Paymob-Signature".into(),
        }
    }

    /// A fake provider that records what it was sent.
    async fn spawn_fake_provider(calls: Arc<AtomicUsize>) -> String {
        async fn create(
            State(calls): State<Arc<AtomicUsize>>,
            headers: HeaderMap,
            Json(body): Json<Value>,
        ) -> Result<Json<Value>, StatusCode> {
            calls.fetch_add(1, Ordering::SeqCst);
            if headers.get("authorization").and_then(|v| v.to_str().ok()) != Some("Bearer sk_test")
            {
                return Err(StatusCode::UNAUTHORIZED);
            }
            if headers.get("idempotency-key").is_none() {
                return Err(StatusCode::BAD_REQUEST);
            }
            Ok(Json(json!({
                "id": format!("cs_{}", body["reference"].as_str().unwrap_or_default()),
                "url": "https://pay.example/cs",
            })))
        }

        async fn status(Path(id): Path<String>) -> Result<Json<Value>, StatusCode> {
            match id.as_str() {
                "cs_paid" => Ok(Json(json!({
                    "session_id": "cs_paid",
                    "status": "paid",
                    "amount": "250.00",
                    "currency": "EGP",
                    "transaction_id": "txn_9",
                }))),
                "cs_broken" => Ok(Json(json!({ "status": "teleported" }))),
                _ => Err(StatusCode::NOT_FOUND),
            }
        }

        let app = Router::new()
            .route("/v1/checkout/sessions", post(create))
            .route("/v1/checkout/sessions/{id}", get(status))
            .with_state(calls);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn test_create_checkout_against_fake_provider() {
        let calls = Arc::new(AtomicUsize::new(0));
        let base = spawn_fake_provider(calls.clone()).await;
        let provider = HostedCheckoutProvider::new(config(base, hex_scheme())).unwrap();

        let intent_id = PaymentIntentId::new();
        let session = provider
            .create_checkout(CheckoutRequest {
                intent_id,
                amount: Money::new(dec!(250), Currency::EGP).unwrap(),
                method: PaymentMethod::Card,
                purpose: PaymentPurpose::WalletCredit,
                payer_ref: "user_1".into(),
                idempotency_key: "key-1".into(),
                expires_at: Utc::now(),
            })
            .await
            .unwrap();

        assert_eq!(session.external_reference, format!("cs_{}", intent_id));
        assert_eq!(session.payment_url, "https://pay.example/cs");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_query_status_maps_answers() {
        let base = spawn_fake_provider(Arc::new(AtomicUsize::new(0))).await;
        let provider = HostedCheckoutProvider::new(config(base, hex_scheme())).unwrap();

        let paid = provider.query_status("cs_paid").await.unwrap();
        assert_eq!(paid.status, PaymentStatus::Completed);
        assert_eq!(paid.external_transaction_id.as_deref(), Some("txn_9"));
        assert_eq!(paid.amount, Some(Money::new(dec!(250), Currency::EGP).unwrap()));

        assert!(matches!(
            provider.query_status("cs_missing").await,
            Err(ProviderError::Status { status: 404, .. })
        ));
        assert!(matches!(
            provider.query_status("cs_broken").await,
            Err(ProviderError::Malformed(_))
        ));
    }

    #[tokio::test]
    async fn test_unreachable_provider_is_retryable() {
        let provider =
            HostedCheckoutProvider::new(config("http://127.0.0.1:1".into(), hex_scheme())).unwrap();
        let err = provider.query_status("cs_paid").await.unwrap_err();
        assert!(err.is_retryable());
    }

    fn notification_body() -> Vec<u8> {
        serde_json::to_vec(&json!({
            "session_id": "cs_paid",
            "status": "COMPLETED",
            "amount": "250.00",
            "currency": "EGP",
        }))
        .unwrap()
    }

    #[test]
    fn test_hex_signature_verification() {
        let provider =
            HostedCheckoutProvider::new(config("http://unused".into(), hex_scheme())).unwrap();
        let body = notification_body();
        let headers = SignatureHeaders::from([(
            "x-paymob-signature".to_string(),
            sign_payload(&body, SECRET),
        )]);

        let notification = provider.verify_notification(&body, &headers).unwrap();
        assert_eq!(notification.external_reference.as_deref(), Some("cs_paid"));
        assert_eq!(notification.payment.status, PaymentStatus::Completed);

        let forged = SignatureHeaders::from([(
            "x-paymob-signature".to_string(),
            sign_payload(&body, "guess"),
        )]);
        assert!(matches!(
            provider.verify_notification(&body, &forged),
            Err(VerificationError::SignatureMismatch)
        ));
    }

    #[test]
    fn test_timestamped_signature_verification() {
        let scheme = SignatureScheme::TimestampedHmacSha256 {
            header: "Stripe-Signature".into(),
            tolerance: Duration::from_secs(300),
        };
        let provider = HostedCheckoutProvider::new(config("http://unused".into(), scheme)).unwrap();
        let body = notification_body();
        let now = Utc::now().timestamp();

        let fresh = SignatureHeaders::from([(
            "stripe-signature".to_string(),
            timestamped_signature(&body, SECRET, now),
        )]);
        assert!(provider.verify_notification(&body, &fresh).is_ok());

        let stale = SignatureHeaders::from([(
            "stripe-signature".to_string(),
            timestamped_signature(&body, SECRET, now - 3600),
        )]);
        assert!(matches!(
            provider.verify_notification(&body, &stale),
            Err(VerificationError::StaleTimestamp { .. })
        ));

        let garbled = SignatureHeaders::from([("stripe-signature".to_string(), "v1=abc".into())]);
        assert!(matches!(
            provider.verify_notification(&body, &garbled),
            Err(VerificationError::MissingSignature)
        ));
    }

    #[test]
    fn test_extreme_timestamps_are_stale() {
        let scheme = SignatureScheme::TimestampedHmacSha256 {
            header: "Stripe-Signature".into(),
            tolerance: Duration::from_secs(300),
        };
        let provider = HostedCheckoutProvider::new(config("http://unused".into(), scheme)).unwrap();
        let body = notification_body();

        for t in [i64::MIN, i64::MAX] {
            let headers = SignatureHeaders::from([(
                "stripe-signature".to_string(),
                format!("t={},v1=abc", t),
            )]);
            assert!(matches!(
                provider.verify_notification(&body, &headers),
                Err(VerificationError::StaleTimestamp { .. })
            ));
        }
    }

    #[test]
    fn test_requires_a_currency() {
        let mut cfg = config("http://unused".into(), hex_scheme());
        cfg.currencies.clear();
        assert!(matches!(
            HostedCheckoutProvider::new(cfg),
            Err(ProviderError::NotConfigured(PaymentProvider::Paymob))
        ));
    }
}
