//! In-process provider for development and tests.
//!
//! Checkout sessions live in memory. [`SandboxProvider::settle`] plays the
//! payer finishing (or abandoning) a checkout and returns the signed
//! notification the provider would have sent.

use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use dashmap::DashMap;

use billing_types::ports::{
    CheckoutRequest, CheckoutSession, ProviderNotification, ProviderPaymentStatus,
    SignatureHeaders,
};
use billing_types::{
    Currency, Money, PaymentIntentId, PaymentProvider, PaymentProviderAdapter, PaymentStatus,
    ProviderError, VerificationError,
};

use super::PaymentDocument;
use crate::security::{sign_payload, verify_signature};

pub const SIGNATURE_HEADER: &str = "x-sandbox-signature";

#[derive(Debug, Clone)]
struct SandboxSession {
    intent_id: PaymentIntentId,
    amount: Money,
    status: PaymentStatus,
    transaction_id: Option<String>,
}

/// A signed notification, ready to be posted to the webhook endpoint.
#[derive(Debug, Clone)]
pub struct SandboxNotification {
    pub body: Vec<u8>,
    pub signature: String,
}

impl SandboxNotification {
    pub fn headers(&self) -> SignatureHeaders {
        SignatureHeaders::from([(SIGNATURE_HEADER.to_string(), self.signature.clone())])
    }
}

pub struct SandboxProvider {
    secret: String,
    currencies: Vec<Currency>,
    checkout_base_url: String,
    sessions: DashMap<String, SandboxSession>,
    checkouts_created: AtomicUsize,
    latency: Option<Duration>,
    next_failure: Mutex<Option<ProviderError>>,
}

impl SandboxProvider {
    /// A sandbox that accepts every currency.
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
            currencies: Currency::all().to_vec(),
            checkout_base_url: "https://sandbox.local".into(),
            sessions: DashMap::new(),
            checkouts_created: AtomicUsize::new(0),
            latency: None,
            next_failure: Mutex::new(None),
        }
    }

    /// Restricts the currencies the sandbox settles in; the first is preferred.
    pub fn with_currencies(mut self, currencies: Vec<Currency>) -> Self {
        self.currencies = currencies;
        self
    }

    /// Delays every provider call.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Makes the next `create_checkout` fail with `error`.
    pub fn fail_next_checkout(&self, error: ProviderError) {
        if let Ok(mut next) = self.next_failure.lock() {
            *next = Some(error);
        }
    }

    /// Number of checkout sessions opened so far.
    pub fn checkouts_created(&self) -> usize {
        self.checkouts_created.load(Ordering::SeqCst)
    }

    /// Finishes a checkout session and returns the notification for it.
    pub fn settle(
        &self,
        session_id: &str,
        status: PaymentStatus,
    ) -> Result<SandboxNotification, ProviderError> {
        let mut session = self.sessions.get_mut(session_id).ok_or_else(|| unknown(session_id))?;
        if session.status == PaymentStatus::Pending {
            session.status = status;
            if status == PaymentStatus::Completed {
                session.transaction_id = Some(format!("sbx_tx_{}", session_id));
            }
        }
        let document = document_for(session_id, &session);
        drop(session);
        Ok(self.sign(&document))
    }

    /// Signs an arbitrary document as the sandbox would.
    pub fn notification(
        &self,
        session_id: &str,
        status: PaymentStatus,
        amount: Money,
    ) -> SandboxNotification {
        let document = PaymentDocument {
            reference: None,
            session_id: Some(session_id.to_string()),
            status: status.as_str().to_string(),
            amount: Some(amount.amount()),
            currency: Some(amount.currency().code().to_string()),
            transaction_id: Some(format!("sbx_tx_{}", session_id)),
        };
        self.sign(&document)
    }

    fn sign(&self, document: &PaymentDocument) -> SandboxNotification {
        let body = serde_json::to_vec(document).unwrap_or_default();
        let signature = sign_payload(&body, &self.secret);
        SandboxNotification { body, signature }
    }

    async fn simulate_latency(&self) {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
    }
}

#[async_trait::async_trait]
impl PaymentProviderAdapter for SandboxProvider {
    fn provider(&self) -> PaymentProvider {
        PaymentProvider::Sandbox
    }

    fn supported_currencies(&self) -> &[Currency] {
        &self.currencies
    }

    async fn create_checkout(&self, req: CheckoutRequest) -> Result<CheckoutSession, ProviderError> {
        self.simulate_latency().await;
        if let Some(error) = self.next_failure.lock().ok().and_then(|mut next| next.take()) {
            return Err(error);
        }
        if !self.currencies.contains(&req.amount.currency()) {
            return Err(ProviderError::Status {
                status: 422,
                body: format!("currency {} is not accepted", req.amount.currency()),
            });
        }

        let session_id = format!("sbx_{}", uuid::Uuid::new_v4().simple());
        self.sessions.insert(
            session_id.clone(),
            SandboxSession {
                intent_id: req.intent_id,
                amount: req.amount,
                status: PaymentStatus::Pending,
                transaction_id: None,
            },
        );
        self.checkouts_created.fetch_add(1, Ordering::SeqCst);

        Ok(CheckoutSession {
            payment_url: format!("{}/checkout/{}", self.checkout_base_url, session_id),
            external_reference: session_id,
            expires_at: None,
        })
    }

    fn verify_notification(
        &self,
        raw_body: &[u8],
        headers: &SignatureHeaders,
    ) -> Result<ProviderNotification, VerificationError> {
        let signature = headers
            .get(SIGNATURE_HEADER)
            .ok_or(VerificationError::MissingSignature)?;
        if !verify_signature(raw_body, signature, &self.secret) {
            return Err(VerificationError::SignatureMismatch);
        }

        let document: PaymentDocument = serde_json::from_slice(raw_body)
            .map_err(|e| VerificationError::MalformedPayload(e.to_string()))?;
        document
            .into_notification()
            .map_err(VerificationError::MalformedPayload)
    }

    async fn query_status(
        &self,
        external_reference: &str,
    ) -> Result<ProviderPaymentStatus, ProviderError> {
        self.simulate_latency().await;
        let session = self
            .sessions
            .get(external_reference)
            .ok_or_else(|| unknown(external_reference))?;
        Ok(ProviderPaymentStatus {
            status: session.status,
            external_transaction_id: session.transaction_id.clone(),
            amount: Some(session.amount),
        })
    }
}

fn document_for(session_id: &str, session: &SandboxSession) -> PaymentDocument {
    PaymentDocument {
        reference: Some(session.intent_id.to_string()),
        session_id: Some(session_id.to_string()),
        status: session.status.as_str().to_string(),
        amount: Some(session.amount.amount()),
        currency: Some(session.amount.currency().code().to_string()),
        transaction_id: session.transaction_id.clone(),
    }
}

fn unknown(session_id: &str) -> ProviderError {
    ProviderError::Status {
        status: 404,
        body: format!("unknown checkout session {}", session_id),
    }
}
