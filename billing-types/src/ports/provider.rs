//! Payment provider port.
//!
//! One adapter per external provider, all with the same contract. Adapters
//! never touch storage; the gateway decides what a verified notification or a
//! status answer means for the stored intent.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use crate::domain::{
    Currency, Money, PaymentIntentId, PaymentMethod, PaymentProvider, PaymentPurpose,
    PaymentStatus,
};
use crate::error::{ProviderError, VerificationError};

/// Inbound headers, keyed by lower-case name.
pub type SignatureHeaders = BTreeMap<String, String>;

/// What the gateway asks a provider to collect.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckoutRequest {
    pub intent_id: PaymentIntentId,
    pub amount: Money,
    pub method: PaymentMethod,
    pub purpose: PaymentPurpose,
    pub payer_ref: String,
    /// Forwarded to the provider as `Idempotency-Key`
    pub idempotency_key: String,
    pub expires_at: DateTime<Utc>,
}

/// A hosted checkout the payer is redirected to.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckoutSession {
    pub external_reference: String,
    pub payment_url: String,
    /// Provider-imposed expiry, when shorter than ours
    pub expires_at: Option<DateTime<Utc>>,
}

/// A provider's view of one payment.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderPaymentStatus {
    pub status: PaymentStatus,
    pub external_transaction_id: Option<String>,
    /// Amount the provider captured, when it reports one
    pub amount: Option<Money>,
}

/// A notification whose signature has been verified.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderNotification {
    /// Our intent id, when the provider echoes it back
    pub intent_id: Option<PaymentIntentId>,
    pub external_reference: Option<String>,
    pub payment: ProviderPaymentStatus,
}

#[async_trait::async_trait]
pub trait PaymentProviderAdapter: Send + Sync + 'static {
    fn provider(&self) -> PaymentProvider;

    /// Currencies the provider settles in; the first one is preferred when
    /// a charge has to be converted.
    fn supported_currencies(&self) -> &[Currency];

    async fn create_checkout(&self, req: CheckoutRequest) -> Result<CheckoutSession, ProviderError>;

    /// Checks the signature before parsing anything else out of `raw_body`.
    fn verify_notification(
        &self,
        raw_body: &[u8],
        headers: &SignatureHeaders,
    ) -> Result<ProviderNotification, VerificationError>;

    async fn query_status(&self, external_reference: &str)
    -> Result<ProviderPaymentStatus, ProviderError>;
}
