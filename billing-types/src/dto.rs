//! Data Transfer Objects (DTOs) for requests and responses.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};

use crate::domain::{
    Currency, EffectiveStatus, LedgerEntry, Money, PaymentIntent, PaymentIntentId,
    PaymentMethod, PaymentProvider, PaymentPurpose, PaymentStatus, PurchaseOrder, Subscription,
    WalletId,
};

// ─────────────────────────────────────────────────────────────────────────────
// Wallet DTOs
// ─────────────────────────────────────────────────────────────────────────────

/// Pagination for a wallet's transaction history.
#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct HistoryQuery {
    /// 1-based page number
    #[param(example = 1)]
    pub page: Option<u32>,
    /// Page size, clamped to 1..=100
    #[param(example = 20)]
    pub limit: Option<u32>,
}

/// One page of ledger entries, newest first.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct TransactionPage {
    pub wallet_id: WalletId,
    pub page: u32,
    pub limit: u32,
    pub entries: Vec<LedgerEntry>,
}

/// Buy a course or plan (or renew one) from the wallet balance.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct PurchaseRequest {
    pub order: PurchaseOrder,
    #[schema(value_type = String, example = "100.00")]
    pub amount: Decimal,
    pub currency: Currency,
    /// Caller-chosen idempotency reference
    #[schema(example = "checkout-7f3a")]
    pub reference: String,
}

/// Result of a wallet purchase; running out of balance is not an error.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(tag = "outcome", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PurchaseResponse {
    Completed {
        entry: LedgerEntry,
        subscription: Subscription,
    },
    InsufficientBalance {
        available: Money,
        requested: Money,
    },
}

// ─────────────────────────────────────────────────────────────────────────────
// Payment DTOs
// ─────────────────────────────────────────────────────────────────────────────

/// Request a hosted payment link.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct CreatePaymentLinkRequest {
    #[schema(value_type = String, example = "50.00")]
    pub amount: Decimal,
    pub currency: Currency,
    pub provider: PaymentProvider,
    pub method: PaymentMethod,
    pub purpose: PaymentPurpose,
    /// Owner of the wallet the money lands in
    #[schema(example = "user_42")]
    pub payer_ref: String,
    /// Required for purchase purposes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order: Option<PurchaseOrder>,
    /// Distinguishes deliberate repeats of an otherwise identical charge
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schema(value_type = Option<Object>)]
    pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct PaymentLinkResponse {
    pub payment_url: String,
    pub payment_id: PaymentIntentId,
    pub expires_at: DateTime<Utc>,
    pub provider: PaymentProvider,
    /// What the provider will charge (may differ in currency from the request)
    pub amount: Money,
    pub status: PaymentStatus,
}

impl PaymentLinkResponse {
    pub fn from_intent(intent: &PaymentIntent) -> Self {
        Self {
            payment_url: intent.payment_url.clone().unwrap_or_default(),
            payment_id: intent.id,
            expires_at: intent.expires_at,
            provider: intent.provider,
            amount: intent.amount,
            status: intent.status,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct PaymentStatusQuery {
    /// Poll the provider for up to the configured window before answering
    #[serde(default)]
    pub wait: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct PaymentStatusResponse {
    pub payment_id: PaymentIntentId,
    pub status: PaymentStatus,
    #[schema(value_type = String, example = "50.00")]
    pub amount: Decimal,
    pub currency: Currency,
    pub transaction_id: Option<String>,
}

impl From<&PaymentIntent> for PaymentStatusResponse {
    fn from(intent: &PaymentIntent) -> Self {
        Self {
            payment_id: intent.id,
            status: intent.status,
            amount: intent.amount.amount(),
            currency: intent.amount.currency(),
            transaction_id: intent.external_transaction_id.clone(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Subscription DTOs
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct RenewRequest {
    /// Amount paid for the new period, in the subscription's currency
    #[serde(default)]
    #[schema(value_type = Option<String>, example = "20.00")]
    pub amount: Option<Decimal>,
    /// Payment that funds the renewal; replays are ignored
    #[serde(default)]
    pub transaction_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct CancelRequest {
    #[schema(example = "Requested by user")]
    pub reason: String,
    #[schema(example = "user_42")]
    pub cancelled_by: String,
    #[serde(default)]
    #[schema(value_type = Option<String>)]
    pub refund_amount: Option<Decimal>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct SuspendRequest {
    #[schema(example = "Payment dispute")]
    pub reason: String,
}

/// A subscription together with its read-time computed fields.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct SubscriptionView {
    #[serde(flatten)]
    pub subscription: Subscription,
    pub effective_status: EffectiveStatus,
    pub grants_access: bool,
    pub days_until_expiry: Option<i64>,
}

impl SubscriptionView {
    pub fn at(subscription: Subscription, now: DateTime<Utc>) -> Self {
        Self {
            effective_status: subscription.status_as_of(now),
            grants_access: subscription.grants_access(now),
            days_until_expiry: subscription.days_until_expiry(now),
            subscription,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Reference data DTOs
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct CurrencyLimits {
    pub currency: Currency,
    pub symbol: String,
    #[schema(value_type = String, example = "1.00")]
    pub min: Decimal,
    #[schema(value_type = String, example = "10000.00")]
    pub max: Decimal,
}

/// Current exchange rates (units per 1 USD).
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct RatesResponse {
    pub base: Currency,
    #[schema(value_type = Object)]
    pub rates: std::collections::BTreeMap<Currency, Decimal>,
    pub updated_at: DateTime<Utc>,
    pub last_refresh_success: Option<DateTime<Utc>>,
    pub consecutive_refresh_failures: u32,
}
