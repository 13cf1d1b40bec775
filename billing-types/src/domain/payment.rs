//! Payment intent domain model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use super::money::Money;
use super::subscription::{BillingCycle, SubscriptionGrant, SubscriptionId};

uuid_id!(
    /// Unique identifier for a PaymentIntent.
    PaymentIntentId
);

persisted_enum! {
    /// External payment providers the gateway can route to.
    pub enum PaymentProvider {
        Sandbox => "SANDBOX",
        Stripe => "STRIPE",
        Paymob => "PAYMOB",
        Kashier => "KASHIER",
    }
}

persisted_enum! {
    pub enum PaymentMethod {
        Card => "CARD",
        MobileWallet => "MOBILE_WALLET",
        BankTransfer => "BANK_TRANSFER",
        Cash => "CASH",
        WalletBalance => "WALLET_BALANCE",
    }
}

persisted_enum! {
    /// Why money is being collected.
    pub enum PaymentPurpose {
        WalletCredit => "WALLET_CREDIT",
        CoursePurchase => "COURSE_PURCHASE",
        PlanSubscription => "PLAN_SUBSCRIPTION",
        SubscriptionRenewal => "SUBSCRIPTION_RENEWAL",
    }
}

impl PaymentPurpose {
    /// Purchase purposes spend the credited money right away.
    pub fn is_purchase(&self) -> bool {
        !matches!(self, PaymentPurpose::WalletCredit)
    }
}

persisted_enum! {
    /// Lifecycle of a payment intent. Only ever advances forward.
    pub enum PaymentStatus {
        Pending => "PENDING",
        Completed => "COMPLETED",
        Failed => "FAILED",
    }
}

impl PaymentStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, PaymentStatus::Pending)
    }

    /// `pending -> completed | failed`; nothing else.
    pub fn can_advance_to(&self, next: PaymentStatus) -> bool {
        *self == PaymentStatus::Pending && next.is_terminal()
    }
}

/// What a purchase intent buys once it is paid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PurchaseOrder {
    /// A new course or plan subscription.
    Grant {
        grant: SubscriptionGrant,
        billing_cycle: BillingCycle,
    },
    /// Another period of an existing subscription.
    Renewal { subscription_id: SubscriptionId },
}

impl PurchaseOrder {
    /// The payment purpose this order corresponds to.
    pub fn purpose(&self) -> PaymentPurpose {
        match self {
            PurchaseOrder::Grant { grant, .. } if grant.is_course() => PaymentPurpose::CoursePurchase,
            PurchaseOrder::Grant { .. } => PaymentPurpose::PlanSubscription,
            PurchaseOrder::Renewal { .. } => PaymentPurpose::SubscriptionRenewal,
        }
    }
}

/// One attempt to collect money through an external provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct PaymentIntent {
    pub id: PaymentIntentId,
    pub provider: PaymentProvider,
    pub method: PaymentMethod,
    /// Amount charged by the provider (after currency normalization)
    pub amount: Money,
    pub purpose: PaymentPurpose,
    pub status: PaymentStatus,
    /// Provider-assigned session/intent id
    pub external_reference: Option<String>,
    /// Provider transaction id, known once the payment settles
    pub external_transaction_id: Option<String>,
    pub payment_url: Option<String>,
    pub idempotency_key: String,
    /// Owner of the wallet that receives the money
    pub payer_ref: String,
    pub order: Option<PurchaseOrder>,
    #[schema(value_type = Object)]
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PaymentIntent {
    /// Ledger key of the credit this intent produces once completed.
    pub fn settlement_key(&self) -> String {
        format!("intent:{}", self.id)
    }

    /// Ledger key of the purchase debit that follows the credit.
    pub fn purchase_key(&self) -> String {
        format!("intent:{}:purchase", self.id)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.status == PaymentStatus::Pending && self.expires_at < now
    }
}
