//! Domain models for the billing core.

/// Generates a UUID-backed identifier newtype.
macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord,
            serde::Serialize, serde::Deserialize, utoipa::ToSchema,
        )]
        #[serde(transparent)]
        pub struct $name(uuid::Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(uuid::Uuid::new_v4())
            }

            pub fn from_uuid(uuid: uuid::Uuid) -> Self {
                Self(uuid)
            }

            pub fn as_uuid(&self) -> &uuid::Uuid {
                &self.0
            }

            pub fn into_uuid(self) -> uuid::Uuid {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(uuid::Uuid::parse_str(s)?))
            }
        }
    };
}

/// Generates an enumeration that is persisted and serialized as
/// SCREAMING_SNAKE_CASE text.
macro_rules! persisted_enum {
    (
        $(#[$meta:meta])*
        pub enum $name:ident {
            $( $(#[$vmeta:meta])* $variant:ident => $text:literal ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash,
            serde::Serialize, serde::Deserialize, utoipa::ToSchema,
        )]
        pub enum $name {
            $( $(#[$vmeta])* #[serde(rename = $text)] $variant ),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $name {
            type Err = $crate::error::ValidationError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s.trim().to_ascii_uppercase().as_str() {
                    $($text => Ok($name::$variant),)+
                    _ => Err($crate::error::ValidationError::Invalid(format!(
                        "unknown {} `{}`",
                        stringify!($name),
                        s
                    ))),
                }
            }
        }
    };
}

pub mod ledger;
pub mod money;
pub mod payment;
pub mod subscription;
pub mod wallet;

pub use ledger::{
    AppendOutcome, ApplyOutcome, DebitOutcome, EntryStatus, LedgerEntry, LedgerEntryId,
    NewLedgerEntry, TransactionType, replay_balance,
};
pub use money::{Currency, Money};
pub use payment::{
    PaymentIntent, PaymentIntentId, PaymentMethod, PaymentProvider, PaymentPurpose, PaymentStatus,
    PurchaseOrder,
};
pub use subscription::{
    Billing, BillingCycle, Cancellation, EffectiveStatus, RenewalRecord, Subscription,
    SubscriptionAction, SubscriptionGrant, SubscriptionId, SubscriptionStatus, SubscriptionType,
    Suspension,
};
pub use wallet::{BalanceStep, Wallet, WalletId, WalletStatus};
