//! Port traits (interfaces for adapters).
//!
//! These are the contracts that adapters must implement.
//! The application layer depends on these traits, not concrete implementations.

mod ledger;
mod payments;
mod provider;
mod subscriptions;

pub use ledger::LedgerRepository;
pub use payments::PaymentIntentRepository;
pub use provider::{
    CheckoutRequest, CheckoutSession, PaymentProviderAdapter, ProviderNotification,
    ProviderPaymentStatus, SignatureHeaders,
};
pub use subscriptions::SubscriptionRepository;

/// Result of an insert guarded by a uniqueness constraint.
#[derive(Debug, Clone, PartialEq)]
pub enum InsertOutcome<T> {
    Inserted(T),
    /// A row with the same unique key already existed; this is that row.
    Existing(T),
}

impl<T> InsertOutcome<T> {
    pub fn into_inner(self) -> T {
        match self {
            InsertOutcome::Inserted(v) | InsertOutcome::Existing(v) => v,
        }
    }

    pub fn is_inserted(&self) -> bool {
        matches!(self, InsertOutcome::Inserted(_))
    }
}

/// Everything the billing services need from storage.
pub trait BillingRepository:
    LedgerRepository + PaymentIntentRepository + SubscriptionRepository
{
}

impl<T> BillingRepository for T where
    T: LedgerRepository + PaymentIntentRepository + SubscriptionRepository
{
}
