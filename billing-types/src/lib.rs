//! # Billing Types
//!
//! Domain types and port traits for the billing core of the learning
//! platform. This crate has ZERO IO dependencies - only data structures,
//! business rules, and trait definitions.
//!
//! ## Architecture
//!
//! This crate represents the **innermost core** of the hexagonal architecture:
//! - `domain/` - Pure domain types (Money, Wallet, LedgerEntry, PaymentIntent, Subscription)
//! - `validation` - Per-currency amount limits
//! - `ports/` - Trait definitions that adapters must implement
//! - `dto/` - Data Transfer Objects for API boundaries
//! - `error/` - Domain and application error types

pub mod domain;
pub mod dto;
pub mod error;
pub mod ports;
pub mod validation;

// Re-export commonly used types
pub use domain::{
    AppendOutcome, ApplyOutcome, BillingCycle, Currency, DebitOutcome, LedgerEntry, Money,
    NewLedgerEntry, PaymentIntent, PaymentIntentId, PaymentMethod, PaymentProvider,
    PaymentPurpose, PaymentStatus, PurchaseOrder, Subscription, SubscriptionAction,
    SubscriptionGrant, SubscriptionId, SubscriptionStatus, TransactionType, Wallet, WalletId,
    WalletStatus,
};
pub use dto::*;
pub use error::{AppError, DomainError, ProviderError, RepoError, ValidationError, VerificationError};
pub use ports::{
    BillingRepository, InsertOutcome, LedgerRepository, PaymentIntentRepository,
    PaymentProviderAdapter, SubscriptionRepository,
};
pub use validation::{AmountLimits, AmountValidator};
