//! Error types for the billing core.
//!
//! Each layer has its own enum; [`AppError`] is the union the application
//! services return and the HTTP adapter translates.

use rust_decimal::Decimal;

use crate::domain::{
    Currency, Money, PaymentProvider, SubscriptionAction, SubscriptionStatus, WalletId,
};

/// A request was rejected before anything happened.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationError {
    #[error("Amount {amount} {currency} is outside the allowed range {min}..={max}")]
    AmountOutOfRange {
        amount: Decimal,
        currency: Currency,
        min: Decimal,
        max: Decimal,
    },

    #[error("Amount {amount} has more than 2 decimal places")]
    PrecisionError { amount: Decimal },

    #[error("Unsupported currency: {0}")]
    UnsupportedCurrency(String),

    #[error("Currency mismatch: expected {expected}, got {got}")]
    CurrencyMismatch { expected: Currency, got: Currency },

    #[error("Amount must be positive")]
    NonPositiveAmount,

    #[error("Amount cannot be negative")]
    NegativeAmount,

    #[error("{0}")]
    Invalid(String),
}

impl From<exchange_rates::UnknownCurrency> for ValidationError {
    fn from(err: exchange_rates::UnknownCurrency) -> Self {
        ValidationError::UnsupportedCurrency(err.0)
    }
}

/// Failure talking to an external payment provider.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProviderError {
    #[error("Provider network error: {0}")]
    Network(String),

    #[error("Provider did not answer within {0} seconds")]
    Timeout(u64),

    #[error("Provider returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Malformed provider response: {0}")]
    Malformed(String),

    #[error("Payment provider {0} is not configured")]
    NotConfigured(PaymentProvider),
}

impl ProviderError {
    /// Whether re-attempting the same request (with the same idempotency key)
    /// may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProviderError::Network(_) | ProviderError::Timeout(_) | ProviderError::Status { .. }
        )
    }
}

/// An inbound provider notification could not be trusted.
#[derive(Debug, Clone, thiserror::Error)]
pub enum VerificationError {
    #[error("Missing signature header")]
    MissingSignature,

    #[error("Signature mismatch")]
    SignatureMismatch,

    #[error("Signature timestamp is {age_secs}s old")]
    StaleTimestamp { age_secs: i64 },

    #[error("Malformed notification payload: {0}")]
    MalformedPayload(String),

    #[error("Notification amount {got} does not match intent amount {expected}")]
    AmountMismatch { expected: Money, got: Money },

    #[error("No payment intent matches reference {0}")]
    UnknownIntent(String),
}

/// Business rule violations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DomainError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("Cannot {action} a subscription that is {from}")]
    IllegalTransition {
        from: SubscriptionStatus,
        action: SubscriptionAction,
    },

    #[error("Wallet {0} is frozen")]
    WalletFrozen(WalletId),

    #[error("Not found: {0}")]
    NotFound(String),
}

/// Repository-level errors (data access failures).
#[derive(Debug, thiserror::Error)]
pub enum RepoError {
    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Transaction error: {0}")]
    Transaction(String),

    #[error("Entity not found")]
    NotFound,

    #[error("Conflict: {0}")]
    Conflict(String),
}

impl From<ValidationError> for RepoError {
    fn from(err: ValidationError) -> Self {
        RepoError::Domain(DomainError::Validation(err))
    }
}

/// Application-level errors (for HTTP responses).
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Cannot {action} a subscription that is {from}")]
    IllegalTransition {
        from: SubscriptionStatus,
        action: SubscriptionAction,
    },

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error(transparent)]
    Verification(#[from] VerificationError),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<DomainError> for AppError {
    fn from(err: DomainError) -> Self {
        match err {
            DomainError::Validation(e) => AppError::Validation(e),
            DomainError::IllegalTransition { from, action } => {
                AppError::IllegalTransition { from, action }
            }
            DomainError::WalletFrozen(id) => AppError::Conflict(format!("Wallet {} is frozen", id)),
            DomainError::NotFound(what) => AppError::NotFound(what),
        }
    }
}

impl From<RepoError> for AppError {
    fn from(err: RepoError) -> Self {
        match err {
            RepoError::Domain(e) => e.into(),
            RepoError::NotFound => AppError::NotFound("Resource not found".into()),
            RepoError::Database(e) => AppError::Internal(e),
            RepoError::Transaction(e) => AppError::Internal(e),
            RepoError::Conflict(e) => AppError::Conflict(e),
        }
    }
}
