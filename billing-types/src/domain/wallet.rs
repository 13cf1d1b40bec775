//! Wallet domain model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use super::ledger::TransactionType;
use super::money::{Currency, Money};
use crate::error::{DomainError, ValidationError};

uuid_id!(
    /// Unique identifier for a Wallet.
    WalletId
);

persisted_enum! {
    /// Whether a wallet accepts new ledger entries.
    pub enum WalletStatus {
        Active => "ACTIVE",
        Frozen => "FROZEN",
    }
}

/// A per-owner balance.
///
/// `balance` is a cached projection of the wallet's ledger: it always equals
/// the fold of all entry effects, and `version` equals the number of entries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Wallet {
    pub id: WalletId,
    /// Opaque reference to the owning user or organization
    #[schema(example = "user_42")]
    pub owner_id: String,
    pub balance: Money,
    pub status: WalletStatus,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// The balance transition an entry would cause.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BalanceStep {
    Applied { before: Money, after: Money },
    Insufficient { available: Money, requested: Money },
}

impl Wallet {
    /// Opens an empty wallet.
    pub fn open(owner_id: String, currency: Currency, now: DateTime<Utc>) -> Result<Self, ValidationError> {
        validate_owner_id(&owner_id)?;
        Ok(Self {
            id: WalletId::new(),
            owner_id,
            balance: Money::zero(currency),
            status: WalletStatus::Active,
            version: 0,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn currency(&self) -> Currency {
        self.balance.currency()
    }

    pub fn is_frozen(&self) -> bool {
        self.status == WalletStatus::Frozen
    }

    /// Computes the effect of appending an entry, without mutating anything.
    ///
    /// Frozen wallets, foreign currencies and non-positive amounts are errors;
    /// a decrease larger than the balance is a regular `Insufficient` result.
    pub fn step(&self, entry_type: TransactionType, amount: &Money) -> Result<BalanceStep, DomainError> {
        if self.is_frozen() {
            return Err(DomainError::WalletFrozen(self.id));
        }
        self.balance.ensure_same_currency(amount)?;
        if amount.is_zero() {
            return Err(ValidationError::NonPositiveAmount.into());
        }

        let before = self.balance;
        if entry_type.increases_balance() {
            let after = before.checked_add(*amount)?;
            return Ok(BalanceStep::Applied { before, after });
        }

        match before.checked_sub(*amount) {
            Ok(after) => Ok(BalanceStep::Applied { before, after }),
            Err(ValidationError::NegativeAmount) => Ok(BalanceStep::Insufficient {
                available: before,
                requested: *amount,
            }),
            Err(e) => Err(e.into()),
        }
    }
}

pub fn validate_owner_id(owner_id: &str) -> Result<(), ValidationError> {
    if owner_id.trim().is_empty() || owner_id.len() > 128 {
        return Err(ValidationError::Invalid(
            "owner id must be between 1 and 128 characters".into(),
        ));
    }
    Ok(())
}
