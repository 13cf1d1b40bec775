//! Ledger entry domain model.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use super::money::{Currency, Money};
use super::payment::{PaymentMethod, PaymentProvider, PaymentPurpose};
use super::wallet::WalletId;

uuid_id!(
    /// Unique identifier for a LedgerEntry.
    LedgerEntryId
);

persisted_enum! {
    /// The kind of monetary movement an entry records.
    pub enum TransactionType {
        Credit => "CREDIT",
        Debit => "DEBIT",
        Transfer => "TRANSFER",
        Refund => "REFUND",
        Withdrawal => "WITHDRAWAL",
        Deposit => "DEPOSIT",
    }
}

impl TransactionType {
    /// `credit`, `deposit` and `refund` add to the balance; everything else
    /// takes from it.
    pub fn increases_balance(&self) -> bool {
        matches!(
            self,
            TransactionType::Credit | TransactionType::Deposit | TransactionType::Refund
        )
    }
}

persisted_enum! {
    pub enum EntryStatus {
        Pending => "PENDING",
        Completed => "COMPLETED",
        Failed => "FAILED",
    }
}

/// An immutable record of one monetary movement against a wallet.
///
/// Entries are never edited or deleted; corrections are new compensating
/// entries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct LedgerEntry {
    pub id: LedgerEntryId,
    pub wallet_id: WalletId,
    /// 1-based position in the wallet's ledger
    pub sequence: i64,
    pub entry_type: TransactionType,
    pub amount: Money,
    pub balance_before: Money,
    pub balance_after: Money,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub purpose: Option<PaymentPurpose>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment_method: Option<PaymentMethod>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment_provider: Option<PaymentProvider>,
    /// Idempotency key, unique per wallet
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_transaction_id: Option<String>,
    pub status: EntryStatus,
    #[schema(value_type = Object)]
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl LedgerEntry {
    /// Signed change this entry made to the balance.
    pub fn delta(&self) -> Decimal {
        if self.entry_type.increases_balance() {
            self.amount.amount()
        } else {
            -self.amount.amount()
        }
    }
}

/// Folds entries (in any order) into the balance they imply.
pub fn replay_balance(currency: Currency, entries: &[LedgerEntry]) -> Decimal {
    entries
        .iter()
        .filter(|e| e.amount.currency() == currency)
        .map(LedgerEntry::delta)
        .sum()
}

/// An entry waiting to be appended; the repository assigns id, sequence and
/// balances.
#[derive(Debug, Clone, PartialEq)]
pub struct NewLedgerEntry {
    pub wallet_id: WalletId,
    pub entry_type: TransactionType,
    pub amount: Money,
    pub purpose: Option<PaymentPurpose>,
    pub payment_method: Option<PaymentMethod>,
    pub payment_provider: Option<PaymentProvider>,
    pub external_transaction_id: Option<String>,
    pub metadata: serde_json::Value,
}

impl NewLedgerEntry {
    pub fn new(wallet_id: WalletId, entry_type: TransactionType, amount: Money) -> Self {
        Self {
            wallet_id,
            entry_type,
            amount,
            purpose: None,
            payment_method: None,
            payment_provider: None,
            external_transaction_id: None,
            metadata: serde_json::Value::Object(Default::default()),
        }
    }

    pub fn with_purpose(mut self, purpose: PaymentPurpose) -> Self {
        self.purpose = Some(purpose);
        self
    }

    pub fn with_payment(mut self, method: PaymentMethod, provider: PaymentProvider) -> Self {
        self.payment_method = Some(method);
        self.payment_provider = Some(provider);
        self
    }

    pub fn with_external_id(mut self, external_transaction_id: impl Into<String>) -> Self {
        self.external_transaction_id = Some(external_transaction_id.into());
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    /// Materializes the entry at the given position.
    pub fn into_entry(
        self,
        sequence: i64,
        balance_before: Money,
        balance_after: Money,
        created_at: DateTime<Utc>,
    ) -> LedgerEntry {
        LedgerEntry {
            id: LedgerEntryId::new(),
            wallet_id: self.wallet_id,
            sequence,
            entry_type: self.entry_type,
            amount: self.amount,
            balance_before,
            balance_after,
            purpose: self.purpose,
            payment_method: self.payment_method,
            payment_provider: self.payment_provider,
            external_transaction_id: self.external_transaction_id,
            status: EntryStatus::Completed,
            metadata: self.metadata,
            created_at,
        }
    }
}

/// What the storage layer did with an append request.
#[derive(Debug, Clone, PartialEq)]
pub enum AppendOutcome {
    Appended(LedgerEntry),
    /// An entry with the same external transaction id already exists.
    Duplicate(LedgerEntry),
    InsufficientBalance { available: Money, requested: Money },
}

/// Result of a debit; running out of money is an expected outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(tag = "outcome", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DebitOutcome {
    Applied { entry: LedgerEntry },
    InsufficientBalance { available: Money, requested: Money },
}

impl DebitOutcome {
    pub fn entry(&self) -> Option<&LedgerEntry> {
        match self {
            DebitOutcome::Applied { entry } => Some(entry),
            DebitOutcome::InsufficientBalance { .. } => None,
        }
    }
}

/// Result of crediting a confirmed external payment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(tag = "outcome", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApplyOutcome {
    Applied { entry: LedgerEntry },
    /// The payment was credited before; this is the original entry.
    AlreadyApplied { entry: LedgerEntry },
}

impl ApplyOutcome {
    pub fn entry(&self) -> &LedgerEntry {
        match self {
            ApplyOutcome::Applied { entry } | ApplyOutcome::AlreadyApplied { entry } => entry,
        }
    }

    pub fn into_entry(self) -> LedgerEntry {
        match self {
            ApplyOutcome::Applied { entry } | ApplyOutcome::AlreadyApplied { entry } => entry,
        }
    }

    pub fn is_new(&self) -> bool {
        matches!(self, ApplyOutcome::Applied { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn usd(amount: Decimal) -> Money {
        Money::new(amount, Currency::USD).unwrap()
    }

    #[test]
    fn test_transaction_type_effects() {
        for t in [
            TransactionType::Credit,
            TransactionType::Deposit,
            TransactionType::Refund,
        ] {
            assert!(t.increases_balance());
        }
        for t in [
            TransactionType::Debit,
            TransactionType::Withdrawal,
            TransactionType::Transfer,
        ] {
            assert!(!t.increases_balance());
        }
    }

    #[test]
    fn test_transaction_type_text() {
        assert_eq!(TransactionType::Withdrawal.to_string(), "WITHDRAWAL");
        assert_eq!("refund".parse::<TransactionType>().unwrap(), TransactionType::Refund);
        assert!("BOGUS".parse::<TransactionType>().is_err());
        assert_eq!(
            serde_json::to_string(&TransactionType::Credit).unwrap(),
            "\"CREDIT\""
        );
    }

    #[test]
    fn test_replay_balance() {
        let wallet_id = WalletId::new();
        let now = Utc::now();
        let credit = NewLedgerEntry::new(wallet_id, TransactionType::Credit, usd(dec!(50)))
            .into_entry(1, usd(dec!(0)), usd(dec!(50)), now);
        let debit = NewLedgerEntry::new(wallet_id, TransactionType::Debit, usd(dec!(20)))
            .into_entry(2, usd(dec!(50)), usd(dec!(30)), now);
        assert_eq!(replay_balance(Currency::USD, &[credit, debit]), dec!(30));
    }

    #[test]
    fn test_debit_outcome_serializes_with_tag() {
        let outcome = DebitOutcome::InsufficientBalance {
            available: usd(dec!(40)),
            requested: usd(dec!(100)),
        };
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["outcome"], "INSUFFICIENT_BALANCE");
        assert_eq!(json["available"]["amount"], "40.00");
    }
}
