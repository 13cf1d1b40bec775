//! Wallet ledger service.
//!
//! Every balance change goes through [`LedgerRepository::append`], which
//! writes the entry and the new balance in one transaction. Operations that
//! carry a caller reference derive an external transaction id from it, so a
//! replay returns the original entry instead of moving money twice.

use std::sync::Arc;

use chrono::Utc;
use serde_json::{Value, json};

use billing_types::domain::wallet::validate_owner_id;
use billing_types::{
    AppError, AppendOutcome, ApplyOutcome, Currency, DebitOutcome, LedgerEntry, LedgerRepository,
    Money, NewLedgerEntry, PaymentIntent, PaymentPurpose, PaymentStatus, TransactionPage,
    TransactionType, ValidationError, Wallet, WalletId, WalletStatus,
};
use exchange_rates::CurrencyConverter;

/// Largest page `history` hands out.
pub const MAX_PAGE_SIZE: u32 = 100;
const DEFAULT_PAGE_SIZE: u32 = 20;

pub struct WalletLedger<R: LedgerRepository> {
    repo: Arc<R>,
    converter: Arc<CurrencyConverter>,
    default_currency: Currency,
}

impl<R: LedgerRepository> WalletLedger<R> {
    pub fn new(repo: Arc<R>, converter: Arc<CurrencyConverter>, default_currency: Currency) -> Self {
        Self {
            repo,
            converter,
            default_currency,
        }
    }

    /// Currency new wallets are opened in.
    pub fn default_currency(&self) -> Currency {
        self.default_currency
    }

    /// Returns the owner's wallet, opening it on first use.
    #[tracing::instrument(skip(self))]
    pub async fn wallet_for_owner(&self, owner_id: &str) -> Result<Wallet, AppError> {
        validate_owner_id(owner_id)?;
        let wallet = self
            .repo
            .get_or_create_wallet(owner_id, self.default_currency, Utc::now())
            .await?;
        Ok(wallet)
    }

    pub async fn wallet(&self, id: WalletId) -> Result<Wallet, AppError> {
        self.repo
            .get_wallet(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Wallet {}", id)))
    }

    /// Adds money to a wallet.
    #[tracing::instrument(skip(self, metadata), fields(amount = %amount))]
    pub async fn credit(
        &self,
        wallet_id: WalletId,
        amount: Money,
        purpose: Option<PaymentPurpose>,
        metadata: Value,
    ) -> Result<LedgerEntry, AppError> {
        let mut entry = NewLedgerEntry::new(wallet_id, TransactionType::Credit, amount)
            .with_metadata(metadata);
        entry.purpose = purpose;

        match self.record(entry).await? {
            AppendOutcome::Appended(entry) | AppendOutcome::Duplicate(entry) => Ok(entry),
            AppendOutcome::InsufficientBalance { .. } => Err(AppError::Internal(
                "credit reported insufficient balance".into(),
            )),
        }
    }

    /// Takes money from a wallet; an insufficient balance is an outcome, not
    /// an error.
    #[tracing::instrument(skip(self, metadata), fields(amount = %amount))]
    pub async fn debit(
        &self,
        wallet_id: WalletId,
        amount: Money,
        purpose: Option<PaymentPurpose>,
        metadata: Value,
    ) -> Result<DebitOutcome, AppError> {
        let mut entry = NewLedgerEntry::new(wallet_id, TransactionType::Debit, amount)
            .with_metadata(metadata);
        entry.purpose = purpose;
        self.take(entry).await
    }

    /// Like [`debit`](Self::debit), but at most once per `external_id`; a
    /// replay returns the original entry.
    #[tracing::instrument(skip(self, metadata), fields(amount = %amount))]
    pub async fn debit_once(
        &self,
        wallet_id: WalletId,
        amount: Money,
        purpose: Option<PaymentPurpose>,
        external_id: &str,
        metadata: Value,
    ) -> Result<DebitOutcome, AppError> {
        let mut entry = NewLedgerEntry::new(wallet_id, TransactionType::Debit, amount)
            .with_external_id(external_id)
            .with_metadata(metadata);
        entry.purpose = purpose;
        self.take(entry).await
    }

    /// Gives money back, once per `reference`.
    #[tracing::instrument(skip(self, metadata), fields(amount = %amount))]
    pub async fn refund(
        &self,
        wallet_id: WalletId,
        amount: Money,
        reference: &str,
        metadata: Value,
    ) -> Result<LedgerEntry, AppError> {
        require_reference(reference)?;
        let entry = NewLedgerEntry::new(wallet_id, TransactionType::Refund, amount)
            .with_external_id(format!("refund:{}", reference))
            .with_metadata(metadata);

        match self.record(entry).await? {
            AppendOutcome::Appended(entry) => {
                tracing::info!(wallet_id = %wallet_id, entry_id = %entry.id, "Refund recorded");
                Ok(entry)
            }
            AppendOutcome::Duplicate(entry) => Ok(entry),
            AppendOutcome::InsufficientBalance { .. } => Err(AppError::Internal(
                "refund reported insufficient balance".into(),
            )),
        }
    }

    /// Pays money out of the platform, once per `reference`.
    #[tracing::instrument(skip(self, metadata), fields(amount = %amount))]
    pub async fn withdraw(
        &self,
        wallet_id: WalletId,
        amount: Money,
        reference: &str,
        metadata: Value,
    ) -> Result<DebitOutcome, AppError> {
        require_reference(reference)?;
        let entry = NewLedgerEntry::new(wallet_id, TransactionType::Withdrawal, amount)
            .with_external_id(format!("withdrawal:{}", reference))
            .with_metadata(metadata);
        self.take(entry).await
    }

    /// Credits the payer's wallet for a completed intent, exactly once.
    ///
    /// The charged amount is converted into the wallet's currency.
    #[tracing::instrument(skip(self, intent), fields(intent_id = %intent.id))]
    pub async fn apply_external_payment(
        &self,
        intent: &PaymentIntent,
    ) -> Result<ApplyOutcome, AppError> {
        if intent.status != PaymentStatus::Completed {
            return Err(ValidationError::Invalid(format!(
                "payment {} is {}, only completed payments can be applied",
                intent.id, intent.status
            ))
            .into());
        }

        let wallet = self.wallet_for_owner(&intent.payer_ref).await?;
        let amount = intent.amount.convert(&self.converter, wallet.currency())?;

        let entry = NewLedgerEntry::new(wallet.id, TransactionType::Credit, amount)
            .with_purpose(intent.purpose)
            .with_payment(intent.method, intent.provider)
            .with_external_id(intent.settlement_key())
            .with_metadata(json!({
                "payment_intent_id": intent.id,
                "charged": intent.amount,
                "provider_transaction_id": intent.external_transaction_id,
            }));

        match self.record(entry).await? {
            AppendOutcome::Appended(entry) => {
                tracing::info!(
                    wallet_id = %wallet.id,
                    entry_id = %entry.id,
                    amount = %entry.amount,
                    "External payment credited"
                );
                Ok(ApplyOutcome::Applied { entry })
            }
            AppendOutcome::Duplicate(entry) => {
                tracing::debug!(entry_id = %entry.id, "External payment already credited");
                Ok(ApplyOutcome::AlreadyApplied { entry })
            }
            AppendOutcome::InsufficientBalance { .. } => Err(AppError::Internal(
                "credit reported insufficient balance".into(),
            )),
        }
    }

    pub async fn find_by_external_id(
        &self,
        wallet_id: WalletId,
        external_id: &str,
    ) -> Result<Option<LedgerEntry>, AppError> {
        Ok(self
            .repo
            .find_entry_by_external_id(wallet_id, external_id)
            .await?)
    }

    /// One page of entries, newest first. Pages are 1-based.
    pub async fn history(
        &self,
        wallet_id: WalletId,
        page: Option<u32>,
        limit: Option<u32>,
    ) -> Result<TransactionPage, AppError> {
        self.wallet(wallet_id).await?;

        let page = page.unwrap_or(1).max(1);
        let limit = limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE);
        let offset = (i64::from(page) - 1) * i64::from(limit);

        let entries = self
            .repo
            .list_entries(wallet_id, offset, i64::from(limit))
            .await?;

        Ok(TransactionPage {
            wallet_id,
            page,
            limit,
            entries,
        })
    }

    #[tracing::instrument(skip(self))]
    pub async fn freeze(&self, wallet_id: WalletId) -> Result<Wallet, AppError> {
        let wallet = self
            .repo
            .set_wallet_status(wallet_id, WalletStatus::Frozen, Utc::now())
            .await?;
        tracing::warn!(wallet_id = %wallet_id, "Wallet frozen");
        Ok(wallet)
    }

    #[tracing::instrument(skip(self))]
    pub async fn unfreeze(&self, wallet_id: WalletId) -> Result<Wallet, AppError> {
        let wallet = self
            .repo
            .set_wallet_status(wallet_id, WalletStatus::Active, Utc::now())
            .await?;
        tracing::info!(wallet_id = %wallet_id, "Wallet unfrozen");
        Ok(wallet)
    }

    async fn take(&self, entry: NewLedgerEntry) -> Result<DebitOutcome, AppError> {
        let wallet_id = entry.wallet_id;
        match self.record(entry).await? {
            AppendOutcome::Appended(entry) | AppendOutcome::Duplicate(entry) => {
                Ok(DebitOutcome::Applied { entry })
            }
            AppendOutcome::InsufficientBalance {
                available,
                requested,
            } => {
                tracing::info!(
                    wallet_id = %wallet_id,
                    available = %available,
                    requested = %requested,
                    "Insufficient balance"
                );
                Ok(DebitOutcome::InsufficientBalance {
                    available,
                    requested,
                })
            }
        }
    }

    async fn record(&self, entry: NewLedgerEntry) -> Result<AppendOutcome, AppError> {
        if entry.amount.is_zero() {
            return Err(ValidationError::NonPositiveAmount.into());
        }
        Ok(self.repo.append(entry, Utc::now()).await?)
    }
}

fn require_reference(reference: &str) -> Result<(), ValidationError> {
    if reference.trim().is_empty() {
        return Err(ValidationError::Invalid("reference must not be empty".into()));
    }
    Ok(())
}
