//! Wallet ledger storage port.

use chrono::{DateTime, Utc};

use crate::domain::{
    AppendOutcome, Currency, LedgerEntry, NewLedgerEntry, Wallet, WalletId, WalletStatus,
};
use crate::error::RepoError;

/// Storage for wallets and their append-only ledgers.
///
/// `append` MUST insert the entry and update the wallet balance and version
/// in one database transaction, serialized per wallet, so that two concurrent
/// appends never observe the same `balance_before`.
#[async_trait::async_trait]
pub trait LedgerRepository: Send + Sync + 'static {
    /// Returns the owner's wallet, creating it in `currency` on first need.
    async fn get_or_create_wallet(
        &self,
        owner_id: &str,
        currency: Currency,
        now: DateTime<Utc>,
    ) -> Result<Wallet, RepoError>;

    async fn get_wallet(&self, id: WalletId) -> Result<Option<Wallet>, RepoError>;

    async fn find_wallet_by_owner(&self, owner_id: &str) -> Result<Option<Wallet>, RepoError>;

    async fn set_wallet_status(
        &self,
        id: WalletId,
        status: WalletStatus,
        now: DateTime<Utc>,
    ) -> Result<Wallet, RepoError>;

    /// Appends one entry atomically.
    ///
    /// An entry whose `external_transaction_id` already exists on the wallet
    /// yields `Duplicate` with the stored entry; a decrease larger than the
    /// balance yields `InsufficientBalance` and writes nothing.
    async fn append(
        &self,
        entry: NewLedgerEntry,
        now: DateTime<Utc>,
    ) -> Result<AppendOutcome, RepoError>;

    async fn find_entry_by_external_id(
        &self,
        wallet_id: WalletId,
        external_transaction_id: &str,
    ) -> Result<Option<LedgerEntry>, RepoError>;

    /// Entries newest first (`sequence DESC`).
    async fn list_entries(
        &self,
        wallet_id: WalletId,
        offset: i64,
        limit: i64,
    ) -> Result<Vec<LedgerEntry>, RepoError>;
}
