//! SQLite repository adapter.
//!
//! SQLite has no row locks. `append` opens its transaction with
//! `BEGIN IMMEDIATE`, which takes the database write lock up front, so
//! concurrent appends queue on the busy timeout instead of failing when a
//! deferred read transaction tries to upgrade. The write is still conditioned
//! on the wallet version it read, and a lost race is retried a bounded number
//! of times.
#![allow(clippy::collapsible_if)]

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};

use billing_types::domain::BalanceStep;
use billing_types::{
    AppendOutcome, Currency, InsertOutcome, LedgerEntry, LedgerRepository, NewLedgerEntry,
    PaymentIntent, PaymentIntentId, PaymentIntentRepository, PaymentProvider, PaymentStatus,
    RepoError, Subscription, SubscriptionId, SubscriptionRepository, Wallet, WalletId,
    WalletStatus,
};

use crate::types::{
    DbLedgerEntry, DbPaymentIntent, DbSubscription, DbWallet, ENTRY_COLUMNS, INTENT_COLUMNS,
    SUBSCRIPTION_COLUMNS, SubscriptionDocuments, WALLET_COLUMNS, migration_statements, minor_units,
    to_document,
};

const MAX_APPEND_ATTEMPTS: u32 = 5;

const MIGRATIONS: &[(&str, &str)] = &[
    ("0001", include_str!("../migrations/0001_create_wallets.sql")),
    ("0002", include_str!("../migrations/0002_create_payment_intents.sql")),
    ("0003", include_str!("../migrations/0003_create_subscriptions.sql")),
];

// ─────────────────────────────────────────────────────────────────────────────
// SQLite Repository
// ─────────────────────────────────────────────────────────────────────────────

/// SQLite repository implementation.
pub struct SqliteRepo {
    pool: SqlitePool,
}

impl SqliteRepo {
    /// Creates a new SQLite repository with automatic migration.
    pub async fn new(database_url: &str) -> anyhow::Result<Self> {
        // Ensure on-disk SQLite target directory exists (no-op for in-memory).
        if let Some(path) = database_url.strip_prefix("sqlite://") {
            // Remove query parameters
            let path = path.split('?').next().unwrap_or(path);
            if path != ":memory:" {
                let p = std::path::Path::new(path);
                if let Some(parent) = p.parent() {
                    if !parent.as_os_str().is_empty() {
                        tokio::fs::create_dir_all(parent).await?;
                    }
                }
            }
        }

        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));

        // Every connection to `:memory:` would otherwise see its own database.
        let max_connections = if database_url.contains(":memory:") { 1 } else { 8 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;

        let repo = Self { pool };
        repo.create_schema().await?;
        Ok(repo)
    }

    /// Returns a reference to the connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Creates the database schema (idempotent).
    pub async fn create_schema(&self) -> Result<(), RepoError> {
        for (name, sql) in MIGRATIONS {
            for stmt in migration_statements(sql) {
                sqlx::query(&stmt)
                    .execute(&self.pool)
                    .await
                    .map_err(|e| RepoError::Database(format!("Migration {} failed: {}", name, e)))?;
            }
        }
        Ok(())
    }

    async fn fetch_wallet(&self, id: WalletId) -> Result<Option<Wallet>, RepoError> {
        let sql = format!("SELECT {} FROM wallets WHERE id = ?", WALLET_COLUMNS);
        let row: Option<DbWallet> = sqlx::query_as(&sql)
            .bind(id.into_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.map(DbWallet::into_domain).transpose()
    }

    /// One optimistic attempt. `Ok(None)` means another writer won the race.
    async fn try_append(
        &self,
        entry: &NewLedgerEntry,
        now: DateTime<Utc>,
    ) -> Result<Option<AppendOutcome>, RepoError> {
        let mut tx = match self.pool.begin_with("BEGIN IMMEDIATE").await {
            Ok(tx) => tx,
            Err(e) if is_contention(&e) => return Ok(None),
            Err(e) => return Err(tx_err(e)),
        };

        let sql = format!("SELECT {} FROM wallets WHERE id = ?", WALLET_COLUMNS);
        let wallet = sqlx::query_as::<_, DbWallet>(&sql)
            .bind(entry.wallet_id.into_uuid())
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_err)?
            .ok_or(RepoError::NotFound)?
            .into_domain()?;

        if let Some(external_id) = &entry.external_transaction_id {
            let sql = format!(
                "SELECT {} FROM ledger_entries WHERE wallet_id = ? AND external_transaction_id = ?",
                ENTRY_COLUMNS
            );
            let existing: Option<DbLedgerEntry> = sqlx::query_as(&sql)
                .bind(entry.wallet_id.into_uuid())
                .bind(external_id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(db_err)?;
            if let Some(row) = existing {
                return Ok(Some(AppendOutcome::Duplicate(row.into_domain()?)));
            }
        }

        let (before, after) = match wallet.step(entry.entry_type, &entry.amount)? {
            BalanceStep::Applied { before, after } => (before, after),
            BalanceStep::Insufficient {
                available,
                requested,
            } => {
                return Ok(Some(AppendOutcome::InsufficientBalance {
                    available,
                    requested,
                }));
            }
        };

        let sequence = wallet.version + 1;
        let updated = sqlx::query(
            r#"UPDATE wallets SET balance = ?, version = ?, updated_at = ? WHERE id = ? AND version = ?"#,
        )
        .bind(minor_units(&after)?)
        .bind(sequence)
        .bind(now)
        .bind(wallet.id.into_uuid())
        .bind(wallet.version)
        .execute(&mut *tx)
        .await;
        match updated {
            Ok(done) if done.rows_affected() == 1 => {}
            Ok(_) => return Ok(None),
            Err(e) if is_contention(&e) => return Ok(None),
            Err(e) => return Err(db_err(e)),
        }

        let stored = entry.clone().into_entry(sequence, before, after, now);
        let sql = format!(
            "INSERT INTO ledger_entries ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            ENTRY_COLUMNS
        );
        let inserted = sqlx::query(&sql)
            .bind(stored.id.into_uuid())
            .bind(stored.wallet_id.into_uuid())
            .bind(stored.sequence)
            .bind(stored.entry_type.as_str())
            .bind(minor_units(&stored.amount)?)
            .bind(stored.amount.currency().code())
            .bind(minor_units(&stored.balance_before)?)
            .bind(minor_units(&stored.balance_after)?)
            .bind(stored.purpose.map(|p| p.as_str()))
            .bind(stored.payment_method.map(|m| m.as_str()))
            .bind(stored.payment_provider.map(|p| p.as_str()))
            .bind(stored.external_transaction_id.as_deref())
            .bind(stored.status.as_str())
            .bind(sqlx::types::Json(&stored.metadata))
            .bind(stored.created_at)
            .execute(&mut *tx)
            .await;
        match inserted {
            Ok(_) => {}
            Err(e) if is_contention(&e) => return Ok(None),
            Err(e) => return Err(db_err(e)),
        }

        match tx.commit().await {
            Ok(()) => Ok(Some(AppendOutcome::Appended(stored))),
            Err(e) if is_contention(&e) => Ok(None),
            Err(e) => Err(tx_err(e)),
        }
    }
}

fn db_err(e: sqlx::Error) -> RepoError {
    RepoError::Database(e.to_string())
}

fn tx_err(e: sqlx::Error) -> RepoError {
    RepoError::Transaction(e.to_string())
}

/// `SQLITE_BUSY`/`SQLITE_LOCKED` (any extended code) or a unique index hit.
fn is_contention(e: &sqlx::Error) -> bool {
    let Some(db) = e.as_database_error() else {
        return false;
    };
    if db.is_unique_violation() {
        return true;
    }
    db.code()
        .and_then(|code| code.parse::<i32>().ok())
        .is_some_and(|code| matches!(code & 0xff, 5 | 6))
}

// ─────────────────────────────────────────────────────────────────────────────
// Ledger
// ─────────────────────────────────────────────────────────────────────────────

#[async_trait]
impl LedgerRepository for SqliteRepo {
    async fn get_or_create_wallet(
        &self,
        owner_id: &str,
        currency: Currency,
        now: DateTime<Utc>,
    ) -> Result<Wallet, RepoError> {
        if let Some(wallet) = self.find_wallet_by_owner(owner_id).await? {
            return Ok(wallet);
        }

        let wallet = Wallet::open(owner_id.to_string(), currency, now)?;
        sqlx::query(
            r#"INSERT INTO wallets (id, owner_id, currency, balance, status, version, created_at, updated_at)
               VALUES (?, ?, ?, 0, ?, 0, ?, ?)
               ON CONFLICT (owner_id) DO NOTHING"#,
        )
        .bind(wallet.id.into_uuid())
        .bind(&wallet.owner_id)
        .bind(currency.code())
        .bind(wallet.status.as_str())
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        self.find_wallet_by_owner(owner_id)
            .await?
            .ok_or(RepoError::NotFound)
    }

    async fn get_wallet(&self, id: WalletId) -> Result<Option<Wallet>, RepoError> {
        self.fetch_wallet(id).await
    }

    async fn find_wallet_by_owner(&self, owner_id: &str) -> Result<Option<Wallet>, RepoError> {
        let sql = format!("SELECT {} FROM wallets WHERE owner_id = ?", WALLET_COLUMNS);
        let row: Option<DbWallet> = sqlx::query_as(&sql)
            .bind(owner_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.map(DbWallet::into_domain).transpose()
    }

    async fn set_wallet_status(
        &self,
        id: WalletId,
        status: WalletStatus,
        now: DateTime<Utc>,
    ) -> Result<Wallet, RepoError> {
        let result = sqlx::query(r#"UPDATE wallets SET status = ?, updated_at = ? WHERE id = ?"#)
            .bind(status.as_str())
            .bind(now)
            .bind(id.into_uuid())
            .execute(&self.pool)
            .await
            .map_err(db_err)?;

        if result.rows_affected() == 0 {
            return Err(RepoError::NotFound);
        }
        self.fetch_wallet(id).await?.ok_or(RepoError::NotFound)
    }

    async fn append(
        &self,
        entry: NewLedgerEntry,
        now: DateTime<Utc>,
    ) -> Result<AppendOutcome, RepoError> {
        for attempt in 1..=MAX_APPEND_ATTEMPTS {
            if let Some(outcome) = self.try_append(&entry, now).await? {
                return Ok(outcome);
            }
            tracing::debug!(wallet_id = %entry.wallet_id, attempt, "ledger append lost a race, retrying");
            tokio::time::sleep(Duration::from_millis(5 * u64::from(attempt))).await;
        }
        Err(RepoError::Conflict(format!(
            "wallet {} is too contended, giving up after {} attempts",
            entry.wallet_id, MAX_APPEND_ATTEMPTS
        )))
    }

    async fn find_entry_by_external_id(
        &self,
        wallet_id: WalletId,
        external_transaction_id: &str,
    ) -> Result<Option<LedgerEntry>, RepoError> {
        let sql = format!(
            "SELECT {} FROM ledger_entries WHERE wallet_id = ? AND external_transaction_id = ?",
            ENTRY_COLUMNS
        );
        let row: Option<DbLedgerEntry> = sqlx::query_as(&sql)
            .bind(wallet_id.into_uuid())
            .bind(external_transaction_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.map(DbLedgerEntry::into_domain).transpose()
    }

    async fn list_entries(
        &self,
        wallet_id: WalletId,
        offset: i64,
        limit: i64,
    ) -> Result<Vec<LedgerEntry>, RepoError> {
        let sql = format!(
            "SELECT {} FROM ledger_entries WHERE wallet_id = ? ORDER BY sequence DESC LIMIT ? OFFSET ?",
            ENTRY_COLUMNS
        );
        let rows: Vec<DbLedgerEntry> = sqlx::query_as(&sql)
            .bind(wallet_id.into_uuid())
            .bind(limit)
            .bind(offset)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        rows.into_iter().map(DbLedgerEntry::into_domain).collect()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Payment intents
// ─────────────────────────────────────────────────────────────────────────────

#[async_trait]
impl PaymentIntentRepository for SqliteRepo {
    async fn insert_intent(
        &self,
        intent: PaymentIntent,
    ) -> Result<InsertOutcome<PaymentIntent>, RepoError> {
        let sql = format!(
            "INSERT INTO payment_intents ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT (idempotency_key) DO NOTHING",
            INTENT_COLUMNS
        );
        let order = intent.order.as_ref().map(to_document).transpose()?;
        let result = sqlx::query(&sql)
            .bind(intent.id.into_uuid())
            .bind(intent.provider.as_str())
            .bind(intent.method.as_str())
            .bind(minor_units(&intent.amount)?)
            .bind(intent.amount.currency().code())
            .bind(intent.purpose.as_str())
            .bind(intent.status.as_str())
            .bind(intent.external_reference.as_deref())
            .bind(intent.external_transaction_id.as_deref())
            .bind(intent.payment_url.as_deref())
            .bind(&intent.idempotency_key)
            .bind(&intent.payer_ref)
            .bind(order)
            .bind(sqlx::types::Json(&intent.metadata))
            .bind(intent.created_at)
            .bind(intent.expires_at)
            .bind(intent.updated_at)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;

        if result.rows_affected() == 1 {
            return Ok(InsertOutcome::Inserted(intent));
        }
        self.find_intent_by_key(&intent.idempotency_key)
            .await?
            .map(InsertOutcome::Existing)
            .ok_or_else(|| RepoError::Conflict("payment intent id collision".into()))
    }

    async fn get_intent(&self, id: PaymentIntentId) -> Result<Option<PaymentIntent>, RepoError> {
        let sql = format!("SELECT {} FROM payment_intents WHERE id = ?", INTENT_COLUMNS);
        let row: Option<DbPaymentIntent> = sqlx::query_as(&sql)
            .bind(id.into_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.map(DbPaymentIntent::into_domain).transpose()
    }

    async fn find_intent_by_key(
        &self,
        idempotency_key: &str,
    ) -> Result<Option<PaymentIntent>, RepoError> {
        let sql = format!(
            "SELECT {} FROM payment_intents WHERE idempotency_key = ?",
            INTENT_COLUMNS
        );
        let row: Option<DbPaymentIntent> = sqlx::query_as(&sql)
            .bind(idempotency_key)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.map(DbPaymentIntent::into_domain).transpose()
    }

    async fn find_intent_by_external_reference(
        &self,
        provider: PaymentProvider,
        external_reference: &str,
    ) -> Result<Option<PaymentIntent>, RepoError> {
        let sql = format!(
            "SELECT {} FROM payment_intents WHERE provider = ? AND external_reference = ?",
            INTENT_COLUMNS
        );
        let row: Option<DbPaymentIntent> = sqlx::query_as(&sql)
            .bind(provider.as_str())
            .bind(external_reference)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.map(DbPaymentIntent::into_domain).transpose()
    }

    async fn advance_intent(
        &self,
        id: PaymentIntentId,
        status: PaymentStatus,
        external_transaction_id: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<bool, RepoError> {
        if !PaymentStatus::Pending.can_advance_to(status) {
            return Err(RepoError::Conflict(format!(
                "payment intents cannot move to {}",
                status
            )));
        }

        let result = sqlx::query(
            r#"UPDATE payment_intents
               SET status = ?, external_transaction_id = COALESCE(?, external_transaction_id), updated_at = ?
               WHERE id = ? AND status = 'PENDING'"#,
        )
        .bind(status.as_str())
        .bind(external_transaction_id)
        .bind(now)
        .bind(id.into_uuid())
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(result.rows_affected() == 1)
    }

    async fn list_expired_pending(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<PaymentIntent>, RepoError> {
        let sql = format!(
            "SELECT {} FROM payment_intents WHERE status = 'PENDING' AND expires_at < ? \
             ORDER BY expires_at ASC LIMIT ?",
            INTENT_COLUMNS
        );
        let rows: Vec<DbPaymentIntent> = sqlx::query_as(&sql)
            .bind(now)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        rows.into_iter().map(DbPaymentIntent::into_domain).collect()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Subscriptions
// ─────────────────────────────────────────────────────────────────────────────

#[async_trait]
impl SubscriptionRepository for SqliteRepo {
    async fn insert_subscription(
        &self,
        subscription: Subscription,
    ) -> Result<InsertOutcome<Subscription>, RepoError> {
        let docs = SubscriptionDocuments::encode(&subscription)?;
        let sql = format!(
            "INSERT INTO subscriptions ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT (origin_transaction_id) DO NOTHING",
            SUBSCRIPTION_COLUMNS
        );
        let result = sqlx::query(&sql)
            .bind(subscription.id.into_uuid())
            .bind(subscription.subscription_type().as_str())
            .bind(subscription.owner_ref())
            .bind(subscription.target_ref())
            .bind(docs.grant_details)
            .bind(subscription.status.as_str())
            .bind(subscription.start_date)
            .bind(subscription.end_date)
            .bind(docs.billing)
            .bind(subscription.origin_transaction_id.as_deref())
            .bind(docs.renewal_history)
            .bind(docs.cancellation)
            .bind(docs.suspension)
            .bind(subscription.version)
            .bind(subscription.created_at)
            .bind(subscription.updated_at)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;

        if result.rows_affected() == 1 {
            return Ok(InsertOutcome::Inserted(subscription));
        }
        let origin = subscription
            .origin_transaction_id
            .as_deref()
            .ok_or_else(|| RepoError::Conflict("subscription id collision".into()))?;
        self.find_subscription_by_origin(origin)
            .await?
            .map(InsertOutcome::Existing)
            .ok_or_else(|| RepoError::Conflict("subscription id collision".into()))
    }

    async fn get_subscription(
        &self,
        id: SubscriptionId,
    ) -> Result<Option<Subscription>, RepoError> {
        let sql = format!("SELECT {} FROM subscriptions WHERE id = ?", SUBSCRIPTION_COLUMNS);
        let row: Option<DbSubscription> = sqlx::query_as(&sql)
            .bind(id.into_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.map(DbSubscription::into_domain).transpose()
    }

    async fn find_subscription_by_origin(
        &self,
        origin_transaction_id: &str,
    ) -> Result<Option<Subscription>, RepoError> {
        let sql = format!(
            "SELECT {} FROM subscriptions WHERE origin_transaction_id = ?",
            SUBSCRIPTION_COLUMNS
        );
        let row: Option<DbSubscription> = sqlx::query_as(&sql)
            .bind(origin_transaction_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.map(DbSubscription::into_domain).transpose()
    }

    async fn list_subscriptions_for_owner(
        &self,
        owner_ref: &str,
    ) -> Result<Vec<Subscription>, RepoError> {
        let sql = format!(
            "SELECT {} FROM subscriptions WHERE owner_ref = ? ORDER BY created_at DESC",
            SUBSCRIPTION_COLUMNS
        );
        let rows: Vec<DbSubscription> = sqlx::query_as(&sql)
            .bind(owner_ref)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        rows.into_iter().map(DbSubscription::into_domain).collect()
    }

    async fn update_subscription(
        &self,
        subscription: &Subscription,
    ) -> Result<Subscription, RepoError> {
        let docs = SubscriptionDocuments::encode(subscription)?;
        let result = sqlx::query(
            r#"UPDATE subscriptions
               SET status = ?, end_date = ?, billing = ?, renewal_history = ?, cancellation = ?,
                   suspension = ?, version = version + 1, updated_at = ?
               WHERE id = ? AND version = ?"#,
        )
        .bind(subscription.status.as_str())
        .bind(subscription.end_date)
        .bind(docs.billing)
        .bind(docs.renewal_history)
        .bind(docs.cancellation)
        .bind(docs.suspension)
        .bind(subscription.updated_at)
        .bind(subscription.id.into_uuid())
        .bind(subscription.version)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        if result.rows_affected() == 0 {
            return match self.get_subscription(subscription.id).await? {
                Some(_) => Err(RepoError::Conflict(format!(
                    "subscription {} was modified concurrently",
                    subscription.id
                ))),
                None => Err(RepoError::NotFound),
            };
        }

        let mut stored = subscription.clone();
        stored.version += 1;
        Ok(stored)
    }

    async fn expire_lapsed(&self, now: DateTime<Utc>) -> Result<u64, RepoError> {
        let result = sqlx::query(
            r#"UPDATE subscriptions
               SET status = 'EXPIRED', version = version + 1, updated_at = ?
               WHERE status = 'ACTIVE' AND end_date IS NOT NULL AND end_date < ?"#,
        )
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(result.rows_affected())
    }
}
