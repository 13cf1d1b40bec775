//! PostgreSQL repository adapter.
//!
//! Ledger appends lock the wallet row (`SELECT ... FOR UPDATE`) for the
//! duration of the transaction, so appends to one wallet are serialized.
#![allow(clippy::collapsible_if)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

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

// ─────────────────────────────────────────────────────────────────────────────
// PostgreSQL Repository
// ─────────────────────────────────────────────────────────────────────────────

/// PostgreSQL repository with row-level locking.
pub struct PostgresRepo {
    pool: PgPool,
}

/// Executes the statements of one migration file in order.
async fn execute_migration(pool: &PgPool, sql: &str, name: &str) -> Result<(), anyhow::Error> {
    for stmt in migration_statements(sql) {
        sqlx::query(&stmt)
            .execute(pool)
            .await
            .map_err(|e| anyhow::anyhow!("Migration {} failed: {}", name, e))?;
    }
    Ok(())
}

/// Runs all database migrations.
async fn run_migrations(pool: &PgPool) -> Result<(), anyhow::Error> {
    execute_migration(
        pool,
        include_str!("../migrations/0001_create_wallets_pg.sql"),
        "0001",
    )
    .await?;

    execute_migration(
        pool,
        include_str!("../migrations/0002_create_payment_intents_pg.sql"),
        "0002",
    )
    .await?;

    execute_migration(
        pool,
        include_str!("../migrations/0003_create_subscriptions_pg.sql"),
        "0003",
    )
    .await?;

    Ok(())
}

impl PostgresRepo {
    /// Creates a new PostgreSQL repository with automatic migration.
    pub async fn new(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPool::connect(database_url).await?;
        run_migrations(&pool).await?;
        Ok(Self { pool })
    }

    /// Returns a reference to the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Creates the database schema (for testing with existing pool).
    pub async fn create_schema(&self) -> Result<(), RepoError> {
        run_migrations(&self.pool)
            .await
            .map_err(|e| RepoError::Database(e.to_string()))
    }

    async fn fetch_wallet(&self, id: WalletId) -> Result<Option<Wallet>, RepoError> {
        let sql = format!("SELECT {} FROM wallets WHERE id = $1", WALLET_COLUMNS);
        let row: Option<DbWallet> = sqlx::query_as(&sql)
            .bind(id.into_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.map(DbWallet::into_domain).transpose()
    }
}

fn db_err(e: sqlx::Error) -> RepoError {
    RepoError::Database(e.to_string())
}

fn tx_err(e: sqlx::Error) -> RepoError {
    RepoError::Transaction(e.to_string())
}

// ─────────────────────────────────────────────────────────────────────────────
// Ledger
// ─────────────────────────────────────────────────────────────────────────────

#[async_trait]
impl LedgerRepository for PostgresRepo {
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
               VALUES ($1, $2, $3, 0, $4, 0, $5, $5)
               ON CONFLICT (owner_id) DO NOTHING"#,
        )
        .bind(wallet.id.into_uuid())
        .bind(&wallet.owner_id)
        .bind(currency.code())
        .bind(wallet.status.as_str())
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
        let sql = format!("SELECT {} FROM wallets WHERE owner_id = $1", WALLET_COLUMNS);
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
        let sql = format!(
            "UPDATE wallets SET status = $1, updated_at = $2 WHERE id = $3 RETURNING {}",
            WALLET_COLUMNS
        );
        let row: Option<DbWallet> = sqlx::query_as(&sql)
            .bind(status.as_str())
            .bind(now)
            .bind(id.into_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.ok_or(RepoError::NotFound)?.into_domain()
    }

    async fn append(
        &self,
        entry: NewLedgerEntry,
        now: DateTime<Utc>,
    ) -> Result<AppendOutcome, RepoError> {
        let mut tx = self.pool.begin().await.map_err(tx_err)?;

        // Lock the wallet with FOR UPDATE
        let sql = format!("SELECT {} FROM wallets WHERE id = $1 FOR UPDATE", WALLET_COLUMNS);
        let wallet = sqlx::query_as::<_, DbWallet>(&sql)
            .bind(entry.wallet_id.into_uuid())
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_err)?
            .ok_or(RepoError::NotFound)?
            .into_domain()?;

        if let Some(external_id) = &entry.external_transaction_id {
            let sql = format!(
                "SELECT {} FROM ledger_entries WHERE wallet_id = $1 AND external_transaction_id = $2",
                ENTRY_COLUMNS
            );
            let existing: Option<DbLedgerEntry> = sqlx::query_as(&sql)
                .bind(entry.wallet_id.into_uuid())
                .bind(external_id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(db_err)?;
            if let Some(row) = existing {
                return Ok(AppendOutcome::Duplicate(row.into_domain()?));
            }
        }

        let (before, after) = match wallet.step(entry.entry_type, &entry.amount)? {
            BalanceStep::Applied { before, after } => (before, after),
            BalanceStep::Insufficient {
                available,
                requested,
            } => {
                return Ok(AppendOutcome::InsufficientBalance {
                    available,
                    requested,
                });
            }
        };

        let sequence = wallet.version + 1;
        sqlx::query(r#"UPDATE wallets SET balance = $1, version = $2, updated_at = $3 WHERE id = $4"#)
            .bind(minor_units(&after)?)
            .bind(sequence)
            .bind(now)
            .bind(wallet.id.into_uuid())
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

        let stored = entry.into_entry(sequence, before, after, now);
        let sql = format!(
            "INSERT INTO ledger_entries ({}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)",
            ENTRY_COLUMNS
        );
        sqlx::query(&sql)
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
            .await
            .map_err(db_err)?;

        tx.commit().await.map_err(tx_err)?;

        Ok(AppendOutcome::Appended(stored))
    }

    async fn find_entry_by_external_id(
        &self,
        wallet_id: WalletId,
        external_transaction_id: &str,
    ) -> Result<Option<LedgerEntry>, RepoError> {
        let sql = format!(
            "SELECT {} FROM ledger_entries WHERE wallet_id = $1 AND external_transaction_id = $2",
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
            "SELECT {} FROM ledger_entries WHERE wallet_id = $1 ORDER BY sequence DESC LIMIT $2 OFFSET $3",
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
impl PaymentIntentRepository for PostgresRepo {
    async fn insert_intent(
        &self,
        intent: PaymentIntent,
    ) -> Result<InsertOutcome<PaymentIntent>, RepoError> {
        let sql = format!(
            "INSERT INTO payment_intents ({}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17) \
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
        let sql = format!("SELECT {} FROM payment_intents WHERE id = $1", INTENT_COLUMNS);
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
            "SELECT {} FROM payment_intents WHERE idempotency_key = $1",
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
            "SELECT {} FROM payment_intents WHERE provider = $1 AND external_reference = $2",
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
               SET status = $1, external_transaction_id = COALESCE($2, external_transaction_id), updated_at = $3
               WHERE id = $4 AND status = 'PENDING'"#,
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
            "SELECT {} FROM payment_intents WHERE status = 'PENDING' AND expires_at < $1 \
             ORDER BY expires_at ASC LIMIT $2",
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
impl SubscriptionRepository for PostgresRepo {
    async fn insert_subscription(
        &self,
        subscription: Subscription,
    ) -> Result<InsertOutcome<Subscription>, RepoError> {
        let docs = SubscriptionDocuments::encode(&subscription)?;
        let sql = format!(
            "INSERT INTO subscriptions ({}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16) \
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
        let sql = format!("SELECT {} FROM subscriptions WHERE id = $1", SUBSCRIPTION_COLUMNS);
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
            "SELECT {} FROM subscriptions WHERE origin_transaction_id = $1",
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
            "SELECT {} FROM subscriptions WHERE owner_ref = $1 ORDER BY created_at DESC",
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
        let sql = format!(
            "UPDATE subscriptions \
             SET status = $1, end_date = $2, billing = $3, renewal_history = $4, cancellation = $5, \
                 suspension = $6, version = version + 1, updated_at = $7 \
             WHERE id = $8 AND version = $9 \
             RETURNING {}",
            SUBSCRIPTION_COLUMNS
        );
        let row: Option<DbSubscription> = sqlx::query_as(&sql)
            .bind(subscription.status.as_str())
            .bind(subscription.end_date)
            .bind(docs.billing)
            .bind(docs.renewal_history)
            .bind(docs.cancellation)
            .bind(docs.suspension)
            .bind(subscription.updated_at)
            .bind(subscription.id.into_uuid())
            .bind(subscription.version)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;

        match row {
            Some(row) => row.into_domain(),
            None => match self.get_subscription(subscription.id).await? {
                Some(_) => Err(RepoError::Conflict(format!(
                    "subscription {} was modified concurrently",
                    subscription.id
                ))),
                None => Err(RepoError::NotFound),
            },
        }
    }

    async fn expire_lapsed(&self, now: DateTime<Utc>) -> Result<u64, RepoError> {
        let result = sqlx::query(
            r#"UPDATE subscriptions
               SET status = 'EXPIRED', version = version + 1, updated_at = $1
               WHERE status = 'ACTIVE' AND end_date IS NOT NULL AND end_date < $1"#,
        )
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(result.rows_affected())
    }
}
