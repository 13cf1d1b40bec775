//! Shared database row types for SQLite and PostgreSQL.
//!
//! Both backends decode into the same structs: ids are native UUIDs (BLOB in
//! SQLite, UUID in Postgres), timestamps are `DateTime<Utc>` (RFC 3339 TEXT /
//! TIMESTAMPTZ) and structured documents are `Json` (TEXT / JSONB).

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use sqlx::FromRow;
use sqlx::types::Json;
use uuid::Uuid;

use billing_types::domain::{
    Billing, Cancellation, EntryStatus, LedgerEntryId, RenewalRecord, SubscriptionGrant,
    Suspension,
};
use billing_types::validation::parse_currency;
use billing_types::{
    Currency, LedgerEntry, Money, PaymentIntent, PaymentIntentId, PaymentMethod, PaymentProvider,
    PaymentPurpose, PaymentStatus, PurchaseOrder, RepoError, Subscription, SubscriptionId,
    SubscriptionStatus, TransactionType, Wallet, WalletId, WalletStatus,
};

// ─────────────────────────────────────────────────────────────────────────────
// Database row structs (derive FromRow for automatic mapping)
// ─────────────────────────────────────────────────────────────────────────────

pub const WALLET_COLUMNS: &str =
    "id, owner_id, currency, balance, status, version, created_at, updated_at";

/// Wallet row from database.
#[derive(FromRow)]
pub struct DbWallet {
    pub id: Uuid,
    pub owner_id: String,
    pub currency: String,
    pub balance: i64,
    pub status: String,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

pub const ENTRY_COLUMNS: &str = "id, wallet_id, sequence, entry_type, amount, currency, \
     balance_before, balance_after, purpose, payment_method, payment_provider, \
     external_transaction_id, status, metadata, created_at";

/// Ledger entry row from database.
#[derive(FromRow)]
pub struct DbLedgerEntry {
    pub id: Uuid,
    pub wallet_id: Uuid,
    pub sequence: i64,
    pub entry_type: String,
    pub amount: i64,
    pub currency: String,
    pub balance_before: i64,
    pub balance_after: i64,
    pub purpose: Option<String>,
    pub payment_method: Option<String>,
    pub payment_provider: Option<String>,
    pub external_transaction_id: Option<String>,
    pub status: String,
    pub metadata: Json<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

pub const INTENT_COLUMNS: &str = "id, provider, method, amount, currency, purpose, status, \
     external_reference, external_transaction_id, payment_url, idempotency_key, payer_ref, \
     purchase_order, metadata, created_at, expires_at, updated_at";

/// Payment intent row from database.
#[derive(FromRow)]
pub struct DbPaymentIntent {
    pub id: Uuid,
    pub provider: String,
    pub method: String,
    pub amount: i64,
    pub currency: String,
    pub purpose: String,
    pub status: String,
    pub external_reference: Option<String>,
    pub external_transaction_id: Option<String>,
    pub payment_url: Option<String>,
    pub idempotency_key: String,
    pub payer_ref: String,
    pub purchase_order: Option<Json<serde_json::Value>>,
    pub metadata: Json<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

pub const SUBSCRIPTION_COLUMNS: &str = "id, subscription_type, owner_ref, target_ref, \
     grant_details, status, start_date, end_date, billing, origin_transaction_id, \
     renewal_history, cancellation, suspension, version, created_at, updated_at";

/// Subscription row from database.
#[derive(FromRow)]
pub struct DbSubscription {
    pub id: Uuid,
    pub subscription_type: String,
    pub owner_ref: String,
    pub target_ref: String,
    pub grant_details: Json<serde_json::Value>,
    pub status: String,
    pub start_date: DateTime<Utc>,
    pub end_date: Option<DateTime<Utc>>,
    pub billing: Json<serde_json::Value>,
    pub origin_transaction_id: Option<String>,
    pub renewal_history: Json<serde_json::Value>,
    pub cancellation: Option<Json<serde_json::Value>>,
    pub suspension: Option<Json<serde_json::Value>>,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Parsing helpers
// ─────────────────────────────────────────────────────────────────────────────

fn corrupt(column: &str, err: impl std::fmt::Display) -> RepoError {
    RepoError::Database(format!("corrupt `{}` column: {}", column, err))
}

fn text<T>(column: &str, value: &str) -> Result<T, RepoError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value.parse().map_err(|e| corrupt(column, e))
}

fn currency(value: &str) -> Result<Currency, RepoError> {
    parse_currency(value).map_err(|e| corrupt("currency", e))
}

fn money(column: &str, minor_units: i64, currency: Currency) -> Result<Money, RepoError> {
    Money::from_minor_units(minor_units, currency).map_err(|e| corrupt(column, e))
}

fn document<T: DeserializeOwned>(column: &str, value: Json<serde_json::Value>) -> Result<T, RepoError> {
    serde_json::from_value(value.0).map_err(|e| corrupt(column, e))
}

/// Encodes a value as a JSON column.
pub fn to_document<T: Serialize>(value: &T) -> Result<Json<serde_json::Value>, RepoError> {
    serde_json::to_value(value)
        .map(Json)
        .map_err(|e| RepoError::Database(format!("cannot encode document: {}", e)))
}

pub fn minor_units(money: &Money) -> Result<i64, RepoError> {
    money.minor_units().map_err(RepoError::from)
}

// ─────────────────────────────────────────────────────────────────────────────
// Domain conversion
// ─────────────────────────────────────────────────────────────────────────────

impl DbWallet {
    /// Convert database row to domain Wallet.
    pub fn into_domain(self) -> Result<Wallet, RepoError> {
        let currency = currency(&self.currency)?;
        Ok(Wallet {
            id: WalletId::from_uuid(self.id),
            owner_id: self.owner_id,
            balance: money("balance", self.balance, currency)?,
            status: text::<WalletStatus>("status", &self.status)?,
            version: self.version,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

impl DbLedgerEntry {
    /// Convert database row to domain LedgerEntry.
    pub fn into_domain(self) -> Result<LedgerEntry, RepoError> {
        let currency = currency(&self.currency)?;
        Ok(LedgerEntry {
            id: LedgerEntryId::from_uuid(self.id),
            wallet_id: WalletId::from_uuid(self.wallet_id),
            sequence: self.sequence,
            entry_type: text::<TransactionType>("entry_type", &self.entry_type)?,
            amount: money("amount", self.amount, currency)?,
            balance_before: money("balance_before", self.balance_before, currency)?,
            balance_after: money("balance_after", self.balance_after, currency)?,
            purpose: self
                .purpose
                .as_deref()
                .map(|p| text::<PaymentPurpose>("purpose", p))
                .transpose()?,
            payment_method: self
                .payment_method
                .as_deref()
                .map(|m| text::<PaymentMethod>("payment_method", m))
                .transpose()?,
            payment_provider: self
                .payment_provider
                .as_deref()
                .map(|p| text::<PaymentProvider>("payment_provider", p))
                .transpose()?,
            external_transaction_id: self.external_transaction_id,
            status: text::<EntryStatus>("status", &self.status)?,
            metadata: self.metadata.0,
            created_at: self.created_at,
        })
    }
}

impl DbPaymentIntent {
    /// Convert database row to domain PaymentIntent.
    pub fn into_domain(self) -> Result<PaymentIntent, RepoError> {
        let currency = currency(&self.currency)?;
        Ok(PaymentIntent {
            id: PaymentIntentId::from_uuid(self.id),
            provider: text::<PaymentProvider>("provider", &self.provider)?,
            method: text::<PaymentMethod>("method", &self.method)?,
            amount: money("amount", self.amount, currency)?,
            purpose: text::<PaymentPurpose>("purpose", &self.purpose)?,
            status: text::<PaymentStatus>("status", &self.status)?,
            external_reference: self.external_reference,
            external_transaction_id: self.external_transaction_id,
            payment_url: self.payment_url,
            idempotency_key: self.idempotency_key,
            payer_ref: self.payer_ref,
            order: self
                .purchase_order
                .map(|o| document::<PurchaseOrder>("purchase_order", o))
                .transpose()?,
            metadata: self.metadata.0,
            created_at: self.created_at,
            expires_at: self.expires_at,
            updated_at: self.updated_at,
        })
    }
}

impl DbSubscription {
    /// Convert database row to domain Subscription.
    pub fn into_domain(self) -> Result<Subscription, RepoError> {
        let grant: SubscriptionGrant = document("grant_details", self.grant_details)?;
        if grant.subscription_type().as_str() != self.subscription_type {
            return Err(corrupt("subscription_type", &self.subscription_type));
        }
        Ok(Subscription {
            id: SubscriptionId::from_uuid(self.id),
            grant,
            status: text::<SubscriptionStatus>("status", &self.status)?,
            start_date: self.start_date,
            end_date: self.end_date,
            billing: document::<Billing>("billing", self.billing)?,
            origin_transaction_id: self.origin_transaction_id,
            renewal_history: document::<Vec<RenewalRecord>>("renewal_history", self.renewal_history)?,
            cancellation: self
                .cancellation
                .map(|c| document::<Cancellation>("cancellation", c))
                .transpose()?,
            suspension: self
                .suspension
                .map(|s| document::<Suspension>("suspension", s))
                .transpose()?,
            version: self.version,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

/// Column values of a subscription, ready to bind.
pub struct SubscriptionDocuments {
    pub grant_details: Json<serde_json::Value>,
    pub billing: Json<serde_json::Value>,
    pub renewal_history: Json<serde_json::Value>,
    pub cancellation: Option<Json<serde_json::Value>>,
    pub suspension: Option<Json<serde_json::Value>>,
}

impl SubscriptionDocuments {
    pub fn encode(sub: &Subscription) -> Result<Self, RepoError> {
        Ok(Self {
            grant_details: to_document(&sub.grant)?,
            billing: to_document(&sub.billing)?,
            renewal_history: to_document(&sub.renewal_history)?,
            cancellation: sub.cancellation.as_ref().map(to_document).transpose()?,
            suspension: sub.suspension.as_ref().map(to_document).transpose()?,
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Migrations
// ─────────────────────────────────────────────────────────────────────────────

/// Splits a migration script into executable statements.
///
/// `--` comments are dropped before splitting on `;`, so prose in a comment
/// never produces a statement fragment.
pub fn migration_statements(sql: &str) -> Vec<String> {
    let mut code = String::with_capacity(sql.len());
    for line in sql.lines() {
        code.push_str(strip_line_comment(line));
        code.push('\n');
    }
    code.split(';')
        .map(str::trim)
        .filter(|stmt| !stmt.is_empty())
        .map(String::from)
        .collect()
}

fn strip_line_comment(line: &str) -> &str {
    let bytes = line.as_bytes();
    let mut in_literal = false;
    for i in 0..bytes.len() {
        match bytes[i] {
            b'\'' => in_literal = !in_literal,
            b'-' if !in_literal && bytes.get(i + 1) == Some(&b'-') => return &line[..i],
            _ => {}
        }
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migration_statements_ignore_comment_punctuation() {
        let sql = "-- wallets; one per owner\n\
                   CREATE TABLE a (id TEXT); -- trailing; note\n\
                   CREATE INDEX b ON a (id);\n";
        let statements = migration_statements(sql);
        assert_eq!(
            statements,
            vec!["CREATE TABLE a (id TEXT)", "CREATE INDEX b ON a (id)"]
        );
    }

    #[test]
    fn test_migration_statements_keep_dashes_in_literals() {
        let statements = migration_statements("INSERT INTO a VALUES ('x--y');");
        assert_eq!(statements, vec!["INSERT INTO a VALUES ('x--y')"]);
    }

    #[test]
    fn test_every_migration_splits_into_sql_statements() {
        let scripts = [
            include_str!("../migrations/0001_create_wallets.sql"),
            include_str!("../migrations/0002_create_payment_intents.sql"),
            include_str!("../migrations/0003_create_subscriptions.sql"),
            include_str!("../migrations/0001_create_wallets_pg.sql"),
            include_str!("../migrations/0002_create_payment_intents_pg.sql"),
            include_str!("../migrations/0003_create_subscriptions_pg.sql"),
        ];
        for script in scripts {
            let statements = migration_statements(script);
            assert!(!statements.is_empty());
            for stmt in statements {
                assert!(
                    stmt.starts_with("CREATE") || stmt.starts_with("ALTER"),
                    "unexpected statement: {}",
                    stmt
                );
            }
        }
    }
}
