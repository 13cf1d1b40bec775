//! Payment intent storage port.

use chrono::{DateTime, Utc};

use super::InsertOutcome;
use crate::domain::{PaymentIntent, PaymentIntentId, PaymentProvider, PaymentStatus};
use crate::error::RepoError;

#[async_trait::async_trait]
pub trait PaymentIntentRepository: Send + Sync + 'static {
    /// Inserts a new intent; the idempotency key is unique, and a conflict
    /// returns the intent that won.
    async fn insert_intent(
        &self,
        intent: PaymentIntent,
    ) -> Result<InsertOutcome<PaymentIntent>, RepoError>;

    async fn get_intent(&self, id: PaymentIntentId) -> Result<Option<PaymentIntent>, RepoError>;

    async fn find_intent_by_key(
        &self,
        idempotency_key: &str,
    ) -> Result<Option<PaymentIntent>, RepoError>;

    async fn find_intent_by_external_reference(
        &self,
        provider: PaymentProvider,
        external_reference: &str,
    ) -> Result<Option<PaymentIntent>, RepoError>;

    /// Moves a pending intent to a terminal status.
    ///
    /// Conditional on the stored status still being `PENDING`; returns
    /// `false` when another writer got there first.
    async fn advance_intent(
        &self,
        id: PaymentIntentId,
        status: PaymentStatus,
        external_transaction_id: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<bool, RepoError>;

    /// Pending intents whose `expires_at` is before `now`, oldest first.
    async fn list_expired_pending(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<PaymentIntent>, RepoError>;
}
