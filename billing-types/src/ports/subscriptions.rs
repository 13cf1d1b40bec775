//! Subscription storage port.

use chrono::{DateTime, Utc};

use super::InsertOutcome;
use crate::domain::{Subscription, SubscriptionId};
use crate::error::RepoError;

#[async_trait::async_trait]
pub trait SubscriptionRepository: Send + Sync + 'static {
    /// Inserts a subscription; `origin_transaction_id` is unique, and a
    /// conflict returns the existing subscription.
    async fn insert_subscription(
        &self,
        subscription: Subscription,
    ) -> Result<InsertOutcome<Subscription>, RepoError>;

    async fn get_subscription(&self, id: SubscriptionId)
    -> Result<Option<Subscription>, RepoError>;

    async fn find_subscription_by_origin(
        &self,
        origin_transaction_id: &str,
    ) -> Result<Option<Subscription>, RepoError>;

    /// All subscriptions of an owner, newest first.
    async fn list_subscriptions_for_owner(
        &self,
        owner_ref: &str,
    ) -> Result<Vec<Subscription>, RepoError>;

    /// Writes `subscription` if the stored version still equals
    /// `subscription.version`; returns the stored row with the bumped version.
    ///
    /// A stale version fails with `RepoError::Conflict`.
    async fn update_subscription(
        &self,
        subscription: &Subscription,
    ) -> Result<Subscription, RepoError>;

    /// Rewrites `ACTIVE` subscriptions whose end date has passed to
    /// `EXPIRED`. Returns the number of rows changed.
    async fn expire_lapsed(&self, now: DateTime<Utc>) -> Result<u64, RepoError>;
}
