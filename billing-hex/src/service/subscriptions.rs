//! Subscription lifecycle service.
//!
//! Transitions are decided by [`Subscription`] itself; this service loads,
//! applies and writes back under the row's optimistic version. A write that
//! loses a race is retried once against the fresh row.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use billing_types::{
    AppError, BillingCycle, DomainError, Money, RepoError, Subscription, SubscriptionAction,
    SubscriptionGrant, SubscriptionId, SubscriptionRepository,
};

const MAX_WRITE_ATTEMPTS: usize = 2;

pub struct SubscriptionEngine<R: SubscriptionRepository> {
    repo: Arc<R>,
}

impl<R: SubscriptionRepository> SubscriptionEngine<R> {
    pub fn new(repo: Arc<R>) -> Self {
        Self { repo }
    }

    /// Creates the subscription a payment bought.
    ///
    /// At most one subscription exists per originating transaction; a replay
    /// returns it unchanged.
    #[tracing::instrument(skip(self, grant), fields(owner = grant.owner_ref(), target = grant.target_ref()))]
    pub async fn create_from_payment(
        &self,
        grant: SubscriptionGrant,
        price: Money,
        billing_cycle: BillingCycle,
        origin_transaction_id: Option<String>,
    ) -> Result<Subscription, AppError> {
        if let Some(origin) = &origin_transaction_id {
            if let Some(existing) = self.repo.find_subscription_by_origin(origin).await? {
                tracing::debug!(subscription_id = %existing.id, "Subscription already granted");
                return Ok(existing);
            }
        }

        let subscription = Subscription::from_payment(
            grant,
            price,
            billing_cycle,
            origin_transaction_id,
            Utc::now(),
        )?;

        let outcome = self.repo.insert_subscription(subscription).await?;
        let inserted = outcome.is_inserted();
        let subscription = outcome.into_inner();
        if inserted {
            tracing::info!(
                subscription_id = %subscription.id,
                end_date = ?subscription.end_date,
                "Subscription created"
            );
        }
        Ok(subscription)
    }

    pub async fn get(&self, id: SubscriptionId) -> Result<Subscription, AppError> {
        self.repo
            .get_subscription(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Subscription {}", id)))
    }

    pub async fn list_for_owner(&self, owner_ref: &str) -> Result<Vec<Subscription>, AppError> {
        Ok(self.repo.list_subscriptions_for_owner(owner_ref).await?)
    }

    /// Fails with `IllegalTransition` when `action` is not allowed right now.
    pub async fn check(
        &self,
        id: SubscriptionId,
        action: SubscriptionAction,
    ) -> Result<Subscription, AppError> {
        let subscription = self.get(id).await?;
        subscription.check(action, Utc::now())?;
        Ok(subscription)
    }

    /// Starts a new period from now. A renewal whose transaction id was
    /// already recorded is a no-op.
    #[tracing::instrument(skip(self))]
    pub async fn renew(
        &self,
        id: SubscriptionId,
        amount: Option<Money>,
        transaction_id: Option<String>,
    ) -> Result<Subscription, AppError> {
        self.mutate(id, |subscription, now| {
            subscription.renew(amount, transaction_id.clone(), now)
        })
        .await
    }

    #[tracing::instrument(skip(self))]
    pub async fn cancel(
        &self,
        id: SubscriptionId,
        reason: String,
        cancelled_by: String,
        refund_amount: Option<Money>,
    ) -> Result<Subscription, AppError> {
        self.mutate(id, |subscription, now| {
            subscription
                .cancel(reason.clone(), cancelled_by.clone(), refund_amount, now)
                .map(|_| true)
        })
        .await
    }

    #[tracing::instrument(skip(self))]
    pub async fn suspend(&self, id: SubscriptionId, reason: String) -> Result<Subscription, AppError> {
        self.mutate(id, |subscription, now| {
            subscription.suspend(reason.clone(), now).map(|_| true)
        })
        .await
    }

    #[tracing::instrument(skip(self))]
    pub async fn resume(&self, id: SubscriptionId) -> Result<Subscription, AppError> {
        self.mutate(id, |subscription, now| subscription.resume(now).map(|_| true))
            .await
    }

    /// Persists the expiry of every active subscription whose period ended.
    pub async fn expire_lapsed(&self) -> Result<u64, AppError> {
        let expired = self.repo.expire_lapsed(Utc::now()).await?;
        if expired > 0 {
            tracing::info!(count = expired, "Expired lapsed subscriptions");
        }
        Ok(expired)
    }

    /// Loads, applies `change` and writes back. `change` returns whether it
    /// modified anything; unchanged rows are not written.
    async fn mutate<F>(&self, id: SubscriptionId, mut change: F) -> Result<Subscription, AppError>
    where
        F: FnMut(&mut Subscription, DateTime<Utc>) -> Result<bool, DomainError>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let mut subscription = self.get(id).await?;
            if !change(&mut subscription, Utc::now())? {
                return Ok(subscription);
            }

            match self.repo.update_subscription(&subscription).await {
                Ok(stored) => {
                    tracing::info!(
                        subscription_id = %stored.id,
                        status = %stored.status,
                        version = stored.version,
                        "Subscription updated"
                    );
                    return Ok(stored);
                }
                Err(RepoError::Conflict(reason)) if attempt < MAX_WRITE_ATTEMPTS => {
                    tracing::debug!(subscription_id = %id, %reason, "Stale subscription, retrying");
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}
