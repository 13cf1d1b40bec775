//! Background workers driven by the billing service.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tracing::{error, info, instrument};

use billing_types::BillingRepository;

use crate::BillingService;

/// Periodically persists the expiry of lapsed subscriptions.
///
/// Reads never depend on this: a lapsed subscription already reports
/// itself as expired. The sweep keeps stored status and queries honest.
pub struct ExpirySweeper<R: BillingRepository> {
    service: Arc<BillingService<R>>,
    interval: Duration,
}

impl<R: BillingRepository> ExpirySweeper<R> {
    pub fn new(service: Arc<BillingService<R>>, interval: Duration) -> Self {
        Self { service, interval }
    }

    #[instrument(skip(self), fields(interval_secs = self.interval.as_secs()))]
    pub async fn run(self) {
        info!("Starting subscription expiry sweeper");
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(e) = self.service.expire_lapsed_subscriptions().await {
                error!(error = %e, "Subscription expiry sweep failed");
            }
        }
    }
}

/// Periodically asks providers about pending payments whose link expired.
///
/// A payer may finish a checkout just as the link lapses, so stale intents
/// are resolved from the provider's answer rather than assumed failed.
pub struct PendingReconciler<R: BillingRepository> {
    service: Arc<BillingService<R>>,
    interval: Duration,
    batch_size: i64,
}

impl<R: BillingRepository> PendingReconciler<R> {
    pub fn new(service: Arc<BillingService<R>>, interval: Duration, batch_size: i64) -> Self {
        Self {
            service,
            interval,
            batch_size,
        }
    }

    #[instrument(skip(self), fields(interval_secs = self.interval.as_secs(), batch_size = self.batch_size))]
    pub async fn run(self) {
        info!("Starting pending payment reconciler");
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(e) = self.service.reconcile_pending(self.batch_size).await {
                error!(error = %e, "Failed to reconcile pending payments");
            }
        }
    }
}
