//! Billing services.
//!
//! [`BillingService`] is the façade the HTTP adapter and the background
//! workers use. It wires the wallet ledger, the payment gateway and the
//! subscription engine together and owns the flows that span them:
//! settling a completed payment and buying from the wallet balance.

mod gateway;
mod ledger;
mod subscriptions;

use std::sync::Arc;

use serde_json::json;

pub use gateway::{GatewayConfig, PaymentGateway};
pub use ledger::{MAX_PAGE_SIZE, WalletLedger};
pub use subscriptions::SubscriptionEngine;

use billing_types::domain::wallet::validate_owner_id;
use billing_types::ports::SignatureHeaders;
use billing_types::{
    AmountValidator, AppError, BillingRepository, CancelRequest, CreatePaymentLinkRequest,
    Currency, CurrencyLimits, DebitOutcome, DomainError, LedgerEntry, Money, PaymentIntent,
    PaymentIntentId, PaymentProvider, PaymentStatus, PurchaseOrder, PurchaseRequest,
    PurchaseResponse, RatesResponse, RenewRequest, Subscription, SubscriptionAction,
    SubscriptionId, ValidationError, Wallet,
};
use exchange_rates::CurrencyConverter;

use crate::locks::KeyedLocks;
use crate::outbound::providers::ProviderRegistry;

/// Service-wide settings.
#[derive(Debug, Clone)]
pub struct BillingConfig {
    /// Currency new wallets are opened in
    pub default_currency: Currency,
    pub gateway: GatewayConfig,
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            default_currency: Currency::USD,
            gateway: GatewayConfig::default(),
        }
    }
}

/// What settling a completed payment did.
#[derive(Debug, Clone)]
pub struct Settlement {
    /// The wallet credit for the payment
    pub credit: LedgerEntry,
    /// The purchase debit, for purchase intents that could be fulfilled
    pub purchase: Option<LedgerEntry>,
    /// The subscription granted or renewed
    pub subscription: Option<Subscription>,
}

/// Billing service - orchestrates ledger, gateway and subscriptions.
pub struct BillingService<R: BillingRepository> {
    ledger: WalletLedger<R>,
    gateway: PaymentGateway<R>,
    subscriptions: SubscriptionEngine<R>,
    converter: Arc<CurrencyConverter>,
    validator: Arc<AmountValidator>,
    locks: KeyedLocks,
}

impl<R: BillingRepository> BillingService<R> {
    pub fn new(
        repo: R,
        providers: ProviderRegistry,
        converter: Arc<CurrencyConverter>,
        validator: AmountValidator,
        config: BillingConfig,
    ) -> Self {
        let repo = Arc::new(repo);
        let validator = Arc::new(validator);
        Self {
            ledger: WalletLedger::new(repo.clone(), converter.clone(), config.default_currency),
            gateway: PaymentGateway::new(
                repo.clone(),
                providers,
                validator.clone(),
                converter.clone(),
                config.gateway,
            ),
            subscriptions: SubscriptionEngine::new(repo),
            converter,
            validator,
            locks: KeyedLocks::new(),
        }
    }

    pub fn ledger(&self) -> &WalletLedger<R> {
        &self.ledger
    }

    pub fn gateway(&self) -> &PaymentGateway<R> {
        &self.gateway
    }

    pub fn subscriptions(&self) -> &SubscriptionEngine<R> {
        &self.subscriptions
    }

    pub fn converter(&self) -> &CurrencyConverter {
        &self.converter
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Payments
    // ─────────────────────────────────────────────────────────────────────────

    /// Opens a hosted checkout. A renewal link is refused up front when the
    /// subscription can no longer be renewed.
    pub async fn create_payment_link(
        &self,
        req: CreatePaymentLinkRequest,
    ) -> Result<PaymentIntent, AppError> {
        if let Some(PurchaseOrder::Renewal { subscription_id }) = &req.order {
            self.subscriptions
                .check(*subscription_id, SubscriptionAction::Renew)
                .await?;
        }
        self.gateway.create_payment_link(req).await
    }

    /// Verifies a provider notification and settles the payment when it
    /// completed.
    pub async fn handle_notification(
        &self,
        provider: PaymentProvider,
        raw_body: &[u8],
        headers: &SignatureHeaders,
    ) -> Result<PaymentIntent, AppError> {
        let intent = self
            .gateway
            .handle_notification(provider, raw_body, headers)
            .await?;
        self.settle_if_completed(&intent).await?;
        Ok(intent)
    }

    /// Current status of a payment; with `wait`, polls the provider for up to
    /// the configured window first.
    pub async fn payment_status(
        &self,
        provider: PaymentProvider,
        id: PaymentIntentId,
        wait: bool,
    ) -> Result<PaymentIntent, AppError> {
        let intent = if wait {
            let window = self.gateway.config().poll_window;
            self.gateway.poll_until_settled(provider, id, window).await?
        } else {
            self.gateway.query_status(provider, id).await?
        };
        self.settle_if_completed(&intent).await?;
        Ok(intent)
    }

    /// Asks providers about pending intents whose link expired, settling the
    /// ones that completed meanwhile. Returns how many became final.
    pub async fn reconcile_pending(&self, limit: i64) -> Result<usize, AppError> {
        let stale = self.gateway.expired_pending(limit).await?;
        let mut finalized = 0;

        for intent in stale {
            match self.gateway.query_status(intent.provider, intent.id).await {
                Ok(current) if current.status.is_terminal() => {
                    finalized += 1;
                    if let Err(e) = self.settle_if_completed(&current).await {
                        tracing::error!(intent_id = %current.id, error = %e, "Settlement failed");
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(intent_id = %intent.id, error = %e, "Could not reconcile payment");
                }
            }
        }

        if finalized > 0 {
            tracing::info!(count = finalized, "Reconciled expired payments");
        }
        Ok(finalized)
    }

    async fn settle_if_completed(&self, intent: &PaymentIntent) -> Result<(), AppError> {
        if intent.status == PaymentStatus::Completed {
            self.settle(intent).await?;
        }
        Ok(())
    }

    /// Turns a completed payment into money and entitlements.
    ///
    /// 1. credit the payer's wallet with the payment
    /// 2. for purchase intents, debit the same amount
    /// 3. grant or renew the subscription the order names
    ///
    /// Each step is keyed on the intent, so running this again (after a
    /// crash, or from a concurrent notification and poll) repeats nothing.
    /// An order that can no longer be fulfilled leaves the money in the
    /// wallet.
    #[tracing::instrument(skip(self, intent), fields(intent_id = %intent.id, purpose = %intent.purpose))]
    pub async fn settle(&self, intent: &PaymentIntent) -> Result<Settlement, AppError> {
        let _guard = self.locks.lock(&intent.settlement_key()).await;

        let credit = self.ledger.apply_external_payment(intent).await?.into_entry();
        let mut settlement = Settlement {
            credit,
            purchase: None,
            subscription: None,
        };

        if !intent.purpose.is_purchase() {
            return Ok(settlement);
        }
        let Some(order) = &intent.order else {
            tracing::warn!("Purchase payment without an order, leaving funds in wallet");
            return Ok(settlement);
        };

        let wallet_id = settlement.credit.wallet_id;
        let purchase_key = intent.purchase_key();
        let already_debited = self
            .ledger
            .find_by_external_id(wallet_id, &purchase_key)
            .await?
            .is_some();

        if let PurchaseOrder::Renewal { subscription_id } = order {
            if !already_debited {
                if let Err(e) = self
                    .subscriptions
                    .check(*subscription_id, SubscriptionAction::Renew)
                    .await
                {
                    tracing::warn!(error = %e, "Renewal no longer possible, leaving funds in wallet");
                    return Ok(settlement);
                }
            }
        }

        let metadata = json!({ "payment_intent_id": intent.id, "order": order });
        let debit = self
            .ledger
            .debit_once(
                wallet_id,
                settlement.credit.amount,
                Some(intent.purpose),
                &purchase_key,
                metadata,
            )
            .await?;
        let entry = match debit {
            DebitOutcome::Applied { entry } => entry,
            DebitOutcome::InsufficientBalance { available, .. } => {
                tracing::warn!(available = %available, "Wallet cannot cover the purchase");
                return Ok(settlement);
            }
        };

        let origin = intent.settlement_key();
        match self.fulfil(order, &entry, origin, &purchase_key).await {
            Ok(subscription) => {
                settlement.purchase = Some(entry);
                settlement.subscription = Some(subscription);
                Ok(settlement)
            }
            // The debit was refunded; the payment itself stays credited.
            Err(AppError::IllegalTransition { .. } | AppError::Validation(_)) => Ok(settlement),
            Err(e) => Err(e),
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Wallet
    // ─────────────────────────────────────────────────────────────────────────

    pub async fn wallet_for_owner(&self, owner_id: &str) -> Result<Wallet, AppError> {
        self.ledger.wallet_for_owner(owner_id).await
    }

    /// Buys (or renews) from the wallet balance. Replays with the same
    /// reference return the original result.
    #[tracing::instrument(skip(self, req), fields(reference = %req.reference))]
    pub async fn purchase_with_wallet(
        &self,
        owner_id: &str,
        req: PurchaseRequest,
    ) -> Result<PurchaseResponse, AppError> {
        validate_owner_id(owner_id)?;
        if req.reference.trim().is_empty() {
            return Err(ValidationError::Invalid("reference must not be empty".into()).into());
        }
        if let PurchaseOrder::Grant { grant, .. } = &req.order {
            grant.validate()?;
        }
        let price = self.validator.validate(req.amount, req.currency)?;

        let external_id = format!("purchase:{}", req.reference);
        let _guard = self
            .locks
            .lock(&format!("{}:{}", owner_id, external_id))
            .await;

        let wallet = self.ledger.wallet_for_owner(owner_id).await?;
        let charge = price.convert(&self.converter, wallet.currency())?;

        if let PurchaseOrder::Renewal { subscription_id } = &req.order {
            let replay = self
                .ledger
                .find_by_external_id(wallet.id, &external_id)
                .await?
                .is_some();
            if !replay {
                self.subscriptions
                    .check(*subscription_id, SubscriptionAction::Renew)
                    .await?;
            }
        }

        let metadata = json!({ "order": req.order, "price": price });
        let outcome = self
            .ledger
            .debit_once(
                wallet.id,
                charge,
                Some(req.order.purpose()),
                &external_id,
                metadata,
            )
            .await?;
        let entry = match outcome {
            DebitOutcome::Applied { entry } => entry,
            DebitOutcome::InsufficientBalance {
                available,
                requested,
            } => {
                return Ok(PurchaseResponse::InsufficientBalance {
                    available,
                    requested,
                });
            }
        };

        let origin = format!("ledger:{}", entry.id);
        let subscription = self
            .fulfil(&req.order, &entry, origin, &external_id)
            .await?;
        Ok(PurchaseResponse::Completed {
            entry,
            subscription,
        })
    }

    /// Grants or renews what `order` names, paid for by the debit `entry`.
    ///
    /// When a renewal is refused after the debit, the debit is refunded
    /// under `refund_reference` before the error is returned.
    async fn fulfil(
        &self,
        order: &PurchaseOrder,
        entry: &LedgerEntry,
        transaction_id: String,
        refund_reference: &str,
    ) -> Result<Subscription, AppError> {
        match order {
            PurchaseOrder::Grant {
                grant,
                billing_cycle,
            } => {
                self.subscriptions
                    .create_from_payment(
                        grant.clone(),
                        entry.amount,
                        *billing_cycle,
                        Some(transaction_id),
                    )
                    .await
            }
            PurchaseOrder::Renewal { subscription_id } => {
                let renewal = async {
                    let current = self.subscriptions.get(*subscription_id).await?;
                    let paid = entry
                        .amount
                        .convert(&self.converter, current.billing.amount.currency())?;
                    self.subscriptions
                        .renew(*subscription_id, Some(paid), Some(transaction_id))
                        .await
                }
                .await;

                if let Err(e) = &renewal {
                    tracing::warn!(error = %e, "Renewal failed after debit, refunding");
                    self.ledger
                        .refund(
                            entry.wallet_id,
                            entry.amount,
                            refund_reference,
                            json!({ "reason": e.to_string(), "debit_entry_id": entry.id }),
                        )
                        .await?;
                }
                renewal
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Subscriptions
    // ─────────────────────────────────────────────────────────────────────────

    /// Renews with an amount given in the subscription's own currency.
    pub async fn renew_subscription(
        &self,
        id: SubscriptionId,
        req: RenewRequest,
    ) -> Result<Subscription, AppError> {
        let amount = match req.amount {
            Some(amount) => {
                let current = self.subscriptions.get(id).await?;
                Some(Money::new(amount, current.billing.amount.currency())?)
            }
            None => None,
        };
        self.subscriptions
            .renew(id, amount, req.transaction_id)
            .await
    }

    /// Cancels a subscription; a refund amount is paid back to the owner's
    /// wallet once.
    pub async fn cancel_subscription(
        &self,
        id: SubscriptionId,
        req: CancelRequest,
    ) -> Result<Subscription, AppError> {
        let current = self.subscriptions.get(id).await?;
        let reference = format!("subscription:{}:cancel", id);

        // A cancellation whose refund never reached the ledger finishes it.
        if let Some(owed) = current.cancellation.as_ref().and_then(|c| c.refund_amount) {
            let wallet = self.ledger.wallet_for_owner(current.owner_ref()).await?;
            let paid = self
                .ledger
                .find_by_external_id(wallet.id, &format!("refund:{}", reference))
                .await?;
            if paid.is_none() {
                tracing::warn!(subscription_id = %id, "Completing refund of an earlier cancellation");
                self.refund_cancellation(&wallet, owed, &reference, id).await?;
                return Ok(current);
            }
        }

        let refund = req
            .refund_amount
            .map(|amount| Money::new(amount, current.billing.total_paid.currency()))
            .transpose()?;
        let mut refund_to = None;
        if let Some(refund) = refund {
            if refund.is_zero() || refund.amount() > current.billing.total_paid.amount() {
                return Err(ValidationError::Invalid(format!(
                    "refund must be positive and at most {}",
                    current.billing.total_paid
                ))
                .into());
            }
            let wallet = self.ledger.wallet_for_owner(current.owner_ref()).await?;
            if wallet.is_frozen() {
                return Err(DomainError::WalletFrozen(wallet.id).into());
            }
            refund_to = Some((wallet, refund));
        }

        let cancelled = self
            .subscriptions
            .cancel(id, req.reason, req.cancelled_by, refund)
            .await?;

        if let Some((wallet, refund)) = refund_to {
            self.refund_cancellation(&wallet, refund, &reference, id)
                .await?;
        }
        Ok(cancelled)
    }

    async fn refund_cancellation(
        &self,
        wallet: &Wallet,
        refund: Money,
        reference: &str,
        id: SubscriptionId,
    ) -> Result<LedgerEntry, AppError> {
        let amount = refund.convert(&self.converter, wallet.currency())?;
        self.ledger
            .refund(
                wallet.id,
                amount,
                reference,
                json!({ "subscription_id": id }),
            )
            .await
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Reference data
    // ─────────────────────────────────────────────────────────────────────────

    pub fn rates(&self) -> RatesResponse {
        let table = self.converter.snapshot();
        let status = self.converter.refresh_status();
        RatesResponse {
            base: Currency::USD,
            rates: table.rates().clone(),
            updated_at: table.updated_at(),
            last_refresh_success: status.last_success,
            consecutive_refresh_failures: status.consecutive_failures,
        }
    }

    pub fn amount_limits(&self) -> Vec<CurrencyLimits> {
        self.validator
            .all_limits()
            .iter()
            .map(|(currency, limits)| CurrencyLimits {
                currency: *currency,
                symbol: currency.symbol().to_string(),
                min: limits.min,
                max: limits.max,
            })
            .collect()
    }

    /// Rewrites lapsed active subscriptions to expired.
    pub async fn expire_lapsed_subscriptions(&self) -> Result<u64, AppError> {
        self.subscriptions.expire_lapsed().await
    }
}
