//! BillingService unit tests.

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    use billing_types::domain::{BalanceStep, PaymentPurpose, SubscriptionGrant, WalletId};
    use billing_types::{
        AmountValidator, AppError, AppendOutcome, BillingCycle, CancelRequest,
        CreatePaymentLinkRequest, Currency, InsertOutcome, LedgerEntry, LedgerRepository, Money,
        NewLedgerEntry, PaymentIntent, PaymentIntentId, PaymentIntentRepository, PaymentMethod,
        PaymentProvider, PaymentStatus, ProviderError, PurchaseOrder, PurchaseRequest,
        PurchaseResponse, RenewRequest, RepoError, Subscription, SubscriptionId,
        SubscriptionRepository, SubscriptionStatus, ValidationError, VerificationError, Wallet,
        WalletStatus,
    };
    use exchange_rates::CurrencyConverter;

    use crate::outbound::providers::{ProviderRegistry, SandboxProvider};
    use crate::{BillingConfig, BillingService, GatewayConfig};

    /// Simple in-memory repository for testing the service layer.
    #[derive(Default)]
    pub struct MockRepo {
        wallets: Mutex<HashMap<WalletId, Wallet>>,
        entries: Mutex<Vec<LedgerEntry>>,
        intents: Mutex<HashMap<PaymentIntentId, PaymentIntent>>,
        subscriptions: Mutex<HashMap<SubscriptionId, Subscription>>,
    }

    impl MockRepo {
        pub fn new() -> Self {
            Self::default()
        }
    }

    #[async_trait]
    impl LedgerRepository for MockRepo {
        async fn get_or_create_wallet(
            &self,
            owner_id: &str,
            currency: Currency,
            now: DateTime<Utc>,
        ) -> Result<Wallet, RepoError> {
            let mut wallets = self.wallets.lock().unwrap();
            if let Some(wallet) = wallets.values().find(|w| w.owner_id == owner_id) {
                return Ok(wallet.clone());
            }
            let wallet = Wallet::open(owner_id.to_string(), currency, now)?;
            wallets.insert(wallet.id, wallet.clone());
            Ok(wallet)
        }

        async fn get_wallet(&self, id: WalletId) -> Result<Option<Wallet>, RepoError> {
            Ok(self.wallets.lock().unwrap().get(&id).cloned())
        }

        async fn find_wallet_by_owner(&self, owner_id: &str) -> Result<Option<Wallet>, RepoError> {
            Ok(self
                .wallets
                .lock()
                .unwrap()
                .values()
                .find(|w| w.owner_id == owner_id)
                .cloned())
        }

        async fn set_wallet_status(
            &self,
            id: WalletId,
            status: WalletStatus,
            now: DateTime<Utc>,
        ) -> Result<Wallet, RepoError> {
            let mut wallets = self.wallets.lock().unwrap();
            let wallet = wallets.get_mut(&id).ok_or(RepoError::NotFound)?;
            wallet.status = status;
            wallet.updated_at = now;
            Ok(wallet.clone())
        }

        async fn append(
            &self,
            entry: NewLedgerEntry,
            now: DateTime<Utc>,
        ) -> Result<AppendOutcome, RepoError> {
            let mut wallets = self.wallets.lock().unwrap();
            let mut entries = self.entries.lock().unwrap();
            let wallet = wallets
                .get_mut(&entry.wallet_id)
                .ok_or(RepoError::NotFound)?;

            if let Some(external_id) = &entry.external_transaction_id {
                let existing = entries.iter().find(|e| {
                    e.wallet_id == entry.wallet_id
                        && e.external_transaction_id.as_ref() == Some(external_id)
                });
                if let Some(existing) = existing {
                    return Ok(AppendOutcome::Duplicate(existing.clone()));
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
            let stored = entry.into_entry(sequence, before, after, now);
            wallet.balance = after;
            wallet.version = sequence;
            wallet.updated_at = now;
            entries.push(stored.clone());
            Ok(AppendOutcome::Appended(stored))
        }

        async fn find_entry_by_external_id(
            &self,
            wallet_id: WalletId,
            external_transaction_id: &str,
        ) -> Result<Option<LedgerEntry>, RepoError> {
            Ok(self
                .entries
                .lock()
                .unwrap()
                .iter()
                .find(|e| {
                    e.wallet_id == wallet_id
                        && e.external_transaction_id.as_deref() == Some(external_transaction_id)
                })
                .cloned())
        }

        async fn list_entries(
            &self,
            wallet_id: WalletId,
            offset: i64,
            limit: i64,
        ) -> Result<Vec<LedgerEntry>, RepoError> {
            let mut entries: Vec<_> = self
                .entries
                .lock()
                .unwrap()
                .iter()
                .filter(|e| e.wallet_id == wallet_id)
                .cloned()
                .collect();
            entries.sort_by(|a, b| b.sequence.cmp(&a.sequence));
            Ok(entries
                .into_iter()
                .skip(offset as usize)
                .take(limit as usize)
                .collect())
        }
    }

    #[async_trait]
    impl PaymentIntentRepository for MockRepo {
        async fn insert_intent(
            &self,
            intent: PaymentIntent,
        ) -> Result<InsertOutcome<PaymentIntent>, RepoError> {
            let mut intents = self.intents.lock().unwrap();
            if let Some(existing) = intents
                .values()
                .find(|i| i.idempotency_key == intent.idempotency_key)
            {
                return Ok(InsertOutcome::Existing(existing.clone()));
            }
            intents.insert(intent.id, intent.clone());
            Ok(InsertOutcome::Inserted(intent))
        }

        async fn get_intent(&self, id: PaymentIntentId) -> Result<Option<PaymentIntent>, RepoError> {
            Ok(self.intents.lock().unwrap().get(&id).cloned())
        }

        async fn find_intent_by_key(
            &self,
            idempotency_key: &str,
        ) -> Result<Option<PaymentIntent>, RepoError> {
            Ok(self
                .intents
                .lock()
                .unwrap()
                .values()
                .find(|i| i.idempotency_key == idempotency_key)
                .cloned())
        }

        async fn find_intent_by_external_reference(
            &self,
            provider: PaymentProvider,
            external_reference: &str,
        ) -> Result<Option<PaymentIntent>, RepoError> {
            Ok(self
                .intents
                .lock()
                .unwrap()
                .values()
                .find(|i| {
                    i.provider == provider
                        && i.external_reference.as_deref() == Some(external_reference)
                })
                .cloned())
        }

        async fn advance_intent(
            &self,
            id: PaymentIntentId,
            status: PaymentStatus,
            external_transaction_id: Option<String>,
            now: DateTime<Utc>,
        ) -> Result<bool, RepoError> {
            let mut intents = self.intents.lock().unwrap();
            let intent = intents.get_mut(&id).ok_or(RepoError::NotFound)?;
            if !intent.status.can_advance_to(status) {
                return Ok(false);
            }
            intent.status = status;
            if external_transaction_id.is_some() {
                intent.external_transaction_id = external_transaction_id;
            }
            intent.updated_at = now;
            Ok(true)
        }

        async fn list_expired_pending(
            &self,
            now: DateTime<Utc>,
            limit: i64,
        ) -> Result<Vec<PaymentIntent>, RepoError> {
            let mut expired: Vec<_> = self
                .intents
                .lock()
                .unwrap()
                .values()
                .filter(|i| i.is_expired(now))
                .cloned()
                .collect();
            expired.sort_by_key(|i| i.created_at);
            expired.truncate(limit as usize);
            Ok(expired)
        }
    }

    #[async_trait]
    impl SubscriptionRepository for MockRepo {
        async fn insert_subscription(
            &self,
            subscription: Subscription,
        ) -> Result<InsertOutcome<Subscription>, RepoError> {
            let mut subscriptions = self.subscriptions.lock().unwrap();
            if let Some(origin) = &subscription.origin_transaction_id {
                if let Some(existing) = subscriptions
                    .values()
                    .find(|s| s.origin_transaction_id.as_ref() == Some(origin))
                {
                    return Ok(InsertOutcome::Existing(existing.clone()));
                }
            }
            subscriptions.insert(subscription.id, subscription.clone());
            Ok(InsertOutcome::Inserted(subscription))
        }

        async fn get_subscription(
            &self,
            id: SubscriptionId,
        ) -> Result<Option<Subscription>, RepoError> {
            Ok(self.subscriptions.lock().unwrap().get(&id).cloned())
        }

        async fn find_subscription_by_origin(
            &self,
            origin_transaction_id: &str,
        ) -> Result<Option<Subscription>, RepoError> {
            Ok(self
                .subscriptions
                .lock()
                .unwrap()
                .values()
                .find(|s| s.origin_transaction_id.as_deref() == Some(origin_transaction_id))
                .cloned())
        }

        async fn list_subscriptions_for_owner(
            &self,
            owner_ref: &str,
        ) -> Result<Vec<Subscription>, RepoError> {
            let mut owned: Vec<_> = self
                .subscriptions
                .lock()
                .unwrap()
                .values()
                .filter(|s| s.owner_ref() == owner_ref)
                .cloned()
                .collect();
            owned.sort_by(|a, b| b.created_at.cmp(&a.created_at));
            Ok(owned)
        }

        async fn update_subscription(
            &self,
            subscription: &Subscription,
        ) -> Result<Subscription, RepoError> {
            let mut subscriptions = self.subscriptions.lock().unwrap();
            let stored = subscriptions
                .get_mut(&subscription.id)
                .ok_or(RepoError::NotFound)?;
            if stored.version != subscription.version {
                return Err(RepoError::Conflict("stale subscription".into()));
            }
            *stored = subscription.clone();
            stored.version += 1;
            Ok(stored.clone())
        }

        async fn expire_lapsed(&self, now: DateTime<Utc>) -> Result<u64, RepoError> {
            let mut expired = 0;
            for subscription in self.subscriptions.lock().unwrap().values_mut() {
                if subscription.has_lapsed(now) {
                    subscription.status = SubscriptionStatus::Expired;
                    subscription.version += 1;
                    expired += 1;
                }
            }
            Ok(expired)
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Helpers
    // ─────────────────────────────────────────────────────────────────────────

    fn service_with(sandbox: Arc<SandboxProvider>, gateway: GatewayConfig) -> BillingService<MockRepo> {
        BillingService::new(
            MockRepo::new(),
            ProviderRegistry::new().with(sandbox),
            Arc::new(CurrencyConverter::with_defaults()),
            AmountValidator::new(),
            BillingConfig {
                default_currency: Currency::USD,
                gateway,
            },
        )
    }

    fn setup() -> (BillingService<MockRepo>, Arc<SandboxProvider>) {
        let sandbox = Arc::new(SandboxProvider::new("whsec_test"));
        (service_with(sandbox.clone(), GatewayConfig::default()), sandbox)
    }

    fn usd(amount: Decimal) -> Money {
        Money::new(amount, Currency::USD).unwrap()
    }

    fn top_up(amount: Decimal, payer: &str) -> CreatePaymentLinkRequest {
        CreatePaymentLinkRequest {
            amount,
            currency: Currency::USD,
            provider: PaymentProvider::Sandbox,
            method: PaymentMethod::Card,
            purpose: PaymentPurpose::WalletCredit,
            payer_ref: payer.into(),
            order: None,
            nonce: None,
            metadata: None,
        }
    }

    fn plan_order(user: &str) -> PurchaseOrder {
        PurchaseOrder::Grant {
            grant: SubscriptionGrant::UserPlan {
                user_id: user.into(),
                plan_id: "pro".into(),
            },
            billing_cycle: BillingCycle::Monthly,
        }
    }

    fn purchase(order: PurchaseOrder, amount: Decimal, reference: &str) -> PurchaseRequest {
        PurchaseRequest {
            order,
            amount,
            currency: Currency::USD,
            reference: reference.into(),
        }
    }

    async fn fund(service: &BillingService<MockRepo>, owner: &str, amount: Decimal) -> Wallet {
        let wallet = service.wallet_for_owner(owner).await.unwrap();
        service
            .ledger()
            .credit(wallet.id, usd(amount), None, serde_json::json!({}))
            .await
            .unwrap();
        service.wallet_for_owner(owner).await.unwrap()
    }

    async fn pay(
        service: &BillingService<MockRepo>,
        sandbox: &SandboxProvider,
        intent: &PaymentIntent,
    ) -> PaymentIntent {
        let session = intent.external_reference.as_deref().unwrap();
        let notification = sandbox.settle(session, PaymentStatus::Completed).unwrap();
        service
            .handle_notification(
                PaymentProvider::Sandbox,
                &notification.body,
                &notification.headers(),
            )
            .await
            .unwrap()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Payment links
    // ─────────────────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_payment_link_is_idempotent() {
        let (service, sandbox) = setup();

        let first = service.create_payment_link(top_up(dec!(50), "user_1")).await.unwrap();
        let second = service.create_payment_link(top_up(dec!(50), "user_1")).await.unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(first.status, PaymentStatus::Pending);
        assert!(first.payment_url.is_some());
        assert_eq!(sandbox.checkouts_created(), 1);

        let mut repeat = top_up(dec!(50), "user_1");
        repeat.nonce = Some("second-top-up".into());
        let third = service.create_payment_link(repeat).await.unwrap();
        assert_ne!(first.id, third.id);
        assert_eq!(sandbox.checkouts_created(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_payment_links_open_one_checkout() {
        let (service, sandbox) = setup();

        let (a, b) = tokio::join!(
            service.create_payment_link(top_up(dec!(75), "user_1")),
            service.create_payment_link(top_up(dec!(75), "user_1")),
        );

        assert_eq!(a.unwrap().id, b.unwrap().id);
        assert_eq!(sandbox.checkouts_created(), 1);
    }

    #[tokio::test]
    async fn test_payment_link_converts_to_provider_currency() {
        let sandbox = Arc::new(SandboxProvider::new("whsec_test").with_currencies(vec![Currency::EGP]));
        let service = service_with(sandbox.clone(), GatewayConfig::default());

        let intent = service.create_payment_link(top_up(dec!(100), "user_1")).await.unwrap();

        assert_eq!(intent.amount, Money::new(dec!(4860), Currency::EGP).unwrap());
        assert_eq!(intent.metadata["requested"]["currency"], "USD");
    }

    #[tokio::test]
    async fn test_payment_link_rejects_out_of_range_amount() {
        let (service, sandbox) = setup();

        let result = service.create_payment_link(top_up(dec!(0.50), "user_1")).await;

        assert!(matches!(result, Err(AppError::Validation(_))));
        assert_eq!(sandbox.checkouts_created(), 0);
    }

    #[tokio::test]
    async fn test_purchase_link_requires_order() {
        let (service, _) = setup();
        let mut req = top_up(dec!(20), "user_1");
        req.purpose = PaymentPurpose::CoursePurchase;

        let result = service.create_payment_link(req).await;

        assert!(matches!(
            result,
            Err(AppError::Validation(ValidationError::Invalid(_)))
        ));
    }

    #[tokio::test]
    async fn test_retryable_provider_failure_leaves_no_intent() {
        let (service, sandbox) = setup();
        sandbox.fail_next_checkout(ProviderError::Network("connection reset".into()));

        let err = service
            .create_payment_link(top_up(dec!(30), "user_1"))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Provider(ref e) if e.is_retryable()));

        let retried = service.create_payment_link(top_up(dec!(30), "user_1")).await.unwrap();
        assert_eq!(retried.status, PaymentStatus::Pending);
        assert_eq!(sandbox.checkouts_created(), 1);
    }

    #[tokio::test]
    async fn test_slow_provider_times_out() {
        let sandbox = Arc::new(SandboxProvider::new("whsec_test").with_latency(Duration::from_millis(300)));
        let service = service_with(
            sandbox,
            GatewayConfig {
                provider_timeout: Duration::from_millis(50),
                ..GatewayConfig::default()
            },
        );

        let result = service.create_payment_link(top_up(dec!(30), "user_1")).await;

        assert!(matches!(
            result,
            Err(AppError::Provider(ProviderError::Timeout(_)))
        ));
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Notifications and settlement
    // ─────────────────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_completed_notification_credits_wallet_once() {
        let (service, sandbox) = setup();
        let intent = service.create_payment_link(top_up(dec!(50), "user_1")).await.unwrap();

        let session = intent.external_reference.as_deref().unwrap();
        let notification = sandbox.settle(session, PaymentStatus::Completed).unwrap();
        for _ in 0..3 {
            let settled = service
                .handle_notification(
                    PaymentProvider::Sandbox,
                    &notification.body,
                    &notification.headers(),
                )
                .await
                .unwrap();
            assert_eq!(settled.status, PaymentStatus::Completed);
            assert!(settled.external_transaction_id.is_some());
        }

        let wallet = service.wallet_for_owner("user_1").await.unwrap();
        assert_eq!(wallet.balance, usd(dec!(50)));
        let page = service.ledger().history(wallet.id, None, None).await.unwrap();
        assert_eq!(page.entries.len(), 1);
        assert_eq!(
            page.entries[0].external_transaction_id,
            Some(intent.settlement_key())
        );
    }

    #[tokio::test]
    async fn test_tampered_notification_changes_nothing() {
        let (service, sandbox) = setup();
        let intent = service.create_payment_link(top_up(dec!(50), "user_1")).await.unwrap();
        let session = intent.external_reference.as_deref().unwrap();
        let notification = sandbox.settle(session, PaymentStatus::Completed).unwrap();

        let mut tampered = notification.body.clone();
        tampered.extend_from_slice(b" ");
        let result = service
            .handle_notification(PaymentProvider::Sandbox, &tampered, &notification.headers())
            .await;

        assert!(matches!(
            result,
            Err(AppError::Verification(VerificationError::SignatureMismatch))
        ));
        let stored = service.gateway().get(intent.id).await.unwrap();
        assert_eq!(stored.status, PaymentStatus::Pending);
        let wallet = service.wallet_for_owner("user_1").await.unwrap();
        assert!(wallet.balance.is_zero());
    }

    #[tokio::test]
    async fn test_notification_with_wrong_amount_is_rejected() {
        let (service, sandbox) = setup();
        let intent = service.create_payment_link(top_up(dec!(50), "user_1")).await.unwrap();
        let session = intent.external_reference.as_deref().unwrap();

        let forged = sandbox.notification(session, PaymentStatus::Completed, usd(dec!(5)));
        let result = service
            .handle_notification(PaymentProvider::Sandbox, &forged.body, &forged.headers())
            .await;

        assert!(matches!(
            result,
            Err(AppError::Verification(VerificationError::AmountMismatch { .. }))
        ));
        let stored = service.gateway().get(intent.id).await.unwrap();
        assert_eq!(stored.status, PaymentStatus::Pending);
    }

    #[tokio::test]
    async fn test_failed_payment_moves_no_money() {
        let (service, sandbox) = setup();
        let intent = service.create_payment_link(top_up(dec!(50), "user_1")).await.unwrap();
        let session = intent.external_reference.as_deref().unwrap();

        let notification = sandbox.settle(session, PaymentStatus::Failed).unwrap();
        let failed = service
            .handle_notification(
                PaymentProvider::Sandbox,
                &notification.body,
                &notification.headers(),
            )
            .await
            .unwrap();

        assert_eq!(failed.status, PaymentStatus::Failed);
        let wallet = service.wallet_for_owner("user_1").await.unwrap();
        assert!(wallet.balance.is_zero());
    }

    #[tokio::test]
    async fn test_course_purchase_payment_grants_subscription() {
        let (service, sandbox) = setup();
        let mut req = top_up(dec!(25), "user_1");
        req.purpose = PaymentPurpose::CoursePurchase;
        req.order = Some(PurchaseOrder::Grant {
            grant: SubscriptionGrant::UserCourse {
                user_id: "user_1".into(),
                course_id: "rust-101".into(),
            },
            billing_cycle: BillingCycle::OneTime,
        });
        let intent = service.create_payment_link(req).await.unwrap();

        let paid = pay(&service, &sandbox, &intent).await;
        // Settling again from a status poll must not grant a second time.
        let settlement = service.settle(&paid).await.unwrap();

        let wallet = service.wallet_for_owner("user_1").await.unwrap();
        assert!(wallet.balance.is_zero());
        let subscriptions = service.subscriptions().list_for_owner("user_1").await.unwrap();
        assert_eq!(subscriptions.len(), 1);
        let subscription = &subscriptions[0];
        assert_eq!(subscription.status, SubscriptionStatus::Active);
        assert_eq!(subscription.end_date, None);
        assert_eq!(
            subscription.origin_transaction_id,
            Some(intent.settlement_key())
        );
        assert_eq!(settlement.subscription.map(|s| s.id), Some(subscription.id));

        let page = service.ledger().history(wallet.id, None, None).await.unwrap();
        assert_eq!(page.entries.len(), 2);
    }

    fn renewal_link(subscription_id: SubscriptionId) -> CreatePaymentLinkRequest {
        let mut req = top_up(dec!(20), "user_1");
        req.purpose = PaymentPurpose::SubscriptionRenewal;
        req.order = Some(PurchaseOrder::Renewal { subscription_id });
        req
    }

    fn plain_cancel() -> CancelRequest {
        CancelRequest {
            reason: "moving on".into(),
            cancelled_by: "user_1".into(),
            refund_amount: None,
        }
    }

    #[tokio::test]
    async fn test_renewal_payment_for_cancelled_subscription_stays_in_wallet() {
        let (service, sandbox) = setup();
        fund(&service, "user_1", dec!(20)).await;
        let PurchaseResponse::Completed { subscription, .. } = service
            .purchase_with_wallet("user_1", purchase(plan_order("user_1"), dec!(20), "p-1"))
            .await
            .unwrap()
        else {
            panic!("expected a completed purchase");
        };

        // The link is opened while renewal is still allowed.
        let intent = service
            .create_payment_link(renewal_link(subscription.id))
            .await
            .unwrap();
        service
            .cancel_subscription(subscription.id, plain_cancel())
            .await
            .unwrap();
        let paid = pay(&service, &sandbox, &intent).await;
        assert_eq!(paid.status, PaymentStatus::Completed);

        let wallet = service.wallet_for_owner("user_1").await.unwrap();
        assert_eq!(wallet.balance, usd(dec!(20)));
        let stored = service.subscriptions().get(subscription.id).await.unwrap();
        assert_eq!(stored.status, SubscriptionStatus::Cancelled);
        assert!(stored.renewal_history.is_empty());
    }

    #[tokio::test]
    async fn test_renewal_link_for_cancelled_subscription_is_refused() {
        let (service, sandbox) = setup();
        fund(&service, "user_1", dec!(20)).await;
        let PurchaseResponse::Completed { subscription, .. } = service
            .purchase_with_wallet("user_1", purchase(plan_order("user_1"), dec!(20), "p-1"))
            .await
            .unwrap()
        else {
            panic!("expected a completed purchase");
        };
        service
            .cancel_subscription(subscription.id, plain_cancel())
            .await
            .unwrap();

        let result = service.create_payment_link(renewal_link(subscription.id)).await;

        assert!(matches!(result, Err(AppError::IllegalTransition { .. })));
        assert_eq!(sandbox.checkouts_created(), 0);
    }

    #[tokio::test]
    async fn test_renewal_link_for_unknown_subscription_is_not_found() {
        let (service, _) = setup();
        let result = service
            .create_payment_link(renewal_link(SubscriptionId::new()))
            .await;
        assert!(matches!(result, Err(AppError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_status_poll_settles_completed_payment() {
        let (service, sandbox) = setup();
        let intent = service.create_payment_link(top_up(dec!(40), "user_1")).await.unwrap();
        sandbox
            .settle(intent.external_reference.as_deref().unwrap(), PaymentStatus::Completed)
            .unwrap();

        let polled = service
            .payment_status(PaymentProvider::Sandbox, intent.id, false)
            .await
            .unwrap();

        assert_eq!(polled.status, PaymentStatus::Completed);
        let wallet = service.wallet_for_owner("user_1").await.unwrap();
        assert_eq!(wallet.balance, usd(dec!(40)));
    }

    #[tokio::test]
    async fn test_reconcile_resolves_expired_intents() {
        let sandbox = Arc::new(SandboxProvider::new("whsec_test"));
        let service = service_with(
            sandbox.clone(),
            GatewayConfig {
                intent_ttl: chrono::Duration::milliseconds(1),
                ..GatewayConfig::default()
            },
        );
        let paid = service.create_payment_link(top_up(dec!(60), "user_1")).await.unwrap();
        let open = service.create_payment_link(top_up(dec!(10), "user_2")).await.unwrap();
        sandbox
            .settle(paid.external_reference.as_deref().unwrap(), PaymentStatus::Completed)
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let finalized = service.reconcile_pending(10).await.unwrap();

        assert_eq!(finalized, 1);
        let wallet = service.wallet_for_owner("user_1").await.unwrap();
        assert_eq!(wallet.balance, usd(dec!(60)));
        let still_open = service.gateway().get(open.id).await.unwrap();
        assert_eq!(still_open.status, PaymentStatus::Pending);
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Wallet purchases
    // ─────────────────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_purchase_with_empty_wallet_reports_shortfall() {
        let (service, _) = setup();

        let response = service
            .purchase_with_wallet("user_1", purchase(plan_order("user_1"), dec!(100), "p-1"))
            .await
            .unwrap();

        match response {
            PurchaseResponse::InsufficientBalance {
                available,
                requested,
            } => {
                assert!(available.is_zero());
                assert_eq!(requested, usd(dec!(100)));
            }
            other => panic!("expected insufficient balance, got {:?}", other),
        }
        let subscriptions = service.subscriptions().list_for_owner("user_1").await.unwrap();
        assert!(subscriptions.is_empty());
    }

    #[tokio::test]
    async fn test_purchase_replay_debits_once() {
        let (service, _) = setup();
        fund(&service, "user_1", dec!(100)).await;

        let first = service
            .purchase_with_wallet("user_1", purchase(plan_order("user_1"), dec!(30), "p-1"))
            .await
            .unwrap();
        let replay = service
            .purchase_with_wallet("user_1", purchase(plan_order("user_1"), dec!(30), "p-1"))
            .await
            .unwrap();

        let (
            PurchaseResponse::Completed {
                entry: first_entry,
                subscription: first_sub,
            },
            PurchaseResponse::Completed {
                entry: replay_entry,
                subscription: replay_sub,
            },
        ) = (first, replay)
        else {
            panic!("expected completed purchases");
        };
        assert_eq!(first_entry.id, replay_entry.id);
        assert_eq!(first_sub.id, replay_sub.id);
        assert_eq!(first_entry.balance_after, usd(dec!(70)));

        let wallet = service.wallet_for_owner("user_1").await.unwrap();
        assert_eq!(wallet.balance, usd(dec!(70)));
    }

    #[tokio::test]
    async fn test_purchase_from_frozen_wallet_is_refused() {
        let (service, _) = setup();
        let wallet = fund(&service, "user_1", dec!(100)).await;
        service.ledger().freeze(wallet.id).await.unwrap();

        let result = service
            .purchase_with_wallet("user_1", purchase(plan_order("user_1"), dec!(30), "p-1"))
            .await;

        assert!(matches!(result, Err(AppError::Conflict(_))));
        service.ledger().unfreeze(wallet.id).await.unwrap();
        let wallet = service.wallet_for_owner("user_1").await.unwrap();
        assert_eq!(wallet.balance, usd(dec!(100)));
    }

    #[tokio::test]
    async fn test_wallet_renewal_of_cancelled_subscription_is_refused() {
        let (service, _) = setup();
        fund(&service, "user_1", dec!(100)).await;
        let PurchaseResponse::Completed { subscription, .. } = service
            .purchase_with_wallet("user_1", purchase(plan_order("user_1"), dec!(30), "p-1"))
            .await
            .unwrap()
        else {
            panic!("expected a completed purchase");
        };
        service
            .cancel_subscription(
                subscription.id,
                CancelRequest {
                    reason: "switching plans".into(),
                    cancelled_by: "admin".into(),
                    refund_amount: None,
                },
            )
            .await
            .unwrap();

        let renewal = PurchaseOrder::Renewal {
            subscription_id: subscription.id,
        };
        let result = service
            .purchase_with_wallet("user_1", purchase(renewal, dec!(30), "p-2"))
            .await;

        assert!(matches!(
            result,
            Err(AppError::IllegalTransition {
                from: SubscriptionStatus::Cancelled,
                ..
            })
        ));
        let wallet = service.wallet_for_owner("user_1").await.unwrap();
        assert_eq!(wallet.balance, usd(dec!(70)));
    }

    #[tokio::test]
    async fn test_wallet_renewal_extends_subscription() {
        let (service, _) = setup();
        fund(&service, "user_1", dec!(100)).await;
        let PurchaseResponse::Completed { subscription, .. } = service
            .purchase_with_wallet("user_1", purchase(plan_order("user_1"), dec!(30), "p-1"))
            .await
            .unwrap()
        else {
            panic!("expected a completed purchase");
        };

        let renewal = PurchaseOrder::Renewal {
            subscription_id: subscription.id,
        };
        let response = service
            .purchase_with_wallet("user_1", purchase(renewal, dec!(30), "p-2"))
            .await
            .unwrap();

        let PurchaseResponse::Completed {
            subscription: renewed,
            ..
        } = response
        else {
            panic!("expected a completed renewal");
        };
        assert_eq!(renewed.id, subscription.id);
        assert_eq!(renewed.renewal_history.len(), 1);
        assert_eq!(renewed.billing.total_paid, usd(dec!(60)));
    }

    #[tokio::test]
    async fn test_withdrawal_fails_closed_and_applies_once() {
        use billing_types::{DebitOutcome, TransactionType};

        let (service, _) = setup();
        let wallet = fund(&service, "user_1", dec!(40)).await;
        let ledger = service.ledger();

        let refused = ledger
            .withdraw(wallet.id, usd(dec!(50)), "payout-1", serde_json::json!({}))
            .await
            .unwrap();
        assert!(matches!(refused, DebitOutcome::InsufficientBalance { .. }));

        let first = ledger
            .withdraw(wallet.id, usd(dec!(25)), "payout-2", serde_json::json!({}))
            .await
            .unwrap();
        let replay = ledger
            .withdraw(wallet.id, usd(dec!(25)), "payout-2", serde_json::json!({}))
            .await
            .unwrap();
        let (Some(first), Some(replay)) = (first.entry(), replay.entry()) else {
            panic!("withdrawal was refused");
        };
        assert_eq!(first.id, replay.id);
        assert_eq!(first.entry_type, TransactionType::Withdrawal);

        let wallet = service.wallet_for_owner("user_1").await.unwrap();
        assert_eq!(wallet.balance, usd(dec!(15)));

        let blank = ledger
            .withdraw(wallet.id, usd(dec!(1)), " ", serde_json::json!({}))
            .await;
        assert!(matches!(blank, Err(AppError::Validation(_))));
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Subscriptions
    // ─────────────────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_renewal_with_same_transaction_applies_once() {
        let (service, _) = setup();
        fund(&service, "user_1", dec!(100)).await;
        let PurchaseResponse::Completed { subscription, .. } = service
            .purchase_with_wallet("user_1", purchase(plan_order("user_1"), dec!(30), "p-1"))
            .await
            .unwrap()
        else {
            panic!("expected a completed purchase");
        };

        let req = RenewRequest {
            amount: Some(dec!(30)),
            transaction_id: Some("tx-renew-1".into()),
        };
        service
            .renew_subscription(subscription.id, req.clone())
            .await
            .unwrap();
        let replayed = service
            .renew_subscription(subscription.id, req)
            .await
            .unwrap();

        assert_eq!(replayed.renewal_history.len(), 1);
        assert_eq!(replayed.billing.total_paid, usd(dec!(60)));
    }

    #[tokio::test]
    async fn test_cancel_with_refund_credits_wallet_once() {
        let (service, _) = setup();
        fund(&service, "user_1", dec!(100)).await;
        let PurchaseResponse::Completed { subscription, .. } = service
            .purchase_with_wallet("user_1", purchase(plan_order("user_1"), dec!(30), "p-1"))
            .await
            .unwrap()
        else {
            panic!("expected a completed purchase");
        };

        let cancel = CancelRequest {
            reason: "not satisfied".into(),
            cancelled_by: "support".into(),
            refund_amount: Some(dec!(10)),
        };
        let cancelled = service
            .cancel_subscription(subscription.id, cancel.clone())
            .await
            .unwrap();
        assert_eq!(cancelled.status, SubscriptionStatus::Cancelled);
        assert_eq!(
            cancelled.cancellation.as_ref().and_then(|c| c.refund_amount),
            Some(usd(dec!(10)))
        );

        let again = service.cancel_subscription(subscription.id, cancel).await;
        assert!(matches!(again, Err(AppError::IllegalTransition { .. })));

        let wallet = service.wallet_for_owner("user_1").await.unwrap();
        assert_eq!(wallet.balance, usd(dec!(80)));
    }

    fn refund_cancel(amount: Decimal) -> CancelRequest {
        CancelRequest {
            reason: "not satisfied".into(),
            cancelled_by: "support".into(),
            refund_amount: Some(amount),
        }
    }

    #[tokio::test]
    async fn test_cancel_refund_to_frozen_wallet_keeps_subscription_active() {
        let (service, _) = setup();
        let wallet = fund(&service, "user_1", dec!(100)).await;
        let PurchaseResponse::Completed { subscription, .. } = service
            .purchase_with_wallet("user_1", purchase(plan_order("user_1"), dec!(30), "p-1"))
            .await
            .unwrap()
        else {
            panic!("expected a completed purchase");
        };
        service.ledger().freeze(wallet.id).await.unwrap();

        let refused = service
            .cancel_subscription(subscription.id, refund_cancel(dec!(10)))
            .await;
        assert!(matches!(refused, Err(AppError::Conflict(_))));
        let stored = service.subscriptions().get(subscription.id).await.unwrap();
        assert_eq!(stored.status, SubscriptionStatus::Active);

        service.ledger().unfreeze(wallet.id).await.unwrap();
        let cancelled = service
            .cancel_subscription(subscription.id, refund_cancel(dec!(10)))
            .await
            .unwrap();
        assert_eq!(cancelled.status, SubscriptionStatus::Cancelled);
        let wallet = service.wallet_for_owner("user_1").await.unwrap();
        assert_eq!(wallet.balance, usd(dec!(80)));
    }

    #[tokio::test]
    async fn test_cancel_retry_completes_unpaid_refund() {
        let (service, _) = setup();
        fund(&service, "user_1", dec!(100)).await;
        let PurchaseResponse::Completed { subscription, .. } = service
            .purchase_with_wallet("user_1", purchase(plan_order("user_1"), dec!(30), "p-1"))
            .await
            .unwrap()
        else {
            panic!("expected a completed purchase");
        };
        // Cancelled with a refund recorded, but the ledger never saw it.
        service
            .subscriptions()
            .cancel(
                subscription.id,
                "not satisfied".into(),
                "support".into(),
                Some(usd(dec!(10))),
            )
            .await
            .unwrap();
        let wallet = service.wallet_for_owner("user_1").await.unwrap();
        assert_eq!(wallet.balance, usd(dec!(70)));

        let retried = service
            .cancel_subscription(subscription.id, refund_cancel(dec!(10)))
            .await
            .unwrap();
        assert_eq!(retried.status, SubscriptionStatus::Cancelled);
        let wallet = service.wallet_for_owner("user_1").await.unwrap();
        assert_eq!(wallet.balance, usd(dec!(80)));

        let again = service
            .cancel_subscription(subscription.id, refund_cancel(dec!(10)))
            .await;
        assert!(matches!(again, Err(AppError::IllegalTransition { .. })));
        let wallet = service.wallet_for_owner("user_1").await.unwrap();
        assert_eq!(wallet.balance, usd(dec!(80)));
    }

    #[tokio::test]
    async fn test_refund_larger_than_paid_is_rejected() {
        let (service, _) = setup();
        fund(&service, "user_1", dec!(100)).await;
        let PurchaseResponse::Completed { subscription, .. } = service
            .purchase_with_wallet("user_1", purchase(plan_order("user_1"), dec!(30), "p-1"))
            .await
            .unwrap()
        else {
            panic!("expected a completed purchase");
        };

        let result = service
            .cancel_subscription(
                subscription.id,
                CancelRequest {
                    reason: "refund all".into(),
                    cancelled_by: "support".into(),
                    refund_amount: Some(dec!(31)),
                },
            )
            .await;

        assert!(matches!(result, Err(AppError::Validation(_))));
        let stored = service.subscriptions().get(subscription.id).await.unwrap();
        assert_eq!(stored.status, SubscriptionStatus::Active);
    }

    #[tokio::test]
    async fn test_suspend_and_resume() {
        let (service, _) = setup();
        fund(&service, "user_1", dec!(100)).await;
        let PurchaseResponse::Completed { subscription, .. } = service
            .purchase_with_wallet("user_1", purchase(plan_order("user_1"), dec!(30), "p-1"))
            .await
            .unwrap()
        else {
            panic!("expected a completed purchase");
        };

        let suspended = service
            .subscriptions()
            .suspend(subscription.id, "chargeback".into())
            .await
            .unwrap();
        assert_eq!(suspended.status, SubscriptionStatus::Suspended);
        assert!(!suspended.grants_access(Utc::now()));

        let resumed = service.subscriptions().resume(subscription.id).await.unwrap();
        assert_eq!(resumed.status, SubscriptionStatus::Active);
        assert_eq!(resumed.end_date, subscription.end_date);

        let again = service.subscriptions().resume(subscription.id).await;
        assert!(matches!(again, Err(AppError::IllegalTransition { .. })));
    }

    #[tokio::test]
    async fn test_amount_limits_cover_every_currency() {
        let (service, _) = setup();

        let limits = service.amount_limits();

        assert_eq!(limits.len(), Currency::all().len());
        let usd_limits = limits.iter().find(|l| l.currency == Currency::USD).unwrap();
        assert_eq!(usd_limits.min, dec!(1));
        assert_eq!(service.rates().base, Currency::USD);
    }
}
