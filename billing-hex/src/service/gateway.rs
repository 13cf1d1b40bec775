//! Payment gateway: hosted payment links, provider notifications and status
//! polling, independent of which provider handles the money.
//!
//! The gateway owns the intent lifecycle (`PENDING -> COMPLETED | FAILED`)
//! but never moves money itself; settlement of completed intents belongs to
//! the billing façade.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::{Value, json};

use billing_types::domain::wallet::validate_owner_id;
use billing_types::ports::{CheckoutRequest, ProviderPaymentStatus, SignatureHeaders};
use billing_types::{
    AmountValidator, AppError, CreatePaymentLinkRequest, Money, PaymentIntent, PaymentIntentId,
    PaymentIntentRepository, PaymentProvider, PaymentPurpose, PaymentStatus, ProviderError,
    PurchaseOrder, ValidationError, VerificationError,
};
use exchange_rates::CurrencyConverter;

use crate::locks::KeyedLocks;
use crate::outbound::providers::ProviderRegistry;
use crate::security::derive_idempotency_key;

/// Timing knobs of the gateway.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Upper bound on any single provider call
    pub provider_timeout: Duration,
    /// How long a payment link stays payable
    pub intent_ttl: chrono::Duration,
    /// Delay between provider polls while waiting for a result
    pub poll_interval: Duration,
    /// Total time a waiting status request may poll for
    pub poll_window: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            provider_timeout: Duration::from_secs(15),
            intent_ttl: chrono::Duration::minutes(30),
            poll_interval: Duration::from_secs(2),
            poll_window: Duration::from_secs(30),
        }
    }
}

pub struct PaymentGateway<R: PaymentIntentRepository> {
    repo: Arc<R>,
    providers: ProviderRegistry,
    validator: Arc<AmountValidator>,
    converter: Arc<CurrencyConverter>,
    locks: KeyedLocks,
    config: GatewayConfig,
}

impl<R: PaymentIntentRepository> PaymentGateway<R> {
    pub fn new(
        repo: Arc<R>,
        providers: ProviderRegistry,
        validator: Arc<AmountValidator>,
        converter: Arc<CurrencyConverter>,
        config: GatewayConfig,
    ) -> Self {
        Self {
            repo,
            providers,
            validator,
            converter,
            locks: KeyedLocks::new(),
            config,
        }
    }

    pub fn providers(&self) -> &ProviderRegistry {
        &self.providers
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Creates (or returns the existing) hosted payment link for a charge.
    ///
    /// Requests with the same purpose, payer, amount, currency and nonce map
    /// to one intent; concurrent duplicates wait for the first and get its
    /// result.
    #[tracing::instrument(
        skip(self, req),
        fields(provider = %req.provider, purpose = %req.purpose, payer = %req.payer_ref)
    )]
    pub async fn create_payment_link(
        &self,
        req: CreatePaymentLinkRequest,
    ) -> Result<PaymentIntent, AppError> {
        let requested = self.validator.validate(req.amount, req.currency)?;
        validate_owner_id(&req.payer_ref)?;
        validate_order(&req)?;

        let adapter = self.providers.get(req.provider)?;
        let charge = if adapter.supported_currencies().contains(&requested.currency()) {
            requested
        } else {
            let target = *adapter
                .supported_currencies()
                .first()
                .ok_or(ProviderError::NotConfigured(req.provider))?;
            let converted = requested.convert(&self.converter, target)?;
            self.validator.validate_money(&converted)?;
            tracing::debug!(requested = %requested, charged = %converted, "Converted charge");
            converted
        };

        let nonce = req.nonce.as_deref().unwrap_or_default();
        let key = derive_idempotency_key(req.purpose, &req.payer_ref, &requested, nonce);
        let _guard = self.locks.lock(&key).await;

        if let Some(existing) = self.repo.find_intent_by_key(&key).await? {
            tracing::debug!(intent_id = %existing.id, "Returning existing payment intent");
            return Ok(existing);
        }

        let now = Utc::now();
        let id = PaymentIntentId::new();
        let expires_at = now + self.config.intent_ttl;

        let session = self
            .bounded(adapter.create_checkout(CheckoutRequest {
                intent_id: id,
                amount: charge,
                method: req.method,
                purpose: req.purpose,
                payer_ref: req.payer_ref.clone(),
                idempotency_key: key.clone(),
                expires_at,
            }))
            .await
            .inspect_err(|e| {
                tracing::warn!(error = %e, retryable = e.is_retryable(), "Checkout creation failed");
            })?;

        let intent = PaymentIntent {
            id,
            provider: req.provider,
            method: req.method,
            amount: charge,
            purpose: req.purpose,
            status: PaymentStatus::Pending,
            external_reference: Some(session.external_reference),
            external_transaction_id: None,
            payment_url: Some(session.payment_url),
            idempotency_key: key,
            payer_ref: req.payer_ref,
            order: req.order,
            metadata: intent_metadata(req.metadata, &requested, &charge),
            created_at: now,
            expires_at: session.expires_at.map_or(expires_at, |e| e.min(expires_at)),
            updated_at: now,
        };

        let outcome = self.repo.insert_intent(intent).await?;
        let inserted = outcome.is_inserted();
        let intent = outcome.into_inner();
        if inserted {
            tracing::info!(intent_id = %intent.id, amount = %intent.amount, "Payment link created");
        }
        Ok(intent)
    }

    pub async fn get(&self, id: PaymentIntentId) -> Result<PaymentIntent, AppError> {
        self.repo
            .get_intent(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Payment {}", id)))
    }

    /// Verifies a provider notification and advances the matching intent.
    ///
    /// Notifications for intents that are already terminal change nothing.
    #[tracing::instrument(skip(self, raw_body, headers))]
    pub async fn handle_notification(
        &self,
        provider: PaymentProvider,
        raw_body: &[u8],
        headers: &SignatureHeaders,
    ) -> Result<PaymentIntent, AppError> {
        let adapter = self.providers.get(provider)?;
        let notification = adapter
            .verify_notification(raw_body, headers)
            .inspect_err(|e| {
                tracing::warn!(security = true, error = %e, "Rejected payment notification");
            })?;

        let intent = match (notification.intent_id, &notification.external_reference) {
            (Some(id), _) => self.repo.get_intent(id).await?,
            (None, Some(reference)) => {
                self.repo
                    .find_intent_by_external_reference(provider, reference)
                    .await?
            }
            (None, None) => None,
        };
        let intent = intent
            .filter(|intent| intent.provider == provider)
            .ok_or_else(|| {
                let reference = notification
                    .intent_id
                    .map(|id| id.to_string())
                    .or(notification.external_reference.clone())
                    .unwrap_or_default();
                tracing::warn!(security = true, %reference, "Notification for unknown payment");
                VerificationError::UnknownIntent(reference)
            })?;

        if intent.status.is_terminal() {
            tracing::debug!(intent_id = %intent.id, status = %intent.status, "Intent already final");
            return Ok(intent);
        }
        self.apply_status(intent, notification.payment).await
    }

    /// Asks the provider about a pending intent and records a final answer.
    #[tracing::instrument(skip(self))]
    pub async fn query_status(
        &self,
        provider: PaymentProvider,
        id: PaymentIntentId,
    ) -> Result<PaymentIntent, AppError> {
        let intent = self.get(id).await?;
        if intent.provider != provider {
            return Err(AppError::NotFound(format!("Payment {} for {}", id, provider)));
        }
        self.refresh(intent).await
    }

    /// Polls the provider until the intent is final or the window closes,
    /// then returns whatever is stored.
    pub async fn poll_until_settled(
        &self,
        provider: PaymentProvider,
        id: PaymentIntentId,
        window: Duration,
    ) -> Result<PaymentIntent, AppError> {
        let deadline = Instant::now() + window;
        loop {
            let intent = self.query_status(provider, id).await?;
            if intent.status.is_terminal() || Instant::now() + self.config.poll_interval > deadline {
                return Ok(intent);
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }
    }

    /// Pending intents whose link expired, for reconciliation.
    pub async fn expired_pending(&self, limit: i64) -> Result<Vec<PaymentIntent>, AppError> {
        Ok(self.repo.list_expired_pending(Utc::now(), limit).await?)
    }

    async fn refresh(&self, intent: PaymentIntent) -> Result<PaymentIntent, AppError> {
        if intent.status.is_terminal() {
            return Ok(intent);
        }
        let Some(reference) = intent.external_reference.clone() else {
            return Ok(intent);
        };

        let adapter = self.providers.get(intent.provider)?;
        let status = self.bounded(adapter.query_status(&reference)).await?;
        if !status.status.is_terminal() {
            return Ok(intent);
        }
        self.apply_status(intent, status).await
    }

    async fn apply_status(
        &self,
        intent: PaymentIntent,
        reported: ProviderPaymentStatus,
    ) -> Result<PaymentIntent, AppError> {
        if !intent.status.can_advance_to(reported.status) {
            return Ok(intent);
        }
        if let Some(amount) = reported.amount {
            if amount != intent.amount {
                tracing::warn!(
                    security = true,
                    intent_id = %intent.id,
                    expected = %intent.amount,
                    got = %amount,
                    "Provider reported a different amount"
                );
                return Err(VerificationError::AmountMismatch {
                    expected: intent.amount,
                    got: amount,
                }
                .into());
            }
        }

        let advanced = self
            .repo
            .advance_intent(
                intent.id,
                reported.status,
                reported.external_transaction_id,
                Utc::now(),
            )
            .await?;
        if advanced {
            tracing::info!(intent_id = %intent.id, status = %reported.status, "Payment status advanced");
        }
        self.get(intent.id).await
    }

    async fn bounded<T>(
        &self,
        call: impl std::future::Future<Output = Result<T, ProviderError>>,
    ) -> Result<T, ProviderError> {
        let timeout = self.config.provider_timeout;
        tokio::time::timeout(timeout, call)
            .await
            .map_err(|_| ProviderError::Timeout(timeout.as_secs()))?
    }
}

fn validate_order(req: &CreatePaymentLinkRequest) -> Result<(), ValidationError> {
    match (&req.order, req.purpose) {
        (None, PaymentPurpose::WalletCredit) => Ok(()),
        (Some(_), PaymentPurpose::WalletCredit) => Err(ValidationError::Invalid(
            "wallet credits do not carry an order".into(),
        )),
        (None, purpose) => Err(ValidationError::Invalid(format!(
            "{} requires an order",
            purpose
        ))),
        (Some(order), purpose) if order.purpose() != purpose => Err(ValidationError::Invalid(
            format!("order is a {}, not a {}", order.purpose(), purpose),
        )),
        (Some(PurchaseOrder::Grant { grant, .. }), _) => grant.validate(),
        (Some(_), _) => Ok(()),
    }
}

fn intent_metadata(metadata: Option<Value>, requested: &Money, charge: &Money) -> Value {
    let mut metadata = match metadata {
        Some(Value::Object(map)) => Value::Object(map),
        Some(other) => json!({ "caller": other }),
        None => json!({}),
    };
    if requested.currency() != charge.currency() {
        metadata["requested"] = json!(requested);
    }
    metadata
}
