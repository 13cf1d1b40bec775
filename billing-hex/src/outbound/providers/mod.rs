//! Payment provider adapters and the registry the gateway resolves them from.
//!
//! Every adapter speaks the same normalized payment document on the wire
//! (notifications and status answers); only transport and signature schemes
//! differ per provider.

mod hosted_checkout;
mod sandbox;

use std::collections::HashMap;
use std::sync::Arc;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use billing_types::ports::{ProviderNotification, ProviderPaymentStatus};
use billing_types::{
    Currency, Money, PaymentIntentId, PaymentProvider, PaymentProviderAdapter, PaymentStatus,
    ProviderError,
};

pub use hosted_checkout::{
    HostedCheckoutConfig, HostedCheckoutProvider, SignatureScheme, timestamped_signature,
};
pub use sandbox::{SIGNATURE_HEADER as SANDBOX_SIGNATURE_HEADER, SandboxNotification, SandboxProvider};

/// Adapters by provider.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    adapters: HashMap<PaymentProvider, Arc<dyn PaymentProviderAdapter>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an adapter, replacing any earlier one for the same provider.
    pub fn with(mut self, adapter: Arc<dyn PaymentProviderAdapter>) -> Self {
        self.register(adapter);
        self
    }

    pub fn register(&mut self, adapter: Arc<dyn PaymentProviderAdapter>) {
        tracing::info!(provider = %adapter.provider(), "Payment provider registered");
        self.adapters.insert(adapter.provider(), adapter);
    }

    pub fn get(
        &self,
        provider: PaymentProvider,
    ) -> Result<Arc<dyn PaymentProviderAdapter>, ProviderError> {
        self.adapters
            .get(&provider)
            .cloned()
            .ok_or(ProviderError::NotConfigured(provider))
    }

    pub fn providers(&self) -> Vec<PaymentProvider> {
        let mut providers: Vec<_> = self.adapters.keys().copied().collect();
        providers.sort_by_key(|p| p.as_str());
        providers
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}

/// The normalized payment document providers send and answer with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct PaymentDocument {
    /// Our intent id, echoed back
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
    /// The provider's checkout session id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amount: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub currency: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<String>,
}

impl PaymentDocument {
    pub fn payment_status(&self) -> Result<ProviderPaymentStatus, String> {
        let status = match self.status.trim().to_ascii_uppercase().as_str() {
            "COMPLETED" | "PAID" | "SUCCEEDED" | "SUCCESS" => PaymentStatus::Completed,
            "FAILED" | "DECLINED" | "CANCELLED" | "EXPIRED" => PaymentStatus::Failed,
            "PENDING" | "OPEN" | "PROCESSING" => PaymentStatus::Pending,
            other => return Err(format!("unknown payment status `{}`", other)),
        };

        let amount = match (self.amount, self.currency.as_deref()) {
            (Some(amount), Some(code)) => {
                let currency: Currency = code.parse().map_err(|e| format!("{}", e))?;
                Some(Money::new(amount, currency).map_err(|e| e.to_string())?)
            }
            (None, None) => None,
            _ => return Err("amount and currency must be reported together".into()),
        };

        Ok(ProviderPaymentStatus {
            status,
            external_transaction_id: self.transaction_id.clone(),
            amount,
        })
    }

    pub fn into_notification(self) -> Result<ProviderNotification, String> {
        let payment = self.payment_status()?;
        let intent_id = self
            .reference
            .as_deref()
            .and_then(|r| r.parse::<PaymentIntentId>().ok());
        if intent_id.is_none() && self.session_id.is_none() {
            return Err("notification names neither a reference nor a session".into());
        }
        Ok(ProviderNotification {
            intent_id,
            external_reference: self.session_id,
            payment,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn document(status: &str) -> PaymentDocument {
        PaymentDocument {
            reference: Some(PaymentIntentId::new().to_string()),
            session_id: Some("cs_1".into()),
            status: status.into(),
            amount: Some(dec!(50)),
            currency: Some("USD".into()),
            transaction_id: Some("tx_1".into()),
        }
    }

    #[test]
    fn test_status_vocabulary() {
        assert_eq!(
            document("paid").payment_status().unwrap().status,
            PaymentStatus::Completed
        );
        assert_eq!(
            document("DECLINED").payment_status().unwrap().status,
            PaymentStatus::Failed
        );
        assert_eq!(
            document("open").payment_status().unwrap().status,
            PaymentStatus::Pending
        );
        assert!(document("refunded").payment_status().is_err());
    }

    #[test]
    fn test_amount_needs_currency() {
        let mut doc = document("COMPLETED");
        doc.currency = None;
        assert!(doc.payment_status().is_err());

        let doc = document("COMPLETED");
        let amount = doc.payment_status().unwrap().amount.unwrap();
        assert_eq!(amount, Money::new(dec!(50), Currency::USD).unwrap());
    }

    #[test]
    fn test_notification_needs_a_locator() {
        let mut doc = document("COMPLETED");
        doc.reference = Some("not-a-uuid".into());
        let notification = doc.clone().into_notification().unwrap();
        assert!(notification.intent_id.is_none());
        assert_eq!(notification.external_reference.as_deref(), Some("cs_1"));

        doc.session_id = None;
        assert!(doc.into_notification().is_err());
    }

    #[test]
    fn test_registry_reports_unconfigured_provider() {
        let registry = ProviderRegistry::new().with(Arc::new(SandboxProvider::new("secret")));
        assert!(registry.get(PaymentProvider::Sandbox).is_ok());
        assert!(matches!(
            registry.get(PaymentProvider::Stripe),
            Err(ProviderError::NotConfigured(PaymentProvider::Stripe))
        ));
        assert_eq!(registry.providers(), vec![PaymentProvider::Sandbox]);
    }
}
