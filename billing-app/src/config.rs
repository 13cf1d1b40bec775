//! Configuration loading from environment.

use std::collections::BTreeMap;
use std::env;
use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;

use billing_hex::outbound::providers::{HostedCheckoutConfig, SignatureScheme};
use billing_types::{AmountLimits, Currency, PaymentProvider};

/// Window within which a timestamped webhook signature is accepted.
const SIGNATURE_TOLERANCE: Duration = Duration::from_secs(300);

/// Application configuration.
pub struct Config {
    pub port: u16,
    pub database_url: String,
    /// Raw API keys accepted on `/api` routes
    pub api_keys: Vec<String>,
    pub default_currency: Currency,
    /// Live rate table endpoint; the compiled-in table is used when unset
    pub rates_url: Option<String>,
    pub rates_refresh: Duration,
    pub provider_timeout: Duration,
    pub poll_window: Duration,
    pub intent_ttl: chrono::Duration,
    pub expiry_sweep: Duration,
    pub reconcile_interval: Duration,
    pub amount_limits: Vec<(Currency, AmountLimits)>,
    pub sandbox_secret: Option<String>,
    pub hosted_providers: Vec<HostedCheckoutConfig>,
}

impl Config {
    /// Loads configuration from environment variables.
    pub fn from_env() -> anyhow::Result<Self> {
        let port = parsed_or("PORT", 3000)?;

        let database_url = env::var("DATABASE_URL")
            .map_err(|_| anyhow::anyhow!("DATABASE_URL environment variable is required"))?;

        let api_keys = parse_api_keys(&env::var("BILLING_API_KEYS").unwrap_or_default());
        if api_keys.is_empty() {
            anyhow::bail!("BILLING_API_KEYS must list at least one API key");
        }

        let provider_timeout = Duration::from_secs(parsed_or("BILLING_PROVIDER_TIMEOUT_SECS", 15)?);

        let amount_limits = match optional("BILLING_AMOUNT_LIMITS") {
            Some(raw) => parse_amount_limits(&raw).context("Invalid BILLING_AMOUNT_LIMITS")?,
            None => Vec::new(),
        };

        let mut hosted_providers = Vec::new();
        for provider in [
            PaymentProvider::Stripe,
            PaymentProvider::Paymob,
            PaymentProvider::Kashier,
        ] {
            if let Some(config) = hosted_provider(provider, provider_timeout)? {
                hosted_providers.push(config);
            }
        }

        Ok(Self {
            port,
            database_url,
            api_keys,
            default_currency: parsed_or("BILLING_DEFAULT_CURRENCY", Currency::USD)?,
            rates_url: optional("BILLING_RATES_URL"),
            rates_refresh: Duration::from_secs(parsed_or("BILLING_RATES_REFRESH_SECS", 3600)?),
            provider_timeout,
            poll_window: Duration::from_secs(parsed_or("BILLING_POLL_WINDOW_SECS", 30)?),
            intent_ttl: chrono::Duration::minutes(parsed_or("BILLING_INTENT_TTL_MINUTES", 30)?),
            expiry_sweep: Duration::from_secs(parsed_or("BILLING_EXPIRY_SWEEP_SECS", 300)?),
            reconcile_interval: Duration::from_secs(parsed_or("BILLING_RECONCILE_SECS", 60)?),
            amount_limits,
            sandbox_secret: optional("BILLING_SANDBOX_SECRET"),
            hosted_providers,
        })
    }
}

/// Reads `BILLING_{PROVIDER}_*`; a provider without a base URL is disabled.
fn hosted_provider(
    provider: PaymentProvider,
    timeout: Duration,
) -> anyhow::Result<Option<HostedCheckoutConfig>> {
    let prefix = format!("BILLING_{}", provider.as_str());
    let Some(base_url) = optional(&format!("{}_BASE_URL", prefix)) else {
        return Ok(None);
    };

    let required = |suffix: &str| {
        let name = format!("{}_{}", prefix, suffix);
        optional(&name).with_context(|| format!("{} is required when {}_BASE_URL is set", name, prefix))
    };
    let api_key = required("API_KEY")?;
    let webhook_secret = required("WEBHOOK_SECRET")?;
    let currencies = parse_currencies(&required("CURRENCIES")?)
        .with_context(|| format!("Invalid {}_CURRENCIES", prefix))?;

    Ok(Some(HostedCheckoutConfig {
        provider,
        base_url,
        api_key,
        webhook_secret,
        currencies,
        signature: signature_scheme(provider),
        timeout,
    }))
}

fn signature_scheme(provider: PaymentProvider) -> SignatureScheme {
    match provider {
        PaymentProvider::Stripe => SignatureScheme::TimestampedHmacSha256 {
            header: "stripe-signature".into(),
            tolerance: SIGNATURE_TOLERANCE,
        },
        other => SignatureScheme::HexHmacSha256 {
            header: format!("x-{}-signature", other.as_str().to_ascii_lowercase()),
        },
    }
}

fn optional(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn parsed_or<T>(name: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    match optional(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid {}: {}", name, e)),
        None => Ok(default),
    }
}

fn parse_api_keys(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .map(String::from)
        .collect()
}

fn parse_currencies(raw: &str) -> anyhow::Result<Vec<Currency>> {
    let currencies = raw
        .split(',')
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .map(|c| c.parse::<Currency>().map_err(|e| anyhow::anyhow!("{}", e)))
        .collect::<anyhow::Result<Vec<_>>>()?;
    if currencies.is_empty() {
        anyhow::bail!("at least one currency is required");
    }
    Ok(currencies)
}

/// Parses `{"EGP": {"min": "50.00", "max": "600000.00"}, ...}`.
fn parse_amount_limits(raw: &str) -> anyhow::Result<Vec<(Currency, AmountLimits)>> {
    let limits: BTreeMap<Currency, AmountLimits> = serde_json::from_str(raw)?;
    Ok(limits.into_iter().collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_parse_api_keys() {
        assert_eq!(
            parse_api_keys(" sk_one, ,sk_two ,"),
            vec!["sk_one".to_string(), "sk_two".to_string()]
        );
        assert!(parse_api_keys("").is_empty());
    }

    #[test]
    fn test_parse_currencies() {
        assert_eq!(
            parse_currencies("egp, usd").unwrap(),
            vec![Currency::EGP, Currency::USD]
        );
        assert!(parse_currencies("EGP,XYZ").is_err());
        assert!(parse_currencies(" , ").is_err());
    }

    #[test]
    fn test_parse_amount_limits() {
        let limits =
            parse_amount_limits(r#"{"EGP": {"min": "100.00", "max": "600000.00"}}"#).unwrap();
        assert_eq!(limits.len(), 1);
        assert_eq!(limits[0].0, Currency::EGP);
        assert_eq!(limits[0].1.min, dec!(100));
        assert!(parse_amount_limits("not json").is_err());
    }

    #[test]
    fn test_signature_schemes() {
        assert!(matches!(
            signature_scheme(PaymentProvider::Stripe),
            SignatureScheme::TimestampedHmacSha256 { .. }
        ));
        assert_eq!(
            signature_scheme(PaymentProvider::Paymob),
            SignatureScheme::HexHmacSha256 {
                header: "x-paymob-signature".into()
            }
        );
    }
}
