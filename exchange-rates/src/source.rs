//! Where fresh rate tables come from.

use std::str::FromStr;
use std::time::Duration;

use chrono::Utc;
use rust_decimal::Decimal;

use crate::{Currency, ExchangeError, RateTable};

/// A provider of complete rate tables relative to USD.
#[async_trait::async_trait]
pub trait RateSource: Send + Sync + 'static {
    /// Short name used in logs.
    fn name(&self) -> &str;

    async fn fetch(&self) -> Result<RateTable, ExchangeError>;
}

/// Serves the compiled-in catalogue defaults.
#[derive(Debug, Default, Clone, Copy)]
pub struct StaticRateSource;

#[async_trait::async_trait]
impl RateSource for StaticRateSource {
    fn name(&self) -> &str {
        "static"
    }

    async fn fetch(&self) -> Result<RateTable, ExchangeError> {
        Ok(RateTable::defaults())
    }
}

/// Fetches `{"rates": {"EGP": 48.6, ...}}` (units per USD) over HTTP.
///
/// Codes outside the catalogue are ignored.
pub struct HttpRateSource {
    client: reqwest::Client,
    url: String,
}

impl HttpRateSource {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, ExchangeError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ExchangeError::ServiceUnavailable(e.to_string()))?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait::async_trait]
impl RateSource for HttpRateSource {
    fn name(&self) -> &str {
        &self.url
    }

    async fn fetch(&self) -> Result<RateTable, ExchangeError> {
        let resp = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| ExchangeError::ServiceUnavailable(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(ExchangeError::ServiceUnavailable(format!(
                "HTTP {}",
                resp.status()
            )));
        }

        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| ExchangeError::Malformed(e.to_string()))?;

        parse_rates(&body)
    }
}

/// Parses the `rates` object of a rate payload.
///
/// Numbers are read through their textual form so that `48.6` stays exactly
/// `48.6`.
pub(crate) fn parse_rates(body: &serde_json::Value) -> Result<RateTable, ExchangeError> {
    let rates = body
        .get("rates")
        .and_then(|r| r.as_object())
        .ok_or_else(|| ExchangeError::Malformed("missing `rates` object".into()))?;

    let mut parsed = Vec::with_capacity(rates.len());
    for (code, value) in rates {
        let Ok(currency) = Currency::from_str(code) else {
            tracing::debug!(code = %code, "Ignoring rate for unsupported currency");
            continue;
        };
        let text = match value {
            serde_json::Value::Number(n) => n.to_string(),
            serde_json::Value::String(s) => s.clone(),
            other => {
                return Err(ExchangeError::Malformed(format!(
                    "rate for {} is not a number: {}",
                    code, other
                )));
            }
        };
        let rate = Decimal::from_str(&text)
            .or_else(|_| Decimal::from_scientific(&text))
            .map_err(|e| ExchangeError::Malformed(format!("rate for {}: {}", code, e)))?;
        parsed.push((currency, rate));
    }

    RateTable::new(parsed, Utc::now())
}
