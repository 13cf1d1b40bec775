//! Background task that keeps the converter's rate table current.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, instrument};

use crate::{CurrencyConverter, ExchangeError, RateSource};

/// Periodically pulls a rate table from `source` into `converter`.
///
/// A failed fetch leaves the current table untouched; the next attempt happens
/// at the regular interval.
pub struct RateRefresher<S: RateSource> {
    converter: Arc<CurrencyConverter>,
    source: S,
    interval: Duration,
}

impl<S: RateSource> RateRefresher<S> {
    pub fn new(converter: Arc<CurrencyConverter>, source: S, interval: Duration) -> Self {
        Self {
            converter,
            source,
            interval,
        }
    }

    /// Fetches once and swaps the table in on success.
    pub async fn refresh_once(&self) -> Result<(), ExchangeError> {
        match self.source.fetch().await {
            Ok(table) => {
                let missing = table.missing();
                if !missing.is_empty() {
                    tracing::warn!(
                        source = self.source.name(),
                        missing = ?missing,
                        "Rate table is incomplete"
                    );
                }
                self.converter.replace(table);
                self.converter.record_refresh_success(Utc::now());
                info!(source = self.source.name(), "Exchange rates refreshed");
                Ok(())
            }
            Err(e) => {
                let failures = self.converter.record_refresh_failure(&e);
                error!(
                    source = self.source.name(),
                    consecutive_failures = failures,
                    error = %e,
                    "Exchange rate refresh failed, keeping previous table"
                );
                Err(e)
            }
        }
    }

    /// Runs forever; the first refresh happens immediately.
    #[instrument(skip(self), fields(source = self.source.name(), interval_secs = self.interval.as_secs()))]
    pub async fn run(self) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            // Failures are already logged and counted.
            let _ = self.refresh_once().await;
        }
    }
}
