//! USD-pivot currency conversion over a swappable rate table.

use std::sync::{Arc, Mutex, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::Serialize;

use crate::{Currency, ExchangeError, RateTable};

/// Outcome of the most recent background refreshes.
#[derive(Debug, Clone, Default, Serialize, utoipa::ToSchema)]
pub struct RefreshStatus {
    pub last_success: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
}

/// Converts amounts between currencies through USD.
///
/// Readers take a snapshot (`Arc<RateTable>`) and never hold the lock while
/// computing, so a refresh swapping the table is a single pointer write.
pub struct CurrencyConverter {
    table: RwLock<Arc<RateTable>>,
    status: Mutex<RefreshStatus>,
}

impl CurrencyConverter {
    pub fn new(table: RateTable) -> Self {
        Self {
            table: RwLock::new(Arc::new(table)),
            status: Mutex::new(RefreshStatus::default()),
        }
    }

    /// Creates a converter seeded with the catalogue's default rates.
    pub fn with_defaults() -> Self {
        Self::new(RateTable::defaults())
    }

    /// Returns the table currently in effect.
    pub fn snapshot(&self) -> Arc<RateTable> {
        self.table
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Atomically replaces the rate table.
    pub fn replace(&self, table: RateTable) {
        let next = Arc::new(table);
        *self.table.write().unwrap_or_else(PoisonError::into_inner) = next;
    }

    /// Units of `to` per 1 unit of `from`.
    ///
    /// Identical currencies yield exactly 1. A missing rate degrades to 1
    /// instead of failing; amount validation downstream rejects implausible
    /// results.
    pub fn rate(&self, from: Currency, to: Currency) -> Decimal {
        if from == to {
            return Decimal::ONE;
        }
        let table = self.snapshot();
        let from_rate = lookup(&table, from);
        let to_rate = lookup(&table, to);
        to_rate / from_rate
    }

    /// Converts `amount` of `from` into `to`, rounded to 2 decimal places.
    ///
    /// Always goes `from -> USD -> to`, keeping the intermediate USD value at
    /// full precision and rounding once at the end.
    pub fn convert_amount(&self, amount: Decimal, from: Currency, to: Currency) -> Decimal {
        if from == to {
            return amount;
        }
        let table = self.snapshot();
        let usd = amount / lookup(&table, from);
        round_money(usd * lookup(&table, to))
    }

    pub fn refresh_status(&self) -> RefreshStatus {
        self.status
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn record_refresh_success(&self, at: DateTime<Utc>) {
        let mut status = self.status.lock().unwrap_or_else(PoisonError::into_inner);
        status.last_success = Some(at);
        status.consecutive_failures = 0;
        status.last_error = None;
    }

    pub(crate) fn record_refresh_failure(&self, err: &ExchangeError) -> u32 {
        let mut status = self.status.lock().unwrap_or_else(PoisonError::into_inner);
        status.consecutive_failures = status.consecutive_failures.saturating_add(1);
        status.last_error = Some(err.to_string());
        status.consecutive_failures
    }
}

impl Default for CurrencyConverter {
    fn default() -> Self {
        Self::with_defaults()
    }
}

fn lookup(table: &RateTable, currency: Currency) -> Decimal {
    match table.get(currency) {
        Some(rate) => rate,
        None => {
            tracing::warn!(
                currency = %currency,
                degraded = true,
                "Exchange rate missing, falling back to 1"
            );
            Decimal::ONE
        }
    }
}

/// Rounds to 2 decimal places, halves away from zero.
pub(crate) fn round_money(amount: Decimal) -> Decimal {
    amount.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}
