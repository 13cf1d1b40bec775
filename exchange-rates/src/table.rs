//! Immutable snapshot of exchange rates relative to USD.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;

use crate::{Currency, ExchangeError};

/// Units of each currency per 1 USD, as of `updated_at`.
///
/// A table is never mutated after construction; refreshing replaces the whole
/// table. USD is always present at exactly 1.
#[derive(Debug, Clone, PartialEq, Serialize, utoipa::ToSchema)]
pub struct RateTable {
    #[schema(value_type = Object)]
    rates: BTreeMap<Currency, Decimal>,
    updated_at: DateTime<Utc>,
}

impl RateTable {
    /// Builds a table, rejecting non-positive rates.
    ///
    /// Currencies absent from `rates` stay absent; lookups for them fall back
    /// at conversion time.
    pub fn new(
        rates: impl IntoIterator<Item = (Currency, Decimal)>,
        updated_at: DateTime<Utc>,
    ) -> Result<Self, ExchangeError> {
        let mut table = BTreeMap::new();
        for (currency, rate) in rates {
            if rate <= Decimal::ZERO {
                return Err(ExchangeError::InvalidRate { currency, rate });
            }
            table.insert(currency, rate);
        }
        table.insert(Currency::USD, Decimal::ONE);

        Ok(Self {
            rates: table,
            updated_at,
        })
    }

    /// The compiled-in defaults from the currency catalogue.
    pub fn defaults() -> Self {
        let rates = Currency::all()
            .iter()
            .map(|c| (*c, c.default_rate()))
            .collect();
        Self {
            rates,
            updated_at: Utc::now(),
        }
    }

    pub fn get(&self, currency: Currency) -> Option<Decimal> {
        self.rates.get(&currency).copied()
    }

    pub fn rates(&self) -> &BTreeMap<Currency, Decimal> {
        &self.rates
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    /// Currencies in the catalogue that this table has no rate for.
    pub fn missing(&self) -> Vec<Currency> {
        Currency::all()
            .iter()
            .filter(|c| !self.rates.contains_key(c))
            .copied()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_defaults_cover_catalogue() {
        let table = RateTable::defaults();
        assert!(table.missing().is_empty());
        assert_eq!(table.get(Currency::USD), Some(Decimal::ONE));
    }

    #[test]
    fn test_usd_forced_to_one() {
        let table = RateTable::new([(Currency::USD, dec!(2)), (Currency::EGP, dec!(50))], Utc::now())
            .unwrap();
        assert_eq!(table.get(Currency::USD), Some(Decimal::ONE));
        assert_eq!(table.get(Currency::EGP), Some(dec!(50)));
    }

    #[test]
    fn test_rejects_non_positive_rate() {
        let result = RateTable::new([(Currency::EUR, dec!(0))], Utc::now());
        assert!(matches!(
            result,
            Err(ExchangeError::InvalidRate {
                currency: Currency::EUR,
                ..
            })
        ));
    }

    #[test]
    fn test_missing_lists_gaps() {
        let table = RateTable::new([(Currency::EGP, dec!(48.6))], Utc::now()).unwrap();
        let missing = table.missing();
        assert!(missing.contains(&Currency::KWD));
        assert!(!missing.contains(&Currency::USD));
        assert!(!missing.contains(&Currency::EGP));
    }
}
