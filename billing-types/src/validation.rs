//! Amount validation: the first gate in front of every charge.
//!
//! Each currency has one min/max pair. The defaults come from the currency
//! catalogue and are part of the documented API (`GET /api/amount-limits`);
//! operators may override individual currencies at start-up.

use std::collections::BTreeMap;
use std::str::FromStr;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::{Currency, Money};
use crate::error::ValidationError;

/// Inclusive bounds for a single charge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, utoipa::ToSchema)]
pub struct AmountLimits {
    #[schema(value_type = String, example = "1.00")]
    pub min: Decimal,
    #[schema(value_type = String, example = "10000.00")]
    pub max: Decimal,
}

impl AmountLimits {
    pub fn defaults_for(currency: Currency) -> Self {
        Self {
            min: currency.default_min_amount(),
            max: currency.default_max_amount(),
        }
    }
}

/// Fails if `amount` carries more than 2 significant decimal places.
///
/// Trailing zeros do not count: `10.500` passes, `100.005` does not.
pub fn check_precision(amount: Decimal) -> Result<(), ValidationError> {
    if amount.normalize().scale() > 2 {
        return Err(ValidationError::PrecisionError { amount });
    }
    Ok(())
}

/// Parses an ISO-like currency code.
pub fn parse_currency(code: &str) -> Result<Currency, ValidationError> {
    Currency::from_str(code).map_err(Into::into)
}

/// Table-driven per-currency amount validator. Pure and side-effect free.
#[derive(Debug, Clone)]
pub struct AmountValidator {
    limits: BTreeMap<Currency, AmountLimits>,
}

impl AmountValidator {
    /// Creates a validator with the documented default limits.
    pub fn new() -> Self {
        let limits = Currency::all()
            .iter()
            .map(|c| (*c, AmountLimits::defaults_for(*c)))
            .collect();
        Self { limits }
    }

    /// Creates a validator with operator overrides applied on top of the
    /// defaults.
    pub fn with_overrides(
        overrides: impl IntoIterator<Item = (Currency, AmountLimits)>,
    ) -> Result<Self, ValidationError> {
        let mut validator = Self::new();
        for (currency, limits) in overrides {
            if limits.min <= Decimal::ZERO {
                return Err(ValidationError::Invalid(format!(
                    "minimum for {} must be positive",
                    currency
                )));
            }
            if limits.min > limits.max {
                return Err(ValidationError::Invalid(format!(
                    "minimum for {} exceeds its maximum",
                    currency
                )));
            }
            check_precision(limits.min)?;
            check_precision(limits.max)?;
            validator.limits.insert(currency, limits);
        }
        Ok(validator)
    }

    pub fn limits(&self, currency: Currency) -> AmountLimits {
        self.limits
            .get(&currency)
            .copied()
            .unwrap_or_else(|| AmountLimits::defaults_for(currency))
    }

    pub fn all_limits(&self) -> &BTreeMap<Currency, AmountLimits> {
        &self.limits
    }

    /// Checks precision first, then the currency's range.
    pub fn validate(&self, amount: Decimal, currency: Currency) -> Result<Money, ValidationError> {
        check_precision(amount)?;
        let limits = self.limits(currency);
        if amount < limits.min || amount > limits.max {
            return Err(ValidationError::AmountOutOfRange {
                amount,
                currency,
                min: limits.min,
                max: limits.max,
            });
        }
        Money::new(amount, currency)
    }

    pub fn validate_money(&self, money: &Money) -> Result<(), ValidationError> {
        self.validate(money.amount(), money.currency()).map(|_| ())
    }
}

impl Default for AmountValidator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_rejects_three_decimal_places() {
        let validator = AmountValidator::new();
        assert!(matches!(
            validator.validate(dec!(100.005), Currency::USD),
            Err(ValidationError::PrecisionError { .. })
        ));
    }

    #[test]
    fn test_trailing_zeros_are_not_precision() {
        let validator = AmountValidator::new();
        let money = validator.validate(dec!(10.500), Currency::USD).unwrap();
        assert_eq!(money.amount(), dec!(10.50));
    }

    #[test]
    fn test_rejects_egp_below_minimum() {
        let validator = AmountValidator::new();
        let err = validator.validate(dec!(10), Currency::EGP).unwrap_err();
        assert_eq!(
            err,
            ValidationError::AmountOutOfRange {
                amount: dec!(10),
                currency: Currency::EGP,
                min: dec!(50),
                max: dec!(500000),
            }
        );
    }

    #[test]
    fn test_bounds_are_inclusive() {
        let validator = AmountValidator::new();
        assert!(validator.validate(dec!(1.00), Currency::USD).is_ok());
        assert!(validator.validate(dec!(10000), Currency::USD).is_ok());
        assert!(validator.validate(dec!(10000.01), Currency::USD).is_err());
        assert!(validator.validate(dec!(0.50), Currency::KWD).is_ok());
        assert!(validator.validate(dec!(-5), Currency::KWD).is_err());
    }

    #[test]
    fn test_overrides_apply_per_currency() {
        let validator = AmountValidator::with_overrides([(
            Currency::EGP,
            AmountLimits {
                min: dec!(5),
                max: dec!(1000),
            },
        )])
        .unwrap();
        assert!(validator.validate(dec!(10), Currency::EGP).is_ok());
        assert!(validator.validate(dec!(1000.01), Currency::EGP).is_err());
        assert_eq!(validator.limits(Currency::USD).min, dec!(1));
    }

    #[test]
    fn test_overrides_reject_inverted_range() {
        let result = AmountValidator::with_overrides([(
            Currency::USD,
            AmountLimits {
                min: dec!(100),
                max: dec!(10),
            },
        )]);
        assert!(matches!(result, Err(ValidationError::Invalid(_))));

        let result = AmountValidator::with_overrides([(
            Currency::USD,
            AmountLimits {
                min: dec!(0),
                max: dec!(10),
            },
        )]);
        assert!(result.is_err());
    }

    #[test]
    fn test_parse_currency() {
        assert_eq!(parse_currency("sar").unwrap(), Currency::SAR);
        assert_eq!(
            parse_currency("GBP"),
            Err(ValidationError::UnsupportedCurrency("GBP".into()))
        );
    }
}
