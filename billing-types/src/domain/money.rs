//! Type-safe monetary value with embedded currency.

use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::ValidationError;
use crate::validation::check_precision;

pub use exchange_rates::Currency;

/// A non-negative amount of one currency, with at most 2 decimal places.
///
/// The amount is kept at scale 2, so `Money` serializes as `"50.00"` and maps
/// exactly onto integer minor units for storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, utoipa::ToSchema)]
pub struct Money {
    #[schema(value_type = String, example = "50.00")]
    amount: Decimal,
    currency: Currency,
}

impl Money {
    /// Creates a new Money value.
    pub fn new(amount: Decimal, currency: Currency) -> Result<Self, ValidationError> {
        if amount.is_sign_negative() && !amount.is_zero() {
            return Err(ValidationError::NegativeAmount);
        }
        check_precision(amount)?;
        Ok(Self {
            amount: at_scale_2(amount),
            currency,
        })
    }

    pub fn zero(currency: Currency) -> Self {
        Self {
            amount: at_scale_2(Decimal::ZERO),
            currency,
        }
    }

    /// Rebuilds a value from hundredths of the currency.
    pub fn from_minor_units(units: i64, currency: Currency) -> Result<Self, ValidationError> {
        Self::new(Decimal::new(units, 2), currency)
    }

    pub fn amount(&self) -> Decimal {
        self.amount
    }

    pub fn currency(&self) -> Currency {
        self.currency
    }

    pub fn is_zero(&self) -> bool {
        self.amount.is_zero()
    }

    /// The amount in hundredths of the currency.
    pub fn minor_units(&self) -> Result<i64, ValidationError> {
        (self.amount * Decimal::ONE_HUNDRED)
            .to_i64()
            .ok_or_else(|| ValidationError::Invalid(format!("amount {} is too large", self)))
    }

    /// Checked addition - returns error if currencies don't match.
    pub fn checked_add(&self, other: Money) -> Result<Money, ValidationError> {
        self.ensure_same_currency(&other)?;
        let amount = self
            .amount
            .checked_add(other.amount)
            .ok_or_else(|| ValidationError::Invalid("amount overflow".into()))?;
        Ok(Money {
            amount,
            currency: self.currency,
        })
    }

    /// Checked subtraction - returns error if currencies don't match or the
    /// result would be negative.
    pub fn checked_sub(&self, other: Money) -> Result<Money, ValidationError> {
        self.ensure_same_currency(&other)?;
        if self.amount < other.amount {
            return Err(ValidationError::NegativeAmount);
        }
        Ok(Money {
            amount: self.amount - other.amount,
            currency: self.currency,
        })
    }

    pub fn ensure_same_currency(&self, other: &Money) -> Result<(), ValidationError> {
        if self.currency != other.currency {
            return Err(ValidationError::CurrencyMismatch {
                expected: self.currency,
                got: other.currency,
            });
        }
        Ok(())
    }

    /// Converts into `to` through the converter's current rate table.
    pub fn convert(
        &self,
        converter: &exchange_rates::CurrencyConverter,
        to: Currency,
    ) -> Result<Money, ValidationError> {
        if self.currency == to {
            return Ok(*self);
        }
        Money::new(converter.convert_amount(self.amount, self.currency, to), to)
    }
}

fn at_scale_2(amount: Decimal) -> Decimal {
    let mut amount = amount.normalize();
    amount.rescale(2);
    amount
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.amount, self.currency)
    }
}
