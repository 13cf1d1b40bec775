//! Currency catalogue and USD-pivot exchange-rate conversion.
//!
//! Currencies are defined declaratively with the `define_currencies!` macro,
//! which generates the [`Currency`] enum together with its display symbol,
//! the default rate table and the default charge limits.
//!
//! # Adding a New Currency
//! Add a line to the `define_currencies!` invocation below:
//! ```ignore
//! define_currencies! {
//!     // ... existing currencies ...
//!     GBP => ("GBP", "£", (79, 2), 100, 1_000_000),
//! }
//! ```
//!
//! # Example
//! ```
//! use exchange_rates::{Currency, CurrencyConverter};
//! use rust_decimal::Decimal;
//!
//! let converter = CurrencyConverter::with_defaults();
//! let egp = converter.convert_amount(Decimal::new(10000, 2), Currency::USD, Currency::EGP);
//! assert_eq!(egp, Decimal::new(486000, 2));
//! ```

use rust_decimal::Decimal;

mod converter;
mod refresh;
mod source;
mod table;

pub use converter::{CurrencyConverter, RefreshStatus};
pub use refresh::RateRefresher;
pub use source::{HttpRateSource, RateSource, StaticRateSource};
pub use table::RateTable;

/// Errors raised while obtaining or validating a rate table.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ExchangeError {
    #[error("Rate service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Invalid rate for {currency}: {rate}")]
    InvalidRate { currency: Currency, rate: Decimal },

    #[error("Malformed rate table: {0}")]
    Malformed(String),
}

/// Returned when a currency code is not part of the catalogue.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unsupported currency: {0}")]
pub struct UnknownCurrency(pub String);

/// Macro to define currencies with their rate and limit defaults.
///
/// # Syntax
/// ```ignore
/// define_currencies! {
///     Name => ("CODE", "SYMBOL", (rate_mantissa, rate_scale), min_minor_units, max_minor_units),
/// }
/// ```
///
/// The rate is expressed in units of the currency per 1 USD; the limits are in
/// hundredths of the currency.
#[macro_export]
macro_rules! define_currencies {
    (
        $(
            $name:ident => ($code:literal, $symbol:literal, ($rate:expr, $scale:expr), $min:expr, $max:expr)
        ),* $(,)?
    ) => {
        /// Currencies supported by the billing core.
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord,
            serde::Serialize, serde::Deserialize, utoipa::ToSchema,
        )]
        #[serde(rename_all = "UPPERCASE")]
        pub enum Currency {
            $($name),*
        }

        impl Currency {
            pub fn code(&self) -> &'static str {
                match self {
                    $(Currency::$name => $code),*
                }
            }

            pub fn symbol(&self) -> &'static str {
                match self {
                    $(Currency::$name => $symbol),*
                }
            }

            /// Default units of this currency per 1 USD.
            pub fn default_rate(&self) -> rust_decimal::Decimal {
                match self {
                    $(Currency::$name => rust_decimal::Decimal::new($rate, $scale)),*
                }
            }

            /// Smallest amount a single charge may carry, absent operator overrides.
            pub fn default_min_amount(&self) -> rust_decimal::Decimal {
                match self {
                    $(Currency::$name => rust_decimal::Decimal::new($min, 2)),*
                }
            }

            /// Largest amount a single charge may carry, absent operator overrides.
            pub fn default_max_amount(&self) -> rust_decimal::Decimal {
                match self {
                    $(Currency::$name => rust_decimal::Decimal::new($max, 2)),*
                }
            }

            pub fn all() -> &'static [Currency] {
                &[$(Currency::$name),*]
            }
        }

        impl std::fmt::Display for Currency {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.code())
            }
        }

        impl std::str::FromStr for Currency {
            type Err = $crate::UnknownCurrency;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s.trim().to_uppercase().as_str() {
                    $($code => Ok(Currency::$name),)*
                    _ => Err($crate::UnknownCurrency(s.to_string())),
                }
            }
        }
    };
}

// ─────────────────────────────────────────────────────────────────────────────
// CURRENCY DEFINITIONS
// ─────────────────────────────────────────────────────────────────────────────

define_currencies! {
    USD => ("USD", "$", (1, 0), 100, 1_000_000),
    EUR => ("EUR", "€", (92, 2), 100, 1_000_000),
    EGP => ("EGP", "E£", (4860, 2), 5_000, 50_000_000),
    AED => ("AED", "د.إ", (36725, 4), 500, 3_600_000),
    SAR => ("SAR", "﷼", (375, 2), 500, 3_750_000),
    KWD => ("KWD", "د.ك", (3075, 4), 50, 300_000),
    QAR => ("QAR", "ر.ق", (364, 2), 500, 3_600_000),
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_currency_code_parse() {
        assert_eq!("USD".parse::<Currency>().unwrap(), Currency::USD);
        assert_eq!("egp".parse::<Currency>().unwrap(), Currency::EGP);
        assert_eq!(
            "XYZ".parse::<Currency>(),
            Err(UnknownCurrency("XYZ".to_string()))
        );
    }

    #[test]
    fn test_currency_code_display() {
        assert_eq!(Currency::KWD.to_string(), "KWD");
    }

    #[test]
    fn test_currency_serde_uses_code() {
        assert_eq!(serde_json::to_string(&Currency::AED).unwrap(), "\"AED\"");
        let parsed: Currency = serde_json::from_str("\"QAR\"").unwrap();
        assert_eq!(parsed, Currency::QAR);
    }

    #[test]
    fn test_default_limits() {
        assert_eq!(Currency::EGP.default_min_amount(), dec!(50));
        assert_eq!(Currency::USD.default_max_amount(), dec!(10000));
        assert_eq!(Currency::KWD.default_min_amount(), dec!(0.5));
        for currency in Currency::all() {
            assert!(currency.default_min_amount() < currency.default_max_amount());
            assert!(currency.default_rate() > Decimal::ZERO);
        }
    }

    #[test]
    fn test_currency_all() {
        assert_eq!(Currency::all().len(), 7);
        assert_eq!(Currency::USD.default_rate(), Decimal::ONE);
    }
}
