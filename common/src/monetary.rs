//! Monetary types for the settlement core.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A monetary amount with currency.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Money {
    /// The amount value (high precision decimal).
    pub value: Decimal,
    /// ISO 4217 currency code.
    pub currency: Currency,
}

impl Money {
    /// Create a new Money instance.
    pub fn new(value: Decimal, currency: Currency) -> Self {
        Self { value, currency }
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.value, self.currency)
    }
}

/// ISO 4217 currency code.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Currency(String);

impl Currency {
    /// Create a new currency from code.
    pub fn new(code: impl Into<String>) -> Self {
        Self(code.into().trim().to_uppercase())
    }

    /// Get the currency code.
    pub fn code(&self) -> &str {
        &self.0
    }

    /// Check the code is three ASCII letters.
    pub fn is_valid(&self) -> bool {
        self.0.len() == 3 && self.0.chars().all(|c| c.is_ascii_uppercase())
    }

    /// Get the standard decimal places for this currency.
    ///
    /// The registry may declare a different precision; this is the ISO
    /// default used when none is declared.
    pub fn decimal_places(&self) -> u32 {
        match self.0.as_str() {
            "JPY" | "KRW" | "UGX" | "RWF" | "BIF" => 0,
            "BHD" | "KWD" | "OMR" => 3,
            _ => 2,
        }
    }

    /// Round a value to this currency's precision (banker's rounding).
    pub fn round(&self, value: Decimal) -> Decimal {
        value.round_dp(self.decimal_places())
    }

    /// Common currencies
    pub fn kes() -> Self {
        Self::new("KES")
    }

    pub fn usd() -> Self {
        Self::new("USD")
    }

    pub fn eur() -> Self {
        Self::new("EUR")
    }

    pub fn ugx() -> Self {
        Self::new("UGX")
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Currency {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// An ordered currency pair (`from` converts into `to`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CurrencyPair {
    /// Currency being converted.
    pub base: Currency,
    /// Currency the rate is quoted in.
    pub quote: Currency,
}

impl CurrencyPair {
    /// Create a new currency pair.
    pub fn new(base: Currency, quote: Currency) -> Self {
        Self { base, quote }
    }

    /// Get the inverse pair.
    pub fn inverse(&self) -> Self {
        Self {
            base: self.quote.clone(),
            quote: self.base.clone(),
        }
    }

    /// True when both sides are the same currency.
    pub fn is_identity(&self) -> bool {
        self.base == self.quote
    }
}

impl fmt::Display for CurrencyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.base, self.quote)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_money_display() {
        let money = Money::new(dec!(1250.50), Currency::kes());
        assert_eq!(money.to_string(), "1250.50 KES");
    }

    #[test]
    fn test_currency_rounding() {
        assert_eq!(Currency::kes().round(dec!(10.005)), dec!(10.00));
        assert_eq!(Currency::kes().round(dec!(10.015)), dec!(10.02));
        assert_eq!(Currency::ugx().round(dec!(3701.6)), dec!(3702));
    }

    #[test]
    fn test_currency_code_normalised() {
        let currency = Currency::new(" kes ");
        assert_eq!(currency.code(), "KES");
        assert!(currency.is_valid());
        assert!(!Currency::new("KESH").is_valid());
    }

    #[test]
    fn test_pair_inverse() {
        let pair = CurrencyPair::new(Currency::usd(), Currency::kes());
        assert_eq!(pair.inverse().base, Currency::kes());
        assert!(!pair.is_identity());
        assert!(CurrencyPair::new(Currency::kes(), Currency::kes()).is_identity());
    }
}
