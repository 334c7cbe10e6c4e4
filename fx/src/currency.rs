//! Currency definitions.

use civicledger_common::{Currency, Timestamp};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// A registered currency.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CurrencyDefinition {
    /// ISO 4217 code.
    pub code: Currency,
    /// Display name.
    pub name: String,
    /// Decimal places amounts are rounded to.
    pub decimal_places: u32,
    /// Whether new postings may use this currency.
    pub active: bool,
    /// Set once a posted ledger entry uses this currency; freezes the definition.
    pub referenced: bool,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl CurrencyDefinition {
    /// Round a value to this currency's declared precision.
    pub fn round(&self, value: Decimal) -> Decimal {
        value.round_dp(self.decimal_places)
    }
}

/// Request to register a currency.
#[derive(Debug, Clone)]
pub struct NewCurrency {
    pub code: Currency,
    pub name: String,
    /// Defaults to the ISO precision of the code.
    pub decimal_places: Option<u32>,
    /// Initial rate to the base currency, recorded as the first history entry.
    pub rate_to_base: Option<Decimal>,
}

impl NewCurrency {
    /// Register `code` with default precision and no initial rate.
    pub fn new(code: Currency, name: impl Into<String>) -> Self {
        Self {
            code,
            name: name.into(),
            decimal_places: None,
            rate_to_base: None,
        }
    }

    /// Declare a non-default precision.
    pub fn with_decimal_places(mut self, places: u32) -> Self {
        self.decimal_places = Some(places);
        self
    }

    /// Seed the rate history with a rate to the base currency.
    pub fn with_rate_to_base(mut self, rate: Decimal) -> Self {
        self.rate_to_base = Some(rate);
        self
    }
}
