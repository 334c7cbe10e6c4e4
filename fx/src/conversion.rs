//! Currency conversion records.

use chrono::{DateTime, Utc};
use civicledger_common::{CurrencyPair, Money, Timestamp};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::registry::{RatePath, ResolvedRate};

/// Represents a completed currency conversion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversion {
    /// Unique conversion ID.
    pub id: Uuid,
    /// Input amount.
    pub input: Money,
    /// Output amount, rounded to the target currency's precision.
    pub output: Money,
    /// Unrounded rate applied.
    pub rate: Decimal,
    /// How the rate was resolved.
    pub path: RatePath,
    /// Effective time of the rate used, `None` for identity conversions.
    pub rate_effective_at: Option<Timestamp>,
    /// When the conversion was executed.
    pub executed_at: DateTime<Utc>,
}

impl Conversion {
    /// Create a new conversion record.
    pub fn new(input: Money, output: Money, resolved: ResolvedRate) -> Self {
        Self {
            id: Uuid::now_v7(),
            input,
            output,
            rate: resolved.rate,
            path: resolved.path,
            rate_effective_at: resolved.effective_at,
            executed_at: Utc::now(),
        }
    }

    /// Rate implied by the rounded output.
    pub fn effective_rate(&self) -> Decimal {
        if self.input.value.is_zero() {
            return Decimal::ZERO;
        }
        self.output.value / self.input.value
    }

    /// Get the currency pair.
    pub fn pair(&self) -> CurrencyPair {
        CurrencyPair::new(self.input.currency.clone(), self.output.currency.clone())
    }

    /// Whether input and output are the same currency.
    pub fn is_identity(&self) -> bool {
        self.path == RatePath::Identity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use civicledger_common::{now, Currency};
    use proptest::prelude::*;
    use rust_decimal_macros::dec;

    use crate::CurrencyRegistry;

    #[test]
    fn test_conversion_effective_rate() {
        let input = Money::new(dec!(1000), Currency::usd());
        let output = Money::new(dec!(129500), Currency::kes());
        let resolved = ResolvedRate {
            pair: CurrencyPair::new(Currency::usd(), Currency::kes()),
            rate: dec!(129.5),
            path: RatePath::Direct,
            effective_at: Some(now()),
        };

        let conversion = Conversion::new(input, output, resolved);

        assert_eq!(conversion.effective_rate(), dec!(129.5));
        assert_eq!(conversion.pair().quote, Currency::kes());
        assert!(!conversion.is_identity());
    }

    proptest! {
        #[test]
        fn converted_amounts_carry_target_precision(
            cents in 1i64..10_000_000,
            rate_milli in 1i64..500_000,
        ) {
            let registry = CurrencyRegistry::new(Currency::kes());
            registry
                .register_currency(crate::NewCurrency::new(Currency::usd(), "US Dollar"))
                .unwrap();
            let rate = Decimal::new(rate_milli, 3);
            registry
                .record_rate(Currency::usd(), Currency::kes(), rate, now(), "test")
                .unwrap();

            let amount = Money::new(Decimal::new(cents, 2), Currency::usd());
            let conversion = registry.convert(&amount, &Currency::kes(), now()).unwrap();

            prop_assert!(conversion.output.value.scale() <= 2);
            prop_assert_eq!(conversion.output.value, (amount.value * rate).round_dp(2));
        }
    }
}
