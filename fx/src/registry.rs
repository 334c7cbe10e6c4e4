//! Currency registry and exchange-rate history.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use civicledger_common::{now, Currency, CurrencyPair, Money, Timestamp};
use dashmap::DashMap;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::conversion::Conversion;
use crate::currency::{CurrencyDefinition, NewCurrency};
use crate::error::{FxError, FxResult};

/// One appended rate observation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeRate {
    /// Unique rate ID.
    pub id: Uuid,
    /// Pair the rate converts (one unit of `base` buys `rate` units of `quote`).
    pub pair: CurrencyPair,
    /// Conversion factor.
    pub rate: Decimal,
    /// Instant from which the rate applies.
    pub effective_at: Timestamp,
    /// When the rate was recorded.
    pub recorded_at: Timestamp,
    /// Rate source (central bank, gateway, manual).
    pub source: String,
    /// Recording order; breaks ties between equal `effective_at`.
    pub sequence: u64,
}

/// How a rate was resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RatePath {
    /// Same currency on both sides.
    Identity,
    /// Rate recorded for the pair.
    Direct,
    /// Reciprocal of the rate recorded for the reverse pair.
    Inverse,
    /// Product of two legs through the base currency.
    Triangulated { via: Currency },
}

/// A rate resolved for a point in time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolvedRate {
    pub pair: CurrencyPair,
    pub rate: Decimal,
    pub path: RatePath,
    /// Effective time of the oldest history entry used.
    pub effective_at: Option<Timestamp>,
}

/// Registry of currencies and their rate history.
///
/// Rate history is append-only, so lookups are point-in-time reads that
/// never observe a rate being edited.
pub struct CurrencyRegistry {
    base: Currency,
    currencies: DashMap<Currency, CurrencyDefinition>,
    /// Rates per pair, sorted by (`effective_at`, `sequence`).
    rates: DashMap<CurrencyPair, Vec<ExchangeRate>>,
    sequence: AtomicU64,
}

impl CurrencyRegistry {
    /// Create a registry whose base currency is registered and active.
    pub fn new(base: Currency) -> Self {
        let registry = Self {
            base: base.clone(),
            currencies: DashMap::new(),
            rates: DashMap::new(),
            sequence: AtomicU64::new(0),
        };
        let timestamp = now();
        registry.currencies.insert(
            base.clone(),
            CurrencyDefinition {
                name: base.code().to_string(),
                decimal_places: base.decimal_places(),
                code: base,
                active: true,
                referenced: false,
                created_at: timestamp,
                updated_at: timestamp,
            },
        );
        registry
    }

    /// The base currency.
    pub fn base(&self) -> &Currency {
        &self.base
    }

    /// Register a new currency.
    #[instrument(skip(self, new), fields(code = %new.code))]
    pub fn register_currency(&self, new: NewCurrency) -> FxResult<CurrencyDefinition> {
        if !new.code.is_valid() {
            return Err(FxError::InvalidCode(new.code.code().to_string()));
        }
        if self.currencies.contains_key(&new.code) {
            return Err(FxError::DuplicateCurrency(new.code));
        }
        if let Some(rate) = new.rate_to_base.filter(|rate| *rate <= Decimal::ZERO) {
            return Err(FxError::InvalidRate {
                pair: CurrencyPair::new(new.code, self.base.clone()),
                rate,
            });
        }

        let timestamp = now();
        let definition = CurrencyDefinition {
            decimal_places: new.decimal_places.unwrap_or_else(|| new.code.decimal_places()),
            code: new.code.clone(),
            name: new.name,
            active: true,
            referenced: false,
            created_at: timestamp,
            updated_at: timestamp,
        };
        self.currencies.insert(new.code.clone(), definition.clone());

        if let Some(rate) = new.rate_to_base {
            if new.code != self.base {
                let seeded =
                    self.record_rate(new.code.clone(), self.base.clone(), rate, timestamp, "registration");
                if let Err(e) = seeded {
                    self.currencies.remove(&new.code);
                    return Err(e);
                }
            }
        }

        info!(code = %new.code, "Currency registered");
        Ok(definition)
    }

    /// Get a currency definition.
    pub fn currency(&self, code: &Currency) -> FxResult<CurrencyDefinition> {
        self.currencies
            .get(code)
            .map(|c| c.clone())
            .ok_or_else(|| FxError::UnknownCurrency(code.clone()))
    }

    /// Get a currency definition that is active.
    pub fn active_currency(&self, code: &Currency) -> FxResult<CurrencyDefinition> {
        let definition = self.currency(code)?;
        if !definition.active {
            return Err(FxError::InactiveCurrency(code.clone()));
        }
        Ok(definition)
    }

    /// Change name or precision of a currency not yet referenced.
    pub fn update_currency(
        &self,
        code: &Currency,
        name: Option<String>,
        decimal_places: Option<u32>,
    ) -> FxResult<CurrencyDefinition> {
        let mut definition = self
            .currencies
            .get_mut(code)
            .ok_or_else(|| FxError::UnknownCurrency(code.clone()))?;

        if definition.referenced {
            return Err(FxError::CurrencyImmutable(code.clone()));
        }
        if let Some(name) = name {
            definition.name = name;
        }
        if let Some(places) = decimal_places {
            definition.decimal_places = places;
        }
        definition.updated_at = now();
        Ok(definition.clone())
    }

    /// Stop accepting new postings in this currency.
    pub fn deactivate_currency(&self, code: &Currency) -> FxResult<()> {
        let mut definition = self
            .currencies
            .get_mut(code)
            .ok_or_else(|| FxError::UnknownCurrency(code.clone()))?;
        definition.active = false;
        definition.updated_at = now();
        info!(code = %code, "Currency deactivated");
        Ok(())
    }

    /// Freeze a currency definition; called when a posted entry uses it.
    pub fn mark_referenced(&self, code: &Currency) {
        if let Some(mut definition) = self.currencies.get_mut(code) {
            if !definition.referenced {
                definition.referenced = true;
                definition.updated_at = now();
            }
        }
    }

    /// Round a value to the registered precision of `code`.
    pub fn round(&self, code: &Currency, value: Decimal) -> Decimal {
        match self.currencies.get(code) {
            Some(definition) => definition.round(value),
            None => code.round(value),
        }
    }

    /// Append a rate to the history.
    #[instrument(skip(self, source))]
    pub fn record_rate(
        &self,
        from: Currency,
        to: Currency,
        rate: Decimal,
        effective_at: DateTime<Utc>,
        source: impl Into<String> + std::fmt::Debug,
    ) -> FxResult<ExchangeRate> {
        let pair = CurrencyPair::new(from, to);
        if rate <= Decimal::ZERO || pair.is_identity() {
            return Err(FxError::InvalidRate { pair, rate });
        }
        self.active_currency(&pair.base)?;
        self.active_currency(&pair.quote)?;

        let record = ExchangeRate {
            id: Uuid::now_v7(),
            pair: pair.clone(),
            rate,
            effective_at,
            recorded_at: now(),
            source: source.into(),
            sequence: self.sequence.fetch_add(1, Ordering::SeqCst),
        };

        let mut history = self.rates.entry(pair.clone()).or_default();
        // Equal effective times land after existing ones, so the newest recording wins ties.
        let position = history.partition_point(|r| r.effective_at <= effective_at);
        history.insert(position, record.clone());

        info!(pair = %pair, rate = %rate, effective_at = %effective_at, "Rate recorded");
        Ok(record)
    }

    /// Full history for a pair, oldest first.
    pub fn history(&self, pair: &CurrencyPair) -> Vec<ExchangeRate> {
        self.rates.get(pair).map(|h| h.clone()).unwrap_or_default()
    }

    /// Latest rate recorded for exactly this pair at or before `at`.
    fn direct_rate(&self, pair: &CurrencyPair, at: Timestamp) -> Option<ExchangeRate> {
        let history = self.rates.get(pair)?;
        let position = history.partition_point(|r| r.effective_at <= at);
        position.checked_sub(1).map(|i| history[i].clone())
    }

    /// Direct or inverse rate for a pair.
    fn leg_rate(&self, pair: &CurrencyPair, at: Timestamp) -> Option<(Decimal, RatePath, Timestamp)> {
        if let Some(rate) = self.direct_rate(pair, at) {
            return Some((rate.rate, RatePath::Direct, rate.effective_at));
        }
        self.direct_rate(&pair.inverse(), at)
            .map(|rate| (Decimal::ONE / rate.rate, RatePath::Inverse, rate.effective_at))
    }

    /// Resolve the rate converting `from` into `to` as of `at`.
    ///
    /// Resolution order: identity, direct, inverse, then triangulation
    /// through the base currency. Each leg uses the latest rate effective
    /// at or before `at`.
    pub fn rate_at(&self, from: &Currency, to: &Currency, at: Timestamp) -> FxResult<ResolvedRate> {
        let pair = CurrencyPair::new(from.clone(), to.clone());
        self.currency(from)?;
        self.currency(to)?;

        if pair.is_identity() {
            return Ok(ResolvedRate {
                pair,
                rate: Decimal::ONE,
                path: RatePath::Identity,
                effective_at: None,
            });
        }

        if let Some((rate, path, effective_at)) = self.leg_rate(&pair, at) {
            debug!(pair = %pair, rate = %rate, ?path, "Rate resolved");
            return Ok(ResolvedRate {
                pair,
                rate,
                path,
                effective_at: Some(effective_at),
            });
        }

        if *from != self.base && *to != self.base {
            let to_base = CurrencyPair::new(from.clone(), self.base.clone());
            let from_base = CurrencyPair::new(self.base.clone(), to.clone());
            if let (Some((first, _, first_at)), Some((second, _, second_at))) =
                (self.leg_rate(&to_base, at), self.leg_rate(&from_base, at))
            {
                let rate = first * second;
                debug!(pair = %pair, rate = %rate, via = %self.base, "Rate triangulated");
                return Ok(ResolvedRate {
                    pair,
                    rate,
                    path: RatePath::Triangulated {
                        via: self.base.clone(),
                    },
                    effective_at: Some(first_at.min(second_at)),
                });
            }
        }

        Err(FxError::RateNotAvailable { pair, at })
    }

    /// Convert an amount into `to` using the rate effective at `at`.
    pub fn convert(&self, amount: &Money, to: &Currency, at: Timestamp) -> FxResult<Conversion> {
        let resolved = self.rate_at(&amount.currency, to, at)?;
        let output = Money::new(self.round(to, amount.value * resolved.rate), to.clone());
        Ok(Conversion::new(amount.clone(), output, resolved))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use rust_decimal_macros::dec;

    fn registry() -> CurrencyRegistry {
        let registry = CurrencyRegistry::new(Currency::kes());
        registry
            .register_currency(NewCurrency::new(Currency::usd(), "US Dollar"))
            .unwrap();
        registry
            .register_currency(NewCurrency::new(Currency::ugx(), "Uganda Shilling"))
            .unwrap();
        registry
    }

    #[test]
    fn test_registration_with_bad_seed_rate_leaves_nothing() {
        let registry = CurrencyRegistry::new(Currency::kes());

        let result = registry
            .register_currency(NewCurrency::new(Currency::usd(), "US Dollar").with_rate_to_base(dec!(0)));
        assert!(matches!(result, Err(FxError::InvalidRate { .. })));
        assert!(registry.currency(&Currency::usd()).is_err());
        assert!(registry.history(&CurrencyPair::new(Currency::usd(), Currency::kes())).is_empty());

        // The code stays free for a corrected registration.
        registry
            .register_currency(NewCurrency::new(Currency::usd(), "US Dollar").with_rate_to_base(dec!(130)))
            .unwrap();
        assert_eq!(
            registry.rate_at(&Currency::usd(), &Currency::kes(), now()).unwrap().rate,
            dec!(130)
        );
    }

    #[test]
    fn test_latest_rate_at_or_before() {
        let registry = registry();
        let t0 = now() - Duration::days(10);

        registry
            .record_rate(Currency::usd(), Currency::kes(), dec!(128), t0, "CBK")
            .unwrap();
        registry
            .record_rate(Currency::usd(), Currency::kes(), dec!(130), t0 + Duration::days(5), "CBK")
            .unwrap();

        let before = registry.rate_at(&Currency::usd(), &Currency::kes(), t0 + Duration::days(1));
        assert_eq!(before.unwrap().rate, dec!(128));

        let after = registry.rate_at(&Currency::usd(), &Currency::kes(), t0 + Duration::days(6));
        assert_eq!(after.unwrap().rate, dec!(130));

        let too_early = registry.rate_at(&Currency::usd(), &Currency::kes(), t0 - Duration::days(1));
        assert!(matches!(too_early, Err(FxError::RateNotAvailable { .. })));
    }

    #[test]
    fn test_backdated_rate_is_ordered_by_effective_time() {
        let registry = registry();
        let t0 = now() - Duration::days(10);

        registry
            .record_rate(Currency::usd(), Currency::kes(), dec!(130), t0 + Duration::days(5), "CBK")
            .unwrap();
        registry
            .record_rate(Currency::usd(), Currency::kes(), dec!(128), t0, "CBK")
            .unwrap();

        let history = registry.history(&CurrencyPair::new(Currency::usd(), Currency::kes()));
        assert_eq!(history[0].rate, dec!(128));
        assert_eq!(history[1].rate, dec!(130));
    }

    #[test]
    fn test_equal_effective_time_latest_recorded_wins() {
        let registry = registry();
        let t0 = now() - Duration::hours(1);

        registry
            .record_rate(Currency::usd(), Currency::kes(), dec!(128), t0, "CBK")
            .unwrap();
        registry
            .record_rate(Currency::usd(), Currency::kes(), dec!(129), t0, "manual")
            .unwrap();

        let rate = registry.rate_at(&Currency::usd(), &Currency::kes(), now()).unwrap();
        assert_eq!(rate.rate, dec!(129));
    }

    #[test]
    fn test_inverse_and_triangulated_rates() {
        let registry = registry();
        let t0 = now() - Duration::hours(1);

        registry
            .record_rate(Currency::usd(), Currency::kes(), dec!(125), t0, "CBK")
            .unwrap();
        registry
            .record_rate(Currency::kes(), Currency::ugx(), dec!(28), t0, "CBK")
            .unwrap();

        let inverse = registry.rate_at(&Currency::kes(), &Currency::usd(), now()).unwrap();
        assert_eq!(inverse.path, RatePath::Inverse);
        assert_eq!(inverse.rate, dec!(0.008));

        let triangulated = registry.rate_at(&Currency::usd(), &Currency::ugx(), now()).unwrap();
        assert_eq!(
            triangulated.path,
            RatePath::Triangulated {
                via: Currency::kes()
            }
        );
        assert_eq!(triangulated.rate, dec!(3500));
    }

    #[test]
    fn test_convert_rounds_to_target_precision() {
        let registry = registry();
        registry
            .record_rate(Currency::usd(), Currency::kes(), dec!(129.4567), now() - Duration::minutes(1), "CBK")
            .unwrap();

        let conversion = registry
            .convert(&Money::new(dec!(10), Currency::usd()), &Currency::kes(), now())
            .unwrap();
        assert_eq!(conversion.output.value, dec!(1294.57));
        assert_eq!(conversion.output.currency, Currency::kes());
    }

    #[test]
    fn test_identity_rate() {
        let registry = registry();
        let rate = registry.rate_at(&Currency::kes(), &Currency::kes(), now()).unwrap();
        assert_eq!(rate.rate, Decimal::ONE);
        assert_eq!(rate.path, RatePath::Identity);
    }

    #[test]
    fn test_rejects_invalid_rates() {
        let registry = registry();
        let result = registry.record_rate(Currency::usd(), Currency::kes(), dec!(0), now(), "CBK");
        assert!(matches!(result, Err(FxError::InvalidRate { .. })));

        let result = registry.record_rate(Currency::new("XYZ"), Currency::kes(), dec!(1), now(), "CBK");
        assert!(matches!(result, Err(FxError::UnknownCurrency(_))));
    }

    #[test]
    fn test_referenced_currency_is_immutable() {
        let registry = registry();
        registry
            .update_currency(&Currency::usd(), Some("Dollar".into()), None)
            .unwrap();

        registry.mark_referenced(&Currency::usd());
        let result = registry.update_currency(&Currency::usd(), None, Some(3));
        assert!(matches!(result, Err(FxError::CurrencyImmutable(_))));
    }

    #[test]
    fn test_registration_seeds_rate_to_base() {
        let registry = CurrencyRegistry::new(Currency::kes());
        registry
            .register_currency(NewCurrency::new(Currency::eur(), "Euro").with_rate_to_base(dec!(140)))
            .unwrap();

        let rate = registry.rate_at(&Currency::eur(), &Currency::kes(), now()).unwrap();
        assert_eq!(rate.rate, dec!(140));
    }

    #[test]
    fn test_inactive_currency_rejects_new_rates() {
        let registry = registry();
        registry.deactivate_currency(&Currency::ugx()).unwrap();
        let result = registry.record_rate(Currency::ugx(), Currency::kes(), dec!(0.035), now(), "CBK");
        assert!(matches!(result, Err(FxError::InactiveCurrency(_))));
    }
}
