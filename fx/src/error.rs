//! FX registry error types.

use civicledger_common::{Currency, CurrencyPair, Entity, LedgerError, Timestamp};
use rust_decimal::Decimal;
use thiserror::Error;

/// Errors that can occur in the FX registry.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum FxError {
    /// Currency code not registered.
    #[error("Unknown currency: {0}")]
    UnknownCurrency(Currency),

    /// Currency exists but is deactivated.
    #[error("Currency inactive: {0}")]
    InactiveCurrency(Currency),

    /// Currency code already registered.
    #[error("Currency already registered: {0}")]
    DuplicateCurrency(Currency),

    /// Currency code is not three ASCII letters.
    #[error("Invalid currency code: {0}")]
    InvalidCode(String),

    /// Currency is referenced by posted entries and cannot change.
    #[error("Currency {0} is referenced by posted entries and cannot be modified")]
    CurrencyImmutable(Currency),

    /// Rate must be strictly positive.
    #[error("Invalid rate {rate} for {pair}")]
    InvalidRate { pair: CurrencyPair, rate: Decimal },

    /// No rate effective at or before the requested time.
    #[error("Rate not available for {pair} at {at}")]
    RateNotAvailable { pair: CurrencyPair, at: Timestamp },
}

/// Result type for FX operations.
pub type FxResult<T> = Result<T, FxError>;

impl From<FxError> for LedgerError {
    fn from(err: FxError) -> Self {
        match err {
            FxError::RateNotAvailable { pair, .. } => LedgerError::UnbalancedAccounts {
                from: pair.base,
                to: pair.quote,
            },
            FxError::UnknownCurrency(code) => LedgerError::not_found(Entity::Currency, code),
            FxError::DuplicateCurrency(code) => LedgerError::Duplicate {
                entity: Entity::Currency,
                key: code.to_string(),
            },
            FxError::InvalidRate { rate, .. } => LedgerError::InvalidAmount(rate),
            other => LedgerError::validation(other.to_string(), "currency"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use civicledger_common::{now, ErrorKind};

    #[test]
    fn test_missing_rate_maps_to_unbalanced_accounts() {
        let pair = CurrencyPair::new(Currency::usd(), Currency::kes());
        let err: LedgerError = FxError::RateNotAvailable { pair, at: now() }.into();

        assert_eq!(
            err,
            LedgerError::UnbalancedAccounts {
                from: Currency::usd(),
                to: Currency::kes(),
            }
        );
        assert_eq!(err.kind(), ErrorKind::Validation);
    }
}
