//! CivicLedger FX Registry
//!
//! Currency definitions and the append-only history of exchange rates
//! between currency pairs.
//!
//! # Features
//!
//! - Currency definitions frozen once a posted entry references them
//! - Rates appended with an effective timestamp, never edited
//! - Point-in-time lookups: the latest rate at or before a given instant
//! - Inverse and base-currency triangulated resolution
//!
//! # Example
//!
//! ```rust,ignore
//! use civicledger_fx::{CurrencyRegistry, NewCurrency};
//! use civicledger_common::{now, Currency, Money};
//!
//! let registry = CurrencyRegistry::new(Currency::kes());
//! registry.register_currency(NewCurrency::new(Currency::usd(), "US Dollar"))?;
//! registry.record_rate(Currency::usd(), Currency::kes(), dec!(129.50), now(), "CBK")?;
//!
//! let kes = registry.convert(&Money::new(dec!(10), Currency::usd()), &Currency::kes(), now())?;
//! ```

pub mod currency;
pub mod registry;
pub mod conversion;
pub mod error;

pub use currency::{CurrencyDefinition, NewCurrency};
pub use registry::{CurrencyRegistry, ExchangeRate, RatePath, ResolvedRate};
pub use conversion::Conversion;
pub use error::{FxError, FxResult};
