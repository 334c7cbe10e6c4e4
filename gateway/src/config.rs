//! Service configuration.

use std::collections::HashSet;
use std::str::FromStr;
use std::time::Duration;

use civicledger_common::Currency;
use civicledger_wallet::WalletLimits;
use rust_decimal::Decimal;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("{var}: cannot parse {value:?}")]
    Unparsable { var: &'static str, value: String },

    #[error("{0}")]
    Invalid(String),
}

/// Numbers of the system accounts the service posts against.
#[derive(Debug, Clone)]
pub struct AccountsConfig {
    /// Asset: money held at the payment gateway.
    pub clearing: String,
    /// Asset: amounts owed on invoices.
    pub receivables: String,
    /// Liability: funds held in citizen wallets.
    pub wallet_float: String,
    /// Liability: payments with no declared purpose.
    pub suspense: String,
    /// Income: billed services.
    pub revenue: String,
}

impl Default for AccountsConfig {
    fn default() -> Self {
        Self {
            clearing: "1200".to_string(),
            receivables: "1300".to_string(),
            wallet_float: "2100".to_string(),
            suspense: "2900".to_string(),
            revenue: "4000".to_string(),
        }
    }
}

/// Default limits applied to new wallets.
#[derive(Debug, Clone, Default)]
pub struct WalletConfig {
    pub transaction_limit: Option<Decimal>,
    pub daily_limit: Option<Decimal>,
    pub monthly_limit: Option<Decimal>,
}

impl WalletConfig {
    pub fn limits(&self) -> WalletLimits {
        WalletLimits {
            transaction: self.transaction_limit,
            daily: self.daily_limit,
            monthly: self.monthly_limit,
        }
    }
}

/// Background sweep intervals.
#[derive(Debug, Clone)]
pub struct SweepConfig {
    pub lock_expiry_interval: Duration,
    pub overdue_interval: Duration,
    pub reconciliation_interval: Duration,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            lock_expiry_interval: Duration::from_secs(30),
            overdue_interval: Duration::from_secs(300),
            reconciliation_interval: Duration::from_secs(3600),
        }
    }
}

/// Main service configuration.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Node ID; generated at startup when absent.
    pub node_id: Option<String>,
    pub base_currency: Currency,
    pub accounts: AccountsConfig,
    pub wallet: WalletConfig,
    pub sweep: SweepConfig,
    pub log_level: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            node_id: None,
            base_currency: Currency::kes(),
            accounts: AccountsConfig::default(),
            wallet: WalletConfig::default(),
            sweep: SweepConfig::default(),
            log_level: "info".to_string(),
        }
    }
}

impl ServiceConfig {
    /// Load configuration from environment variables over the defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Load configuration from any variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(id) = lookup("LEDGER_NODE_ID") {
            config.node_id = Some(id);
        }
        if let Some(code) = lookup("LEDGER_BASE_CURRENCY") {
            config.base_currency = Currency::new(code);
        }
        if let Some(number) = lookup("LEDGER_CLEARING_ACCOUNT") {
            config.accounts.clearing = number;
        }
        if let Some(number) = lookup("LEDGER_RECEIVABLES_ACCOUNT") {
            config.accounts.receivables = number;
        }
        if let Some(number) = lookup("LEDGER_WALLET_FLOAT_ACCOUNT") {
            config.accounts.wallet_float = number;
        }
        if let Some(number) = lookup("LEDGER_SUSPENSE_ACCOUNT") {
            config.accounts.suspense = number;
        }
        if let Some(number) = lookup("LEDGER_REVENUE_ACCOUNT") {
            config.accounts.revenue = number;
        }

        config.wallet.transaction_limit =
            parse(&lookup, "WALLET_TRANSACTION_LIMIT")?.or(config.wallet.transaction_limit);
        config.wallet.daily_limit = parse(&lookup, "WALLET_DAILY_LIMIT")?.or(config.wallet.daily_limit);
        config.wallet.monthly_limit =
            parse(&lookup, "WALLET_MONTHLY_LIMIT")?.or(config.wallet.monthly_limit);

        if let Some(secs) = parse::<u64>(&lookup, "SWEEP_LOCK_EXPIRY_SECS")? {
            config.sweep.lock_expiry_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = parse::<u64>(&lookup, "SWEEP_OVERDUE_SECS")? {
            config.sweep.overdue_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = parse::<u64>(&lookup, "SWEEP_RECONCILIATION_SECS")? {
            config.sweep.reconciliation_interval = Duration::from_secs(secs);
        }

        if let Some(level) = lookup("LOG_LEVEL") {
            config.log_level = level;
        }

        Ok(config)
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.base_currency.is_valid() {
            return Err(ConfigError::Invalid(format!(
                "Base currency {} is not an ISO 4217 code",
                self.base_currency
            )));
        }

        let numbers = [
            &self.accounts.clearing,
            &self.accounts.receivables,
            &self.accounts.wallet_float,
            &self.accounts.suspense,
            &self.accounts.revenue,
        ];
        if numbers.iter().any(|n| n.trim().is_empty()) {
            return Err(ConfigError::Invalid("System account numbers cannot be empty".to_string()));
        }
        let distinct: HashSet<&str> = numbers.iter().map(|n| n.trim()).collect();
        if distinct.len() != numbers.len() {
            return Err(ConfigError::Invalid("System account numbers must be distinct".to_string()));
        }

        let sweeps = [
            self.sweep.lock_expiry_interval,
            self.sweep.overdue_interval,
            self.sweep.reconciliation_interval,
        ];
        if sweeps.iter().any(Duration::is_zero) {
            return Err(ConfigError::Invalid("Sweep intervals cannot be zero".to_string()));
        }

        self.wallet
            .limits()
            .validate()
            .map_err(|e| ConfigError::Invalid(format!("Wallet limits: {}", e)))?;

        Ok(())
    }
}

fn parse<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<Option<T>, ConfigError> {
    match lookup(var) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Unparsable { var, value }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use rust_decimal_macros::dec;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |var| vars.get(var).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = ServiceConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.base_currency, Currency::kes());
    }

    #[test]
    fn test_from_lookup() {
        let config = ServiceConfig::from_lookup(lookup(&[
            ("LEDGER_BASE_CURRENCY", "ugx"),
            ("WALLET_DAILY_LIMIT", "150000"),
            ("WALLET_TRANSACTION_LIMIT", "70000"),
            ("SWEEP_OVERDUE_SECS", "60"),
        ]))
        .unwrap();

        assert_eq!(config.base_currency, Currency::ugx());
        assert_eq!(config.wallet.daily_limit, Some(dec!(150000)));
        assert_eq!(config.wallet.limits().transaction, Some(dec!(70000)));
        assert_eq!(config.sweep.overdue_interval, Duration::from_secs(60));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_unparsable_value() {
        let err = ServiceConfig::from_lookup(lookup(&[("WALLET_DAILY_LIMIT", "lots")])).unwrap_err();
        assert_eq!(
            err,
            ConfigError::Unparsable {
                var: "WALLET_DAILY_LIMIT",
                value: "lots".to_string(),
            }
        );
    }

    #[test]
    fn test_invalid_config() {
        let mut config = ServiceConfig::default();
        config.accounts.suspense = config.accounts.clearing.clone();
        assert!(config.validate().is_err());

        let mut config = ServiceConfig::default();
        config.sweep.overdue_interval = Duration::ZERO;
        assert!(config.validate().is_err());

        let mut config = ServiceConfig::default();
        config.wallet.transaction_limit = Some(dec!(5000));
        config.wallet.daily_limit = Some(dec!(1000));
        assert!(config.validate().is_err());
    }
}
