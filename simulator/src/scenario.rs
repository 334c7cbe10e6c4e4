//! Simulation scenarios.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// A simulation scenario.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scenario {
    pub name: String,
    pub description: String,
    pub steps: Vec<ScenarioStep>,
}

/// A step in a scenario. Amounts are in the base currency.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ScenarioStep {
    /// Top up every citizen's wallet through the gateway.
    FundWallets { amount: Decimal },
    /// Every citizen fires `attempts` withdrawals of `amount` at once.
    Withdraw { amount: Decimal, attempts: usize },
    /// One unallocated payment per citizen, each delivered `copies` times.
    Redeliver { amount: Decimal, copies: usize },
    /// Issue one invoice per citizen.
    IssueInvoices { category: String, amount: Decimal },
    /// Pay each open invoice in equal parts at once, plus one part too many.
    PayInvoices { installments: u32 },
    /// Run every background sweep once.
    RunSweeps,
    Assert { condition: AssertCondition },
}

/// Conditions that can be asserted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum AssertCondition {
    WalletsNonNegative,
    /// Every wallet's available balance equals `amount`.
    WalletBalancesEqual { amount: Decimal },
    /// Each distinct gateway id was processed once, however often delivered.
    EachDeliveryProcessedOnce,
    InvoicesSettled,
    ReceivablesCleared,
    LedgerReconciled,
    IntegrityHolds,
}

impl Scenario {
    /// Load a scenario by name.
    pub fn load(name: &str) -> anyhow::Result<Self> {
        match name {
            "wallet-contention" => Ok(Self::wallet_contention()),
            "callback-redelivery" => Ok(Self::callback_redelivery()),
            "invoice-settlement" => Ok(Self::invoice_settlement()),
            _ => Err(anyhow::anyhow!("Unknown scenario: {}", name)),
        }
    }

    /// Withdrawals racing for the same wallet balance.
    fn wallet_contention() -> Self {
        Self {
            name: "wallet-contention".to_string(),
            description: "25 concurrent withdrawals of 100 against a balance of 1000".to_string(),
            steps: vec![
                ScenarioStep::FundWallets {
                    amount: Decimal::from(1000),
                },
                ScenarioStep::Withdraw {
                    amount: Decimal::from(100),
                    attempts: 25,
                },
                ScenarioStep::Assert {
                    condition: AssertCondition::WalletsNonNegative,
                },
                ScenarioStep::Assert {
                    condition: AssertCondition::WalletBalancesEqual {
                        amount: Decimal::ZERO,
                    },
                },
                ScenarioStep::RunSweeps,
                ScenarioStep::Assert {
                    condition: AssertCondition::LedgerReconciled,
                },
                ScenarioStep::Assert {
                    condition: AssertCondition::IntegrityHolds,
                },
            ],
        }
    }

    /// The gateway retries callbacks it believes were lost.
    fn callback_redelivery() -> Self {
        Self {
            name: "callback-redelivery".to_string(),
            description: "Top-ups and unallocated payments each delivered several times".to_string(),
            steps: vec![
                ScenarioStep::FundWallets {
                    amount: Decimal::from(500),
                },
                ScenarioStep::Redeliver {
                    amount: Decimal::from(250),
                    copies: 5,
                },
                ScenarioStep::Assert {
                    condition: AssertCondition::EachDeliveryProcessedOnce,
                },
                ScenarioStep::Assert {
                    condition: AssertCondition::WalletBalancesEqual {
                        amount: Decimal::from(500),
                    },
                },
                ScenarioStep::Assert {
                    condition: AssertCondition::LedgerReconciled,
                },
                ScenarioStep::Assert {
                    condition: AssertCondition::IntegrityHolds,
                },
            ],
        }
    }

    /// Installment payments racing to settle each invoice.
    fn invoice_settlement() -> Self {
        Self {
            name: "invoice-settlement".to_string(),
            description: "Invoices paid in concurrent installments with one overpayment each".to_string(),
            steps: vec![
                ScenarioStep::IssueInvoices {
                    category: "business-permit".to_string(),
                    amount: Decimal::from(1000),
                },
                ScenarioStep::PayInvoices { installments: 4 },
                ScenarioStep::Assert {
                    condition: AssertCondition::InvoicesSettled,
                },
                ScenarioStep::Assert {
                    condition: AssertCondition::ReceivablesCleared,
                },
                ScenarioStep::RunSweeps,
                ScenarioStep::Assert {
                    condition: AssertCondition::LedgerReconciled,
                },
                ScenarioStep::Assert {
                    condition: AssertCondition::IntegrityHolds,
                },
            ],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_known_scenarios() {
        for name in ["wallet-contention", "callback-redelivery", "invoice-settlement"] {
            let scenario = Scenario::load(name).unwrap();
            assert_eq!(scenario.name, name);
            assert!(!scenario.steps.is_empty());
        }
        assert!(Scenario::load("simple-settlement").is_err());
    }
}
