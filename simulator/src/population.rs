//! Simulated citizens.

use civicledger_common::{Currency, UserId, WalletId};
use civicledger_gateway::LedgerService;
use civicledger_wallet::NewWallet;

/// A citizen with an active primary wallet.
#[derive(Debug, Clone)]
pub struct Citizen {
    pub user_id: UserId,
    pub name: String,
    pub msisdn: String,
    pub wallet_id: WalletId,
}

/// Creates citizens and opens their wallets.
pub struct CitizenFactory;

impl CitizenFactory {
    /// Create `count` citizens with wallets in the service's base currency.
    pub fn create_citizens(service: &LedgerService, count: usize) -> anyhow::Result<Vec<Citizen>> {
        let names = [
            "Achieng Otieno",
            "Baraka Mwangi",
            "Chebet Kiprono",
            "Daudi Njoroge",
            "Esther Wanjiru",
            "Fatuma Hassan",
            "Gitau Kamau",
            "Halima Abdi",
            "Imani Mutua",
            "Jabari Ochieng",
        ];
        let currency: Currency = service.config().base_currency.clone();

        (0..count)
            .map(|i| {
                let name = names
                    .get(i)
                    .map(|n| n.to_string())
                    .unwrap_or_else(|| format!("Citizen {}", i + 1));
                let user_id = UserId::new();
                let wallet = service.open_wallet(NewWallet::new(user_id, currency.clone()).active())?;

                Ok(Citizen {
                    user_id,
                    name,
                    msisdn: format!("2547{:08}", i + 1),
                    wallet_id: wallet.id,
                })
            })
            .collect()
    }
}
