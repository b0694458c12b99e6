use std::collections::BTreeMap;
use tracing::{info, warn};

use crate::db::services::account_service::AccountStore;
use crate::error::Result;
use crate::platform::profile::ProfileSwitcher;
use crate::platform::volume::VolumeBrowser;

/// Reads remaining credit from the balance artifact on the active profile's volume
/// and writes it back into the Account Store.
///
/// Checking an account makes its profile the current one, so callers must serialise
/// balance checks with every other profile switch.
#[derive(Clone)]
pub struct BalanceMonitor {
    store: AccountStore,
    profiles: ProfileSwitcher,
    volume: VolumeBrowser,
    balance_file: String,
    threshold: f64,
}

impl BalanceMonitor {
    pub fn new(
        store: AccountStore,
        profiles: ProfileSwitcher,
        volume: VolumeBrowser,
        balance_file: impl Into<String>,
        threshold: f64,
    ) -> Self {
        Self {
            store,
            profiles,
            volume,
            balance_file: balance_file.into(),
            threshold,
        }
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// Balance of whichever profile is current. `None` means unknown, not zero.
    pub async fn read_remote_balance(&self) -> Option<f64> {
        match self.volume.read_file(&self.balance_file).await {
            Ok(contents) => {
                let parsed = parse_balance(&contents);
                if parsed.is_none() {
                    warn!(file = %self.balance_file, "Balance artifact could not be parsed.");
                }
                parsed
            }
            Err(e) => {
                warn!(file = %self.balance_file, error = %e, "Failed to fetch balance artifact.");
                None
            }
        }
    }

    /// Activates `username`'s profile, reads its balance and records it.
    ///
    /// An unknown balance leaves the stored balance and status untouched.
    pub async fn check_balance(&self, username: &str) -> Result<Option<f64>> {
        info!(username = %username, "Checking balance.");
        let credentials = self.store.credentials(username).await?;
        self.profiles.switch_to(username, &credentials).await?;

        let Some(balance) = self.read_remote_balance().await else {
            return Ok(None);
        };

        let is_bound = self
            .store
            .bound_account()
            .await?
            .is_some_and(|bound| bound.username == username);
        self.store
            .record_balance(username, balance, self.threshold, is_bound)
            .await?;
        Ok(Some(balance))
    }

    /// Checks every account one after another. Accounts whose check fails or whose
    /// balance is unknown are left out of the result.
    pub async fn check_all_balances(&self) -> Result<BTreeMap<String, f64>> {
        let mut balances = BTreeMap::new();
        for account in self.store.list_all().await? {
            match self.check_balance(&account.username).await {
                Ok(Some(balance)) => {
                    balances.insert(account.username, balance);
                }
                Ok(None) => {
                    info!(username = %account.username, "Balance unknown; skipping.");
                }
                Err(e) => {
                    warn!(username = %account.username, error = %e, "Balance check failed; skipping.");
                }
            }
        }
        Ok(balances)
    }
}

/// Accepts a bare number, a JSON number or numeric string, or an object whose
/// `balance` field holds either.
pub fn parse_balance(contents: &str) -> Option<f64> {
    fn from_json(value: &serde_json::Value) -> Option<f64> {
        match value {
            serde_json::Value::Number(n) => n.as_f64(),
            serde_json::Value::String(s) => s.trim().parse().ok(),
            serde_json::Value::Object(map) => map.get("balance").and_then(from_json),
            _ => None,
        }
    }

    let trimmed = contents.trim().trim_start_matches('$');
    let parsed = trimmed.parse::<f64>().ok().or_else(|| {
        serde_json::from_str::<serde_json::Value>(contents.trim())
            .ok()
            .as_ref()
            .and_then(from_json)
    });
    parsed.filter(|balance| balance.is_finite())
}
