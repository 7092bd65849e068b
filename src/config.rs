//! Engine configuration, loaded once at startup from a JSON file.
//!
//! Every section falls back to its defaults, so a file only needs the
//! accounts. Credentials never live here; accounts name the environment
//! variables that hold them.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::models::{AccountRole, TierName};
use crate::trading::{
    ExchangeLimits, ExitConfig, GateConfig, ReplicationConfig, TradingConfig, WorkerIntervals,
    MAX_HOLD_SECS,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub database_url: String,
    pub accounts: Vec<AccountConfig>,

    /// Order limits per exchange name
    pub exchanges: HashMap<String, ExchangeConfig>,

    pub trading: TradingConfig,
    pub exit: ExitConfig,
    pub gate: GateConfig,
    pub replication: ReplicationConfig,
    pub engine: RuntimeConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite:./copyguard.db?mode=rwc".to_string(),
            accounts: Vec::new(),
            exchanges: HashMap::new(),
            trading: TradingConfig::default(),
            exit: ExitConfig::default(),
            gate: GateConfig::default(),
            replication: ReplicationConfig::default(),
            engine: RuntimeConfig::default(),
        }
    }
}

/// One exchange account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountConfig {
    pub id: String,
    pub role: AccountRole,

    /// Key into `exchanges`
    pub exchange: String,

    /// Fixed tier instead of resolving from balance
    #[serde(default)]
    pub tier: Option<TierName>,

    #[serde(default)]
    pub min_call_spacing_ms: Option<u64>,

    /// Environment variable holding the API key
    #[serde(default)]
    pub api_key_env: Option<String>,

    /// Environment variable holding the API secret
    #[serde(default)]
    pub api_secret_env: Option<String>,

    /// Starting balance in dry-run mode
    #[serde(default)]
    pub paper_balance: Option<Decimal>,
}

impl AccountConfig {
    pub fn min_spacing(&self, gate: &GateConfig) -> Duration {
        Duration::from_millis(
            self.min_call_spacing_ms
                .unwrap_or(gate.default_min_spacing_ms),
        )
    }

    pub fn is_master(&self) -> bool {
        self.role == AccountRole::Master
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExchangeConfig {
    pub min_order_notional: Decimal,
    pub quantity_precision: u32,

    /// REST endpoint for live trading
    pub base_url: Option<String>,
}

impl ExchangeConfig {
    pub fn limits(&self) -> ExchangeLimits {
        ExchangeLimits {
            min_order_notional: self.min_order_notional,
            quantity_precision: self.quantity_precision,
        }
    }
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        let limits = ExchangeLimits::default();
        Self {
            min_order_notional: limits.min_order_notional,
            quantity_precision: limits.quantity_precision,
            base_url: None,
        }
    }
}

/// Loop timing and mode.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Exit evaluation cycle per account
    pub cycle_interval_ms: u64,

    /// Periodic write of dirty positions
    pub flush_interval_secs: u64,

    /// Account status report
    pub status_interval_secs: u64,

    pub balance_refresh_secs: u64,

    /// Trade against simulated accounts
    pub dry_run: bool,

    /// Balance for paper accounts that do not set their own
    pub paper_balance: Decimal,
}

impl RuntimeConfig {
    pub fn intervals(&self) -> WorkerIntervals {
        WorkerIntervals {
            cycle: Duration::from_millis(self.cycle_interval_ms),
            flush: Duration::from_secs(self.flush_interval_secs),
            balance_refresh: Duration::from_secs(self.balance_refresh_secs),
        }
    }

    pub fn status_interval(&self) -> Duration {
        Duration::from_secs(self.status_interval_secs.max(1))
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            cycle_interval_ms: 1000,
            flush_interval_secs: 30,
            status_interval_secs: 60,
            balance_refresh_secs: 30,
            dry_run: false,
            paper_balance: dec!(10000),
        }
    }
}

impl EngineConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config: Self = serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let masters = self.accounts.iter().filter(|a| a.is_master()).count();
        if masters != 1 {
            bail!("exactly one master account is required, found {}", masters);
        }

        let mut seen = HashSet::new();
        for account in &self.accounts {
            if !seen.insert(account.id.as_str()) {
                bail!("account id {} is configured twice", account.id);
            }
        }

        let exit = &self.exit;
        if exit.stop_loss_pct <= Decimal::ZERO || exit.stop_loss_pct >= Decimal::ONE {
            bail!("exit.stop_loss_pct must be between 0 and 1");
        }
        if exit
            .profit_targets
            .iter()
            .any(|t| t.gain_pct <= Decimal::ZERO || t.fraction <= Decimal::ZERO)
        {
            bail!("profit targets need a positive gain and fraction");
        }
        let ladder: Decimal = exit.profit_targets.iter().map(|t| t.fraction).sum();
        if ladder > Decimal::ONE {
            bail!("profit target fractions add up to {}, more than the whole position", ladder);
        }
        for (name, secs) in [
            ("exit.max_hold_secs", exit.max_hold_secs),
            ("exit.loss_max_hold_secs", exit.loss_max_hold_secs),
        ] {
            if secs > MAX_HOLD_SECS {
                bail!("{} must be at most {} seconds", name, MAX_HOLD_SECS);
            }
        }
        if exit.close_retries == 0 {
            bail!("exit.close_retries must be at least 1");
        }

        let trading = &self.trading;
        if trading.max_position_fraction <= Decimal::ZERO || trading.max_position_fraction > Decimal::ONE {
            bail!("trading.max_position_fraction must be in (0, 1]");
        }
        for tier in [
            &trading.tiers.conservative,
            &trading.tiers.standard,
            &trading.tiers.aggressive,
        ] {
            if tier.max_position_fraction <= Decimal::ZERO || tier.max_position_fraction > Decimal::ONE {
                bail!("tier {} max_position_fraction must be in (0, 1]", tier.name.as_str());
            }
        }

        Ok(())
    }

    pub fn master(&self) -> Option<&AccountConfig> {
        self.accounts.iter().find(|a| a.is_master())
    }

    pub fn followers(&self) -> impl Iterator<Item = &AccountConfig> {
        self.accounts.iter().filter(|a| !a.is_master())
    }

    /// Limits for an exchange, defaults when it is not configured.
    pub fn limits_for(&self, exchange: &str) -> ExchangeLimits {
        self.exchanges
            .get(exchange)
            .map(ExchangeConfig::limits)
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"{
        "accounts": [
            { "id": "lead", "role": "master", "exchange": "alpha" },
            { "id": "copy-1", "role": "follower", "exchange": "alpha", "tier": "conservative" }
        ],
        "exchanges": { "alpha": { "min_order_notional": "5" } }
    }"#;

    fn minimal() -> EngineConfig {
        serde_json::from_str(MINIMAL).unwrap()
    }

    #[test]
    fn test_sections_default_when_absent() {
        let config = minimal();
        config.validate().unwrap();

        assert_eq!(config.master().unwrap().id, "lead");
        assert_eq!(config.followers().count(), 1);
        assert_eq!(config.followers().next().unwrap().tier, Some(TierName::Conservative));
        assert_eq!(config.exit.close_retries, 3);
        assert_eq!(config.engine.cycle_interval_ms, 1000);

        let limits = config.limits_for("alpha");
        assert_eq!(limits.min_order_notional, dec!(5));
        assert_eq!(limits.quantity_precision, 8);
        assert_eq!(config.limits_for("beta"), ExchangeLimits::default());
    }

    #[test]
    fn test_spacing_falls_back_to_gate_default() {
        let config = minimal();
        let gate = GateConfig::default();
        assert_eq!(config.accounts[0].min_spacing(&gate), Duration::from_millis(200));

        let mut account = config.accounts[1].clone();
        account.min_call_spacing_ms = Some(50);
        assert_eq!(account.min_spacing(&gate), Duration::from_millis(50));
    }

    #[test]
    fn test_rejects_missing_or_duplicate_master() {
        let mut config = minimal();
        config.accounts[1].role = AccountRole::Master;
        assert!(config.validate().is_err());

        config.accounts.retain(|a| a.id == "copy-1");
        config.accounts[0].role = AccountRole::Follower;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_duplicate_ids_and_oversized_ladder() {
        let mut config = minimal();
        config.accounts[1].id = "lead".to_string();
        assert!(config.validate().is_err());

        let mut config = minimal();
        config.exit.profit_targets[0].fraction = dec!(0.9);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_hold_beyond_time_range() {
        let mut config = minimal();
        config.exit.max_hold_secs = u64::MAX;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("exit.max_hold_secs"));

        let mut config = minimal();
        config.exit.loss_max_hold_secs = MAX_HOLD_SECS + 1;
        assert!(config.validate().is_err());

        config.exit.loss_max_hold_secs = MAX_HOLD_SECS;
        config.validate().unwrap();
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("copyguard.json");
        std::fs::write(&path, MINIMAL).unwrap();

        let config = EngineConfig::load(&path).unwrap();
        assert_eq!(config.accounts.len(), 2);

        std::fs::write(&path, "{ not json").unwrap();
        let err = EngineConfig::load(&path).unwrap_err();
        assert!(err.to_string().contains("Failed to parse config"));
    }
}
