use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;
use std::time::Duration;

use crate::error::ConfigError;

const DEFAULT_CONFIG_PATH: &str = "pool_config.json";

/// Bitcoin-family chains: 1 coin = 100,000,000 satoshi
pub const DEFAULT_UNIT_PER_COIN: u64 = 100_000_000;

#[derive(Deserialize, Clone, Debug)]
pub struct CoinConfig {
    /// Payout handler family, e.g. "bitcoin".
    pub family: String,
    /// Ticker shown next to formatted amounts.
    pub symbol: String,
    /// Smallest on-chain units per whole coin.
    #[serde(default = "default_unit_per_coin")]
    pub unit_per_coin: u64,
}

#[derive(Deserialize, Clone, Debug)]
pub struct DaemonConfig {
    pub url: String,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Deserialize, Clone, Debug)]
pub struct PayoutSettings {
    /// Confirmations required on wallet funds spent by a payout.
    #[serde(default = "default_min_confirmations")]
    pub min_confirmations: u32,
    /// Blocks looked up per daemon batch.
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    /// Balances below this are left to accumulate.
    #[serde(default = "default_min_payout")]
    pub min_payout: Decimal,
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    /// Upper bound for one classification or payout call.
    #[serde(default = "default_cycle_timeout_secs")]
    pub cycle_timeout_secs: u64,
}

impl Default for PayoutSettings {
    fn default() -> Self {
        Self {
            min_confirmations: default_min_confirmations(),
            page_size: default_page_size(),
            min_payout: default_min_payout(),
            interval_secs: default_interval_secs(),
            cycle_timeout_secs: default_cycle_timeout_secs(),
        }
    }
}

impl PayoutSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }

    pub fn cycle_timeout(&self) -> Duration {
        Duration::from_secs(self.cycle_timeout_secs.max(1))
    }
}

fn default_unit_per_coin() -> u64 { DEFAULT_UNIT_PER_COIN }
fn default_timeout_secs() -> u64 { 30 }
fn default_min_confirmations() -> u32 { 1 }
fn default_page_size() -> usize { 100 }
fn default_min_payout() -> Decimal { dec!(0.01) }
fn default_interval_secs() -> u64 { 600 }
fn default_cycle_timeout_secs() -> u64 { 300 }
fn default_metrics_listen() -> String { "0.0.0.0:9101".to_string() }

#[derive(Deserialize, Clone, Debug)]
pub struct PoolConfig {
    pub pool_id: String,
    pub coin: CoinConfig,
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub payout: PayoutSettings,
    #[serde(default)]
    pub database_url: String,
    #[serde(default = "default_metrics_listen")]
    pub metrics_listen: String,
}

impl PoolConfig {
    /// Load the pool config from `PAYOUT_CONFIG` (or `pool_config.json`),
    /// apply environment overrides and validate.
    pub fn load() -> Result<Self, ConfigError> {
        let path = std::env::var("PAYOUT_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        let txt = std::fs::read_to_string(&path).map_err(|source| ConfigError::Io {
            path: path.clone(),
            source,
        })?;
        let mut cfg = Self::from_json(&txt).map_err(|source| ConfigError::Parse { path, source })?;
        cfg.apply_env();
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_json(txt: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(txt)
    }

    fn apply_env(&mut self) {
        if let Ok(u) = std::env::var("PAYOUT_DAEMON_URL") { self.daemon.url = u; }
        if let Ok(u) = std::env::var("PAYOUT_DAEMON_USER") { self.daemon.user = Some(u); }
        if let Ok(p) = std::env::var("PAYOUT_DAEMON_PASSWORD") { self.daemon.password = Some(p); }
        if let Ok(d) = std::env::var("PAYOUT_DATABASE_URL") { self.database_url = d; }
        if let Ok(m) = std::env::var("PAYOUT_METRICS_LISTEN") { self.metrics_listen = m; }
    }

    /// Reject configs that would otherwise fail on first use.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pool_id.trim().is_empty() {
            return Err(ConfigError::Missing("pool_id"));
        }
        if self.coin.symbol.trim().is_empty() {
            return Err(ConfigError::Missing("coin.symbol"));
        }
        if self.coin.family.trim().is_empty() {
            return Err(ConfigError::Missing("coin.family"));
        }
        if self.coin.unit_per_coin == 0 {
            return Err(ConfigError::Invalid {
                field: "coin.unit_per_coin",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.daemon.url.trim().is_empty() {
            return Err(ConfigError::Missing("daemon.url"));
        }
        if self.payout.page_size == 0 {
            return Err(ConfigError::Invalid {
                field: "payout.page_size",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.payout.min_confirmations < 1 {
            return Err(ConfigError::Invalid {
                field: "payout.min_confirmations",
                reason: "payouts must spend confirmed funds only".to_string(),
            });
        }
        if self.payout.min_payout < Decimal::ZERO {
            return Err(ConfigError::Invalid {
                field: "payout.min_payout",
                reason: "must not be negative".to_string(),
            });
        }
        Ok(())
    }
}
