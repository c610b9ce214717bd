use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use super::handler::{BitcoinPayoutHandler, PayoutHandler};
use crate::blockchain::{ChainGateway, JsonRpcGateway};
use crate::config::PoolConfig;
use crate::error::ConfigError;
use crate::ledger::LedgerStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CoinFamily {
    Bitcoin,
}

impl FromStr for CoinFamily {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "bitcoin" => Ok(CoinFamily::Bitcoin),
            other => Err(ConfigError::UnsupportedFamily(other.to_string())),
        }
    }
}

impl fmt::Display for CoinFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoinFamily::Bitcoin => f.write_str("bitcoin"),
        }
    }
}

pub type HandlerFactory =
    fn(&PoolConfig, Arc<dyn ChainGateway>, Arc<dyn LedgerStore>) -> Box<dyn PayoutHandler>;

fn bitcoin_factory(
    cfg: &PoolConfig,
    gateway: Arc<dyn ChainGateway>,
    ledger: Arc<dyn LedgerStore>,
) -> Box<dyn PayoutHandler> {
    Box::new(BitcoinPayoutHandler::new(cfg, gateway, ledger))
}

/// Selects the payout handler for a pool from its configured coin family.
pub struct PayoutHandlerRegistry {
    factories: HashMap<CoinFamily, HandlerFactory>,
}

impl PayoutHandlerRegistry {
    pub fn empty() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        registry.register(CoinFamily::Bitcoin, bitcoin_factory);
        registry
    }

    pub fn register(&mut self, family: CoinFamily, factory: HandlerFactory) {
        self.factories.insert(family, factory);
    }

    /// Validate `cfg` and build its handler on top of `gateway`.
    pub fn configure(
        &self,
        cfg: &PoolConfig,
        gateway: Arc<dyn ChainGateway>,
        ledger: Arc<dyn LedgerStore>,
    ) -> Result<Box<dyn PayoutHandler>, ConfigError> {
        cfg.validate()?;
        let family: CoinFamily = cfg.coin.family.parse()?;
        let factory = self
            .factories
            .get(&family)
            .ok_or_else(|| ConfigError::UnsupportedFamily(family.to_string()))?;

        tracing::info!(
            "[{}] Payout handler configured: family={}, symbol={}, page_size={}",
            cfg.pool_id,
            family,
            cfg.coin.symbol,
            cfg.payout.page_size
        );
        Ok(factory(cfg, gateway, ledger))
    }

    /// Same as `configure`, talking to the daemon configured in `cfg`.
    pub fn connect(
        &self,
        cfg: &PoolConfig,
        ledger: Arc<dyn LedgerStore>,
    ) -> Result<Box<dyn PayoutHandler>, ConfigError> {
        cfg.validate()?;
        let gateway = Arc::new(JsonRpcGateway::new(&cfg.daemon)?);
        self.configure(cfg, gateway, ledger)
    }
}

impl Default for PayoutHandlerRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}
