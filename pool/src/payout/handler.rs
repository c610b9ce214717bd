/// Per-coin payout capability and the Bitcoin-family implementation.
use async_trait::async_trait;
use rust_decimal::Decimal;
use std::sync::Arc;

use super::classifier::BlockClassifier;
use super::format_amount;
use super::orchestrator::{PayoutOrchestrator, PayoutReceipt};
use crate::blockchain::ChainGateway;
use crate::config::PoolConfig;
use crate::error::PayoutError;
use crate::ledger::{Balance, Block, LedgerStore};

#[async_trait]
pub trait PayoutHandler: Send + Sync {
    fn pool_id(&self) -> &str;

    fn symbol(&self) -> &str;

    /// Render an amount with 5 decimals and the coin ticker.
    fn format_amount(&self, amount: Decimal) -> String {
        format_amount(amount, self.symbol())
    }

    /// Return the blocks whose status could be decided, in input order.
    async fn classify_blocks(&self, blocks: &[Block]) -> Vec<Block>;

    async fn payout(&self, balances: &[Balance]) -> Result<PayoutReceipt, PayoutError>;

    /// Transaction sent without a ledger record. While set, `payout` refuses
    /// to run.
    fn unrecorded_payout(&self) -> Option<String>;
}

/// Payout handler for bitcoind-compatible wallets
/// (`gettransaction` / `sendmany`).
pub struct BitcoinPayoutHandler {
    pool_id: String,
    symbol: String,
    classifier: BlockClassifier,
    orchestrator: PayoutOrchestrator,
}

impl BitcoinPayoutHandler {
    pub fn new(cfg: &PoolConfig, gateway: Arc<dyn ChainGateway>, ledger: Arc<dyn LedgerStore>) -> Self {
        let classifier = BlockClassifier::new(
            gateway.clone(),
            cfg.payout.page_size,
            cfg.coin.unit_per_coin,
        );
        let orchestrator = PayoutOrchestrator::new(
            gateway,
            ledger,
            cfg.pool_id.clone(),
            cfg.coin.symbol.clone(),
            cfg.payout.min_confirmations,
        )
        .with_send_timeout(cfg.payout.cycle_timeout());

        Self {
            pool_id: cfg.pool_id.clone(),
            symbol: cfg.coin.symbol.clone(),
            classifier,
            orchestrator,
        }
    }
}

#[async_trait]
impl PayoutHandler for BitcoinPayoutHandler {
    fn pool_id(&self) -> &str {
        &self.pool_id
    }

    fn symbol(&self) -> &str {
        &self.symbol
    }

    async fn classify_blocks(&self, blocks: &[Block]) -> Vec<Block> {
        self.classifier.classify(blocks).await
    }

    async fn payout(&self, balances: &[Balance]) -> Result<PayoutReceipt, PayoutError> {
        self.orchestrator.payout(balances).await
    }

    fn unrecorded_payout(&self) -> Option<String> {
        self.orchestrator.unrecorded_transaction()
    }
}
