/// Periodic reconciliation + payout loop for one pool
///
/// Each cycle:
/// 1. Classify pending blocks and persist the decided ones
/// 2. Pay every balance at or above the minimum payout
///
/// Cycles run strictly one after another, so a pool never has two payouts
/// in flight.

use anyhow::{anyhow, Context, Result};
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;

use super::handler::PayoutHandler;
use super::orchestrator::PayoutReceipt;
use crate::config::PayoutSettings;
use crate::error::PayoutError;
use crate::ledger::{BlockStatus, LedgerStore, UnitOfWork};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CycleReport {
    pub confirmed: usize,
    pub orphaned: usize,
    pub payout: Option<PayoutReceipt>,
}

pub struct PayoutCycle {
    handler: Arc<dyn PayoutHandler>,
    ledger: Arc<dyn LedgerStore>,
    min_payout: Decimal,
    interval: Duration,
    cycle_timeout: Duration,
}

impl PayoutCycle {
    pub fn new(
        handler: Arc<dyn PayoutHandler>,
        ledger: Arc<dyn LedgerStore>,
        settings: &PayoutSettings,
    ) -> Self {
        Self {
            handler,
            ledger,
            min_payout: settings.min_payout,
            interval: settings.interval(),
            cycle_timeout: settings.cycle_timeout(),
        }
    }

    /// Classify the pool's pending blocks and store the decided ones.
    ///
    /// Returns `(confirmed, orphaned)`.
    pub async fn reconcile_blocks(&self) -> Result<(usize, usize)> {
        let pool_id = self.handler.pool_id();
        let pending = self
            .ledger
            .pending_blocks(pool_id)
            .await
            .context("failed to load pending blocks")?;
        if pending.is_empty() {
            return Ok((0, 0));
        }

        let decided = tokio::time::timeout(self.cycle_timeout, self.handler.classify_blocks(&pending))
            .await
            .map_err(|_| anyhow!("block classification timed out after {:?}", self.cycle_timeout))?;

        let confirmed = decided.iter().filter(|b| b.status == BlockStatus::Confirmed).count();
        let orphaned = decided.len() - confirmed;

        if !decided.is_empty() {
            let mut unit = UnitOfWork::new();
            for block in decided {
                if block.status == BlockStatus::Confirmed {
                    tracing::info!(
                        "[{}] Block {} confirmed, reward {}",
                        pool_id,
                        block.height,
                        self.handler.format_amount(block.reward.unwrap_or_default())
                    );
                } else {
                    tracing::info!("[{}] Block {} orphaned", pool_id, block.height);
                }
                unit.update_block(pool_id, block);
            }
            self.ledger
                .run_atomic(unit)
                .await
                .context("failed to store classified blocks")?;
        }

        Ok((confirmed, orphaned))
    }

    /// Pay all balances due.
    ///
    /// The handler bounds the send itself. The ledger commit after a sent
    /// payout runs to completion.
    pub async fn pay_balances(&self) -> Result<PayoutReceipt, PayoutError> {
        if let Some(transaction_id) = self.handler.unrecorded_payout() {
            return Err(PayoutError::Halted { transaction_id });
        }

        let balances = self
            .ledger
            .balances_due(self.handler.pool_id(), self.min_payout)
            .await?;
        if balances.is_empty() {
            tracing::debug!("[{}] No balances due", self.handler.pool_id());
        }

        self.handler.payout(&balances).await
    }

    pub async fn run_once(&self) -> CycleReport {
        let mut report = CycleReport::default();

        match self.reconcile_blocks().await {
            Ok((confirmed, orphaned)) => {
                report.confirmed = confirmed;
                report.orphaned = orphaned;
            }
            Err(e) => tracing::warn!("[{}] Block reconciliation error: {:#}", self.handler.pool_id(), e),
        }

        match self.pay_balances().await {
            Ok(receipt) => report.payout = Some(receipt),
            Err(e @ (PayoutError::Unrecorded { .. } | PayoutError::Halted { .. })) => {
                tracing::error!("[{}] Payouts halted: {}", self.handler.pool_id(), e)
            }
            Err(e) => tracing::warn!("[{}] Payout error: {}", self.handler.pool_id(), e),
        }

        report
    }

    /// Run cycles forever on the configured interval.
    pub async fn run(self) {
        tracing::info!(
            "[{}] Payout cycle every {}s (timeout {}s)",
            self.handler.pool_id(),
            self.interval.as_secs(),
            self.cycle_timeout.as_secs()
        );
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            self.run_once().await;
        }
    }
}
