/// In-process ledger
///
/// Applies a unit of work to a staged copy of the state and swaps it in only
/// when every operation succeeded.

use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;

use super::{ensure_decided, Balance, Block, BlockStatus, LedgerOp, LedgerStore, Payment, UnitOfWork};
use crate::error::LedgerError;

#[derive(Debug, Clone)]
pub struct BalanceChange {
    pub address: String,
    pub delta: Decimal,
    pub usage: String,
}

#[derive(Debug, Clone, Default)]
struct PoolState {
    balances: HashMap<String, Decimal>,
    balance_changes: Vec<BalanceChange>,
    blocks: BTreeMap<i64, Block>,
    payments: Vec<Payment>,
}

#[derive(Default)]
pub struct MemoryLedger {
    pools: RwLock<HashMap<String, PoolState>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Credit a miner balance outside of any payout.
    pub async fn credit(&self, pool_id: &str, address: &str, amount: Decimal) {
        let mut pools = self.pools.write().await;
        let state = pools.entry(pool_id.to_string()).or_default();
        *state.balances.entry(address.to_string()).or_insert(Decimal::ZERO) += amount;
    }

    pub async fn insert_block(&self, pool_id: &str, block: Block) {
        let mut pools = self.pools.write().await;
        pools
            .entry(pool_id.to_string())
            .or_default()
            .blocks
            .insert(block.id, block);
    }

    pub async fn balance(&self, pool_id: &str, address: &str) -> Decimal {
        let pools = self.pools.read().await;
        pools
            .get(pool_id)
            .and_then(|s| s.balances.get(address))
            .copied()
            .unwrap_or(Decimal::ZERO)
    }

    pub async fn block(&self, pool_id: &str, id: i64) -> Option<Block> {
        let pools = self.pools.read().await;
        pools.get(pool_id).and_then(|s| s.blocks.get(&id)).cloned()
    }

    pub async fn balance_changes(&self, pool_id: &str) -> Vec<BalanceChange> {
        let pools = self.pools.read().await;
        pools
            .get(pool_id)
            .map(|s| s.balance_changes.clone())
            .unwrap_or_default()
    }
}

fn apply(pools: &mut HashMap<String, PoolState>, op: LedgerOp) -> Result<(), LedgerError> {
    match op {
        LedgerOp::InsertPayment(payment) => {
            pools
                .entry(payment.pool_id.clone())
                .or_default()
                .payments
                .push(payment);
        }
        LedgerOp::AdjustBalance { pool_id, address, delta, usage } => {
            let state = pools.entry(pool_id).or_default();
            let current = state.balances.get(&address).copied().unwrap_or(Decimal::ZERO);
            let next = current + delta;
            if next < Decimal::ZERO {
                return Err(LedgerError::InsufficientBalance {
                    address,
                    balance: current,
                    delta,
                });
            }
            state.balances.insert(address.clone(), next);
            state.balance_changes.push(BalanceChange { address, delta, usage });
        }
        LedgerOp::UpdateBlock { pool_id, block } => {
            ensure_decided(&pool_id, &block)?;
            let state = pools.entry(pool_id.clone()).or_default();
            match state.blocks.get(&block.id).map(|b| b.status) {
                Some(BlockStatus::Pending) => {
                    state.blocks.insert(block.id, block);
                }
                Some(status) => {
                    return Err(LedgerError::Conflict(format!(
                        "block {} of pool {} is already {}",
                        block.id, pool_id, status
                    )));
                }
                None => {
                    return Err(LedgerError::Conflict(format!(
                        "block {} of pool {} is not pending",
                        block.id, pool_id
                    )));
                }
            }
        }
    }
    Ok(())
}

#[async_trait]
impl LedgerStore for MemoryLedger {
    async fn run_atomic(&self, unit: UnitOfWork) -> Result<(), LedgerError> {
        let mut pools = self.pools.write().await;
        let mut staged = pools.clone();
        for op in unit.ops().iter().cloned() {
            apply(&mut staged, op)?;
        }
        *pools = staged;
        Ok(())
    }

    async fn balances_due(&self, pool_id: &str, min_amount: Decimal) -> Result<Vec<Balance>, LedgerError> {
        let pools = self.pools.read().await;
        let mut due: Vec<Balance> = pools
            .get(pool_id)
            .map(|s| {
                s.balances
                    .iter()
                    .filter(|(_, amount)| **amount > Decimal::ZERO && **amount >= min_amount)
                    .map(|(address, amount)| Balance::new(address.clone(), *amount))
                    .collect()
            })
            .unwrap_or_default();
        due.sort_by(|a, b| b.amount.cmp(&a.amount).then_with(|| a.address.cmp(&b.address)));
        Ok(due)
    }

    async fn pending_blocks(&self, pool_id: &str) -> Result<Vec<Block>, LedgerError> {
        let pools = self.pools.read().await;
        Ok(pools
            .get(pool_id)
            .map(|s| {
                s.blocks
                    .values()
                    .filter(|b| b.status == BlockStatus::Pending)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn payments(&self, pool_id: &str) -> Result<Vec<Payment>, LedgerError> {
        let pools = self.pools.read().await;
        Ok(pools.get(pool_id).map(|s| s.payments.clone()).unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::BALANCE_USAGE_PAYOUT;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn payment(address: &str, amount: Decimal) -> Payment {
        Payment {
            pool_id: "btc1".into(),
            coin: "BTC".into(),
            address: address.into(),
            amount,
            transaction_id: "tx1".into(),
            created: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_run_atomic_commits_all_ops() {
        let ledger = MemoryLedger::new();
        ledger.credit("btc1", "a", dec!(2)).await;

        let mut unit = UnitOfWork::new();
        unit.insert_payment(payment("a", dec!(1.25)))
            .adjust_balance("btc1", "a", dec!(-1.25), BALANCE_USAGE_PAYOUT);
        ledger.run_atomic(unit).await.unwrap();

        assert_eq!(ledger.balance("btc1", "a").await, dec!(0.75));
        assert_eq!(ledger.payments("btc1").await.unwrap().len(), 1);
        assert_eq!(ledger.balance_changes("btc1").await.len(), 1);
    }

    #[tokio::test]
    async fn test_run_atomic_rolls_back_on_negative_balance() {
        let ledger = MemoryLedger::new();
        ledger.credit("btc1", "a", dec!(1)).await;
        ledger.credit("btc1", "b", dec!(1)).await;

        let mut unit = UnitOfWork::new();
        unit.insert_payment(payment("a", dec!(1)))
            .adjust_balance("btc1", "a", dec!(-1), BALANCE_USAGE_PAYOUT)
            .insert_payment(payment("b", dec!(3)))
            .adjust_balance("btc1", "b", dec!(-3), BALANCE_USAGE_PAYOUT);

        let err = ledger.run_atomic(unit).await.unwrap_err();
        assert!(matches!(err, LedgerError::InsufficientBalance { ref address, .. } if address == "b"));

        // First recipient's ops were staged before the failure and must be gone too
        assert_eq!(ledger.balance("btc1", "a").await, dec!(1));
        assert_eq!(ledger.balance("btc1", "b").await, dec!(1));
        assert!(ledger.payments("btc1").await.unwrap().is_empty());
        assert!(ledger.balance_changes("btc1").await.is_empty());
    }

    #[tokio::test]
    async fn test_block_cannot_return_to_pending() {
        let ledger = MemoryLedger::new();
        let mut block = Block::pending(1, 10, "h1");
        block.status = BlockStatus::Orphaned;
        ledger.insert_block("btc1", block).await;

        let mut unit = UnitOfWork::new();
        unit.update_block("btc1", Block::pending(1, 10, "h1"));
        assert!(matches!(ledger.run_atomic(unit).await, Err(LedgerError::Conflict(_))));
        assert_eq!(ledger.block("btc1", 1).await.unwrap().status, BlockStatus::Orphaned);

        let mut unit = UnitOfWork::new();
        unit.update_block("btc1", Block::pending(9, 90, "h9"));
        assert!(matches!(ledger.run_atomic(unit).await, Err(LedgerError::Conflict(_))));
    }

    #[tokio::test]
    async fn test_pending_block_cannot_be_rewritten_as_pending() {
        let ledger = MemoryLedger::new();
        ledger.insert_block("btc1", Block::pending(1, 10, "h1")).await;
        ledger.credit("btc1", "a", dec!(1)).await;

        let mut unit = UnitOfWork::new();
        unit.adjust_balance("btc1", "a", dec!(-1), BALANCE_USAGE_PAYOUT)
            .update_block("btc1", Block::pending(1, 10, "h1-rewritten"));
        assert!(matches!(ledger.run_atomic(unit).await, Err(LedgerError::Conflict(_))));

        let block = ledger.block("btc1", 1).await.unwrap();
        assert_eq!(block.transaction_hash, "h1");
        assert_eq!(ledger.balance("btc1", "a").await, dec!(1));
    }

    #[tokio::test]
    async fn test_balances_due_filters_and_orders() {
        let ledger = MemoryLedger::new();
        ledger.credit("btc1", "small", dec!(0.001)).await;
        ledger.credit("btc1", "mid", dec!(0.5)).await;
        ledger.credit("btc1", "big", dec!(3)).await;
        ledger.credit("ltc1", "other", dec!(9)).await;

        let due = ledger.balances_due("btc1", dec!(0.01)).await.unwrap();
        let addrs: Vec<&str> = due.iter().map(|b| b.address.as_str()).collect();
        assert_eq!(addrs, vec!["big", "mid"]);
    }

    #[tokio::test]
    async fn test_pending_blocks_only_returns_pending() {
        let ledger = MemoryLedger::new();
        ledger.insert_block("btc1", Block::pending(2, 20, "h2")).await;
        let mut confirmed = Block::pending(1, 10, "h1");
        confirmed.status = BlockStatus::Confirmed;
        confirmed.reward = Some(dec!(6.25));
        ledger.insert_block("btc1", confirmed).await;
        ledger.insert_block("btc1", Block::pending(3, 30, "h3")).await;

        let pending = ledger.pending_blocks("btc1").await.unwrap();
        let ids: Vec<i64> = pending.iter().map(|b| b.id).collect();
        assert_eq!(ids, vec![2, 3]);
    }
}
