/// Ledger store contract: blocks, balances and payments
///
/// All writes go through a `UnitOfWork`: operations are collected first and
/// only take effect when `LedgerStore::run_atomic` applies the whole unit in
/// one transaction. A failure on any operation discards every operation of
/// the unit.

pub mod memory;
pub mod model;
pub mod postgres;

use async_trait::async_trait;
use rust_decimal::Decimal;

use crate::error::LedgerError;

pub use memory::MemoryLedger;
pub use model::{Balance, Block, BlockStatus, Payment};
pub use postgres::PostgresLedger;

/// Usage tag recorded with balance changes made by a payout.
pub const BALANCE_USAGE_PAYOUT: &str = "payout";

#[derive(Debug, Clone, PartialEq)]
pub enum LedgerOp {
    InsertPayment(Payment),
    AdjustBalance {
        pool_id: String,
        address: String,
        delta: Decimal,
        usage: String,
    },
    UpdateBlock {
        pool_id: String,
        block: Block,
    },
}

#[derive(Debug, Clone, Default)]
pub struct UnitOfWork {
    ops: Vec<LedgerOp>,
}

impl UnitOfWork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_payment(&mut self, payment: Payment) -> &mut Self {
        self.ops.push(LedgerOp::InsertPayment(payment));
        self
    }

    /// Add `delta` to the balance of `address`. Negative deltas must not
    /// take the balance below zero.
    pub fn adjust_balance(
        &mut self,
        pool_id: &str,
        address: &str,
        delta: Decimal,
        usage: &str,
    ) -> &mut Self {
        self.ops.push(LedgerOp::AdjustBalance {
            pool_id: pool_id.to_string(),
            address: address.to_string(),
            delta,
            usage: usage.to_string(),
        });
        self
    }

    pub fn update_block(&mut self, pool_id: &str, block: Block) -> &mut Self {
        self.ops.push(LedgerOp::UpdateBlock {
            pool_id: pool_id.to_string(),
            block,
        });
        self
    }

    pub fn ops(&self) -> &[LedgerOp] {
        &self.ops
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }
}

/// Block updates only ever record a decision: pending to confirmed or
/// orphaned.
pub(crate) fn ensure_decided(pool_id: &str, block: &Block) -> Result<(), LedgerError> {
    if block.status == BlockStatus::Pending {
        return Err(LedgerError::Conflict(format!(
            "block {} of pool {} can only move to confirmed or orphaned",
            block.id, pool_id
        )));
    }
    Ok(())
}

#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Apply every operation of `unit` or none of them.
    async fn run_atomic(&self, unit: UnitOfWork) -> Result<(), LedgerError>;

    /// Balances of `pool_id` at or above `min_amount`, largest first.
    async fn balances_due(&self, pool_id: &str, min_amount: Decimal) -> Result<Vec<Balance>, LedgerError>;

    /// Blocks of `pool_id` still awaiting classification, oldest first.
    async fn pending_blocks(&self, pool_id: &str) -> Result<Vec<Block>, LedgerError>;

    async fn payments(&self, pool_id: &str) -> Result<Vec<Payment>, LedgerError>;
}
