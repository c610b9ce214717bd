use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlockStatus {
    Pending,
    Confirmed,
    Orphaned,
}

impl BlockStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlockStatus::Pending => "pending",
            BlockStatus::Confirmed => "confirmed",
            BlockStatus::Orphaned => "orphaned",
        }
    }
}

impl fmt::Display for BlockStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BlockStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(BlockStatus::Pending),
            "confirmed" => Ok(BlockStatus::Confirmed),
            "orphaned" => Ok(BlockStatus::Orphaned),
            other => Err(format!("unknown block status '{}'", other)),
        }
    }
}

/// A block found by the pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    pub id: i64,
    pub height: u64,
    /// Hash of the coinbase transaction that carries the block reward.
    pub transaction_hash: String,
    pub status: BlockStatus,
    /// Reward in whole coins. Only set once the block is confirmed.
    pub reward: Option<Decimal>,
    pub created: DateTime<Utc>,
}

impl Block {
    pub fn pending(id: i64, height: u64, transaction_hash: impl Into<String>) -> Self {
        Self {
            id,
            height,
            transaction_hash: transaction_hash.into(),
            status: BlockStatus::Pending,
            reward: None,
            created: Utc::now(),
        }
    }
}

/// Amount owed to a miner address, in whole coins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Balance {
    pub address: String,
    pub amount: Decimal,
}

impl Balance {
    pub fn new(address: impl Into<String>, amount: Decimal) -> Self {
        Self { address: address.into(), amount }
    }
}

/// Record of one recipient's share of a completed disbursement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payment {
    pub pool_id: String,
    pub coin: String,
    pub address: String,
    pub amount: Decimal,
    pub transaction_id: String,
    pub created: DateTime<Utc>,
}
