use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tokio::sync::Mutex;
use tokio_postgres::{Client, NoTls, Row, Transaction};

use super::{ensure_decided, Balance, Block, BlockStatus, LedgerOp, LedgerStore, Payment, UnitOfWork};
use crate::error::LedgerError;

/// PostgreSQL-backed ledger.
///
/// A unit of work runs inside one `tokio_postgres::Transaction`. The
/// transaction is only committed after the last operation succeeded; an
/// early return (or the future being dropped by a timeout) drops it, which
/// rolls it back.
pub struct PostgresLedger {
    client: Mutex<Client>,
}

impl PostgresLedger {
    pub async fn connect(db_url: &str) -> Result<Self, LedgerError> {
        let (client, connection) = tokio_postgres::connect(db_url, NoTls).await?;

        tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::error!("PostgreSQL connection error: {}", e);
            }
        });

        Ok(Self {
            client: Mutex::new(client),
        })
    }

    pub async fn init_schema(&self) -> Result<(), LedgerError> {
        let client = self.client.lock().await;
        client
            .batch_execute(
                r#"
            CREATE TABLE IF NOT EXISTS blocks (
                id BIGSERIAL PRIMARY KEY,
                pool_id VARCHAR(64) NOT NULL,
                block_height BIGINT NOT NULL,
                transaction_hash VARCHAR(128) NOT NULL,
                status VARCHAR(16) NOT NULL DEFAULT 'pending',
                reward NUMERIC(28, 12),
                created_at TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT NOW()
            );

            CREATE INDEX IF NOT EXISTS idx_blocks_pool_status
            ON blocks(pool_id, status);

            CREATE TABLE IF NOT EXISTS balances (
                pool_id VARCHAR(64) NOT NULL,
                address VARCHAR(256) NOT NULL,
                amount NUMERIC(28, 12) NOT NULL DEFAULT 0 CHECK (amount >= 0),
                created_at TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT NOW(),
                PRIMARY KEY (pool_id, address)
            );

            CREATE TABLE IF NOT EXISTS balance_changes (
                id BIGSERIAL PRIMARY KEY,
                pool_id VARCHAR(64) NOT NULL,
                address VARCHAR(256) NOT NULL,
                amount NUMERIC(28, 12) NOT NULL,
                usage VARCHAR(64) NOT NULL,
                created_at TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT NOW()
            );

            CREATE TABLE IF NOT EXISTS payments (
                id BIGSERIAL PRIMARY KEY,
                pool_id VARCHAR(64) NOT NULL,
                coin VARCHAR(16) NOT NULL,
                address VARCHAR(256) NOT NULL,
                amount NUMERIC(28, 12) NOT NULL,
                transaction_id VARCHAR(128) NOT NULL,
                created_at TIMESTAMP WITH TIME ZONE NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_payments_pool_address
            ON payments(pool_id, address);
        "#,
            )
            .await?;

        Ok(())
    }
}

async fn apply(tx: &Transaction<'_>, op: &LedgerOp) -> Result<(), LedgerError> {
    match op {
        LedgerOp::InsertPayment(p) => {
            tx.execute(
                r#"
                INSERT INTO payments
                    (pool_id, coin, address, amount, transaction_id, created_at)
                VALUES ($1, $2, $3, $4, $5, $6)
                "#,
                &[&p.pool_id, &p.coin, &p.address, &p.amount, &p.transaction_id, &p.created],
            )
            .await?;
        }
        LedgerOp::AdjustBalance { pool_id, address, delta, usage } => {
            let current: Decimal = tx
                .query_opt(
                    "SELECT amount FROM balances WHERE pool_id = $1 AND address = $2 FOR UPDATE",
                    &[pool_id, address],
                )
                .await?
                .map(|row| row.get(0))
                .unwrap_or(Decimal::ZERO);

            let next = current + *delta;
            if next < Decimal::ZERO {
                return Err(LedgerError::InsufficientBalance {
                    address: address.clone(),
                    balance: current,
                    delta: *delta,
                });
            }

            tx.execute(
                r#"
                INSERT INTO balances (pool_id, address, amount)
                VALUES ($1, $2, $3)
                ON CONFLICT (pool_id, address) DO UPDATE
                SET amount = EXCLUDED.amount, updated_at = NOW()
                "#,
                &[pool_id, address, &next],
            )
            .await?;

            tx.execute(
                r#"
                INSERT INTO balance_changes (pool_id, address, amount, usage)
                VALUES ($1, $2, $3, $4)
                "#,
                &[pool_id, address, delta, usage],
            )
            .await?;
        }
        LedgerOp::UpdateBlock { pool_id, block } => {
            ensure_decided(pool_id, block)?;
            let updated = tx
                .execute(
                    r#"
                    UPDATE blocks SET status = $3, reward = $4
                    WHERE pool_id = $1 AND id = $2 AND status = 'pending'
                    "#,
                    &[pool_id, &block.id, &block.status.as_str(), &block.reward],
                )
                .await?;
            if updated == 0 {
                return Err(LedgerError::Conflict(format!(
                    "block {} of pool {} is not pending",
                    block.id, pool_id
                )));
            }
        }
    }
    Ok(())
}

fn block_from_row(row: &Row) -> Result<Block, LedgerError> {
    let status: String = row.get(3);
    let status = status.parse::<BlockStatus>().map_err(LedgerError::Conflict)?;
    let height: i64 = row.get(1);
    let created: DateTime<Utc> = row.get(5);
    Ok(Block {
        id: row.get(0),
        height: height.max(0) as u64,
        transaction_hash: row.get(2),
        status,
        reward: row.get(4),
        created,
    })
}

#[async_trait]
impl LedgerStore for PostgresLedger {
    async fn run_atomic(&self, unit: UnitOfWork) -> Result<(), LedgerError> {
        let mut client = self.client.lock().await;
        let tx = client.transaction().await?;
        for op in unit.ops() {
            apply(&tx, op).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn balances_due(&self, pool_id: &str, min_amount: Decimal) -> Result<Vec<Balance>, LedgerError> {
        let client = self.client.lock().await;
        let rows = client
            .query(
                r#"
                SELECT address, amount
                FROM balances
                WHERE pool_id = $1 AND amount > 0 AND amount >= $2
                ORDER BY amount DESC, address
                "#,
                &[&pool_id, &min_amount],
            )
            .await?;

        Ok(rows
            .iter()
            .map(|row| Balance {
                address: row.get(0),
                amount: row.get(1),
            })
            .collect())
    }

    async fn pending_blocks(&self, pool_id: &str) -> Result<Vec<Block>, LedgerError> {
        let client = self.client.lock().await;
        let rows = client
            .query(
                r#"
                SELECT id, block_height, transaction_hash, status, reward, created_at
                FROM blocks
                WHERE pool_id = $1 AND status = 'pending'
                ORDER BY block_height, id
                "#,
                &[&pool_id],
            )
            .await?;

        rows.iter().map(block_from_row).collect()
    }

    async fn payments(&self, pool_id: &str) -> Result<Vec<Payment>, LedgerError> {
        let client = self.client.lock().await;
        let rows = client
            .query(
                r#"
                SELECT pool_id, coin, address, amount, transaction_id, created_at
                FROM payments
                WHERE pool_id = $1
                ORDER BY created_at DESC, id DESC
                "#,
                &[&pool_id],
            )
            .await?;

        Ok(rows
            .iter()
            .map(|row| Payment {
                pool_id: row.get(0),
                coin: row.get(1),
                address: row.get(2),
                amount: row.get(3),
                transaction_id: row.get(4),
                created: row.get(5),
            })
            .collect())
    }
}
