/// Payout orchestration
///
/// One `sendmany` pays every due balance. Only after the daemon returned a
/// transaction id are the payments recorded and the balances debited, all
/// in one ledger unit of work.
///
/// Once a transaction id exists the ledger commit always runs to completion,
/// even if the caller stops waiting. If it fails, the orchestrator refuses
/// every further payout until the transaction has been reconciled.

use chrono::Utc;
use rust_decimal::{Decimal, RoundingStrategy};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use super::format_amount;
use crate::blockchain::{ChainGateway, RpcCommand};
use crate::error::{LedgerError, PayoutError};
use crate::ledger::{Balance, LedgerStore, Payment, UnitOfWork, BALANCE_USAGE_PAYOUT};
use crate::metrics::prometheus as metrics;

/// Decimal places the daemon accepts for amounts.
const AMOUNT_DECIMALS: u32 = 8;

const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, PartialEq)]
pub struct PayoutReceipt {
    /// `None` when there was nothing to pay.
    pub transaction_id: Option<String>,
    /// Balances paid, one payment each.
    pub recipients: usize,
    /// Balances left unpaid because they truncate to nothing at 8 decimals.
    pub skipped: usize,
    pub total: Decimal,
}

impl PayoutReceipt {
    fn empty(skipped: usize) -> Self {
        Self {
            transaction_id: None,
            recipients: 0,
            skipped,
            total: Decimal::ZERO,
        }
    }
}

pub struct PayoutOrchestrator {
    gateway: Arc<dyn ChainGateway>,
    ledger: Arc<dyn LedgerStore>,
    pool_id: String,
    symbol: String,
    min_confirmations: u32,
    send_timeout: Duration,
    /// Transaction sent but not (yet) recorded in the ledger.
    unrecorded: Arc<Mutex<Option<String>>>,
}

fn lock_marker(marker: &Mutex<Option<String>>) -> MutexGuard<'_, Option<String>> {
    marker.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl PayoutOrchestrator {
    pub fn new(
        gateway: Arc<dyn ChainGateway>,
        ledger: Arc<dyn LedgerStore>,
        pool_id: String,
        symbol: String,
        min_confirmations: u32,
    ) -> Self {
        Self {
            gateway,
            ledger,
            pool_id,
            symbol,
            min_confirmations: min_confirmations.max(1),
            send_timeout: DEFAULT_SEND_TIMEOUT,
            unrecorded: Arc::new(Mutex::new(None)),
        }
    }

    /// Bound the `sendmany` call. The ledger commit that follows a returned
    /// transaction id is never bounded.
    pub fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = timeout;
        self
    }

    /// Transaction that went out without being recorded, if any.
    pub fn unrecorded_transaction(&self) -> Option<String> {
        lock_marker(&self.unrecorded).clone()
    }

    /// Resume payouts after an operator recorded `transaction_id` by hand.
    /// Returns false if a different transaction (or none) is outstanding.
    pub fn acknowledge_unrecorded(&self, transaction_id: &str) -> bool {
        let mut marker = lock_marker(&self.unrecorded);
        if marker.as_deref() == Some(transaction_id) {
            tracing::warn!("[{}] Payout tx {} reconciled by operator, resuming payouts", self.pool_id, transaction_id);
            *marker = None;
            true
        } else {
            false
        }
    }

    /// Pay out `balances` in a single disbursement.
    ///
    /// Errors before the daemon returned a transaction id leave the ledger
    /// exactly as it was, so the same balances can be retried on a later
    /// cycle. A failed commit after the send halts payouts instead.
    pub async fn payout(&self, balances: &[Balance]) -> Result<PayoutReceipt, PayoutError> {
        if let Some(transaction_id) = self.unrecorded_transaction() {
            metrics::inc_payouts_failed();
            tracing::error!(
                "[{}] Refusing payout: tx {} was sent but never recorded, reconcile it first",
                self.pool_id,
                transaction_id
            );
            return Err(PayoutError::Halted { transaction_id });
        }

        // Pay what the daemon can represent, never more than is owed
        let payable: Vec<Balance> = balances
            .iter()
            .filter_map(|b| {
                let amount = b.amount.round_dp_with_strategy(AMOUNT_DECIMALS, RoundingStrategy::ToZero);
                if amount <= Decimal::ZERO {
                    tracing::warn!("Skipping payout to {}: non-payable amount {}", b.address, b.amount);
                    None
                } else {
                    Some(Balance::new(b.address.clone(), amount))
                }
            })
            .collect();
        let skipped = balances.len() - payable.len();

        if payable.is_empty() {
            return Ok(PayoutReceipt::empty(skipped));
        }

        let total: Decimal = payable.iter().map(|b| b.amount).sum();
        let recipients = payable.len();

        // sendmany takes each address once
        let mut amounts: Vec<(String, Decimal)> = Vec::with_capacity(recipients);
        for b in &payable {
            match amounts.iter_mut().find(|(addr, _)| *addr == b.address) {
                Some((_, amount)) => *amount += b.amount,
                None => amounts.push((b.address.clone(), b.amount)),
            }
        }
        let fee_payers: Vec<String> = amounts.iter().map(|(addr, _)| addr.clone()).collect();

        tracing::info!(
            "[{}] Paying out {} to {} recipients",
            self.pool_id,
            format_amount(total, &self.symbol),
            recipients
        );

        let command = RpcCommand::send_many(&amounts, self.min_confirmations, &fee_payers);
        let sent = match tokio::time::timeout(self.send_timeout, self.gateway.execute_single(&command)).await {
            Ok(outcome) => outcome.map_err(PayoutError::Rpc),
            Err(_) => Err(PayoutError::Timeout),
        };
        let result = match sent {
            Ok(v) => v,
            Err(e) => {
                metrics::inc_payouts_failed();
                tracing::error!(
                    "[{}] Payout of {} to {} recipients failed: {}",
                    self.pool_id,
                    format_amount(total, &self.symbol),
                    recipients,
                    e
                );
                return Err(e);
            }
        };

        let txid = result.as_str().map(str::trim).unwrap_or_default().to_string();
        if txid.is_empty() {
            metrics::inc_payouts_failed();
            tracing::error!(
                "[{}] sendmany reported success without a transaction id (result={}); \
                 ledger left unchanged, reconcile {} to {:?} manually",
                self.pool_id,
                result,
                format_amount(total, &self.symbol),
                fee_payers
            );
            return Err(PayoutError::EmptyTransactionId);
        }

        let created = Utc::now();
        let mut unit = UnitOfWork::new();
        for b in &payable {
            unit.insert_payment(Payment {
                pool_id: self.pool_id.clone(),
                coin: self.symbol.clone(),
                address: b.address.clone(),
                amount: b.amount,
                transaction_id: txid.clone(),
                created,
            })
            .adjust_balance(&self.pool_id, &b.address, -b.amount, BALANCE_USAGE_PAYOUT);
        }

        // The marker is only cleared by a successful commit, so a caller that
        // gives up waiting still leaves the pool halted until the task is done.
        *lock_marker(&self.unrecorded) = Some(txid.clone());
        let ledger = self.ledger.clone();
        let marker = self.unrecorded.clone();
        let commit = tokio::spawn(async move {
            let res = ledger.run_atomic(unit).await;
            if res.is_ok() {
                *lock_marker(&marker) = None;
            }
            res
        });
        let committed = commit
            .await
            .unwrap_or_else(|e| Err(LedgerError::Aborted(e.to_string())));

        if let Err(e) = committed {
            metrics::inc_ledger_rollbacks();
            metrics::inc_payouts_failed();
            tracing::error!(
                "[{}] Payout tx {} ({} to {} recipients) was sent but could not be recorded: {}; \
                 payouts halted until it is reconciled",
                self.pool_id,
                txid,
                format_amount(total, &self.symbol),
                recipients,
                e
            );
            return Err(PayoutError::Unrecorded {
                transaction_id: txid,
                source: e,
            });
        }

        metrics::record_payout_sent(recipients, created.timestamp());
        tracing::info!(
            "[{}] Paid out {} to {} recipients, tx {}",
            self.pool_id,
            format_amount(total, &self.symbol),
            recipients,
            txid
        );

        Ok(PayoutReceipt {
            transaction_id: Some(txid),
            recipients,
            skipped,
            total,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{LedgerError, RpcError};
    use crate::ledger::MemoryLedger;
    use crate::testing::ScriptedGateway;
    use rust_decimal_macros::dec;
    use serde_json::json;

    const POOL: &str = "btc1";

    async fn setup(balances: &[(&str, Decimal)]) -> (Arc<ScriptedGateway>, Arc<MemoryLedger>, PayoutOrchestrator) {
        let gw = Arc::new(ScriptedGateway::new());
        let ledger = Arc::new(MemoryLedger::new());
        for (addr, amount) in balances {
            ledger.credit(POOL, addr, *amount).await;
        }
        let orchestrator = PayoutOrchestrator::new(gw.clone(), ledger.clone(), POOL.into(), "BTC".into(), 1);
        (gw, ledger, orchestrator)
    }

    #[tokio::test]
    async fn test_successful_payout_records_and_debits() {
        let (gw, ledger, orchestrator) = setup(&[("A", dec!(1.5)), ("B", dec!(2.5))]).await;
        gw.script_send(Ok(json!("tx123")));

        let balances = vec![Balance::new("A", dec!(1.5)), Balance::new("B", dec!(2.5))];
        let receipt = orchestrator.payout(&balances).await.unwrap();

        assert_eq!(receipt.transaction_id.as_deref(), Some("tx123"));
        assert_eq!(receipt.recipients, 2);
        assert_eq!(receipt.total, dec!(4.0));

        let payments = ledger.payments(POOL).await.unwrap();
        assert_eq!(payments.len(), 2);
        assert!(payments.iter().all(|p| p.transaction_id == "tx123" && p.coin == "BTC"));
        assert_eq!(ledger.balance(POOL, "A").await, dec!(0));
        assert_eq!(ledger.balance(POOL, "B").await, dec!(0));

        let paid: Decimal = payments.iter().map(|p| p.amount).sum();
        let debited: Decimal = ledger.balance_changes(POOL).await.iter().map(|c| -c.delta).sum();
        assert_eq!(paid, debited);
    }

    #[tokio::test]
    async fn test_sendmany_request_shape() {
        let (gw, _ledger, orchestrator) = setup(&[("A", dec!(1.5)), ("B", dec!(2.5))]).await;
        gw.script_send(Ok(json!("tx123")));

        orchestrator
            .payout(&[Balance::new("A", dec!(1.5)), Balance::new("B", dec!(2.5))])
            .await
            .unwrap();

        let sent = gw.single_commands();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].method, "sendmany");
        let params = sent[0].params.as_array().unwrap();
        assert_eq!(params[1]["A"].as_f64(), Some(1.5));
        assert_eq!(params[1]["B"].as_f64(), Some(2.5));
        // at least one confirmation on spent funds
        assert_eq!(params[2], json!(1));
        // every recipient shares the network fee
        let fee_from: Vec<&str> = params[4].as_array().unwrap().iter().filter_map(|v| v.as_str()).collect();
        assert_eq!(fee_from, vec!["A", "B"]);
    }

    #[tokio::test]
    async fn test_rpc_failure_leaves_ledger_untouched() {
        let (gw, ledger, orchestrator) = setup(&[("A", dec!(1.5)), ("B", dec!(2.5))]).await;
        gw.script_send(Err(RpcError::Node { code: -6, message: "Insufficient funds".into() }));

        let balances = vec![Balance::new("A", dec!(1.5)), Balance::new("B", dec!(2.5))];
        let err = orchestrator.payout(&balances).await.unwrap_err();
        assert!(matches!(err, PayoutError::Rpc(RpcError::Node { code: -6, .. })));

        assert!(ledger.payments(POOL).await.unwrap().is_empty());
        assert!(ledger.balance_changes(POOL).await.is_empty());
        assert_eq!(ledger.balance(POOL, "A").await, dec!(1.5));
        assert_eq!(ledger.balance(POOL, "B").await, dec!(2.5));

        // the same balances go through once the daemon recovers
        gw.script_send(Ok(json!("tx-retry")));
        orchestrator.payout(&balances).await.unwrap();
        assert_eq!(ledger.payments(POOL).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_empty_transaction_id_is_a_failure() {
        let (gw, ledger, orchestrator) = setup(&[("A", dec!(1))]).await;
        gw.script_send(Ok(json!("")));

        let err = orchestrator.payout(&[Balance::new("A", dec!(1))]).await.unwrap_err();
        assert!(matches!(err, PayoutError::EmptyTransactionId));
        assert!(ledger.payments(POOL).await.unwrap().is_empty());
        assert_eq!(ledger.balance(POOL, "A").await, dec!(1));

        gw.script_send(Ok(serde_json::Value::Null));
        let err = orchestrator.payout(&[Balance::new("A", dec!(1))]).await.unwrap_err();
        assert!(matches!(err, PayoutError::EmptyTransactionId));
    }

    #[tokio::test]
    async fn test_ledger_failure_rolls_back_and_halts_pool() {
        // B owes less than requested: the debit fails after A was staged
        let (gw, ledger, orchestrator) = setup(&[("A", dec!(1)), ("B", dec!(0.5))]).await;
        gw.script_send(Ok(json!("tx-partial")));

        let err = orchestrator
            .payout(&[Balance::new("A", dec!(1)), Balance::new("B", dec!(2))])
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PayoutError::Unrecorded { ref transaction_id, source: LedgerError::InsufficientBalance { .. } }
                if transaction_id == "tx-partial"
        ));

        assert!(ledger.payments(POOL).await.unwrap().is_empty());
        assert_eq!(ledger.balance(POOL, "A").await, dec!(1));
        assert_eq!(ledger.balance(POOL, "B").await, dec!(0.5));
        assert_eq!(orchestrator.unrecorded_transaction().as_deref(), Some("tx-partial"));

        // A is still due but must not be paid a second time
        gw.script_send(Ok(json!("tx-again")));
        let err = orchestrator.payout(&[Balance::new("A", dec!(1))]).await.unwrap_err();
        assert!(matches!(err, PayoutError::Halted { ref transaction_id } if transaction_id == "tx-partial"));
        assert_eq!(gw.single_commands().len(), 1);
    }

    #[tokio::test]
    async fn test_acknowledge_unrecorded_resumes_payouts() {
        let (gw, ledger, orchestrator) = setup(&[("A", dec!(1))]).await;
        gw.script_send(Ok(json!("tx-lost")));
        let err = orchestrator.payout(&[Balance::new("A", dec!(5))]).await.unwrap_err();
        assert!(matches!(err, PayoutError::Unrecorded { .. }));

        assert!(!orchestrator.acknowledge_unrecorded("tx-other"));
        assert!(orchestrator.acknowledge_unrecorded("tx-lost"));
        assert_eq!(orchestrator.unrecorded_transaction(), None);

        gw.script_send(Ok(json!("tx-next")));
        let receipt = orchestrator.payout(&[Balance::new("A", dec!(1))]).await.unwrap();
        assert_eq!(receipt.transaction_id.as_deref(), Some("tx-next"));
        assert_eq!(ledger.balance(POOL, "A").await, dec!(0));
    }

    #[tokio::test]
    async fn test_send_timeout_leaves_ledger_untouched() {
        let (gw, ledger, orchestrator) = setup(&[("A", dec!(2))]).await;
        let orchestrator = orchestrator.with_send_timeout(Duration::from_millis(50));
        gw.script_send(Ok(json!("tx-slow")));
        gw.delay_send(Duration::from_millis(500));

        let err = orchestrator.payout(&[Balance::new("A", dec!(2))]).await.unwrap_err();
        assert!(matches!(err, PayoutError::Timeout));
        assert!(ledger.payments(POOL).await.unwrap().is_empty());
        assert!(ledger.balance_changes(POOL).await.is_empty());
        assert_eq!(ledger.balance(POOL, "A").await, dec!(2));
        assert_eq!(orchestrator.unrecorded_transaction(), None);
    }

    #[tokio::test]
    async fn test_nothing_to_pay_skips_daemon() {
        let (gw, _ledger, orchestrator) = setup(&[]).await;
        let receipt = orchestrator.payout(&[]).await.unwrap();
        assert_eq!(receipt, PayoutReceipt::empty(0));

        let receipt = orchestrator
            .payout(&[Balance::new("dust", dec!(0.000000001))])
            .await
            .unwrap();
        assert_eq!(receipt.recipients, 0);
        assert_eq!(receipt.skipped, 1);
        assert!(gw.single_commands().is_empty());
    }

    #[tokio::test]
    async fn test_dust_balance_reported_as_skipped() {
        let (gw, ledger, orchestrator) = setup(&[("A", dec!(1))]).await;
        gw.script_send(Ok(json!("tx-dust")));

        let balances = vec![Balance::new("A", dec!(1)), Balance::new("dust", dec!(0.000000001))];
        let receipt = orchestrator.payout(&balances).await.unwrap();
        assert_eq!(receipt.recipients, 1);
        assert_eq!(receipt.skipped, 1);
        assert_eq!(receipt.recipients + receipt.skipped, balances.len());
        assert_eq!(ledger.payments(POOL).await.unwrap().len(), receipt.recipients);
    }

    #[tokio::test]
    async fn test_amounts_truncated_to_daemon_precision() {
        let (gw, ledger, orchestrator) = setup(&[("A", dec!(1.123456789))]).await;
        gw.script_send(Ok(json!("tx-trunc")));

        let receipt = orchestrator
            .payout(&[Balance::new("A", dec!(1.123456789))])
            .await
            .unwrap();
        assert_eq!(receipt.total, dec!(1.12345678));
        assert_eq!(receipt.skipped, 0);
        assert_eq!(ledger.balance(POOL, "A").await, dec!(0.000000009));
    }
}
