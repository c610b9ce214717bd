use prometheus::core::Collector;
use prometheus::{Encoder, IntCounter, IntGauge, TextEncoder};
use std::sync::OnceLock;

static RPC_REQUESTS: OnceLock<IntCounter> = OnceLock::new();
static RPC_ERRORS: OnceLock<IntCounter> = OnceLock::new();
static RPC_BATCHES: OnceLock<IntCounter> = OnceLock::new();

static BLOCKS_CONFIRMED: OnceLock<IntCounter> = OnceLock::new();
static BLOCKS_ORPHANED: OnceLock<IntCounter> = OnceLock::new();
static BLOCKS_DEFERRED: OnceLock<IntCounter> = OnceLock::new();

static PAYOUTS_SENT: OnceLock<IntCounter> = OnceLock::new();
static PAYOUTS_FAILED: OnceLock<IntCounter> = OnceLock::new();
static PAYOUT_RECIPIENTS: OnceLock<IntCounter> = OnceLock::new();
static LEDGER_ROLLBACKS: OnceLock<IntCounter> = OnceLock::new();

static LAST_PAYOUT_TIMESTAMP: OnceLock<IntGauge> = OnceLock::new();

fn rpc_requests() -> &'static IntCounter {
    RPC_REQUESTS
        .get_or_init(|| IntCounter::new("rpc_requests_total", "Total RPC commands sent to the node").unwrap())
}

fn rpc_errors() -> &'static IntCounter {
    RPC_ERRORS.get_or_init(|| IntCounter::new("rpc_errors_total", "Total RPC commands that failed").unwrap())
}

fn rpc_batches() -> &'static IntCounter {
    RPC_BATCHES
        .get_or_init(|| IntCounter::new("rpc_batches_total", "Total batched RPC requests").unwrap())
}

fn blocks_confirmed() -> &'static IntCounter {
    BLOCKS_CONFIRMED.get_or_init(|| {
        IntCounter::new("blocks_confirmed_total", "Blocks whose reward matured").unwrap()
    })
}

fn blocks_orphaned() -> &'static IntCounter {
    BLOCKS_ORPHANED
        .get_or_init(|| IntCounter::new("blocks_orphaned_total", "Blocks classified as orphaned").unwrap())
}

fn blocks_deferred() -> &'static IntCounter {
    BLOCKS_DEFERRED.get_or_init(|| {
        IntCounter::new(
            "blocks_deferred_total",
            "Block lookups that failed and were left pending",
        )
        .unwrap()
    })
}

fn payouts_sent() -> &'static IntCounter {
    PAYOUTS_SENT
        .get_or_init(|| IntCounter::new("payouts_sent_total", "Disbursements committed to the ledger").unwrap())
}

fn payouts_failed() -> &'static IntCounter {
    PAYOUTS_FAILED
        .get_or_init(|| IntCounter::new("payouts_failed_total", "Payout attempts that failed").unwrap())
}

fn payout_recipients() -> &'static IntCounter {
    PAYOUT_RECIPIENTS.get_or_init(|| {
        IntCounter::new("payout_recipients_total", "Recipients paid across all disbursements").unwrap()
    })
}

fn ledger_rollbacks() -> &'static IntCounter {
    LEDGER_ROLLBACKS.get_or_init(|| {
        IntCounter::new("ledger_rollbacks_total", "Ledger units of work that were rolled back").unwrap()
    })
}

fn last_payout_timestamp() -> &'static IntGauge {
    LAST_PAYOUT_TIMESTAMP.get_or_init(|| {
        IntGauge::new("last_payout_timestamp", "Unix time of the last committed payout").unwrap()
    })
}

pub fn inc_rpc_requests(count: usize) {
    rpc_requests().inc_by(count as u64);
}

pub fn inc_rpc_errors() {
    rpc_errors().inc();
}

pub fn inc_rpc_batches() {
    rpc_batches().inc();
}

pub fn inc_blocks_confirmed() {
    blocks_confirmed().inc();
}

pub fn inc_blocks_orphaned() {
    blocks_orphaned().inc();
}

pub fn inc_blocks_deferred() {
    blocks_deferred().inc();
}

pub fn record_payout_sent(recipients: usize, timestamp: i64) {
    payouts_sent().inc();
    payout_recipients().inc_by(recipients as u64);
    last_payout_timestamp().set(timestamp);
}

pub fn inc_payouts_failed() {
    payouts_failed().inc();
}

pub fn inc_ledger_rollbacks() {
    ledger_rollbacks().inc();
}

pub fn render() -> String {
    let enc = TextEncoder::new();
    let mut mfs = Vec::new();

    mfs.extend(rpc_requests().collect());
    mfs.extend(rpc_errors().collect());
    mfs.extend(rpc_batches().collect());
    mfs.extend(blocks_confirmed().collect());
    mfs.extend(blocks_orphaned().collect());
    mfs.extend(blocks_deferred().collect());
    mfs.extend(payouts_sent().collect());
    mfs.extend(payouts_failed().collect());
    mfs.extend(payout_recipients().collect());
    mfs.extend(ledger_rollbacks().collect());
    mfs.extend(last_payout_timestamp().collect());

    let mut buf = Vec::new();
    let _ = enc.encode(&mfs, &mut buf);
    String::from_utf8_lossy(&buf).to_string()
}
