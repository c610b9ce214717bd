/// Block maturity classification
///
/// Pending blocks are looked up by their coinbase transaction hash, one
/// daemon batch per page of blocks. The wallet's view of the coinbase
/// decides the outcome:
///
/// | lookup result                       | outcome              |
/// |-------------------------------------|----------------------|
/// | error -5 (unknown transaction)      | orphaned             |
/// | no `details` entries                | orphaned             |
/// | category `immature`                 | still pending        |
/// | category `generate`                 | confirmed + reward   |
/// | any other category                  | orphaned             |
/// | any other error                     | still pending (warn) |

use rust_decimal::Decimal;
use serde_json::Value;
use std::str::FromStr;
use std::sync::Arc;

use crate::blockchain::{ChainGateway, RpcCommand, RpcOutcome};
use crate::ledger::{Block, BlockStatus};
use crate::metrics::prometheus as metrics;

pub const DEFAULT_PAGE_SIZE: usize = 100;

const CATEGORY_IMMATURE: &str = "immature";
const CATEGORY_GENERATE: &str = "generate";

#[derive(Debug, Clone, PartialEq)]
pub enum LookupVerdict {
    /// Reward matured; amount in whole coins.
    Confirmed(Decimal),
    Orphaned,
    /// Coinbase not spendable yet.
    Immature,
    /// Lookup failed for a reason that says nothing about the block.
    Deferred(String),
}

fn parse_amount(v: &Value) -> Option<Decimal> {
    let txt = match v {
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.clone(),
        _ => return None,
    };
    Decimal::from_str(&txt)
        .or_else(|_| Decimal::from_scientific(&txt))
        .ok()
}

/// Map one `gettransaction` outcome to a verdict.
///
/// `amount` in the transaction details is reported in the smallest chain
/// unit and converted to whole coins with `unit_per_coin`.
pub fn classify_lookup(outcome: &RpcOutcome, unit_per_coin: Decimal) -> LookupVerdict {
    let tx = match outcome {
        Err(e) if e.is_not_found() => return LookupVerdict::Orphaned,
        Err(e) => return LookupVerdict::Deferred(e.to_string()),
        Ok(tx) => tx,
    };

    let detail = match tx
        .get("details")
        .and_then(|d| d.as_array())
        .and_then(|d| d.first())
    {
        Some(detail) => detail,
        None => return LookupVerdict::Orphaned,
    };

    match detail.get("category").and_then(|c| c.as_str()) {
        Some(CATEGORY_IMMATURE) => LookupVerdict::Immature,
        Some(CATEGORY_GENERATE) => match detail.get("amount").and_then(parse_amount) {
            Some(units) if !unit_per_coin.is_zero() => LookupVerdict::Confirmed(units / unit_per_coin),
            _ => LookupVerdict::Deferred("generate entry without a readable amount".to_string()),
        },
        _ => LookupVerdict::Orphaned,
    }
}

pub struct BlockClassifier {
    gateway: Arc<dyn ChainGateway>,
    page_size: usize,
    unit_per_coin: Decimal,
}

impl BlockClassifier {
    pub fn new(gateway: Arc<dyn ChainGateway>, page_size: usize, unit_per_coin: u64) -> Self {
        Self {
            gateway,
            page_size: page_size.max(1),
            unit_per_coin: Decimal::from(unit_per_coin),
        }
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Classify `blocks` and return the ones whose status was decided,
    /// in input order. Immature blocks and blocks whose lookup failed are
    /// left out and stay pending.
    pub async fn classify(&self, blocks: &[Block]) -> Vec<Block> {
        let mut decided = Vec::new();
        let mut immature = 0usize;
        let mut deferred = 0usize;

        for page in blocks.chunks(self.page_size) {
            let commands: Vec<RpcCommand> = page
                .iter()
                .map(|b| RpcCommand::get_transaction(&b.transaction_hash))
                .collect();

            let results = self.gateway.execute_batch(&commands).await;
            if results.len() != page.len() {
                // Without a 1:1 answer nothing in this page can be attributed safely
                tracing::warn!(
                    "Daemon answered {} of {} lookups, deferring page",
                    results.len(),
                    page.len()
                );
                deferred += page.len();
                continue;
            }

            for (block, outcome) in page.iter().zip(results.iter()) {
                match classify_lookup(outcome, self.unit_per_coin) {
                    LookupVerdict::Confirmed(reward) => {
                        let mut b = block.clone();
                        b.status = BlockStatus::Confirmed;
                        b.reward = Some(reward);
                        metrics::inc_blocks_confirmed();
                        decided.push(b);
                    }
                    LookupVerdict::Orphaned => {
                        let mut b = block.clone();
                        b.status = BlockStatus::Orphaned;
                        b.reward = None;
                        metrics::inc_blocks_orphaned();
                        decided.push(b);
                    }
                    LookupVerdict::Immature => {
                        tracing::debug!("Block {} at height {} is immature", block.id, block.height);
                        immature += 1;
                    }
                    LookupVerdict::Deferred(reason) => {
                        tracing::warn!(
                            "Could not classify block {} at height {} (tx {}): {}",
                            block.id,
                            block.height,
                            block.transaction_hash,
                            reason
                        );
                        metrics::inc_blocks_deferred();
                        deferred += 1;
                    }
                }
            }
        }

        tracing::info!(
            "Block classification: {} checked, {} decided, {} immature, {} deferred",
            blocks.len(),
            decided.len(),
            immature,
            deferred
        );

        decided
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RpcError;
    use crate::testing::ScriptedGateway;
    use rust_decimal_macros::dec;
    use serde_json::json;

    const SAT: u64 = 100_000_000;

    fn generate(amount: u64) -> RpcOutcome {
        Ok(json!({ "confirmations": 101, "details": [{ "category": "generate", "amount": amount }] }))
    }

    fn immature() -> RpcOutcome {
        Ok(json!({ "confirmations": 12, "details": [{ "category": "immature", "amount": 625000000 }] }))
    }

    fn not_found() -> RpcOutcome {
        Err(RpcError::Node { code: -5, message: "Invalid or non-wallet transaction id".into() })
    }

    #[test]
    fn test_classify_lookup_mapping() {
        let upc = Decimal::from(SAT);
        assert_eq!(classify_lookup(&not_found(), upc), LookupVerdict::Orphaned);
        assert_eq!(classify_lookup(&Ok(json!({ "details": [] })), upc), LookupVerdict::Orphaned);
        assert_eq!(classify_lookup(&Ok(json!({})), upc), LookupVerdict::Orphaned);
        assert_eq!(classify_lookup(&immature(), upc), LookupVerdict::Immature);
        assert_eq!(classify_lookup(&generate(625_000_000), upc), LookupVerdict::Confirmed(dec!(6.25)));
        assert_eq!(
            classify_lookup(&Ok(json!({ "details": [{ "category": "orphan" }] })), upc),
            LookupVerdict::Orphaned
        );
        assert!(matches!(
            classify_lookup(&Err(RpcError::Node { code: -28, message: "warming up".into() }), upc),
            LookupVerdict::Deferred(_)
        ));
        assert!(matches!(
            classify_lookup(&Err(RpcError::transport("connection refused")), upc),
            LookupVerdict::Deferred(_)
        ));
    }

    #[test]
    fn test_fractional_unit_amount() {
        let outcome = Ok(json!({ "details": [{ "category": "generate", "amount": 12345 }] }));
        assert_eq!(
            classify_lookup(&outcome, Decimal::from(SAT)),
            LookupVerdict::Confirmed(dec!(0.00012345))
        );
    }

    #[tokio::test]
    async fn test_three_block_scenario() {
        let gw = Arc::new(ScriptedGateway::new());
        gw.script_lookup("h1", not_found());
        gw.script_lookup("h2", Ok(json!({ "details": [] })));
        gw.script_lookup("h3", generate(500_000_000));

        let classifier = BlockClassifier::new(gw.clone(), DEFAULT_PAGE_SIZE, SAT);
        let blocks = vec![
            Block::pending(1, 100, "h1"),
            Block::pending(2, 101, "h2"),
            Block::pending(3, 102, "h3"),
        ];
        let out = classifier.classify(&blocks).await;

        assert_eq!(out.len(), 3);
        assert_eq!(out[0].transaction_hash, "h1");
        assert_eq!(out[0].status, BlockStatus::Orphaned);
        assert_eq!(out[1].transaction_hash, "h2");
        assert_eq!(out[1].status, BlockStatus::Orphaned);
        assert_eq!(out[2].transaction_hash, "h3");
        assert_eq!(out[2].status, BlockStatus::Confirmed);
        assert_eq!(out[2].reward, Some(dec!(5)));
        assert_eq!(gw.batch_sizes(), vec![3]);
    }

    #[tokio::test]
    async fn test_immature_and_failed_lookups_stay_pending() {
        let gw = Arc::new(ScriptedGateway::new());
        gw.script_lookup("young", immature());
        gw.script_lookup("flaky", Err(RpcError::Node { code: -28, message: "Loading wallet...".into() }));
        gw.script_lookup("gone", not_found());

        let classifier = BlockClassifier::new(gw.clone(), DEFAULT_PAGE_SIZE, SAT);
        let blocks = vec![
            Block::pending(1, 10, "young"),
            Block::pending(2, 11, "flaky"),
            Block::pending(3, 12, "gone"),
        ];
        let out = classifier.classify(&blocks).await;

        assert_eq!(out.len(), 1);
        assert_eq!(out[0].id, 3);
        assert_eq!(out[0].status, BlockStatus::Orphaned);
        // inputs are not mutated
        assert!(blocks.iter().all(|b| b.status == BlockStatus::Pending));
    }

    #[tokio::test]
    async fn test_pages_are_bounded_by_page_size() {
        let gw = Arc::new(ScriptedGateway::new());
        let blocks: Vec<Block> = (0..250)
            .map(|i| {
                let hash = format!("hash-{}", i);
                gw.script_lookup(&hash, generate(SAT));
                Block::pending(i, 1_000 + i as u64, hash)
            })
            .collect();

        let classifier = BlockClassifier::new(gw.clone(), 100, SAT);
        let out = classifier.classify(&blocks).await;

        // ceil(250 / 100) batches, none above the page size
        assert_eq!(gw.batch_sizes(), vec![100, 100, 50]);

        // every block looked up exactly once and returned in input order
        let looked_up = gw.looked_up();
        assert_eq!(looked_up.len(), 250);
        let expected: Vec<String> = (0..250).map(|i| format!("hash-{}", i)).collect();
        assert_eq!(looked_up, expected);
        let ids: Vec<i64> = out.iter().map(|b| b.id).collect();
        assert_eq!(ids, (0..250).collect::<Vec<i64>>());
    }

    #[tokio::test]
    async fn test_page_count_never_used_as_page_size() {
        // 3 blocks with page size 2 gives 2 pages; slicing by page count
        // would have produced pages of 2 and then lost or duplicated blocks
        let gw = Arc::new(ScriptedGateway::new());
        for h in ["a", "b", "c"] {
            gw.script_lookup(h, not_found());
        }
        let blocks = vec![Block::pending(1, 1, "a"), Block::pending(2, 2, "b"), Block::pending(3, 3, "c")];

        let classifier = BlockClassifier::new(gw.clone(), 2, SAT);
        let out = classifier.classify(&blocks).await;

        assert_eq!(gw.batch_sizes(), vec![2, 1]);
        assert_eq!(out.iter().map(|b| b.id).collect::<Vec<_>>(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_transport_outage_defers_whole_page() {
        let gw = Arc::new(ScriptedGateway::new());
        gw.fail_transport("connection refused");

        let classifier = BlockClassifier::new(gw.clone(), DEFAULT_PAGE_SIZE, SAT);
        let blocks = vec![Block::pending(1, 1, "a"), Block::pending(2, 2, "b")];
        assert!(classifier.classify(&blocks).await.is_empty());
    }

    #[tokio::test]
    async fn test_empty_input_issues_no_batches() {
        let gw = Arc::new(ScriptedGateway::new());
        let classifier = BlockClassifier::new(gw.clone(), DEFAULT_PAGE_SIZE, SAT);
        assert!(classifier.classify(&[]).await.is_empty());
        assert!(gw.batch_sizes().is_empty());
    }
}
