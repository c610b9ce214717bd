pub mod classifier;
pub mod handler;
pub mod orchestrator;
pub mod registry;
pub mod scheduler;

use rust_decimal::{Decimal, RoundingStrategy};

pub use classifier::{classify_lookup, BlockClassifier, LookupVerdict};
pub use handler::{BitcoinPayoutHandler, PayoutHandler};
pub use orchestrator::{PayoutOrchestrator, PayoutReceipt};
pub use registry::{CoinFamily, PayoutHandlerRegistry};
pub use scheduler::{CycleReport, PayoutCycle};

/// Format an amount for logs and operators: at most 5 decimals, trailing
/// zeros dropped, followed by the ticker.
pub fn format_amount(amount: Decimal, symbol: &str) -> String {
    let rounded = amount
        .round_dp_with_strategy(5, RoundingStrategy::MidpointAwayFromZero)
        .normalize();
    format!("{} {}", rounded, symbol)
}
