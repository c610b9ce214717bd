pub mod blockchain;
pub mod config;
pub mod error;
pub mod ledger;
pub mod metrics;
pub mod payout;

// Scripted daemon used by unit tests, integration tests and benches
#[cfg(any(test, feature = "test_utils"))]
pub mod testing;
