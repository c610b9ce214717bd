/// Chain oracle gateway: the pool's only view of the node
///
/// Commands go out singly or as one batch. A batch answers with one outcome
/// per command, in command order, and a failing command never hides the
/// results of the others.

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde_json::{json, Map, Number, Value};

use crate::error::RpcError;

pub const GET_TRANSACTION: &str = "gettransaction";
pub const SEND_MANY: &str = "sendmany";

/// Result of one command: the node's `result` value or a structured error.
pub type RpcOutcome = Result<Value, RpcError>;

#[derive(Debug, Clone, PartialEq)]
pub struct RpcCommand {
    pub method: String,
    pub params: Value,
}

impl RpcCommand {
    pub fn new(method: &str, params: Value) -> Self {
        Self {
            method: method.to_string(),
            params,
        }
    }

    /// Wallet lookup of a transaction by id.
    pub fn get_transaction(txid: &str) -> Self {
        Self::new(GET_TRANSACTION, json!([txid]))
    }

    /// Multi-recipient send from the default wallet account.
    ///
    /// Amounts are whole coins; the node takes them as JSON numbers with at
    /// most 8 decimals. Addresses listed in `subtract_fee_from` share the
    /// network fee instead of the pool wallet.
    pub fn send_many(
        amounts: &[(String, Decimal)],
        min_confirmations: u32,
        subtract_fee_from: &[String],
    ) -> Self {
        let mut recipients = Map::new();
        for (address, amount) in amounts {
            let value = serde_json::from_str::<Number>(&amount.round_dp(8).normalize().to_string())
                .map(Value::Number)
                .unwrap_or(Value::Null);
            recipients.insert(address.clone(), value);
        }

        Self::new(
            SEND_MANY,
            json!(["", recipients, min_confirmations, "", subtract_fee_from]),
        )
    }
}

#[async_trait]
pub trait ChainGateway: Send + Sync {
    /// Execute `commands` as one batch. The returned vector always has the
    /// same length as `commands` and entry `i` answers command `i`.
    async fn execute_batch(&self, commands: &[RpcCommand]) -> Vec<RpcOutcome>;

    async fn execute_single(&self, command: &RpcCommand) -> RpcOutcome;
}
