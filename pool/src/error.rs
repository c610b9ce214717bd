/// Error types shared by the gateway, ledger and payout layers.
use rust_decimal::Decimal;
use thiserror::Error;

/// JSON-RPC error code the node returns for an unknown transaction id.
pub const RPC_INVALID_ADDRESS_OR_KEY: i64 = -5;

/// Failure of a single gateway command.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RpcError {
    /// The node answered with a JSON-RPC error object.
    #[error("node error {code}: {message}")]
    Node { code: i64, message: String },

    /// The request never produced a usable answer (connection, timeout,
    /// HTTP status, malformed body, open circuit breaker).
    #[error("transport error: {0}")]
    Transport(String),
}

impl RpcError {
    pub fn transport(msg: impl Into<String>) -> Self {
        RpcError::Transport(msg.into())
    }

    /// True when the node reports the referenced transaction as unknown.
    pub fn is_not_found(&self) -> bool {
        matches!(self, RpcError::Node { code, .. } if *code == RPC_INVALID_ADDRESS_OR_KEY)
    }

    pub fn code(&self) -> Option<i64> {
        match self {
            RpcError::Node { code, .. } => Some(*code),
            RpcError::Transport(_) => None,
        }
    }
}

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("balance of {address} would go negative: balance={balance}, delta={delta}")]
    InsufficientBalance {
        address: String,
        balance: Decimal,
        delta: Decimal,
    },

    #[error("ledger conflict: {0}")]
    Conflict(String),

    #[error("database error: {0}")]
    Database(#[from] tokio_postgres::Error),

    #[error("ledger task aborted: {0}")]
    Aborted(String),
}

#[derive(Error, Debug)]
pub enum PayoutError {
    #[error("disbursement rejected: {0}")]
    Rpc(#[from] RpcError),

    #[error("disbursement returned an empty transaction id")]
    EmptyTransactionId,

    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),

    /// The disbursement went out but its payments and debits were not
    /// stored. The pool stays halted until the transaction is reconciled.
    #[error("payout {transaction_id} was sent but not recorded: {source}")]
    Unrecorded {
        transaction_id: String,
        #[source]
        source: LedgerError,
    },

    #[error("payouts halted until transaction {transaction_id} is reconciled")]
    Halted { transaction_id: String },

    #[error("payout timed out")]
    Timeout,
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("missing required config field: {0}")]
    Missing(&'static str),

    #[error("invalid config field {field}: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("no payout handler registered for coin family '{0}'")]
    UnsupportedFamily(String),

    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_mapping() {
        let err = RpcError::Node { code: -5, message: "Invalid or non-wallet transaction id".into() };
        assert!(err.is_not_found());
        assert_eq!(err.code(), Some(-5));

        let other = RpcError::Node { code: -28, message: "Loading block index...".into() };
        assert!(!other.is_not_found());

        assert!(!RpcError::transport("connection refused").is_not_found());
        assert_eq!(RpcError::transport("x").code(), None);
    }
}
