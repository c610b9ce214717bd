/// Blockchain communication module
/// Gateway contract and the JSON-RPC client that talks to the coin daemon

pub mod gateway;
pub mod rpc_client;

pub use gateway::{ChainGateway, RpcCommand, RpcOutcome};
pub use rpc_client::JsonRpcGateway;
