/// Scripted in-process gateway for tests and benchmarks.
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use crate::blockchain::gateway::{GET_TRANSACTION, SEND_MANY};
use crate::blockchain::{ChainGateway, RpcCommand, RpcOutcome};
use crate::error::RpcError;

#[derive(Default)]
struct Script {
    lookups: HashMap<String, RpcOutcome>,
    send_result: Option<RpcOutcome>,
    transport_failure: Option<String>,
    batch_sizes: Vec<usize>,
    looked_up: Vec<String>,
    singles: Vec<RpcCommand>,
    lookup_delay: Option<Duration>,
    send_delay: Option<Duration>,
}

/// Answers `gettransaction` from a table keyed by txid and `sendmany` with
/// one canned outcome, recording every call it sees.
#[derive(Default)]
pub struct ScriptedGateway {
    script: Mutex<Script>,
}

impl ScriptedGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script_lookup(&self, txid: &str, outcome: RpcOutcome) {
        self.lock().lookups.insert(txid.to_string(), outcome);
    }

    pub fn script_send(&self, outcome: RpcOutcome) {
        self.lock().send_result = Some(outcome);
    }

    /// Fail every call as if the daemon were unreachable.
    pub fn fail_transport(&self, reason: &str) {
        self.lock().transport_failure = Some(reason.to_string());
    }

    /// Hold every batch for `delay` before answering.
    pub fn delay_lookups(&self, delay: Duration) {
        self.lock().lookup_delay = Some(delay);
    }

    /// Hold every single command for `delay` before answering.
    pub fn delay_send(&self, delay: Duration) {
        self.lock().send_delay = Some(delay);
    }

    pub fn batch_sizes(&self) -> Vec<usize> {
        self.lock().batch_sizes.clone()
    }

    pub fn looked_up(&self) -> Vec<String> {
        self.lock().looked_up.clone()
    }

    pub fn single_commands(&self) -> Vec<RpcCommand> {
        self.lock().singles.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn answer(script: &mut Script, command: &RpcCommand) -> RpcOutcome {
        if let Some(reason) = &script.transport_failure {
            return Err(RpcError::transport(reason.clone()));
        }
        match command.method.as_str() {
            GET_TRANSACTION => {
                let txid = command
                    .params
                    .get(0)
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                script.looked_up.push(txid.clone());
                script
                    .lookups
                    .get(&txid)
                    .cloned()
                    .unwrap_or_else(|| Err(RpcError::transport(format!("unscripted txid {}", txid))))
            }
            SEND_MANY => script
                .send_result
                .clone()
                .unwrap_or_else(|| Err(RpcError::transport("unscripted sendmany"))),
            other => Err(RpcError::Node {
                code: -32601,
                message: format!("Method not found: {}", other),
            }),
        }
    }
}

#[async_trait]
impl ChainGateway for ScriptedGateway {
    async fn execute_batch(&self, commands: &[RpcCommand]) -> Vec<RpcOutcome> {
        if commands.is_empty() {
            return Vec::new();
        }
        let delay = {
            let mut script = self.lock();
            script.batch_sizes.push(commands.len());
            script.lookup_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut script = self.lock();
        commands.iter().map(|c| Self::answer(&mut script, c)).collect()
    }

    async fn execute_single(&self, command: &RpcCommand) -> RpcOutcome {
        let delay = {
            let mut script = self.lock();
            script.singles.push(command.clone());
            script.send_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut script = self.lock();
        Self::answer(&mut script, command)
    }
}
