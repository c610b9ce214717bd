/// JSON-RPC client for the coin daemon
///
/// Implements `ChainGateway` over HTTP with a circuit breaker. Batches are
/// sent as a JSON-RPC array in a single POST.

use async_trait::async_trait;
use base64::Engine;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{header, Method, Request, Uri};
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

use super::gateway::{ChainGateway, RpcCommand, RpcOutcome};
use crate::config::DaemonConfig;
use crate::error::{ConfigError, RpcError};
use crate::metrics::prometheus as metrics;

#[derive(Debug, Clone, Serialize)]
pub struct RpcRequest<'a> {
    pub jsonrpc: &'a str,
    pub id: u64,
    pub method: &'a str,
    pub params: &'a Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcResponse {
    #[serde(default)]
    pub id: Value,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<Value>,
}

const BREAKER_MAX_FAILURES: u32 = 5;
const BREAKER_RESET_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
struct CircuitBreaker {
    failures: u32,
    last_failure: Option<Instant>,
    is_open: bool,
    max_failures: u32,
    reset_timeout: Duration,
}

impl CircuitBreaker {
    fn new() -> Self {
        Self {
            failures: 0,
            last_failure: None,
            is_open: false,
            max_failures: BREAKER_MAX_FAILURES,
            reset_timeout: BREAKER_RESET_TIMEOUT,
        }
    }

    fn record_failure(&mut self) {
        self.failures += 1;
        self.last_failure = Some(Instant::now());

        if self.failures >= self.max_failures && !self.is_open {
            self.is_open = true;
            tracing::error!(
                "Daemon circuit breaker open after {} transport failures, pausing RPC for {}s",
                self.failures,
                self.reset_timeout.as_secs()
            );
        }
    }

    fn record_success(&mut self) {
        if self.failures > 0 {
            self.failures = 0;
            tracing::info!("Daemon circuit breaker reset");
        }
    }

    fn check(&mut self) -> Result<(), RpcError> {
        if self.is_open {
            if let Some(last_fail) = self.last_failure {
                if last_fail.elapsed() > self.reset_timeout {
                    tracing::info!("Daemon circuit breaker half-open, retrying");
                    self.is_open = false;
                    self.failures = 0;
                } else {
                    return Err(RpcError::transport("daemon circuit breaker is open"));
                }
            }
        }
        Ok(())
    }
}

/// Convert a JSON-RPC error object into a structured error.
fn node_error(error: Value) -> RpcError {
    match (error.get("code").and_then(|c| c.as_i64()), error.get("message")) {
        (Some(code), message) => RpcError::Node {
            code,
            message: message
                .and_then(|m| m.as_str())
                .unwrap_or_default()
                .to_string(),
        },
        (None, _) => RpcError::transport(format!("malformed error object: {}", error)),
    }
}

fn outcome_from_response(response: RpcResponse) -> RpcOutcome {
    match response.error {
        Some(error) if !error.is_null() => Err(node_error(error)),
        _ => Ok(response.result.unwrap_or(Value::Null)),
    }
}

/// Line batch responses up with their commands by request id.
///
/// The node may answer a batch in any order; ids are the command indexes.
/// Slots without an answer become transport errors.
fn order_batch_responses(count: usize, responses: Vec<RpcResponse>) -> Vec<RpcOutcome> {
    let mut slots: Vec<Option<RpcOutcome>> = (0..count).map(|_| None).collect();

    for response in responses {
        let idx = match response.id.as_u64() {
            Some(id) if (id as usize) < count => id as usize,
            _ => {
                tracing::warn!("Dropping batch response with unexpected id {}", response.id);
                continue;
            }
        };
        if slots[idx].is_some() {
            tracing::warn!("Duplicate batch response for id {}", idx);
            continue;
        }
        slots[idx] = Some(outcome_from_response(response));
    }

    slots
        .into_iter()
        .enumerate()
        .map(|(idx, slot)| {
            slot.unwrap_or_else(|| Err(RpcError::transport(format!("no response for batch entry {}", idx))))
        })
        .collect()
}

pub struct JsonRpcGateway {
    url: Uri,
    timeout: Duration,
    auth_header: Option<String>,
    client: Client<HttpConnector, Full<Bytes>>,
    circuit_breaker: Arc<RwLock<CircuitBreaker>>,
}

impl JsonRpcGateway {
    pub fn new(daemon: &DaemonConfig) -> Result<Self, ConfigError> {
        let url = daemon.url.parse::<Uri>().map_err(|e| ConfigError::Invalid {
            field: "daemon.url",
            reason: e.to_string(),
        })?;
        if url.scheme_str() != Some("http") {
            return Err(ConfigError::Invalid {
                field: "daemon.url",
                reason: format!("unsupported scheme in '{}', expected http", daemon.url),
            });
        }

        let auth_header = daemon.user.as_ref().map(|user| {
            let password = daemon.password.as_deref().unwrap_or_default();
            let token = base64::engine::general_purpose::STANDARD.encode(format!("{}:{}", user, password));
            format!("Basic {}", token)
        });

        let client = Client::builder(hyper_util::rt::TokioExecutor::new()).build_http();

        tracing::info!("Daemon RPC gateway initialized: {}", url);

        Ok(Self {
            url,
            timeout: Duration::from_secs(daemon.timeout_secs.max(1)),
            auth_header,
            client,
            circuit_breaker: Arc::new(RwLock::new(CircuitBreaker::new())),
        })
    }

    /// POST a JSON-RPC payload and return the raw response body.
    ///
    /// Only transport-level problems are errors here; the daemon answers
    /// failed calls with HTTP 500 and a JSON-RPC error body, so the body is
    /// handed back whenever there is one.
    async fn post(&self, payload: Vec<u8>) -> Result<Bytes, RpcError> {
        {
            let mut breaker = self.circuit_breaker.write().await;
            breaker.check()?;
        }

        let res: Result<Bytes, RpcError> = async {
            let mut builder = Request::builder()
                .method(Method::POST)
                .uri(self.url.clone())
                .header(header::CONTENT_TYPE, "application/json");
            if let Some(auth) = &self.auth_header {
                builder = builder.header(header::AUTHORIZATION, auth);
            }
            let req = builder
                .body(Full::new(Bytes::from(payload)))
                .map_err(|e| RpcError::transport(format!("failed to build request: {}", e)))?;

            let response = tokio::time::timeout(self.timeout, self.client.request(req))
                .await
                .map_err(|_| RpcError::transport("RPC request timeout"))?
                .map_err(|e| RpcError::transport(format!("RPC connection failed: {}", e)))?;

            let status = response.status();
            if status == hyper::StatusCode::UNAUTHORIZED || status == hyper::StatusCode::FORBIDDEN {
                return Err(RpcError::transport(format!("RPC authentication failed: {}", status)));
            }

            let body = response
                .into_body()
                .collect()
                .await
                .map_err(|e| RpcError::transport(format!("failed to read RPC body: {}", e)))?
                .to_bytes();

            if !status.is_success() && body.is_empty() {
                return Err(RpcError::transport(format!("RPC HTTP error: {}", status)));
            }
            Ok(body)
        }
        .await;

        let mut breaker = self.circuit_breaker.write().await;
        match &res {
            Ok(_) => breaker.record_success(),
            Err(_) => breaker.record_failure(),
        }
        res
    }
}

#[async_trait]
impl ChainGateway for JsonRpcGateway {
    async fn execute_batch(&self, commands: &[RpcCommand]) -> Vec<RpcOutcome> {
        if commands.is_empty() {
            return Vec::new();
        }

        metrics::inc_rpc_batches();
        metrics::inc_rpc_requests(commands.len());

        let requests: Vec<RpcRequest<'_>> = commands
            .iter()
            .enumerate()
            .map(|(idx, cmd)| RpcRequest {
                jsonrpc: "1.0",
                id: idx as u64,
                method: &cmd.method,
                params: &cmd.params,
            })
            .collect();

        let outcomes = match serde_json::to_vec(&requests) {
            Err(e) => {
                let err = RpcError::transport(format!("failed to encode batch: {}", e));
                vec![Err(err); commands.len()]
            }
            Ok(payload) => match self.post(payload).await {
                Err(err) => vec![Err(err); commands.len()],
                Ok(body) => match serde_json::from_slice::<Vec<RpcResponse>>(&body) {
                    Ok(responses) => order_batch_responses(commands.len(), responses),
                    Err(_) => {
                        // A daemon that rejects the whole batch answers with one error object
                        let err = match serde_json::from_slice::<RpcResponse>(&body) {
                            Ok(single) => match outcome_from_response(single) {
                                Err(e) => e,
                                Ok(_) => RpcError::transport("batch answered with a single result"),
                            },
                            Err(e) => RpcError::transport(format!("malformed batch response: {}", e)),
                        };
                        vec![Err(err); commands.len()]
                    }
                },
            },
        };

        for outcome in &outcomes {
            if outcome.is_err() {
                metrics::inc_rpc_errors();
            }
        }
        outcomes
    }

    async fn execute_single(&self, command: &RpcCommand) -> RpcOutcome {
        metrics::inc_rpc_requests(1);

        let request = RpcRequest {
            jsonrpc: "1.0",
            id: 1,
            method: &command.method,
            params: &command.params,
        };

        let res = async {
            let payload = serde_json::to_vec(&request)
                .map_err(|e| RpcError::transport(format!("failed to encode request: {}", e)))?;
            let body = self.post(payload).await?;
            let response: RpcResponse = serde_json::from_slice(&body)
                .map_err(|e| RpcError::transport(format!("malformed RPC response: {}", e)))?;
            outcome_from_response(response)
        }
        .await;

        if let Err(e) = &res {
            metrics::inc_rpc_errors();
            tracing::debug!("RPC {} failed: {}", command.method, e);
        }
        res
    }
}
