//! Controller client for the RPC surface exposed inside a target.
//!
//! This module implements the connection retry loop and the
//! newline-delimited JSON-RPC 2.0 exchange with the controller.

use crate::error::TargetError;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;

/// Interval between connection retry attempts.
const RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// Default timeout for individual RPC calls.
const RPC_TIMEOUT: Duration = Duration::from_secs(30);

/// JSON-RPC error codes understood by the runtime.
pub mod error_codes {
    /// Parse error - Invalid JSON was received.
    pub const PARSE_ERROR: i32 = -32700;
    /// Method not found - The method does not exist / is not available.
    pub const METHOD_NOT_FOUND: i32 = -32601;
    /// Invalid params - Invalid method parameter(s).
    pub const INVALID_PARAMS: i32 = -32602;
    /// Internal error - Internal JSON-RPC error.
    pub const INTERNAL_ERROR: i32 = -32603;
    /// The target hit a condition it cannot recover from.
    pub const TARGET_FATAL: i32 = -32000;
    /// Used locally when the controller did not answer in time.
    pub const RESPONSE_TIMEOUT: i32 = -1;
}

/// Opaque named invocation dispatched inside a target.
///
/// The runtime never interprets `args`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    /// Controller function name.
    pub name: String,
    /// Positional arguments.
    #[serde(default)]
    pub args: Vec<serde_json::Value>,
}

impl FunctionCall {
    /// Create a call with no arguments.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            args: Vec::new(),
        }
    }

    /// Append a positional argument.
    pub fn arg(mut self, value: impl Into<serde_json::Value>) -> Self {
        self.args.push(value.into());
        self
    }
}

/// Outcome of a single `act` call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActOutcome {
    /// Reward attributed to this action, if the controller reports one.
    #[serde(default)]
    pub reward: Option<f64>,
    /// Whether the controller considers the episode over.
    #[serde(default)]
    pub terminated: bool,
}

/// Client for the controller running inside a target.
pub struct ControllerClient {
    endpoint: String,
    reader: BufReader<OwnedReadHalf>,
    writer: BufWriter<OwnedWriteHalf>,
    next_id: u64,
    rpc_timeout: Duration,
}

impl ControllerClient {
    /// Connect to the controller, retrying every 100ms until `connect_timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`TargetError::Timeout`] if no connection could be established
    /// within the timeout.
    pub async fn connect(endpoint: &str, connect_timeout: Duration) -> Result<Self, TargetError> {
        let start = std::time::Instant::now();
        tracing::debug!(endpoint = %endpoint, "Connecting to controller");

        let mut attempts = 0u32;
        loop {
            attempts += 1;
            match Self::try_connect(endpoint).await {
                Ok(client) => {
                    tracing::debug!(
                        endpoint = %endpoint,
                        elapsed_ms = start.elapsed().as_millis() as u64,
                        attempts,
                        "Connected to controller"
                    );
                    return Ok(client);
                }
                Err(e) => {
                    if start.elapsed() >= connect_timeout {
                        tracing::warn!(
                            endpoint = %endpoint,
                            elapsed_ms = start.elapsed().as_millis() as u64,
                            attempts,
                            "Controller connection timeout"
                        );
                        return Err(TargetError::Timeout {
                            operation: format!("connect to controller at {endpoint}"),
                            after: connect_timeout,
                        });
                    }
                    tracing::trace!(error = %e, attempt = attempts, "Connection attempt failed, retrying...");
                    tokio::time::sleep(RETRY_INTERVAL).await;
                }
            }
        }
    }

    /// Attempt a single connection.
    pub async fn try_connect(endpoint: &str) -> Result<Self, TargetError> {
        let stream = TcpStream::connect(endpoint)
            .await
            .map_err(|e| TargetError::Connection(format!("connect to {endpoint} failed: {e}")))?;
        stream.set_nodelay(true)?;

        let (read_half, write_half) = stream.into_split();
        Ok(Self {
            endpoint: endpoint.to_string(),
            reader: BufReader::new(read_half),
            writer: BufWriter::new(write_half),
            next_id: 1,
            rpc_timeout: RPC_TIMEOUT,
        })
    }

    /// Override the per-call response timeout.
    pub fn with_rpc_timeout(mut self, rpc_timeout: Duration) -> Self {
        self.rpc_timeout = rpc_timeout;
        self
    }

    /// Address this client is connected to.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Send a JSON-RPC request and wait for the response.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails, times out, or the controller
    /// returns an error payload.
    pub async fn call<P: Serialize, R: DeserializeOwned>(
        &mut self,
        method: &str,
        params: P,
    ) -> Result<R, TargetError> {
        let id = self.next_id;
        self.next_id += 1;

        let request = serde_json::json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });

        let request_str = serde_json::to_string(&request)?;
        tracing::debug!(method = %method, id, "Sending RPC request");
        tracing::trace!(request = %request_str, "RPC request body");

        self.writer.write_all(request_str.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await?;

        let response = self.read_response(method, id).await?;

        if let Some(error) = response.get("error") {
            let code = error
                .get("code")
                .and_then(|v| v.as_i64())
                .unwrap_or(error_codes::INTERNAL_ERROR as i64) as i32;
            let message = error
                .get("message")
                .and_then(|v| v.as_str())
                .unwrap_or("unknown error")
                .to_string();
            let data = error.get("data").cloned();
            tracing::debug!(method = %method, id, code, message = %message, "RPC error response");
            return Err(TargetError::Rpc {
                code,
                message,
                data,
            });
        }

        let result = response
            .get("result")
            .cloned()
            .ok_or_else(|| TargetError::Rpc {
                code: error_codes::INTERNAL_ERROR,
                message: "missing result in response".into(),
                data: None,
            })?;

        tracing::debug!(method = %method, id, "RPC call successful");
        serde_json::from_value(result).map_err(TargetError::from)
    }

    /// Read lines until the response carrying `id` arrives.
    ///
    /// Replies to earlier requests that timed out are still in the stream;
    /// they are dropped. The whole exchange shares one `rpc_timeout`.
    async fn read_response(&mut self, method: &str, id: u64) -> Result<serde_json::Value, TargetError> {
        let deadline = tokio::time::Instant::now() + self.rpc_timeout;
        loop {
            let mut response_str = String::new();
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            match timeout(remaining, self.reader.read_line(&mut response_str)).await {
                Ok(Ok(0)) => {
                    return Err(TargetError::Connection(format!(
                        "controller at {} closed the connection",
                        self.endpoint
                    )));
                }
                Ok(Ok(_)) => {}
                Ok(Err(e)) => {
                    tracing::warn!(method = %method, id, error = %e, "RPC read error");
                    return Err(e.into());
                }
                Err(_) => {
                    tracing::warn!(method = %method, id, timeout_ms = self.rpc_timeout.as_millis() as u64, "RPC response timeout");
                    return Err(TargetError::Rpc {
                        code: error_codes::RESPONSE_TIMEOUT,
                        message: "response timeout".into(),
                        data: None,
                    });
                }
            }

            tracing::trace!(response = %response_str.trim(), "RPC response body");
            let response: serde_json::Value = serde_json::from_str(&response_str)?;

            match response.get("id").and_then(|v| v.as_u64()) {
                Some(got) if got == id => return Ok(response),
                // Parse errors carry a null id
                None if response.get("error").is_some() => return Ok(response),
                Some(got) if got < id => {
                    tracing::debug!(method = %method, id, stale_id = got, "Discarding late RPC response");
                }
                got => {
                    return Err(TargetError::Rpc {
                        code: error_codes::INTERNAL_ERROR,
                        message: format!("response id {got:?} does not match request id {id}"),
                        data: None,
                    });
                }
            }
        }
    }

    /// Ping the controller to check that it is responsive.
    pub async fn ping(&mut self) -> Result<(), TargetError> {
        let _: PingResponse = self.call("ping", serde_json::json!({})).await?;
        Ok(())
    }

    /// Invoke a setup/evaluate function inside the target.
    pub async fn invoke(&mut self, call: &FunctionCall) -> Result<serde_json::Value, TargetError> {
        tracing::debug!(function = %call.name, args = call.args.len(), "Invoking controller function");
        self.call("call", call).await
    }

    /// Apply one action inside the target.
    pub async fn act<A: Serialize>(&mut self, action: &A) -> Result<ActOutcome, TargetError> {
        let outcome: Option<ActOutcome> = self
            .call("act", serde_json::json!({ "action": action }))
            .await?;
        Ok(outcome.unwrap_or_default())
    }

    /// Fetch the target's current observation without changing its state.
    pub async fn observe<R: DeserializeOwned>(&mut self) -> Result<R, TargetError> {
        self.call("observe", serde_json::json!({})).await
    }
}

#[derive(Debug, Deserialize)]
struct PingResponse {
    #[allow(dead_code)]
    pong: bool,
}
