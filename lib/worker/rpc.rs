//! JSON-RPC client for EVM nodes.

use std::error::Error as StdError;
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use nonzero_ext::nonzero;
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, warn};

use super::retry::{run_with_retry, RetryPolicy};
use crate::pipeline::types::BlockRange;

/// Process-wide request budget shared by every RPC call, retries included.
pub type GlobalRateLimiter = Arc<RateLimiter<NotKeyed, InMemoryState, DefaultClock>>;

pub fn rate_limiter(requests_per_second: u32) -> GlobalRateLimiter {
    let rps = NonZeroU32::new(requests_per_second).unwrap_or(nonzero!(50u32));
    Arc::new(RateLimiter::direct(Quota::per_second(rps)))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcErrorKind {
    /// Timeouts, refused or reset connections, truncated bodies.
    Network,
    /// HTTP 429 or a node-side request limit.
    RateLimited,
    /// HTTP 5xx, node internal errors, or data the node does not have yet.
    UpstreamUnavailable,
    /// JSON-RPC error object the node returned for a well-formed request.
    Rpc,
    /// Response that does not follow the JSON-RPC envelope.
    Malformed,
    Other,
}

#[derive(Debug, Error)]
#[error("{method} failed ({kind:?}): {message}")]
pub struct RpcError {
    pub kind: RpcErrorKind,
    pub method: &'static str,
    pub message: String,
    /// Attempts made before giving up; `1` for errors built outside the retry loop.
    pub attempts: u32,
}

impl RpcError {
    pub fn new(kind: RpcErrorKind, method: &'static str, message: impl Into<String>) -> Self {
        Self {
            kind,
            method,
            message: message.into(),
            attempts: 1,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind,
            RpcErrorKind::Network | RpcErrorKind::RateLimited | RpcErrorKind::UpstreamUnavailable
        )
    }
}

#[derive(Debug, Clone)]
pub struct RpcClientConfig {
    pub url: String,
    pub timeout: Duration,
    pub retry_policy: RetryPolicy,
}

#[derive(Debug, Deserialize)]
struct JsonRpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<JsonRpcErrorObject>,
}

#[derive(Debug, Deserialize)]
struct JsonRpcErrorObject {
    code: i64,
    message: String,
}

/// Node-side "limit exceeded" code used by most hosted providers.
const RPC_LIMIT_EXCEEDED: i64 = -32005;
const RPC_INTERNAL_ERROR: i64 = -32603;

pub struct EvmRpcClient {
    http: reqwest::Client,
    config: RpcClientConfig,
    limiter: GlobalRateLimiter,
    next_id: AtomicU64,
}

impl EvmRpcClient {
    pub fn new(config: RpcClientConfig, limiter: GlobalRateLimiter) -> Result<Self, RpcError> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|err| RpcError::new(RpcErrorKind::Other, "client_init", err.to_string()))?;

        Ok(Self {
            http,
            config,
            limiter,
            next_id: AtomicU64::new(1),
        })
    }

    /// `eth_blockNumber`: current chain head.
    pub async fn block_number(&self) -> Result<i64, RpcError> {
        let method = "eth_blockNumber";
        let value = self.call(method, json!([]), -1).await?;
        parse_quantity(&value).map_err(|message| RpcError::new(RpcErrorKind::Malformed, method, message))
    }

    /// `eth_getBlockByNumber` with transaction hashes only.
    pub async fn get_block(&self, number: i64) -> Result<Value, RpcError> {
        self.call(
            "eth_getBlockByNumber",
            json!([to_quantity(number), false]),
            number,
        )
        .await
    }

    /// `eth_getLogs` over an inclusive range, filtered on `topic0`.
    pub async fn get_logs(&self, range: BlockRange, topic0: &str) -> Result<Vec<Value>, RpcError> {
        let method = "eth_getLogs";
        let filter = json!([{
            "fromBlock": to_quantity(range.from_block),
            "toBlock": to_quantity(range.to_block),
            "topics": [topic0],
        }]);
        let value = self.call(method, filter, range.from_block).await?;
        into_array(method, value)
    }

    /// `eth_getBlockReceipts` for one block.
    pub async fn get_block_receipts(&self, number: i64) -> Result<Vec<Value>, RpcError> {
        let method = "eth_getBlockReceipts";
        let value = self.call(method, json!([to_quantity(number)]), number).await?;
        into_array(method, value)
    }

    /// Issues one call under the retry policy. A `null` result is treated as data the node
    /// does not serve yet and is retried like an upstream outage.
    async fn call(&self, method: &'static str, params: Value, seed: i64) -> Result<Value, RpcError> {
        let outcome = run_with_retry(
            &self.config.retry_policy,
            seed,
            |attempt| {
                let params = params.clone();
                async move {
                    if attempt > 1 {
                        debug!(event = "rpc_retry", method, attempt, "retrying rpc call");
                    }
                    self.call_once(method, params).await
                }
            },
            RpcError::is_retryable,
        )
        .await;

        match outcome {
            Ok((value, _attempts)) => Ok(value),
            Err(terminal) => {
                warn!(
                    event = "rpc_call_failed",
                    method,
                    attempts = terminal.attempts,
                    exhausted_retryable = terminal.exhausted_retryable,
                    error = %terminal.error,
                    "rpc call failed"
                );
                Err(RpcError {
                    attempts: terminal.attempts,
                    ..terminal.error
                })
            }
        }
    }

    async fn call_once(&self, method: &'static str, params: Value) -> Result<Value, RpcError> {
        self.limiter.until_ready().await;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });

        let response = self
            .http
            .post(&self.config.url)
            .json(&body)
            .send()
            .await
            .map_err(|err| map_transport_error(method, err))?;

        let status = response.status();
        if !status.is_success() {
            return Err(map_status(method, status.as_u16()));
        }

        let envelope: JsonRpcResponse = response
            .json()
            .await
            .map_err(|err| map_transport_error(method, err))?;

        if let Some(error) = envelope.error {
            return Err(map_rpc_error(method, error));
        }

        match envelope.result {
            Some(Value::Null) | None => Err(RpcError::new(
                RpcErrorKind::UpstreamUnavailable,
                method,
                "node returned a null result",
            )),
            Some(value) => Ok(value),
        }
    }
}

fn into_array(method: &'static str, value: Value) -> Result<Vec<Value>, RpcError> {
    match value {
        Value::Array(items) => Ok(items),
        other => Err(RpcError::new(
            RpcErrorKind::Malformed,
            method,
            format!("expected an array result, got {other}"),
        )),
    }
}

fn map_status(method: &'static str, status: u16) -> RpcError {
    let kind = match status {
        429 => RpcErrorKind::RateLimited,
        500..=599 => RpcErrorKind::UpstreamUnavailable,
        _ => RpcErrorKind::Other,
    };
    RpcError::new(kind, method, format!("unexpected HTTP status {status}"))
}

fn map_rpc_error(method: &'static str, error: JsonRpcErrorObject) -> RpcError {
    let kind = match error.code {
        RPC_LIMIT_EXCEEDED => RpcErrorKind::RateLimited,
        RPC_INTERNAL_ERROR => RpcErrorKind::UpstreamUnavailable,
        _ => RpcErrorKind::Rpc,
    };
    RpcError::new(kind, method, format!("code {}: {}", error.code, error.message))
}

fn map_transport_error(method: &'static str, err: reqwest::Error) -> RpcError {
    debug!(
        event = "rpc_transport_error",
        method,
        status = ?err.status().map(|status| status.as_u16()),
        is_timeout = err.is_timeout(),
        is_connect = err.is_connect(),
        is_decode = err.is_decode(),
        error_chain = %render_error_chain(&err),
        "rpc transport error"
    );

    if let Some(status) = err.status() {
        return map_status(method, status.as_u16());
    }
    // Bodies cut off mid-stream surface as decode errors; retry them like the network.
    if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() || err.is_decode()
    {
        return RpcError::new(RpcErrorKind::Network, method, err.to_string());
    }
    RpcError::new(RpcErrorKind::Other, method, err.to_string())
}

fn render_error_chain(error: &reqwest::Error) -> String {
    let mut parts = vec![error.to_string()];
    let mut source = error.source();
    while let Some(next) = source {
        parts.push(next.to_string());
        source = next.source();
    }
    parts.join(" | caused_by: ")
}

/// Encodes a block number as a JSON-RPC quantity (`0x`-prefixed, no leading zeros).
pub fn to_quantity(value: i64) -> String {
    format!("{value:#x}")
}

/// Decodes a JSON-RPC quantity string into an `i64`.
pub fn parse_quantity(value: &Value) -> Result<i64, String> {
    let raw = value
        .as_str()
        .ok_or_else(|| format!("expected a hex quantity string, got {value}"))?;
    let digits = raw
        .strip_prefix("0x")
        .ok_or_else(|| format!("quantity {raw:?} is missing the 0x prefix"))?;
    if digits.is_empty() {
        return Err(format!("quantity {raw:?} has no digits"));
    }
    i64::from_str_radix(digits, 16).map_err(|err| format!("invalid quantity {raw:?}: {err}"))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;
    use wiremock::matchers::{body_partial_json, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::{
        parse_quantity, rate_limiter, to_quantity, EvmRpcClient, RpcClientConfig, RpcErrorKind,
    };
    use crate::pipeline::types::BlockRange;
    use crate::worker::retry::RetryPolicy;

    fn client(server: &MockServer, max_attempts: u32) -> EvmRpcClient {
        EvmRpcClient::new(
            RpcClientConfig {
                url: server.uri(),
                timeout: Duration::from_secs(2),
                retry_policy: RetryPolicy::immediate(max_attempts),
            },
            rate_limiter(1_000),
        )
        .expect("client")
    }

    fn rpc_result(result: serde_json::Value) -> ResponseTemplate {
        ResponseTemplate::new(200).set_body_json(json!({
            "jsonrpc": "2.0",
            "id": 1,
            "result": result,
        }))
    }

    #[tokio::test]
    async fn block_number_decodes_hex_quantity() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"method": "eth_blockNumber"})))
            .respond_with(rpc_result(json!("0x12d687")))
            .expect(1)
            .mount(&server)
            .await;

        let head = client(&server, 3).block_number().await.expect("head");
        assert_eq!(head, 1_234_567);
    }

    #[tokio::test]
    async fn retries_upstream_errors_then_succeeds() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(rpc_result(json!("0x10")))
            .mount(&server)
            .await;

        let head = client(&server, 5).block_number().await.expect("head");
        assert_eq!(head, 16);
    }

    #[tokio::test]
    async fn exhausted_retries_report_attempts() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429))
            .expect(3)
            .mount(&server)
            .await;

        let err = client(&server, 3).block_number().await.expect_err("rate limited");
        assert_eq!(err.kind, RpcErrorKind::RateLimited);
        assert_eq!(err.attempts, 3);
    }

    #[tokio::test]
    async fn rpc_error_object_is_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "jsonrpc": "2.0",
                "id": 1,
                "error": {"code": -32602, "message": "invalid argument 0"},
            })))
            .expect(1)
            .mount(&server)
            .await;

        let err = client(&server, 5)
            .get_block_receipts(10)
            .await
            .expect_err("invalid params");
        assert_eq!(err.kind, RpcErrorKind::Rpc);
        assert!(!err.is_retryable());
        assert!(err.message.contains("-32602"));
    }

    #[tokio::test]
    async fn null_block_is_retried_as_unavailable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"method": "eth_getBlockByNumber"})))
            .respond_with(rpc_result(json!(null)))
            .expect(2)
            .mount(&server)
            .await;

        let err = client(&server, 2).get_block(99).await.expect_err("missing block");
        assert_eq!(err.kind, RpcErrorKind::UpstreamUnavailable);
        assert_eq!(err.attempts, 2);
    }

    #[tokio::test]
    async fn get_logs_sends_range_filter() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({
                "method": "eth_getLogs",
                "params": [{"fromBlock": "0xa", "toBlock": "0x14", "topics": ["0xddf2"]}],
            })))
            .respond_with(rpc_result(json!([{"logIndex": "0x0"}])))
            .expect(1)
            .mount(&server)
            .await;

        let logs = client(&server, 1)
            .get_logs(BlockRange::new(10, 20), "0xddf2")
            .await
            .expect("logs");
        assert_eq!(logs.len(), 1);
    }

    #[test]
    fn quantity_helpers() {
        assert_eq!(to_quantity(0), "0x0");
        assert_eq!(to_quantity(255), "0xff");
        assert_eq!(parse_quantity(&json!("0xff")), Ok(255));
        assert!(parse_quantity(&json!("ff")).is_err());
        assert!(parse_quantity(&json!("0x")).is_err());
        assert!(parse_quantity(&json!(12)).is_err());
    }
}
