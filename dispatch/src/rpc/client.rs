/// JSON-RPC client for a single endpoint.
///
/// Intentionally thin: timeouts and envelope handling live here, while
/// health accounting, throttling and failover live in the manager so every
/// caller shares one view of endpoint state.
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Buf;
use hyper::{Method, Request};
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::error::DispatchError;
use crate::metrics::prometheus as metrics;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    pub jsonrpc: String,
    pub id: u64,
    pub method: String,
    pub params: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcResponse {
    pub jsonrpc: String,
    pub id: u64,
    pub result: Option<Value>,
    pub error: Option<Value>,
}

pub struct RpcClient {
    url: String,
    timeout: Duration,
    http: Client<HttpConnector, Full<Bytes>>,
    next_id: AtomicU64,
}

impl RpcClient {
    pub fn new(url: String, timeout: Duration) -> Self {
        let http = Client::builder(hyper_util::rt::TokioExecutor::new()).build_http();
        Self {
            url,
            timeout,
            http,
            next_id: AtomicU64::new(1),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub async fn call(&self, method: &str, params: Value) -> Result<Value, DispatchError> {
        metrics::inc_rpc_requests();

        let res = self.call_inner(method, params).await;
        if res.is_err() {
            metrics::inc_rpc_errors();
        }
        res
    }

    async fn call_inner(&self, method: &str, params: Value) -> Result<Value, DispatchError> {
        let payload = RpcRequest {
            jsonrpc: "2.0".to_string(),
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            method: method.to_string(),
            params,
        };

        let body_bytes = serde_json::to_vec(&payload)
            .map_err(|e| DispatchError::Rpc(format!("request encode failed: {}", e)))?;
        let req = Request::builder()
            .method(Method::POST)
            .uri(&self.url)
            .header("Content-Type", "application/json")
            .body(Full::new(Bytes::from(body_bytes)))
            .map_err(|e| DispatchError::Rpc(format!("request build failed: {}", e)))?;

        let response = tokio::time::timeout(self.timeout, self.http.request(req))
            .await
            .map_err(|_| DispatchError::Rpc(format!("{}: request timed out", self.url)))?
            .map_err(|e| DispatchError::Rpc(format!("{}: connection failed: {}", self.url, e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(DispatchError::Rpc(format!("{}: HTTP {}", self.url, status)));
        }

        let body_bytes = response
            .into_body()
            .collect()
            .await
            .map_err(|e| DispatchError::Rpc(format!("{}: body read failed: {}", self.url, e)))?
            .to_bytes();
        let rpc_response: RpcResponse = serde_json::from_reader(body_bytes.reader())
            .map_err(|e| DispatchError::Rpc(format!("{}: malformed response: {}", self.url, e)))?;

        if let Some(error) = rpc_response.error {
            let message = error
                .get("message")
                .and_then(|m| m.as_str())
                .unwrap_or("unknown error")
                .to_string();
            tracing::debug!("RPC error from {}: {}", self.url, message);
            // The endpoint itself is fine; this must not count against its
            // health the way a transport failure does.
            return Err(DispatchError::Node(message));
        }

        Ok(rpc_response.result.unwrap_or(Value::Null))
    }

    pub async fn block_number(&self) -> Result<u64, DispatchError> {
        let v = self.call("eth_blockNumber", json!([])).await?;
        parse_quantity(&v)
    }

    pub async fn chain_id(&self) -> Result<u64, DispatchError> {
        let v = self.call("eth_chainId", json!([])).await?;
        parse_quantity(&v)
    }

    /// Network-side pending nonce, the authority NonceManager resyncs from.
    pub async fn pending_nonce(&self, address: &str) -> Result<u64, DispatchError> {
        let v = self
            .call("eth_getTransactionCount", json!([address, "pending"]))
            .await?;
        parse_quantity(&v)
    }

    pub async fn send_raw_transaction(&self, payload: &str) -> Result<String, DispatchError> {
        let v = self.call("eth_sendRawTransaction", json!([payload])).await?;
        v.as_str()
            .map(str::to_string)
            .ok_or_else(|| DispatchError::Rpc("sendRawTransaction returned no hash".to_string()))
    }

    /// `None` until the transaction is included in a block.
    pub async fn transaction_receipt(&self, hash: &str) -> Result<Option<Value>, DispatchError> {
        let v = self.call("eth_getTransactionReceipt", json!([hash])).await?;
        if v.is_null() {
            Ok(None)
        } else {
            Ok(Some(v))
        }
    }
}

/// JSON-RPC quantities arrive as 0x-prefixed hex strings; some legacy nodes
/// send bare numbers.
pub fn parse_quantity(v: &Value) -> Result<u64, DispatchError> {
    if let Some(n) = v.as_u64() {
        return Ok(n);
    }
    let s = v
        .as_str()
        .ok_or_else(|| DispatchError::Rpc(format!("expected quantity, got {}", v)))?;
    let hex = s.strip_prefix("0x").unwrap_or(s);
    u64::from_str_radix(hex, 16)
        .map_err(|e| DispatchError::Rpc(format!("bad quantity {:?}: {}", s, e)))
}

/// Receipt status field: 0x1 success, 0x0 reverted.
pub fn receipt_succeeded(receipt: &Value) -> bool {
    receipt
        .get("status")
        .and_then(|s| parse_quantity(s).ok())
        .map(|n| n == 1)
        .unwrap_or(true)
}
