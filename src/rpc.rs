//! JSON-RPC shapes for talking to storage servers.
//!
//! Snodes accept either a single `{method, params}` object or a JSON-RPC
//! 2.0 `batch` carrying several sub-requests; batch responses come back as
//! `{results: [{code, body}, …]}` in sub-request order.

use serde::Deserialize;
use serde_json::{json, Value};

use crate::transport::{FetchError, Request, Transport};

/// One RPC call, standalone or inside a batch.
#[derive(Debug, Clone)]
pub struct RpcCall {
    pub method: &'static str,
    pub params: Value,
}

impl RpcCall {
    pub fn new(method: &'static str, params: Value) -> Self {
        Self { method, params }
    }

    fn to_value(&self) -> Value {
        json!({ "method": self.method, "params": self.params })
    }
}

/// One entry of a batch response.
#[derive(Debug, Clone, Deserialize)]
pub struct BatchEntry {
    #[serde(default)]
    pub code: Option<i64>,
    #[serde(default)]
    pub body: Option<Value>,
}

impl BatchEntry {
    pub fn is_ok(&self) -> bool {
        self.code == Some(200)
    }
}

#[derive(Deserialize)]
struct BatchResponse {
    #[serde(default)]
    results: Vec<BatchEntry>,
}

/// A message as returned by a snode `retrieve`.
#[derive(Debug, Clone, Deserialize)]
pub struct StoredMessage {
    pub hash: String,
    /// Base64 of the wrapped envelope.
    pub data: String,
    #[serde(default)]
    pub pubkey: Option<String>,
    #[serde(default)]
    pub timestamp: Option<u64>,
    #[serde(default)]
    pub expiration: Option<u64>,
}

fn snode_request(url: &str, body: Value) -> Request {
    Request::post_json(url, body)
        .with_header("User-Agent", "WhatsApp")
        .with_header("Accept-Language", "en-us")
}

/// Send a JSON-RPC 2.0 batch to a snode and return the per-subrequest
/// results in order.
pub async fn snode_batch_request(
    transport: &dyn Transport,
    url: &str,
    subrequests: &[RpcCall],
) -> Result<Vec<BatchEntry>, FetchError> {
    let body = json!({
        "jsonrpc": "2.0",
        "method": "batch",
        "params": {
            "requests": subrequests.iter().map(RpcCall::to_value).collect::<Vec<_>>(),
        },
    });
    log::debug!("batch request to {url}: {} subrequests", subrequests.len());

    let response = transport.request(snode_request(url, body)).await?;
    if !response.is_ok() {
        return Err(FetchError::Snode(format!(
            "batch request to {url} failed with status {}",
            response.status
        )));
    }
    let parsed: BatchResponse = response.json()?;
    Ok(parsed.results)
}

/// Send a single `{method, params}` RPC to a snode.
pub async fn snode_single_request(
    transport: &dyn Transport,
    url: &str,
    call: &RpcCall,
) -> Result<crate::transport::Response, FetchError> {
    transport.request(snode_request(url, call.to_value())).await
}
