//! Swarm resolution.
//!
//! A user's messages live on a small subset of the snode pool, their
//! swarm. Any snode can be asked `get_swarm` for any user id; a snode that
//! does not consider itself responsible answers 421 and the query moves on
//! to another node. Responses spell snode fields in one of two ways
//! depending on server generation (`ip`/`port`/`x25519`/`ed25519` vs
//! `public_ip`/`storage_port`/`pubkey_x25519`/`pubkey_ed25519`); both are
//! accepted.

use std::time::Duration;

use serde::Deserialize;
use serde_json::{json, Value};

use crate::rpc::{snode_batch_request, RpcCall};
use crate::transport::{FetchError, Transport};

/// One service node. Identity for pool bookkeeping is `(host, port)`.
#[derive(Debug, Clone, Eq)]
pub struct Snode {
    pub host: String,
    pub port: u16,
    pub pubkey_x25519: String,
    pub pubkey_ed25519: String,
}

impl PartialEq for Snode {
    fn eq(&self, other: &Self) -> bool {
        self.host == other.host && self.port == other.port
    }
}

impl std::hash::Hash for Snode {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.host.hash(state);
        self.port.hash(state);
    }
}

impl Snode {
    pub fn storage_url(&self) -> String {
        format!("https://{}:{}/storage_rpc/v1", self.host, self.port)
    }
}

/// The set of snodes holding one user's messages.
#[derive(Debug, Clone, PartialEq)]
pub struct Swarm {
    pub snodes: Vec<Snode>,
}

#[derive(Debug, Clone)]
pub struct SwarmResolveOptions {
    pub max_attempts: usize,
    pub retry_delay: Duration,
}

impl Default for SwarmResolveOptions {
    fn default() -> Self {
        Self { max_attempts: 3, retry_delay: Duration::from_secs(1) }
    }
}

/// Raw snode entry: tolerant of both field spellings.
#[derive(Debug, Deserialize)]
pub(crate) struct RawSnode {
    #[serde(default, alias = "public_ip")]
    ip: Option<String>,
    #[serde(default, alias = "storage_port")]
    port: Option<Value>,
    #[serde(default, alias = "pubkey_x25519")]
    x25519: Option<String>,
    #[serde(default, alias = "pubkey_ed25519")]
    ed25519: Option<String>,
}

impl RawSnode {
    pub(crate) fn into_snode(self) -> Option<Snode> {
        let host = self.ip.filter(|ip| !ip.is_empty() && ip != "0.0.0.0")?;
        let port = match self.port? {
            Value::Number(n) => u16::try_from(n.as_u64()?).ok()?,
            Value::String(s) => s.parse().ok()?,
            _ => return None,
        };
        Some(Snode {
            host,
            port,
            pubkey_x25519: self.x25519.unwrap_or_default(),
            pubkey_ed25519: self.ed25519.unwrap_or_default(),
        })
    }
}

/// Resolve the swarms responsible for `session_id`.
///
/// Draws snodes from `pool` at random without replacement so a failing or
/// 421-answering node is not asked twice within one resolution.
pub async fn fetch_swarms_for(
    transport: &dyn Transport,
    pool: &[Snode],
    session_id: &str,
    options: &SwarmResolveOptions,
) -> Result<Vec<Swarm>, FetchError> {
    if pool.is_empty() {
        return Err(FetchError::Snode("no snodes available".into()));
    }

    let mut available: Vec<Snode> = pool.to_vec();
    let mut last_error: Option<FetchError> = None;

    for attempt in 0..options.max_attempts {
        let Some(snode) = pick_random(&mut available) else {
            log::warn!("ran out of snodes to try for swarm fetch");
            break;
        };

        match query_one(transport, &snode, session_id).await {
            Ok(swarm) => return Ok(vec![swarm]),
            Err(error) => {
                log::warn!(
                    "attempt {}/{} to fetch swarm from {} failed: {error}",
                    attempt + 1,
                    options.max_attempts,
                    snode.host,
                );
                last_error = Some(error);
                tokio::time::sleep(options.retry_delay).await;
            }
        }
    }

    let last = last_error.map(|e| e.to_string()).unwrap_or_else(|| "no attempts".into());
    Err(FetchError::Snode(format!(
        "failed to fetch swarms after {} attempts; last error: {last}",
        options.max_attempts
    )))
}

async fn query_one(
    transport: &dyn Transport,
    snode: &Snode,
    session_id: &str,
) -> Result<Swarm, FetchError> {
    let calls = [RpcCall::new("get_swarm", json!({ "pubkey": session_id }))];
    let results = snode_batch_request(transport, &snode.storage_url(), &calls).await?;

    let first = results
        .into_iter()
        .next()
        .ok_or_else(|| FetchError::Snode("empty batch response".into()))?;

    let raw_snodes = first
        .body
        .as_ref()
        .and_then(|body| body.get("snodes"))
        .and_then(|snodes| {
            serde_json::from_value::<Vec<RawSnode>>(snodes.clone()).ok()
        })
        .unwrap_or_default();

    let snodes: Vec<Snode> = raw_snodes
        .into_iter()
        .filter_map(RawSnode::into_snode)
        .collect();

    if snodes.is_empty() {
        if first.code == Some(421) {
            return Err(FetchError::Snode(
                "421: snode is not responsible for this pubkey, retrying elsewhere".into(),
            ));
        }
        return Err(FetchError::Snode("no snodes found in batch response".into()));
    }
    Ok(Swarm { snodes })
}

/// Remove and return a uniformly random element.
pub(crate) fn pick_random<T>(items: &mut Vec<T>) -> Option<T> {
    use rand::Rng;
    if items.is_empty() {
        return None;
    }
    let index = rand::thread_rng().gen_range(0..items.len());
    Some(items.swap_remove(index))
}
