//! Network transport abstraction.
//!
//! Everything that leaves the process goes through the [`Transport`]
//! trait, so the discovery, swarm and polling layers can be exercised
//! against a scripted transport in tests. Two implementations ship:
//! HTTP(S) over reqwest and a websocket client.
//!
//! Snode endpoints use self-signed certificates; their Ed25519 identity is
//! the actual trust root, so certificate validation is deliberately
//! disabled on the HTTP client.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::Message;

/// Wall-clock budget for a single request.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("snode error: {0}")]
    Snode(String),
    #[error("request timed out")]
    Timeout,
    #[error("{0}")]
    Unknown(String),
}

#[derive(Debug, Clone)]
pub enum RequestBody {
    Json(serde_json::Value),
    Bytes(Vec<u8>),
}

#[derive(Debug, Clone)]
pub struct Request {
    pub method: String,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<RequestBody>,
    /// Overrides [`DEFAULT_TIMEOUT`] when set.
    pub timeout: Option<Duration>,
}

impl Request {
    pub fn get(url: impl Into<String>) -> Self {
        Self::new("GET", url)
    }

    pub fn head(url: impl Into<String>) -> Self {
        Self::new("HEAD", url)
    }

    pub fn post_json(url: impl Into<String>, body: serde_json::Value) -> Self {
        let mut request = Self::new("POST", url);
        request.body = Some(RequestBody::Json(body));
        request
    }

    fn new(method: &str, url: impl Into<String>) -> Self {
        Self {
            method: method.to_owned(),
            url: url.into(),
            headers: Vec::new(),
            body: None,
            timeout: None,
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_owned(), value.to_owned()));
        self
    }
}

#[derive(Debug, Clone)]
pub struct Response {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl Response {
    pub fn is_ok(&self) -> bool {
        self.status == 200
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, FetchError> {
        serde_json::from_slice(&self.body)
            .map_err(|e| FetchError::Unknown(format!("invalid response body: {e}")))
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Request/response transport. `close` must be idempotent.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn request(&self, request: Request) -> Result<Response, FetchError>;
    async fn close(&self);
}

// ─── HTTP ────────────────────────────────────────────────────────────────────

pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new() -> Result<Self, FetchError> {
        Self::with_proxy(None)
    }

    pub fn with_proxy(proxy: Option<&str>) -> Result<Self, FetchError> {
        let mut builder = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .timeout(DEFAULT_TIMEOUT);
        if let Some(proxy) = proxy {
            builder = builder.proxy(
                reqwest::Proxy::all(proxy)
                    .map_err(|e| FetchError::Unknown(format!("invalid proxy: {e}")))?,
            );
        }
        let client = builder
            .build()
            .map_err(|e| FetchError::Unknown(format!("http client: {e}")))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn request(&self, request: Request) -> Result<Response, FetchError> {
        let method = reqwest::Method::from_bytes(request.method.as_bytes())
            .map_err(|e| FetchError::Unknown(format!("bad method: {e}")))?;
        let mut builder = self.client.request(method, &request.url);
        if let Some(timeout) = request.timeout {
            builder = builder.timeout(timeout);
        }
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        match request.body {
            Some(RequestBody::Json(value)) => builder = builder.json(&value),
            Some(RequestBody::Bytes(bytes)) => builder = builder.body(bytes),
            None => {}
        }

        let response = builder.send().await.map_err(map_reqwest_error)?;
        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .map(|(k, v)| {
                (k.as_str().to_owned(), v.to_str().unwrap_or_default().to_owned())
            })
            .collect();
        let body = response.bytes().await.map_err(map_reqwest_error)?.to_vec();
        Ok(Response { status, headers, body })
    }

    async fn close(&self) {
        // reqwest pools close with the client; nothing to do
    }
}

fn map_reqwest_error(error: reqwest::Error) -> FetchError {
    if error.is_timeout() {
        FetchError::Timeout
    } else if error.is_connect() || error.is_request() {
        FetchError::Snode(error.to_string())
    } else {
        FetchError::Unknown(error.to_string())
    }
}

// ─── WebSocket ───────────────────────────────────────────────────────────────

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// JSON request/response over a single websocket connection.
///
/// Connects lazily on the first request; `close` drops the connection and
/// is a no-op when never connected.
pub struct WsTransport {
    url: String,
    stream: Mutex<Option<WsStream>>,
}

impl WsTransport {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into(), stream: Mutex::new(None) }
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn request(&self, request: Request) -> Result<Response, FetchError> {
        let mut guard = self.stream.lock().await;
        if guard.is_none() {
            let (stream, _) = tokio_tungstenite::connect_async(&self.url)
                .await
                .map_err(|e| FetchError::Snode(format!("websocket connect: {e}")))?;
            *guard = Some(stream);
        }
        let stream = guard.as_mut().expect("connected above");

        let payload = match request.body {
            Some(RequestBody::Json(value)) => value.to_string(),
            Some(RequestBody::Bytes(bytes)) => String::from_utf8_lossy(&bytes).into_owned(),
            None => String::new(),
        };
        stream
            .send(Message::Text(payload))
            .await
            .map_err(|e| FetchError::Snode(format!("websocket send: {e}")))?;

        let timeout = request.timeout.unwrap_or(DEFAULT_TIMEOUT);
        let reply = tokio::time::timeout(timeout, stream.next())
            .await
            .map_err(|_| FetchError::Timeout)?;
        match reply {
            Some(Ok(message)) => Ok(Response {
                status: 200,
                headers: HashMap::new(),
                body: message.into_data(),
            }),
            Some(Err(e)) => Err(FetchError::Snode(format!("websocket receive: {e}"))),
            None => Err(FetchError::Snode("websocket closed".into())),
        }
    }

    async fn close(&self) {
        let mut guard = self.stream.lock().await;
        if let Some(mut stream) = guard.take() {
            let _ = stream.close(None).await;
        }
    }
}

// ─── Test double ─────────────────────────────────────────────────────────────


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_builders() {
        let req = Request::post_json("https://example.org/rpc", serde_json::json!({"a": 1}))
            .with_header("User-Agent", "WhatsApp");
        assert_eq!(req.method, "POST");
        assert!(matches!(req.body, Some(RequestBody::Json(_))));
        assert_eq!(req.headers[0].1, "WhatsApp");
    }

    #[test]
    fn response_header_lookup_is_case_insensitive() {
        let mut headers = HashMap::new();
        headers.insert("Date".to_owned(), "Thu, 01 Jan 1970 00:00:00 GMT".to_owned());
        let resp = Response { status: 200, headers, body: Vec::new() };
        assert!(resp.header("date").is_some());
        assert!(resp.header("DATE").is_some());
        assert!(resp.header("etag").is_none());
    }

    #[tokio::test]
    async fn mock_transport_scripts_in_order() {
        use testing::MockTransport;
        let mock = MockTransport::new(vec![
            Err(FetchError::Timeout),
            Ok(MockTransport::json_response(200, serde_json::json!({"ok": true}))),
        ]);
        assert!(matches!(
            mock.request(Request::get("http://a")).await,
            Err(FetchError::Timeout)
        ));
        let second = mock.request(Request::get("http://b")).await.unwrap();
        assert!(second.is_ok());
        assert_eq!(mock.request_count(), 2);
    }
}
