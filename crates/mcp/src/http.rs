//! Streamable HTTP transport.
//!
//! Each request is one POST carrying a JSON-RPC body. The `Accept` header
//! admits both a single JSON document and an event stream; the server picks
//! the shape per response. A server-assigned `Mcp-Session-Id` is captured
//! from the first response that carries it and echoed on every later request
//! for the lifetime of this transport.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header;
use serde_json::Value;
use tracing::{debug, warn};

use crate::correlator::DEFAULT_REQUEST_TIMEOUT;
use crate::error::McpError;
use crate::framing::{self, Decoded, Frame};
use crate::transport::{Transport, TransportState};
use crate::types::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, RpcId};

/// Header used by servers to assign and recognize a session.
pub const SESSION_HEADER: &str = "Mcp-Session-Id";

/// Sentinel event payload that terminates an event stream.
pub const SSE_DONE: &str = "[DONE]";

const ACCEPT_BOTH: &str = "application/json, text/event-stream";

/// Supplies the `Authorization` header value for servers that require auth.
///
/// Token acquisition lives outside this crate; the transport only attaches
/// whatever the provider hands it.
#[async_trait]
pub trait AuthProvider: Send + Sync {
    async fn authorization(&self) -> Result<String, McpError>;
}

// ── SSE assembly ────────────────────────────────────────────────────

/// Accumulates partial text from a streamed response and keeps the last
/// JSON-RPC response seen.
///
/// Network reads may split an event at any byte boundary, so complete lines
/// are only processed once their newline has arrived. Malformed event
/// payloads are skipped with a warning; they never fail the call.
pub struct SseBuffer {
    partial: String,
    last: Option<JsonRpcResponse>,
    done: bool,
}

impl SseBuffer {
    pub fn new() -> Self {
        Self {
            partial: String::new(),
            last: None,
            done: false,
        }
    }

    /// Feed one chunk of response bytes.
    pub fn push(&mut self, chunk: &[u8]) {
        self.partial.push_str(&String::from_utf8_lossy(chunk));
        while let Some(newline) = self.partial.find('\n') {
            let line = self.partial[..newline].trim_end_matches('\r').to_string();
            self.partial = self.partial[newline + 1..].to_string();
            self.process_line(&line);
            if self.done {
                break;
            }
        }
    }

    fn process_line(&mut self, line: &str) {
        // SSE framing: only `data:` fields carry payloads; comments and
        // event/id/retry fields are ignored.
        let Some(payload) = line.strip_prefix("data:") else {
            return;
        };
        let payload = payload.strip_prefix(' ').unwrap_or(payload);

        if payload == SSE_DONE {
            self.done = true;
            return;
        }

        match framing::decode_line(payload) {
            Ok(Decoded::Frame(Frame::Response(response))) => {
                self.last = Some(response);
            }
            Ok(Decoded::Frame(Frame::Notification(n))) => {
                debug!(method = %n.method, "notification event in stream");
            }
            Ok(Decoded::Frame(Frame::Request(_))) | Ok(Decoded::NotProtocol) => {
                warn!(payload = %payload, "skipping malformed event payload");
            }
            Err(e) => {
                warn!(error = %e, "skipping invalid event payload");
            }
        }
    }

    /// True once the sentinel terminator has been seen.
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// The last well-formed JSON-RPC response observed, if any.
    pub fn into_response(self) -> Option<JsonRpcResponse> {
        self.last
    }
}

impl Default for SseBuffer {
    fn default() -> Self {
        Self::new()
    }
}

// ── Transport ───────────────────────────────────────────────────────

/// Configuration for one streamable HTTP server.
#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub name: String,
    pub url: String,
    pub request_timeout: Duration,
    pub connect_timeout: Duration,
}

impl HttpConfig {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            connect_timeout: Duration::from_secs(5),
        }
    }
}

/// Transport issuing JSON-RPC over POST with optional SSE responses.
pub struct HttpTransport {
    name: String,
    client: reqwest::Client,
    url: String,
    session: Mutex<Option<String>>,
    next_id: std::sync::atomic::AtomicI64,
    auth: Option<Arc<dyn AuthProvider>>,
    request_timeout: Duration,
    stopped: AtomicBool,
}

impl HttpTransport {
    pub fn new(
        config: HttpConfig,
        auth: Option<Arc<dyn AuthProvider>>,
    ) -> Result<Arc<Self>, McpError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .connect_timeout(config.connect_timeout)
            .tcp_nodelay(true)
            .build()
            .map_err(|e| McpError::Transport(format!("failed to build HTTP client: {}", e)))?;

        Ok(Arc::new(Self {
            name: config.name,
            client,
            url: config.url,
            session: Mutex::new(None),
            next_id: std::sync::atomic::AtomicI64::new(1),
            auth,
            request_timeout: config.request_timeout,
            stopped: AtomicBool::new(false),
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The captured session token, if the server has assigned one.
    pub fn session_id(&self) -> Option<String> {
        self.session.lock().unwrap().clone()
    }

    /// Store a server-assigned session token. A response without the header
    /// never clears a previously stored token.
    fn absorb_session(&self, headers: &reqwest::header::HeaderMap) {
        if let Some(value) = headers.get(SESSION_HEADER).and_then(|v| v.to_str().ok()) {
            let mut session = self.session.lock().unwrap();
            if session.as_deref() != Some(value) {
                debug!(server = %self.name, "captured session id");
                *session = Some(value.to_string());
            }
        }
    }

    async fn post_body<T: serde::Serialize>(
        &self,
        body: &T,
    ) -> Result<reqwest::Response, McpError> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(McpError::Shutdown(format!(
                "transport for '{}' is stopped",
                self.name
            )));
        }

        let mut builder = self
            .client
            .post(&self.url)
            .header(header::ACCEPT, ACCEPT_BOTH)
            .json(body);

        if let Some(session) = self.session_id() {
            builder = builder.header(SESSION_HEADER, session);
        }
        if let Some(auth) = &self.auth {
            builder = builder.header(header::AUTHORIZATION, auth.authorization().await?);
        }

        let response = builder.send().await.map_err(|e| self.classify(e))?;

        // Session capture happens before the status check so a token assigned
        // alongside an error response is not lost.
        self.absorb_session(response.headers());

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(server = %self.name, status = %status, "server returned error status");
            return Err(McpError::Http {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }

    fn classify(&self, error: reqwest::Error) -> McpError {
        if error.is_timeout() {
            McpError::Timeout(self.request_timeout)
        } else if error.is_connect() {
            McpError::Transport(format!("connection to '{}' failed: {}", self.url, error))
        } else {
            McpError::Transport(error.to_string())
        }
    }

    /// Read an event-stream response to completion and return the final
    /// JSON-RPC response, or an explicit error when none was observed.
    async fn read_event_stream(
        &self,
        response: reqwest::Response,
    ) -> Result<JsonRpcResponse, McpError> {
        let mut buffer = SseBuffer::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk =
                chunk.map_err(|e| McpError::Transport(format!("stream read failed: {}", e)))?;
            buffer.push(&chunk);
            if buffer.is_done() {
                break;
            }
        }
        buffer.into_response().ok_or_else(|| {
            McpError::Protocol("event stream ended without a JSON-RPC response".to_string())
        })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, McpError> {
        let id = RpcId::Number(self.next_id.fetch_add(1, Ordering::Relaxed));
        let request = JsonRpcRequest::new(id.clone(), method, params);
        debug!(server = %self.name, method = %method, id = %id, "sending request");

        let response = self.post_body(&request).await?;

        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();

        let rpc = if content_type.starts_with("text/event-stream") {
            self.read_event_stream(response).await?
        } else {
            let text = response
                .text()
                .await
                .map_err(|e| McpError::Transport(format!("failed to read body: {}", e)))?;
            serde_json::from_str::<JsonRpcResponse>(&text)
                .map_err(|e| McpError::Protocol(format!("malformed JSON response: {}", e)))?
        };

        if rpc.id != id {
            warn!(server = %self.name, sent = %id, got = %rpc.id, "response id mismatch");
        }
        if let Some(err) = rpc.error {
            return Err(McpError::from_rpc(err));
        }
        Ok(rpc.result.unwrap_or(Value::Null))
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), McpError> {
        let notification = JsonRpcNotification::new(method, params);
        debug!(server = %self.name, method = %method, "sending notification");
        // Servers typically answer notifications with 202 and an empty body;
        // only the status and session header matter here.
        let _ = self.post_body(&notification).await?;
        Ok(())
    }

    async fn stop(&self) -> Result<(), McpError> {
        self.stopped.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn state(&self) -> TransportState {
        if self.stopped.load(Ordering::SeqCst) {
            TransportState::Stopped
        } else {
            TransportState::Ready
        }
    }
}
