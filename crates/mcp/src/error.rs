//! Error types for the MCP transport layer.

use std::time::Duration;

use serde_json::Value;

use crate::types::JsonRpcError;

/// Errors that can occur during MCP transport and session operations.
///
/// A `Tool` error is a well-formed JSON-RPC error object returned by the
/// server for one call; `Timeout`, `Tool` and the transport-class variants
/// (`Transport`, `Io`, `Http`) are returned to the caller of that request and
/// leave the transport usable. `Handshake` aborts the session setup for one
/// server only.
#[derive(Debug, thiserror::Error)]
pub enum McpError {
    /// The `initialize` exchange failed or returned a malformed result.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// No matching response arrived within the request window.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// Transport-level failure (stream closed, write failed, connect error).
    #[error("transport error: {0}")]
    Transport(String),

    /// Transport I/O error.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Non-2xx HTTP status from a streamable HTTP server. The body text is
    /// kept because it usually explains content-negotiation mismatches.
    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    /// A frame that claims to be JSON-RPC but is structurally invalid, or a
    /// stream that ended without ever producing a response.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// A JSON-RPC error object returned by the server for a specific call.
    #[error("tool error {code}: {message}")]
    Tool {
        code: i64,
        message: String,
        data: Option<Value>,
    },

    /// Failed to serialize or deserialize JSON.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The transport was stopped while the request was outstanding.
    #[error("transport stopped: {0}")]
    Shutdown(String),

    /// Session not initialized: call initialize first.
    #[error("not initialized: call initialize first")]
    NotInitialized,
}

impl McpError {
    /// Wrap a server-returned JSON-RPC error object.
    pub fn from_rpc(err: JsonRpcError) -> Self {
        McpError::Tool {
            code: err.code,
            message: err.message,
            data: err.data,
        }
    }

    /// True for errors that leave the transport usable for further calls.
    pub fn is_call_scoped(&self) -> bool {
        matches!(
            self,
            McpError::Timeout(_) | McpError::Tool { .. } | McpError::Http { .. }
        )
    }
}
