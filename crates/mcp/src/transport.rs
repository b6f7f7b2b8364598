//! Transport abstraction shared by the process and streamable HTTP backends.
//!
//! One transport instance serves one server. Implementations handle the wire
//! mechanics (framing, correlation, session headers); callers interact with
//! the request/notify surface and never hold transport internals.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::McpError;
use crate::session::ServerConnection;

/// Transport lifecycle states.
///
/// Process transports walk `NotStarted → Starting → Ready → Stopped`, with
/// `Starting → Failed` on spawn errors and `Ready → Failed` when the server
/// desynchronizes. HTTP transports are stateless per request and go straight
/// to `Ready`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    NotStarted,
    Starting,
    Ready,
    Failed,
    Stopped,
}

impl std::fmt::Display for TransportState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotStarted => write!(f, "not_started"),
            Self::Starting => write!(f, "starting"),
            Self::Ready => write!(f, "ready"),
            Self::Failed => write!(f, "failed"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// Readiness oracle for process-based servers.
///
/// Different servers signal readiness differently, so the heuristic is chosen
/// per server rather than hard-coded: a structured frame, a known output
/// substring, or simply going quiet after startup chatter. A well-formed
/// protocol frame always counts as ready regardless of the chosen variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadyWhen {
    /// Ready on the first well-formed protocol frame (default).
    FirstFrame,
    /// Ready when any stdout/stderr line contains this substring.
    OutputContains(String),
    /// Ready once no output has been seen for this long.
    QuietFor(Duration),
}

impl Default for ReadyWhen {
    fn default() -> Self {
        ReadyWhen::FirstFrame
    }
}

/// Carries framed messages to and from one server.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a request and await the correlated result value.
    async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, McpError>;

    /// Send a notification (no response expected).
    async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), McpError>;

    /// Stop the transport, rejecting outstanding requests. Idempotent.
    async fn stop(&self) -> Result<(), McpError>;

    /// Current lifecycle state.
    fn state(&self) -> TransportState;
}

/// Lookup capability for resolving a live server connection by name.
///
/// The registry implements this; components that need to reach servers depend
/// on the trait instead of on the registry type, keeping the dependency
/// direction one-way.
pub trait ServerLookup: Send + Sync {
    fn lookup(&self, name: &str) -> Option<Arc<ServerConnection>>;
}
