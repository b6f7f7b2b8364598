//! MCP (Model Context Protocol) transport and session layer.
//!
//! This crate carries JSON-RPC 2.0 traffic between a host application and
//! independently-running MCP servers, over either a spawned child process's
//! standard streams or a streamable HTTP endpoint.
//!
//! # Architecture
//!
//! - **types**: JSON-RPC 2.0 and MCP-specific protocol types
//! - **framing**: tolerant line codec separating frames from log output
//! - **correlator**: id allocation and response matching with timeouts
//! - **transport**: the `Transport` trait, lifecycle states, readiness oracle
//! - **process**: newline-delimited JSON over piped child-process stdio
//! - **http**: POST with JSON or Server-Sent-Events responses
//! - **session**: the initialize handshake and per-server client surface
//! - **error**: unified error types
//!
//! # Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use toolbridge_mcp::process::{ProcessConfig, ProcessTransport};
//! use toolbridge_mcp::session::ServerConnection;
//! use toolbridge_mcp::transport::Transport;
//!
//! # async fn example() -> Result<(), toolbridge_mcp::McpError> {
//! let transport = ProcessTransport::spawn(ProcessConfig::new("graph", "graph-mcp")).await?;
//! transport.wait_ready(std::time::Duration::from_secs(10)).await;
//! let transport: Arc<dyn Transport> = transport;
//! let connection = ServerConnection::establish("graph", transport).await?;
//! let tools = connection.list_tools().await?;
//! # Ok(())
//! # }
//! ```

pub mod correlator;
pub mod error;
pub mod framing;
pub mod http;
pub mod process;
pub mod session;
pub mod transport;
pub mod types;

pub use correlator::{Correlator, DEFAULT_REQUEST_TIMEOUT};
pub use error::McpError;
pub use framing::{Decoded, Frame};
pub use http::{AuthProvider, HttpConfig, HttpTransport, SseBuffer, SESSION_HEADER};
pub use process::{ProcessConfig, ProcessTransport};
pub use session::{ServerConnection, Session, CLIENT_NAME};
pub use transport::{ReadyWhen, ServerLookup, Transport, TransportState};
pub use types::*;
