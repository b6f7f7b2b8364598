//! MCP session establishment and the per-server client surface.
//!
//! A session is created once per transport by running the `initialize`
//! exchange and sending `notifications/initialized`. Only a connection that
//! completed the handshake exposes the tool and resource operations, so the
//! "initialized before any tool call" invariant holds by construction.

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, info};

use crate::error::McpError;
use crate::transport::Transport;
use crate::types::{
    CallToolParams, CallToolResult, ClientCapabilities, ClientInfo, InitializeParams,
    InitializeResult, ListResourcesResult, ListToolsResult, ReadResourceParams,
    ReadResourceResult, ResourceInfo, ServerCapabilities, ServerInfo, ToolInfo,
    PROTOCOL_VERSION,
};

/// Client name reported in the `initialize` handshake.
pub const CLIENT_NAME: &str = "toolbridge";

/// Negotiated state for one server, fixed after the handshake.
#[derive(Debug, Clone)]
pub struct Session {
    pub protocol_version: String,
    pub capabilities: ServerCapabilities,
    pub server_info: ServerInfo,
    initialized: bool,
}

impl Session {
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }
}

/// A live server: transport plus completed session.
///
/// `establish` is the only place that runs `initialize`; the registry's
/// per-server start lock serializes it, so a transport never has two
/// handshakes in flight.
pub struct ServerConnection {
    name: String,
    transport: Arc<dyn Transport>,
    session: Session,
}

impl std::fmt::Debug for ServerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConnection")
            .field("name", &self.name)
            .field("session", &self.session)
            .finish_non_exhaustive()
    }
}

impl ServerConnection {
    /// Run the initialize exchange over `transport` and build the connection.
    pub async fn establish(
        name: impl Into<String>,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, McpError> {
        let name = name.into();
        let params = InitializeParams {
            protocol_version: PROTOCOL_VERSION.to_string(),
            capabilities: ClientCapabilities::default(),
            client_info: ClientInfo {
                name: CLIENT_NAME.to_string(),
                version: Some(env!("CARGO_PKG_VERSION").to_string()),
            },
        };

        let value = transport
            .request("initialize", Some(serde_json::to_value(&params)?))
            .await
            .map_err(|e| match e {
                McpError::Tool { code, message, .. } => McpError::Handshake(format!(
                    "server rejected initialize ({}): {}",
                    code, message
                )),
                other => other,
            })?;

        let result: InitializeResult = serde_json::from_value(value)
            .map_err(|e| McpError::Handshake(format!("malformed initialize result: {}", e)))?;

        transport.notify("notifications/initialized", None).await?;

        info!(
            server = %name,
            protocol = %result.protocol_version,
            server_name = %result.server_info.name,
            "session established"
        );

        Ok(Self {
            name,
            transport,
            session: Session {
                protocol_version: result.protocol_version,
                capabilities: result.capabilities,
                server_info: result.server_info,
                initialized: true,
            },
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    fn ensure_initialized(&self) -> Result<(), McpError> {
        if self.session.initialized {
            Ok(())
        } else {
            Err(McpError::NotInitialized)
        }
    }

    /// List the tools the server exposes.
    pub async fn list_tools(&self) -> Result<Vec<ToolInfo>, McpError> {
        self.ensure_initialized()?;
        let value = self.transport.request("tools/list", None).await?;
        let result: ListToolsResult = serde_json::from_value(value)?;
        debug!(server = %self.name, count = result.tools.len(), "listed tools");
        Ok(result.tools)
    }

    /// Invoke a tool by name.
    pub async fn call_tool(
        &self,
        tool: &str,
        arguments: Value,
    ) -> Result<CallToolResult, McpError> {
        self.ensure_initialized()?;
        let params = CallToolParams {
            name: tool.to_string(),
            arguments,
        };
        let value = self
            .transport
            .request("tools/call", Some(serde_json::to_value(&params)?))
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    /// List the resources the server exposes.
    pub async fn list_resources(&self) -> Result<Vec<ResourceInfo>, McpError> {
        self.ensure_initialized()?;
        let value = self.transport.request("resources/list", None).await?;
        let result: ListResourcesResult = serde_json::from_value(value)?;
        Ok(result.resources)
    }

    /// Read one resource by URI.
    pub async fn read_resource(&self, uri: &str) -> Result<ReadResourceResult, McpError> {
        self.ensure_initialized()?;
        let params = ReadResourceParams {
            uri: uri.to_string(),
        };
        let value = self
            .transport
            .request("resources/read", Some(serde_json::to_value(&params)?))
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Stop the underlying transport.
    pub async fn stop(&self) -> Result<(), McpError> {
        self.transport.stop().await
    }
}
