//! Server registry and startup supervision for MCP servers.
//!
//! This crate owns the configuration and lifecycle side of the bridge:
//!
//! - **config**: `servers.toml` descriptors with timing and startup sections
//! - **supervisor**: the startup fallback ladder for process-based servers
//! - **registry**: one handle per server, start/stop/get with failure
//!   isolation between servers
//!
//! The transport and session mechanics live in `toolbridge-mcp`; this crate
//! wires descriptors to transports and keeps one [`ServerHandle`] per name.

pub mod config;
pub mod registry;
pub mod supervisor;

pub use config::{
    BridgeConfig, ConfigError, ServerDescriptor, StartupConfig, TimingConfig, TransportKind,
};
pub use registry::{RegistryError, ServerHandle, ServerRegistry, StopFailure};
pub use supervisor::{start_process_server, StartupError, StartupOptions, StartupOutcome};
