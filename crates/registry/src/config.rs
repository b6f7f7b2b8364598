//! Server configuration.
//!
//! Parsed from `servers.toml`: one `[servers.<name>]` table per server plus
//! `[timing]` and `[startup]` sections with defaults. Descriptors are
//! immutable after loading and owned by the registry.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use toolbridge_mcp::http::HttpConfig;
use toolbridge_mcp::process::ProcessConfig;
use toolbridge_mcp::transport::ReadyWhen;

/// Errors raised while loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

// ── Top-level config ────────────────────────────────────────────────

/// Full configuration for the bridge: timing knobs, startup ladder settings,
/// and the set of named servers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BridgeConfig {
    #[serde(default)]
    pub timing: TimingConfig,

    #[serde(default)]
    pub startup: StartupConfig,

    /// Named server descriptors. The table key is the server name.
    #[serde(default)]
    pub servers: HashMap<String, ServerDescriptor>,
}

impl BridgeConfig {
    /// Load and validate a config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml(&text)
    }

    /// Parse and validate config from TOML text.
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let mut config: BridgeConfig = toml::from_str(text)?;
        for (name, descriptor) in config.servers.iter_mut() {
            descriptor.name = name.clone();
            descriptor.validate()?;
        }
        Ok(config)
    }

    /// Descriptors in name order.
    pub fn descriptors(&self) -> Vec<ServerDescriptor> {
        let mut descriptors: Vec<ServerDescriptor> = self.servers.values().cloned().collect();
        descriptors.sort_by(|a, b| a.name.cmp(&b.name));
        descriptors
    }
}

// ── Section configs ─────────────────────────────────────────────────

/// Request timing knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingConfig {
    /// Window each request waits for its response, in seconds.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_request_timeout_secs() -> u64 {
    30
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl TimingConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Startup ladder settings for process-based servers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartupConfig {
    /// Readiness window for each spawn step, in seconds.
    #[serde(default = "default_step_window_secs")]
    pub step_window_secs: u64,

    /// Window for the HTTP health-probe step, in seconds.
    #[serde(default = "default_probe_window_secs")]
    pub probe_window_secs: u64,

    /// Command prefix used to run a published package by name
    /// (e.g. `["npx", "--yes"]`). Empty disables the fallback step.
    #[serde(default = "default_fallback_runner")]
    pub fallback_runner: Vec<String>,
}

fn default_step_window_secs() -> u64 {
    10
}

fn default_probe_window_secs() -> u64 {
    5
}

fn default_fallback_runner() -> Vec<String> {
    vec!["npx".to_string(), "--yes".to_string()]
}

impl Default for StartupConfig {
    fn default() -> Self {
        Self {
            step_window_secs: default_step_window_secs(),
            probe_window_secs: default_probe_window_secs(),
            fallback_runner: default_fallback_runner(),
        }
    }
}

impl StartupConfig {
    pub fn step_window(&self) -> Duration {
        Duration::from_secs(self.step_window_secs)
    }

    pub fn probe_window(&self) -> Duration {
        Duration::from_secs(self.probe_window_secs)
    }
}

// ── Server descriptors ──────────────────────────────────────────────

/// How the server is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Process,
    Http,
}

/// One configured server. Immutable after loading.
///
/// Process servers use `command`/`args`/`env` (plus the optional fallback and
/// readiness fields); http servers use `url`/`requires_auth`. The `env`
/// overlay may carry tenant ids and credentials, so its values are excluded
/// from the `Debug` output.
#[derive(Clone, Serialize, Deserialize)]
pub struct ServerDescriptor {
    /// Unique server name, filled from the config table key.
    #[serde(skip)]
    pub name: String,

    pub kind: TransportKind,

    #[serde(default = "default_enabled")]
    pub enabled: bool,

    // Process transport fields.
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Published package name for the package-manager fallback step.
    #[serde(default)]
    pub package: Option<String>,
    /// Output substring that signals readiness.
    #[serde(default)]
    pub ready_pattern: Option<String>,
    /// Treat this many milliseconds of output silence as readiness.
    #[serde(default)]
    pub quiet_ready_ms: Option<u64>,
    /// Local port probed by the health-check fallback step.
    #[serde(default)]
    pub health_port: Option<u16>,

    // HTTP transport fields.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub requires_auth: bool,
}

fn default_enabled() -> bool {
    true
}

impl ServerDescriptor {
    /// Minimal process descriptor, mostly for tests and programmatic setup.
    pub fn process(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: TransportKind::Process,
            enabled: true,
            command: Some(command.into()),
            args: Vec::new(),
            env: HashMap::new(),
            package: None,
            ready_pattern: None,
            quiet_ready_ms: None,
            health_port: None,
            url: None,
            requires_auth: false,
        }
    }

    /// Minimal http descriptor.
    pub fn http(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: TransportKind::Http,
            enabled: true,
            command: None,
            args: Vec::new(),
            env: HashMap::new(),
            package: None,
            ready_pattern: None,
            quiet_ready_ms: None,
            health_port: None,
            url: Some(url.into()),
            requires_auth: false,
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.name.is_empty() {
            return Err(ConfigError::Invalid("server name must not be empty".into()));
        }
        match self.kind {
            TransportKind::Process => {
                match self.command.as_deref() {
                    Some(command) if !command.trim().is_empty() => {}
                    _ => {
                        return Err(ConfigError::Invalid(format!(
                            "process server '{}' requires a non-empty command",
                            self.name
                        )));
                    }
                }
            }
            TransportKind::Http => {
                let Some(url) = self.url.as_deref() else {
                    return Err(ConfigError::Invalid(format!(
                        "http server '{}' requires a url",
                        self.name
                    )));
                };
                let parsed = url::Url::parse(url).map_err(|e| {
                    ConfigError::Invalid(format!("http server '{}' has invalid url: {}", self.name, e))
                })?;
                if !matches!(parsed.scheme(), "http" | "https") {
                    return Err(ConfigError::Invalid(format!(
                        "http server '{}' url must use http or https",
                        self.name
                    )));
                }
            }
        }
        Ok(())
    }

    /// The readiness oracle selected for this server.
    pub fn ready_when(&self) -> ReadyWhen {
        if let Some(pattern) = &self.ready_pattern {
            return ReadyWhen::OutputContains(pattern.clone());
        }
        if let Some(ms) = self.quiet_ready_ms {
            return ReadyWhen::QuietFor(Duration::from_millis(ms));
        }
        ReadyWhen::FirstFrame
    }

    /// Build the process transport config for the configured command.
    pub fn process_config(&self, request_timeout: Duration) -> Result<ProcessConfig, ConfigError> {
        let command = self.command.clone().ok_or_else(|| {
            ConfigError::Invalid(format!("server '{}' has no command", self.name))
        })?;
        let mut config = ProcessConfig::new(self.name.clone(), command);
        config.args = self.args.clone();
        config.env = self.env.clone();
        config.ready = self.ready_when();
        config.request_timeout = request_timeout;
        Ok(config)
    }

    /// Build the http transport config.
    pub fn http_config(&self, request_timeout: Duration) -> Result<HttpConfig, ConfigError> {
        let url = self
            .url
            .clone()
            .ok_or_else(|| ConfigError::Invalid(format!("server '{}' has no url", self.name)))?;
        let mut config = HttpConfig::new(self.name.clone(), url);
        config.request_timeout = request_timeout;
        Ok(config)
    }
}

impl std::fmt::Debug for ServerDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut env_keys: Vec<&String> = self.env.keys().collect();
        env_keys.sort();
        f.debug_struct("ServerDescriptor")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("enabled", &self.enabled)
            .field("command", &self.command)
            .field("args", &self.args)
            .field("env_keys", &env_keys)
            .field("package", &self.package)
            .field("url", &self.url)
            .field("requires_auth", &self.requires_auth)
            .finish()
    }
}
