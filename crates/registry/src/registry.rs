//! Server registry: one handle per configured server.
//!
//! The registry is constructed explicitly at application start and passed by
//! reference to whatever needs to start, stop or query servers; there is no
//! ambient global instance. One server's failure never takes down another:
//! `start_all` and `stop_all` collect per-server failures instead of aborting
//! on the first one.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tracing::{debug, error, info, warn};

use toolbridge_mcp::error::McpError;
use toolbridge_mcp::http::{AuthProvider, HttpTransport};
use toolbridge_mcp::session::ServerConnection;
use toolbridge_mcp::transport::{ServerLookup, Transport, TransportState};

use crate::config::{BridgeConfig, ConfigError, ServerDescriptor, TransportKind};
use crate::supervisor::{start_process_server, StartupError, StartupOptions};

/// Errors surfaced to registry callers.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error(transparent)]
    Startup(#[from] StartupError),

    #[error("handshake with '{server}' failed: {source}")]
    Handshake {
        server: String,
        #[source]
        source: McpError,
    },

    #[error("transport for '{server}' failed: {source}")]
    Transport {
        server: String,
        #[source]
        source: McpError,
    },

    #[error("invalid descriptor for '{server}': {source}")]
    Config {
        server: String,
        #[source]
        source: ConfigError,
    },

    #[error("unknown server '{0}'")]
    UnknownServer(String),

    #[error("server '{0}' is disabled")]
    Disabled(String),
}

/// One server's failure to stop, reported by [`ServerRegistry::stop_all`].
#[derive(Debug)]
pub struct StopFailure {
    pub server: String,
    pub error: McpError,
}

/// Pairs a descriptor with its live connection, if any.
///
/// The handle owns the transport exclusively; callers reach the server only
/// through the [`ServerConnection`] accessors. The start lock serializes
/// ladder executions: concurrent `start` calls share the in-flight attempt
/// instead of spawning duplicates.
pub struct ServerHandle {
    descriptor: ServerDescriptor,
    options: StartupOptions,
    auth: Option<Arc<dyn AuthProvider>>,
    connection: RwLock<Option<Arc<ServerConnection>>>,
    start_lock: tokio::sync::Mutex<()>,
}

impl ServerHandle {
    fn new(
        descriptor: ServerDescriptor,
        options: StartupOptions,
        auth: Option<Arc<dyn AuthProvider>>,
    ) -> Self {
        Self {
            descriptor,
            options,
            auth,
            connection: RwLock::new(None),
            start_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn descriptor(&self) -> &ServerDescriptor {
        &self.descriptor
    }

    /// The live connection, if the server has been started.
    pub fn connection(&self) -> Option<Arc<ServerConnection>> {
        self.connection.read().unwrap().clone()
    }

    /// True while the transport is up and usable.
    pub fn is_running(&self) -> bool {
        self.connection()
            .map(|c| c.transport().state() == TransportState::Ready)
            .unwrap_or(false)
    }

    /// Bring the server up: run the startup ladder (process servers) or build
    /// the HTTP transport, then perform the initialize handshake.
    ///
    /// A second caller arriving while a start is in flight waits on the lock
    /// and receives the connection the first caller produced.
    pub async fn start(&self) -> Result<Arc<ServerConnection>, RegistryError> {
        let _guard = self.start_lock.lock().await;

        if let Some(connection) = self.connection() {
            if connection.transport().state() == TransportState::Ready {
                debug!(server = %self.descriptor.name, "already running");
                return Ok(connection);
            }
        }

        if !self.descriptor.enabled {
            return Err(RegistryError::Disabled(self.descriptor.name.clone()));
        }

        let transport: Arc<dyn Transport> = match self.descriptor.kind {
            TransportKind::Process => {
                let outcome = start_process_server(&self.descriptor, &self.options).await?;
                if !outcome.failed_steps.is_empty() {
                    warn!(
                        server = %self.descriptor.name,
                        steps = ?outcome.failed_steps,
                        "startup succeeded after fallback"
                    );
                }
                outcome.transport
            }
            TransportKind::Http => {
                let config = self
                    .descriptor
                    .http_config(self.options.request_timeout)
                    .map_err(|e| RegistryError::Config {
                        server: self.descriptor.name.clone(),
                        source: e,
                    })?;
                let auth = if self.descriptor.requires_auth {
                    self.auth.clone()
                } else {
                    None
                };
                HttpTransport::new(config, auth).map_err(|e| RegistryError::Transport {
                    server: self.descriptor.name.clone(),
                    source: e,
                })?
            }
        };

        match ServerConnection::establish(self.descriptor.name.clone(), Arc::clone(&transport))
            .await
        {
            Ok(connection) => {
                let connection = Arc::new(connection);
                *self.connection.write().unwrap() = Some(Arc::clone(&connection));
                info!(server = %self.descriptor.name, "server started");
                Ok(connection)
            }
            Err(e) => {
                let _ = transport.stop().await;
                Err(RegistryError::Handshake {
                    server: self.descriptor.name.clone(),
                    source: e,
                })
            }
        }
    }

    /// Stop the server if it is running. Idempotent.
    pub async fn stop(&self) -> Result<(), McpError> {
        let connection = self.connection.write().unwrap().take();
        match connection {
            Some(connection) => connection.stop().await,
            None => Ok(()),
        }
    }
}

/// Holds one [`ServerHandle`] per configured server name.
pub struct ServerRegistry {
    servers: RwLock<HashMap<String, Arc<ServerHandle>>>,
    options: StartupOptions,
    auth: Option<Arc<dyn AuthProvider>>,
}

impl ServerRegistry {
    pub fn new(options: StartupOptions) -> Self {
        Self {
            servers: RwLock::new(HashMap::new()),
            options,
            auth: None,
        }
    }

    /// Attach an auth provider for http servers flagged `requires_auth`.
    pub fn with_auth(mut self, auth: Arc<dyn AuthProvider>) -> Self {
        self.auth = Some(auth);
        self
    }

    /// Build a registry and register every server from the config.
    pub fn from_config(config: &BridgeConfig) -> Self {
        let registry = Self::new(StartupOptions::from_config(&config.timing, &config.startup));
        registry.register(config.descriptors());
        registry
    }

    /// Register descriptors. Idempotent per name: a re-registered name
    /// replaces the prior descriptor only when the prior handle is not
    /// running.
    pub fn register(&self, descriptors: impl IntoIterator<Item = ServerDescriptor>) {
        let mut servers = self.servers.write().unwrap();
        for descriptor in descriptors {
            match servers.get(&descriptor.name) {
                Some(existing) if existing.is_running() => {
                    warn!(
                        server = %descriptor.name,
                        "ignoring re-registration of a running server"
                    );
                }
                _ => {
                    debug!(server = %descriptor.name, kind = ?descriptor.kind, "registered server");
                    servers.insert(
                        descriptor.name.clone(),
                        Arc::new(ServerHandle::new(
                            descriptor,
                            self.options.clone(),
                            self.auth.clone(),
                        )),
                    );
                }
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<ServerHandle>> {
        self.servers.read().unwrap().get(name).cloned()
    }

    /// Registered server names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.servers.read().unwrap().keys().cloned().collect();
        names.sort();
        names
    }

    /// Start every enabled server, collecting per-server failures. One
    /// server's startup failure leaves the others untouched.
    pub async fn start_all(&self) -> Vec<(String, RegistryError)> {
        let handles: Vec<Arc<ServerHandle>> = {
            let servers = self.servers.read().unwrap();
            let mut handles: Vec<_> = servers.values().cloned().collect();
            handles.sort_by(|a, b| a.descriptor().name.cmp(&b.descriptor().name));
            handles
        };

        let mut failures = Vec::new();
        for handle in handles {
            let name = handle.descriptor().name.clone();
            if !handle.descriptor().enabled {
                debug!(server = %name, "skipping disabled server");
                continue;
            }
            match handle.start().await {
                Ok(_) => {}
                Err(e) => {
                    error!(server = %name, error = %e, "failed to start server");
                    failures.push((name, e));
                }
            }
        }
        failures
    }

    /// Stop every handle independently. A stop failure on one server never
    /// blocks the others from stopping; all failures are collected and
    /// returned.
    pub async fn stop_all(&self) -> Vec<StopFailure> {
        let handles: Vec<Arc<ServerHandle>> = {
            self.servers.read().unwrap().values().cloned().collect()
        };

        let mut failures = Vec::new();
        for handle in handles {
            let name = handle.descriptor().name.clone();
            if let Err(error) = handle.stop().await {
                error!(server = %name, error = %error, "failed to stop server");
                failures.push(StopFailure {
                    server: name,
                    error,
                });
            }
        }
        failures
    }
}

impl ServerLookup for ServerRegistry {
    fn lookup(&self, name: &str) -> Option<Arc<ServerConnection>> {
        self.get(name).and_then(|handle| handle.connection())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Transport double that answers the handshake and optionally fails stop.
    struct StubTransport {
        fail_stop: bool,
        stopped: AtomicBool,
    }

    impl StubTransport {
        fn new(fail_stop: bool) -> Arc<Self> {
            Arc::new(Self {
                fail_stop,
                stopped: AtomicBool::new(false),
            })
        }
    }

    #[async_trait]
    impl Transport for StubTransport {
        async fn request(&self, method: &str, _params: Option<Value>) -> Result<Value, McpError> {
            match method {
                "initialize" => Ok(json!({
                    "protocolVersion": "2024-11-05",
                    "capabilities": {},
                    "serverInfo": {"name": "stub"}
                })),
                _ => Ok(Value::Null),
            }
        }

        async fn notify(&self, _method: &str, _params: Option<Value>) -> Result<(), McpError> {
            Ok(())
        }

        async fn stop(&self) -> Result<(), McpError> {
            if self.fail_stop {
                return Err(McpError::Transport("stop exploded".to_string()));
            }
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

    async fn handle_with_stub(name: &str, stub: Arc<StubTransport>) -> Arc<ServerHandle> {
        let transport: Arc<dyn Transport> = stub;
        let connection = ServerConnection::establish(name, transport).await.unwrap();
        let handle = ServerHandle::new(
            ServerDescriptor::process(name, "unused"),
            StartupOptions::default(),
            None,
        );
        *handle.connection.write().unwrap() = Some(Arc::new(connection));
        Arc::new(handle)
    }

    fn registry_with_handles(handles: Vec<Arc<ServerHandle>>) -> ServerRegistry {
        let registry = ServerRegistry::new(StartupOptions::default());
        {
            let mut servers = registry.servers.write().unwrap();
            for handle in handles {
                servers.insert(handle.descriptor().name.clone(), handle);
            }
        }
        registry
    }

    #[test]
    fn test_register_and_get() {
        let registry = ServerRegistry::new(StartupOptions::default());
        registry.register(vec![
            ServerDescriptor::process("alpha", "alpha-mcp"),
            ServerDescriptor::http("beta", "http://localhost:9000/mcp"),
        ]);

        assert_eq!(registry.names(), vec!["alpha", "beta"]);
        assert!(registry.get("alpha").is_some());
        assert!(registry.get("gamma").is_none());
    }

    #[test]
    fn test_reregistration_replaces_stopped_server() {
        let registry = ServerRegistry::new(StartupOptions::default());
        registry.register(vec![ServerDescriptor::process("alpha", "old-command")]);
        registry.register(vec![ServerDescriptor::process("alpha", "new-command")]);

        let handle = registry.get("alpha").unwrap();
        assert_eq!(handle.descriptor().command.as_deref(), Some("new-command"));
        assert_eq!(registry.names().len(), 1);
    }

    #[tokio::test]
    async fn test_reregistration_keeps_running_server() {
        let handle = handle_with_stub("alpha", StubTransport::new(false)).await;
        let registry = registry_with_handles(vec![handle]);
        assert!(registry.get("alpha").unwrap().is_running());

        registry.register(vec![ServerDescriptor::process("alpha", "new-command")]);
        // The running handle was kept; the replacement was ignored.
        assert_ne!(
            registry.get("alpha").unwrap().descriptor().command.as_deref(),
            Some("new-command")
        );
    }

    #[tokio::test]
    async fn test_start_returns_existing_connection() {
        // The descriptor's command does not exist, so if start() re-ran the
        // ladder it would fail; the pre-existing ready connection is shared
        // instead.
        let handle = handle_with_stub("alpha", StubTransport::new(false)).await;
        let connection = handle.start().await.unwrap();
        assert_eq!(connection.name(), "alpha");
    }

    #[tokio::test]
    async fn test_start_disabled_server_is_rejected() {
        let mut descriptor = ServerDescriptor::process("off", "unused");
        descriptor.enabled = false;
        let handle = ServerHandle::new(descriptor, StartupOptions::default(), None);

        let err = handle.start().await.unwrap_err();
        assert!(matches!(err, RegistryError::Disabled(_)));
    }

    #[tokio::test]
    async fn test_stop_all_collects_failures_and_keeps_going() {
        let good_a = StubTransport::new(false);
        let bad = StubTransport::new(true);
        let good_b = StubTransport::new(false);

        let handles = vec![
            handle_with_stub("a-good", Arc::clone(&good_a)).await,
            handle_with_stub("b-bad", Arc::clone(&bad)).await,
            handle_with_stub("c-good", Arc::clone(&good_b)).await,
        ];
        let registry = registry_with_handles(handles);

        let failures = registry.stop_all().await;

        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].server, "b-bad");
        // The other two servers were still stopped.
        assert!(good_a.stopped.load(Ordering::SeqCst));
        assert!(good_b.stopped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_stop_all_is_idempotent() {
        let handle = handle_with_stub("alpha", StubTransport::new(false)).await;
        let registry = registry_with_handles(vec![handle]);

        assert!(registry.stop_all().await.is_empty());
        assert!(registry.stop_all().await.is_empty());
    }

    #[tokio::test]
    async fn test_start_all_isolates_failures() {
        // Two servers that cannot start: failures are collected per server
        // rather than aborting on the first.
        let registry = ServerRegistry::new(StartupOptions {
            request_timeout: std::time::Duration::from_secs(1),
            step_window: std::time::Duration::from_millis(200),
            probe_window: std::time::Duration::from_millis(200),
            fallback_runner: Vec::new(),
        });
        registry.register(vec![
            ServerDescriptor::process("one", "definitely-not-a-real-command-a6b1"),
            ServerDescriptor::process("two", "definitely-not-a-real-command-c7d2"),
        ]);

        let failures = registry.start_all().await;
        assert_eq!(failures.len(), 2);
        let names: Vec<&str> = failures.iter().map(|(n, _)| n.as_str()).collect();
        assert!(names.contains(&"one"));
        assert!(names.contains(&"two"));
    }

    #[tokio::test]
    async fn test_lookup_resolves_running_connection() {
        let handle = handle_with_stub("alpha", StubTransport::new(false)).await;
        let registry = registry_with_handles(vec![handle]);

        let lookup: &dyn ServerLookup = &registry;
        assert!(lookup.lookup("alpha").is_some());
        assert!(lookup.lookup("missing").is_none());

        registry.stop_all().await;
        assert!(lookup.lookup("alpha").is_none());
    }
}
