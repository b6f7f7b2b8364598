//! Child-process transport: newline-delimited JSON-RPC over piped stdio.
//!
//! The spawned server owns its stdio pipes through three background tasks: a
//! stdout reader feeding a bounded line channel, a dispatch loop that frames
//! lines and routes responses into the [`Correlator`], and a writer that
//! serializes outgoing frames so a request is never interleaved with a
//! partially-written predecessor. Stderr is read but never parsed as protocol
//! data; it is surfaced as log text only.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, error, info, warn};

use crate::correlator::{Correlator, DEFAULT_REQUEST_TIMEOUT};
use crate::error::McpError;
use crate::framing::{self, Decoded, Frame};
use crate::transport::{ReadyWhen, Transport, TransportState};
use crate::types::JsonRpcNotification;
use crate::types::JsonRpcRequest;

/// Consecutive invalid frames after which the server is considered
/// desynchronized and the transport fails.
const DESYNC_LIMIT: usize = 8;

/// How long to wait after a termination signal before force-killing.
const KILL_GRACE: Duration = Duration::from_secs(2);

/// Capacity of the line and write channels between tasks.
const CHANNEL_CAPACITY: usize = 64;

/// Configuration for spawning one process-based server.
///
/// `env` is overlaid on the inherited process environment: variables are
/// added or overridden, never removed. The values may carry credentials and
/// are excluded from the `Debug` output.
#[derive(Clone)]
pub struct ProcessConfig {
    pub name: String,
    pub command: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub ready: ReadyWhen,
    pub request_timeout: Duration,
}

impl ProcessConfig {
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            args: Vec::new(),
            env: HashMap::new(),
            ready: ReadyWhen::default(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

impl std::fmt::Debug for ProcessConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut env_keys: Vec<&String> = self.env.keys().collect();
        env_keys.sort();
        f.debug_struct("ProcessConfig")
            .field("name", &self.name)
            .field("command", &self.command)
            .field("args", &self.args)
            .field("env_keys", &env_keys)
            .field("ready", &self.ready)
            .finish()
    }
}

/// One line of output from the server process.
#[derive(Debug)]
enum IoLine {
    Out(String),
    Err(String),
    Eof,
}

/// Transport over a spawned child process's standard streams.
#[derive(Debug)]
pub struct ProcessTransport {
    name: String,
    correlator: Arc<Correlator>,
    write_tx: mpsc::Sender<String>,
    line_tx: mpsc::Sender<IoLine>,
    state: Arc<watch::Sender<TransportState>>,
    state_rx: watch::Receiver<TransportState>,
    child: Mutex<Option<Child>>,
}

impl ProcessTransport {
    /// Spawn the configured command and wire up the IO tasks.
    ///
    /// Output listeners are registered before anything is written so the
    /// server's readiness signal cannot be lost.
    pub async fn spawn(config: ProcessConfig) -> Result<Arc<Self>, McpError> {
        let mut env_keys: Vec<&String> = config.env.keys().collect();
        env_keys.sort();
        info!(
            server = %config.name,
            command = %config.command,
            args = ?config.args,
            env_keys = ?env_keys,
            "spawning MCP server process"
        );

        let mut cmd = Command::new(&config.command);
        cmd.args(&config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in &config.env {
            cmd.env(key, value);
        }

        let mut child = cmd.spawn()?;

        let stdout = child.stdout.take().ok_or_else(|| {
            McpError::Transport("failed to capture server stdout".to_string())
        })?;
        let stdin = child.stdin.take().ok_or_else(|| {
            McpError::Transport("failed to capture server stdin".to_string())
        })?;
        let stderr = child.stderr.take();

        let transport = Self::from_io(config, stdout, stdin);
        if let Some(stderr) = stderr {
            let tx = transport.line_tx.clone();
            tokio::spawn(read_lines(stderr, tx, IoLine::Err, false));
        }
        *transport.child.lock().await = Some(child);
        Ok(transport)
    }

    /// Build a transport over arbitrary IO streams.
    ///
    /// `spawn` uses this with the child's pipes; tests use it with in-memory
    /// duplex streams so the framing and correlation paths run unchanged.
    pub fn from_io<R, W>(config: ProcessConfig, reader: R, writer: W) -> Arc<Self>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let correlator = Arc::new(Correlator::new(config.request_timeout));
        let (state_tx, state_rx) = watch::channel(TransportState::Starting);
        let state = Arc::new(state_tx);
        let (line_tx, line_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (write_tx, write_rx) = mpsc::channel(CHANNEL_CAPACITY);

        // Reader first: the dispatch loop must be consuming before any write.
        tokio::spawn(read_lines(reader, line_tx.clone(), IoLine::Out, true));
        tokio::spawn(dispatch_loop(
            config.name.clone(),
            line_rx,
            Arc::clone(&correlator),
            Arc::clone(&state),
            config.ready.clone(),
        ));
        tokio::spawn(write_loop(
            config.name.clone(),
            writer,
            write_rx,
            Arc::clone(&state),
            Arc::clone(&correlator),
        ));

        Arc::new(Self {
            name: config.name,
            correlator,
            write_tx,
            line_tx,
            state,
            state_rx,
            child: Mutex::new(None),
        })
    }

    /// Wait up to `window` for the transport to become ready.
    ///
    /// Returns false if the window elapses or the transport fails first.
    pub async fn wait_ready(&self, window: Duration) -> bool {
        let mut rx = self.state_rx.clone();
        match *rx.borrow() {
            TransportState::Ready => return true,
            TransportState::Failed | TransportState::Stopped => return false,
            _ => {}
        }
        let outcome = tokio::time::timeout(window, async {
            loop {
                if rx.changed().await.is_err() {
                    return false;
                }
                match *rx.borrow() {
                    TransportState::Ready => return true,
                    TransportState::Failed | TransportState::Stopped => return false,
                    _ => {}
                }
            }
        })
        .await;
        matches!(outcome, Ok(true))
    }

    /// Force the transport ready without a protocol frame.
    ///
    /// Used when an external health probe confirmed the server is up even
    /// though it printed no recognizable startup output.
    pub fn mark_ready(&self) {
        mark_ready(&self.state, &self.name, "external probe");
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

#[async_trait::async_trait]
impl Transport for ProcessTransport {
    async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<serde_json::Value, McpError> {
        let state = self.state();
        if state != TransportState::Ready {
            return Err(McpError::Transport(format!(
                "transport for '{}' is {}, not ready",
                self.name, state
            )));
        }

        let (id, rx) = self.correlator.register().await;
        let request = JsonRpcRequest::new(id.clone(), method, params);
        let line = framing::encode(&request)?;

        if self.write_tx.send(line).await.is_err() {
            self.correlator.abandon(&id).await;
            return Err(McpError::Transport(
                "writer task stopped".to_string(),
            ));
        }
        debug!(server = %self.name, method = %request.method, id = %id, "sent request");

        self.correlator.wait(&id, rx).await
    }

    async fn notify(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<(), McpError> {
        let state = self.state();
        if state != TransportState::Ready {
            return Err(McpError::Transport(format!(
                "transport for '{}' is {}, not ready",
                self.name, state
            )));
        }
        let notification = JsonRpcNotification::new(method, params);
        let line = framing::encode(&notification)?;
        self.write_tx
            .send(line)
            .await
            .map_err(|_| McpError::Transport("writer task stopped".to_string()))?;
        debug!(server = %self.name, method = %method, "sent notification");
        Ok(())
    }

    async fn stop(&self) -> Result<(), McpError> {
        if self.state() == TransportState::Stopped {
            return Ok(());
        }
        let _ = self.state.send(TransportState::Stopped);
        self.correlator
            .fail_all(|| McpError::Shutdown(format!("server '{}' stopped", self.name)))
            .await;

        if let Some(child) = self.child.lock().await.take() {
            terminate(child, &self.name).await;
        }
        info!(server = %self.name, "transport stopped");
        Ok(())
    }

    fn state(&self) -> TransportState {
        *self.state_rx.borrow()
    }
}

/// Transition `Starting → Ready`, logging which oracle fired.
fn mark_ready(state: &watch::Sender<TransportState>, name: &str, via: &str) {
    let changed = state.send_if_modified(|s| {
        if *s == TransportState::Starting {
            *s = TransportState::Ready;
            true
        } else {
            false
        }
    });
    if changed {
        info!(server = %name, via = via, "transport ready");
    }
}

/// Transition `Starting | Ready → Failed`.
fn mark_failed(state: &watch::Sender<TransportState>) -> bool {
    state.send_if_modified(|s| {
        if matches!(s, TransportState::Starting | TransportState::Ready) {
            *s = TransportState::Failed;
            true
        } else {
            false
        }
    })
}

/// Read lines from one stream into the shared line channel.
async fn read_lines<R>(
    reader: R,
    tx: mpsc::Sender<IoLine>,
    wrap: fn(String) -> IoLine,
    send_eof: bool,
) where
    R: AsyncRead + Send + Unpin + 'static,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if tx.send(wrap(line)).await.is_err() {
                    return;
                }
            }
            Ok(None) => break,
            Err(e) => {
                debug!(error = %e, "read loop ending");
                break;
            }
        }
    }
    if send_eof {
        let _ = tx.send(IoLine::Eof).await;
    }
}

/// Consume the line channel: frames go to the correlator, everything else is
/// diagnostic output, and the readiness oracle watches both.
async fn dispatch_loop(
    name: String,
    mut line_rx: mpsc::Receiver<IoLine>,
    correlator: Arc<Correlator>,
    state: Arc<watch::Sender<TransportState>>,
    ready: ReadyWhen,
) {
    let pattern = match &ready {
        ReadyWhen::OutputContains(p) => Some(p.clone()),
        _ => None,
    };
    let quiet = match ready {
        ReadyWhen::QuietFor(window) => Some(window),
        _ => None,
    };
    let mut desync = 0usize;

    loop {
        let starting = *state.borrow() == TransportState::Starting;
        let event = match (quiet, starting) {
            (Some(window), true) => match tokio::time::timeout(window, line_rx.recv()).await {
                Ok(event) => event,
                Err(_) => {
                    mark_ready(&state, &name, "quiet window");
                    continue;
                }
            },
            _ => line_rx.recv().await,
        };
        let Some(event) = event else { break };

        match event {
            IoLine::Out(line) => match framing::decode_line(&line) {
                Ok(Decoded::Frame(frame)) => {
                    desync = 0;
                    mark_ready(&state, &name, "protocol frame");
                    match frame {
                        Frame::Response(response) => {
                            correlator.complete(response).await;
                        }
                        Frame::Notification(n) => {
                            debug!(server = %name, method = %n.method, "server notification");
                        }
                        Frame::Request(req) => {
                            warn!(
                                server = %name,
                                method = %req.method,
                                id = %req.id,
                                "server-initiated request not supported, dropping"
                            );
                        }
                    }
                }
                Ok(Decoded::NotProtocol) => {
                    debug!(server = %name, line = %line, "server output");
                    if let Some(p) = &pattern {
                        if line.contains(p.as_str()) {
                            mark_ready(&state, &name, "output pattern");
                        }
                    }
                }
                Err(e) => {
                    warn!(server = %name, error = %e, "dropping invalid frame");
                    desync += 1;
                    if desync >= DESYNC_LIMIT {
                        error!(server = %name, "server desynchronized, failing transport");
                        mark_failed(&state);
                        correlator
                            .fail_all(|| {
                                McpError::Transport("server desynchronized".to_string())
                            })
                            .await;
                        break;
                    }
                }
            },
            IoLine::Err(line) => {
                debug!(server = %name, line = %line, "server stderr");
                if let Some(p) = &pattern {
                    if line.contains(p.as_str()) {
                        mark_ready(&state, &name, "output pattern");
                    }
                }
            }
            IoLine::Eof => {
                if *state.borrow() != TransportState::Stopped {
                    warn!(server = %name, "server closed its output stream");
                    mark_failed(&state);
                    correlator
                        .fail_all(|| {
                            McpError::Transport(
                                "server process closed its output stream".to_string(),
                            )
                        })
                        .await;
                }
                break;
            }
        }
    }
}

/// Write framed lines one at a time: frame bytes, newline delimiter, flush.
async fn write_loop<W>(
    name: String,
    mut writer: W,
    mut write_rx: mpsc::Receiver<String>,
    state: Arc<watch::Sender<TransportState>>,
    correlator: Arc<Correlator>,
) where
    W: AsyncWrite + Send + Unpin + 'static,
{
    while let Some(frame) = write_rx.recv().await {
        let result = async {
            writer.write_all(frame.as_bytes()).await?;
            writer.write_all(b"\n").await?;
            writer.flush().await
        }
        .await;

        if let Err(e) = result {
            if *state.borrow() != TransportState::Stopped {
                warn!(server = %name, error = %e, "write to server failed");
                mark_failed(&state);
                correlator
                    .fail_all(|| McpError::Transport(format!("write failed: {}", e)))
                    .await;
            }
            break;
        }
    }
}

/// Ask the process to terminate, escalating to a hard kill after a grace
/// period.
async fn terminate(mut child: Child, name: &str) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        let _ = std::process::Command::new("kill")
            .args(["-TERM", &pid.to_string()])
            .output();
        debug!(server = %name, pid = pid, "sent SIGTERM");
    }

    match tokio::time::timeout(KILL_GRACE, child.wait()).await {
        Ok(Ok(status)) => {
            debug!(server = %name, code = ?status.code(), "server process exited");
        }
        Ok(Err(e)) => {
            warn!(server = %name, error = %e, "error waiting for server process");
        }
        Err(_) => {
            warn!(server = %name, "graceful shutdown timed out, force killing");
            let _ = child.kill().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::JsonRpcResponse;
    use serde_json::json;
    use tokio::io::{DuplexStream, ReadHalf, WriteHalf};

    struct FakeServer {
        reader: tokio::io::Lines<BufReader<ReadHalf<DuplexStream>>>,
        writer: WriteHalf<DuplexStream>,
    }

    impl FakeServer {
        async fn next_request(&mut self) -> JsonRpcRequest {
            let line = self.reader.next_line().await.unwrap().unwrap();
            serde_json::from_str(&line).unwrap()
        }

        async fn send_line(&mut self, line: &str) {
            self.writer.write_all(line.as_bytes()).await.unwrap();
            self.writer.write_all(b"\n").await.unwrap();
            self.writer.flush().await.unwrap();
        }

        async fn send_response(&mut self, response: &JsonRpcResponse) {
            let line = serde_json::to_string(response).unwrap();
            self.send_line(&line).await;
        }
    }

    fn harness(config: ProcessConfig) -> (Arc<ProcessTransport>, FakeServer) {
        let (client_end, server_end) = tokio::io::duplex(4096);
        let (client_read, client_write) = tokio::io::split(client_end);
        let (server_read, server_write) = tokio::io::split(server_end);
        let transport = ProcessTransport::from_io(config, client_read, client_write);
        let server = FakeServer {
            reader: BufReader::new(server_read).lines(),
            writer: server_write,
        };
        (transport, server)
    }

    fn test_config(name: &str) -> ProcessConfig {
        let mut config = ProcessConfig::new(name, "unused");
        config.request_timeout = Duration::from_secs(2);
        config
    }

    #[tokio::test]
    async fn test_not_ready_until_first_frame() {
        let (transport, mut server) = harness(test_config("gate"));
        assert_eq!(transport.state(), TransportState::Starting);

        let err = transport.request("tools/list", None).await.unwrap_err();
        assert!(matches!(err, McpError::Transport(_)));

        server
            .send_line(r#"{"jsonrpc":"2.0","method":"notifications/ready"}"#)
            .await;
        assert!(transport.wait_ready(Duration::from_secs(1)).await);
        assert_eq!(transport.state(), TransportState::Ready);
    }

    #[tokio::test]
    async fn test_out_of_order_responses_pair_by_id() {
        let (transport, mut server) = harness(test_config("shuffle"));
        server
            .send_line(r#"{"jsonrpc":"2.0","method":"notifications/ready"}"#)
            .await;
        assert!(transport.wait_ready(Duration::from_secs(1)).await);

        let server_task = tokio::spawn(async move {
            let mut requests = Vec::new();
            for _ in 0..3 {
                requests.push(server.next_request().await);
            }
            // Answer in reverse arrival order.
            for request in requests.into_iter().rev() {
                let payload = json!({"method": request.method});
                server
                    .send_response(&JsonRpcResponse::success(request.id, payload))
                    .await;
            }
        });

        let (a, b, c) = tokio::join!(
            transport.request("alpha", None),
            transport.request("beta", None),
            transport.request("gamma", None),
        );
        assert_eq!(a.unwrap()["method"], "alpha");
        assert_eq!(b.unwrap()["method"], "beta");
        assert_eq!(c.unwrap()["method"], "gamma");
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_server_error_reaches_caller_as_tool_error() {
        let (transport, mut server) = harness(test_config("errors"));
        server
            .send_line(r#"{"jsonrpc":"2.0","method":"notifications/ready"}"#)
            .await;
        assert!(transport.wait_ready(Duration::from_secs(1)).await);

        let server_task = tokio::spawn(async move {
            let request = server.next_request().await;
            server
                .send_response(&JsonRpcResponse::error(
                    request.id,
                    404,
                    "Tool 'no_such_tool' not found",
                ))
                .await;
        });

        let err = transport
            .request("tools/call", Some(json!({"name": "no_such_tool"})))
            .await
            .unwrap_err();
        match err {
            McpError::Tool { code, message, .. } => {
                assert_eq!(code, 404);
                assert_eq!(message, "Tool 'no_such_tool' not found");
            }
            other => panic!("expected Tool error, got {other:?}"),
        }
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_ready_on_output_pattern() {
        let mut config = test_config("pattern");
        config.ready = ReadyWhen::OutputContains("Server listening".to_string());
        let (transport, mut server) = harness(config);

        server.send_line("Server listening on port 3097").await;
        assert!(transport.wait_ready(Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn test_ready_after_quiet_window() {
        let mut config = test_config("quiet");
        config.ready = ReadyWhen::QuietFor(Duration::from_millis(50));
        let (transport, _server) = harness(config);

        assert!(transport.wait_ready(Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn test_plain_log_lines_are_ignored() {
        let (transport, mut server) = harness(test_config("logs"));
        server
            .send_line(r#"{"jsonrpc":"2.0","method":"notifications/ready"}"#)
            .await;
        assert!(transport.wait_ready(Duration::from_secs(1)).await);

        let server_task = tokio::spawn(async move {
            // Free text and structured log lines interleaved with the
            // protocol frame must not break correlation.
            server.send_line("[debug] cache warmed").await;
            server
                .send_line(r#"{"level":"info","msg":"connected to backend"}"#)
                .await;
            let request = server.next_request().await;
            server.send_line("still chatting").await;
            server
                .send_response(&JsonRpcResponse::success(request.id, json!("done")))
                .await;
        });

        let result = transport.request("tools/list", None).await.unwrap();
        assert_eq!(result, json!("done"));
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_rejects_pending_and_is_idempotent() {
        let (transport, mut server) = harness(test_config("stopper"));
        server
            .send_line(r#"{"jsonrpc":"2.0","method":"notifications/ready"}"#)
            .await;
        assert!(transport.wait_ready(Duration::from_secs(1)).await);

        let caller = {
            let transport = Arc::clone(&transport);
            tokio::spawn(async move { transport.request("tools/list", None).await })
        };
        // Let the request get registered before stopping.
        tokio::time::sleep(Duration::from_millis(50)).await;

        transport.stop().await.unwrap();
        let err = caller.await.unwrap().unwrap_err();
        assert!(matches!(err, McpError::Shutdown(_)));
        assert_eq!(transport.state(), TransportState::Stopped);

        // Stopping again is a no-op.
        transport.stop().await.unwrap();
        assert_eq!(transport.state(), TransportState::Stopped);
    }

    #[tokio::test]
    async fn test_desync_fails_transport_after_repeated_bad_frames() {
        let (transport, mut server) = harness(test_config("desync"));
        server
            .send_line(r#"{"jsonrpc":"2.0","method":"notifications/ready"}"#)
            .await;
        assert!(transport.wait_ready(Duration::from_secs(1)).await);

        for _ in 0..DESYNC_LIMIT {
            server.send_line(r#"{"jsonrpc":"2.0"}"#).await;
        }

        let mut rx = transport.state_rx.clone();
        let failed = tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                if *rx.borrow() == TransportState::Failed {
                    return true;
                }
                if rx.changed().await.is_err() {
                    return false;
                }
            }
        })
        .await;
        assert_eq!(failed, Ok(true));
    }

    #[tokio::test]
    async fn test_eof_fails_pending_requests() {
        let (transport, mut server) = harness(test_config("eof"));
        server
            .send_line(r#"{"jsonrpc":"2.0","method":"notifications/ready"}"#)
            .await;
        assert!(transport.wait_ready(Duration::from_secs(1)).await);

        let caller = {
            let transport = Arc::clone(&transport);
            tokio::spawn(async move { transport.request("tools/list", None).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        drop(server);

        let err = caller.await.unwrap().unwrap_err();
        assert!(matches!(err, McpError::Transport(_)));
    }

    #[tokio::test]
    async fn test_spawn_failure_surfaces_io_error() {
        let config = ProcessConfig::new("ghost", "definitely-not-a-real-command-a6b1");
        let err = ProcessTransport::spawn(config).await.unwrap_err();
        assert!(matches!(err, McpError::Io(_)));
    }

    #[test]
    fn test_debug_redacts_env_values() {
        let mut config = ProcessConfig::new("tenant", "run-server");
        config
            .env
            .insert("API_TOKEN".to_string(), "super-secret".to_string());
        let rendered = format!("{:?}", config);
        assert!(rendered.contains("API_TOKEN"));
        assert!(!rendered.contains("super-secret"));
    }

    #[tokio::test]
    async fn test_mark_ready_external_probe() {
        let (transport, _server) = harness(test_config("probed"));
        assert_eq!(transport.state(), TransportState::Starting);
        transport.mark_ready();
        assert_eq!(transport.state(), TransportState::Ready);
    }
}
