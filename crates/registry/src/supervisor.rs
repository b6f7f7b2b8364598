//! Startup fallback ladder for process-based servers.
//!
//! Some servers start cleanly from their configured command, some only via a
//! package-manager launcher, and some come up silently and can only be
//! confirmed over a local health endpoint. The ladder tries each strategy in
//! order, each bounded by its own window, and fails with a [`StartupError`]
//! naming every step it attempted.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use toolbridge_mcp::process::{ProcessConfig, ProcessTransport};
use toolbridge_mcp::transport::Transport;

use crate::config::{ServerDescriptor, StartupConfig, TimingConfig};

/// All fallback-ladder steps exhausted.
#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("server '{server}' failed to start; attempted: {}", .attempts.join("; "))]
    Exhausted {
        server: String,
        attempts: Vec<String>,
    },
}

/// Settings the ladder runs with, resolved from config once.
#[derive(Debug, Clone)]
pub struct StartupOptions {
    pub request_timeout: Duration,
    pub step_window: Duration,
    pub probe_window: Duration,
    pub fallback_runner: Vec<String>,
}

impl StartupOptions {
    pub fn from_config(timing: &TimingConfig, startup: &StartupConfig) -> Self {
        Self {
            request_timeout: timing.request_timeout(),
            step_window: startup.step_window(),
            probe_window: startup.probe_window(),
            fallback_runner: startup.fallback_runner.clone(),
        }
    }
}

impl Default for StartupOptions {
    fn default() -> Self {
        Self::from_config(&TimingConfig::default(), &StartupConfig::default())
    }
}

/// A ready transport plus the steps that failed before it came up.
pub struct StartupOutcome {
    pub transport: Arc<ProcessTransport>,
    pub failed_steps: Vec<String>,
}

/// Run the fallback ladder for one process-based server.
///
/// Steps, in order, until one produces a ready transport:
/// 1. the descriptor's configured command;
/// 2. the same logical server through the package-manager runner, with the
///    same arguments and environment;
/// 3. an HTTP health probe against the configured local port, accepted as
///    readiness even without a protocol frame.
///
/// The caller serializes ladder executions per server; only one runs at a
/// time.
pub async fn start_process_server(
    descriptor: &ServerDescriptor,
    options: &StartupOptions,
) -> Result<StartupOutcome, StartupError> {
    let mut failed_steps: Vec<String> = Vec::new();
    let exhausted = |attempts: Vec<String>| StartupError::Exhausted {
        server: descriptor.name.clone(),
        attempts,
    };

    let primary = descriptor
        .process_config(options.request_timeout)
        .map_err(|e| exhausted(vec![format!("configured command ({})", e)]))?;
    let command = primary.command.clone();

    // Step 1: the configured command.
    match ProcessTransport::spawn(primary.clone()).await {
        Ok(transport) => {
            if transport.wait_ready(options.step_window).await {
                return Ok(StartupOutcome {
                    transport,
                    failed_steps,
                });
            }
            failed_steps.push(format!(
                "configured command '{}' (no readiness within {:?})",
                command, options.step_window
            ));
            // Stop it before spawning the fallback so two copies never fight
            // over the same port.
            let _ = transport.stop().await;
        }
        Err(e) => {
            failed_steps.push(format!(
                "configured command '{}' (spawn failed: {})",
                command, e
            ));
        }
    }

    // Step 2: the same server via the package-manager runner.
    let mut lingering: Option<Arc<ProcessTransport>> = None;
    if options.fallback_runner.is_empty() {
        failed_steps.push("package runner (disabled by configuration)".to_string());
    } else {
        let package = descriptor
            .package
            .clone()
            .unwrap_or_else(|| command.clone());
        let runner = options.fallback_runner[0].clone();
        let mut args: Vec<String> = options.fallback_runner[1..].to_vec();
        args.push(package.clone());
        args.extend(primary.args.iter().cloned());

        let mut fallback = ProcessConfig::new(primary.name.clone(), runner.clone());
        fallback.args = args;
        fallback.env = primary.env.clone();
        fallback.ready = primary.ready.clone();
        fallback.request_timeout = primary.request_timeout;

        debug!(server = %descriptor.name, runner = %runner, package = %package, "trying package runner fallback");
        match ProcessTransport::spawn(fallback).await {
            Ok(transport) => {
                if transport.wait_ready(options.step_window).await {
                    info!(server = %descriptor.name, package = %package, "started via package runner");
                    return Ok(StartupOutcome {
                        transport,
                        failed_steps,
                    });
                }
                failed_steps.push(format!(
                    "package runner '{} {}' (no readiness within {:?})",
                    runner, package, options.step_window
                ));
                // Keep the process alive: the health probe may still confirm it.
                lingering = Some(transport);
            }
            Err(e) => {
                failed_steps.push(format!(
                    "package runner '{} {}' (spawn failed: {})",
                    runner, package, e
                ));
            }
        }
    }

    // Step 3: HTTP health probe against the expected local port. Some servers
    // print no recognizable startup text at all.
    if let Some(transport) = lingering {
        match descriptor.health_port {
            Some(port) => {
                if probe_health(port, options.probe_window).await {
                    info!(server = %descriptor.name, port = port, "health probe confirmed readiness");
                    transport.mark_ready();
                    return Ok(StartupOutcome {
                        transport,
                        failed_steps,
                    });
                }
                failed_steps.push(format!(
                    "health probe on port {} (no response within {:?})",
                    port, options.probe_window
                ));
            }
            None => {
                failed_steps.push("health probe (no health_port configured)".to_string());
            }
        }
        let _ = transport.stop().await;
    }

    warn!(server = %descriptor.name, steps = ?failed_steps, "startup ladder exhausted");
    Err(exhausted(failed_steps))
}

/// Poll the local health endpoint until it answers or the window closes.
/// Any completed HTTP exchange counts: the probe checks that the server is
/// listening, not that it is healthy by its own definition.
async fn probe_health(port: u16, window: Duration) -> bool {
    let url = format!("http://127.0.0.1:{}/", port);
    let client = match reqwest::Client::builder()
        .connect_timeout(Duration::from_millis(500))
        .timeout(Duration::from_secs(1))
        .build()
    {
        Ok(client) => client,
        Err(_) => return false,
    };

    let deadline = tokio::time::Instant::now() + window;
    while tokio::time::Instant::now() < deadline {
        if client.get(&url).send().await.is_ok() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerDescriptor;
    use toolbridge_mcp::transport::TransportState;

    fn fast_options(runner: Vec<String>) -> StartupOptions {
        StartupOptions {
            request_timeout: Duration::from_secs(2),
            step_window: Duration::from_millis(800),
            probe_window: Duration::from_millis(800),
            fallback_runner: runner,
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_fallback_attempted_once_after_primary_failure() {
        // Primary spawn fails outright; the package-runner step brings the
        // server up by printing its listening banner. Exactly one failed step
        // is recorded, so exactly two spawns happened.
        let mut descriptor =
            ServerDescriptor::process("banner", "definitely-not-a-real-command-a6b1");
        descriptor.package = Some("echo 'Server listening on port 3097' && sleep 2".to_string());
        descriptor.ready_pattern = Some("Server listening on port 3097".to_string());

        let options = fast_options(vec!["sh".to_string(), "-c".to_string()]);
        let outcome = start_process_server(&descriptor, &options).await.unwrap();

        assert_eq!(outcome.failed_steps.len(), 1);
        assert!(outcome.failed_steps[0].contains("configured command"));
        assert_eq!(outcome.transport.state(), TransportState::Ready);
        outcome.transport.stop().await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_exhausted_ladder_names_every_step() {
        // Primary cannot spawn, the fallback exits immediately without output,
        // and no health port is configured.
        let mut descriptor =
            ServerDescriptor::process("doomed", "definitely-not-a-real-command-a6b1");
        descriptor.package = Some("true".to_string());

        let options = fast_options(vec!["sh".to_string(), "-c".to_string()]);
        let err = start_process_server(&descriptor, &options)
            .await
            .err()
            .expect("ladder should be exhausted");

        let StartupError::Exhausted { server, attempts } = err;
        assert_eq!(server, "doomed");
        assert_eq!(attempts.len(), 3);
        assert!(attempts[0].contains("configured command"));
        assert!(attempts[1].contains("package runner"));
        assert!(attempts[2].contains("health probe"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_health_probe_accepts_silent_server() {
        // A minimal HTTP responder stands in for the server's health port.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                tokio::spawn(async move {
                    use tokio::io::{AsyncReadExt, AsyncWriteExt};
                    let mut buf = [0u8; 1024];
                    let _ = socket.read(&mut buf).await;
                    let _ = socket
                        .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 0\r\n\r\n")
                        .await;
                });
            }
        });

        // The primary command cannot spawn; the fallback runs a silent
        // sleeper that never signals readiness.
        let mut descriptor = ServerDescriptor::process("silent", "sleep 5");
        descriptor.package = Some("sleep 5".to_string());
        descriptor.health_port = Some(port);

        let options = fast_options(vec!["sh".to_string(), "-c".to_string()]);
        let outcome = start_process_server(&descriptor, &options).await.unwrap();

        // Two steps failed before the probe confirmed readiness.
        assert_eq!(outcome.failed_steps.len(), 2);
        assert_eq!(outcome.transport.state(), TransportState::Ready);
        outcome.transport.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_probe_health_times_out_on_closed_port() {
        // Bind then drop to get a port that is almost certainly closed.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        assert!(!probe_health(port, Duration::from_millis(600)).await);
    }
}
