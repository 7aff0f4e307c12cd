//! Subprocess transport: newline-delimited JSON-RPC over the child's
//! stdin/stdout.

use std::process::Stdio;
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use toolgate_core::jsonrpc::JsonRpcRequest;

use super::error::TransportError;
use super::pending::PendingCalls;
use crate::registry::StdioServerConfig;

/// How long `close` waits for the child to exit on its own after stdin is
/// closed before killing it.
pub const DEFAULT_CLOSE_GRACE: Duration = Duration::from_secs(2);

struct ProcessControl {
    stdin_tx: mpsc::Sender<String>,
    kill_tx: oneshot::Sender<()>,
    monitor: JoinHandle<()>,
}

/// Client for a tool server running as a child process.
///
/// The client exclusively owns the process. When the process exits or closes
/// stdout, all outstanding calls fail with [`TransportError::TransportClosed`]
/// and so does every later call; spawn a new client to reconnect.
pub struct StdioClient {
    server: String,
    pending: PendingCalls,
    control: Mutex<Option<ProcessControl>>,
    close_grace: Duration,
}

impl StdioClient {
    /// Spawn the configured command and start the I/O tasks.
    pub fn spawn(server: &str, config: &StdioServerConfig) -> Result<Self, TransportError> {
        let mut cmd = Command::new(&config.command);
        cmd.args(&config.args)
            .envs(&config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        info!(
            server,
            command = %config.command,
            args = ?config.args,
            "Spawning tool server"
        );
        let mut child = cmd
            .spawn()
            .map_err(|e| TransportError::Spawn(format!("{}: {e}", config.command)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| TransportError::Spawn("Failed to capture stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| TransportError::Spawn("Failed to capture stdout".to_string()))?;

        let pending = PendingCalls::new();
        let (stdin_tx, mut stdin_rx) = mpsc::channel::<String>(32);

        // Writer: one JSON message per line. Dropping every sender closes the
        // child's stdin.
        let writer_server = server.to_string();
        let writer_pending = pending.clone();
        tokio::spawn(async move {
            let mut stdin = stdin;
            while let Some(line) = stdin_rx.recv().await {
                let written = async {
                    stdin.write_all(line.as_bytes()).await?;
                    stdin.write_all(b"\n").await?;
                    stdin.flush().await
                }
                .await;
                if let Err(e) = written {
                    error!(server = %writer_server, error = %e, "Failed to write to tool server stdin");
                    writer_pending.close().await;
                    break;
                }
            }
            debug!(server = %writer_server, "stdin writer finished");
        });

        let reader_server = server.to_string();
        let reader_pending = pending.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => reader_pending.route_message(&line).await,
                    Ok(None) => break,
                    Err(e) => {
                        warn!(server = %reader_server, error = %e, "Failed to read tool server stdout");
                        break;
                    }
                }
            }
            info!(server = %reader_server, "Tool server closed stdout");
            reader_pending.close().await;
        });

        if let Some(stderr) = child.stderr.take() {
            let stderr_server = server.to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(server = %stderr_server, "stderr: {}", line);
                }
            });
        }

        // Monitor: owns the child, notices exit, kills on request.
        let (kill_tx, kill_rx) = oneshot::channel::<()>();
        let monitor_server = server.to_string();
        let monitor_pending = pending.clone();
        let monitor = tokio::spawn(async move {
            tokio::select! {
                status = child.wait() => match status {
                    Ok(status) => info!(server = %monitor_server, ?status, "Tool server exited"),
                    Err(e) => warn!(server = %monitor_server, error = %e, "Error waiting for tool server"),
                },
                _ = kill_rx => {
                    warn!(server = %monitor_server, "Killing tool server");
                    if let Err(e) = child.kill().await {
                        warn!(server = %monitor_server, error = %e, "Failed to kill tool server");
                    }
                }
            }
            monitor_pending.close().await;
        });

        Ok(Self {
            server: server.to_string(),
            pending,
            control: Mutex::new(Some(ProcessControl {
                stdin_tx,
                kill_tx,
                monitor,
            })),
            close_grace: DEFAULT_CLOSE_GRACE,
        })
    }

    #[must_use]
    pub const fn with_close_grace(mut self, grace: Duration) -> Self {
        self.close_grace = grace;
        self
    }

    pub fn server(&self) -> &str {
        &self.server
    }

    async fn sender(&self) -> Result<mpsc::Sender<String>, TransportError> {
        self.control
            .lock()
            .await
            .as_ref()
            .map(|control| control.stdin_tx.clone())
            .ok_or(TransportError::TransportClosed)
    }

    async fn send_line(&self, message: &JsonRpcRequest) -> Result<(), TransportError> {
        let line = serde_json::to_string(message)?;
        self.sender()
            .await?
            .send(line)
            .await
            .map_err(|_| TransportError::TransportClosed)
    }

    pub async fn call(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value, TransportError> {
        let (id, rx) = self.pending.register().await?;
        let request = JsonRpcRequest::new(id, method, params);
        if let Err(e) = self.send_line(&request).await {
            self.pending.remove(id).await;
            return Err(e);
        }
        debug!(server = %self.server, id, method, "Sent request");
        self.pending.wait(id, rx, timeout).await
    }

    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), TransportError> {
        if self.pending.is_closed().await {
            return Err(TransportError::TransportClosed);
        }
        self.send_line(&JsonRpcRequest::notification(method, params))
            .await
    }

    /// Close stdin, give the child `close_grace` to exit, then kill it.
    pub async fn close(&self) {
        let Some(ProcessControl {
            stdin_tx,
            kill_tx,
            mut monitor,
        }) = self.control.lock().await.take()
        else {
            return;
        };

        drop(stdin_tx);
        if tokio::time::timeout(self.close_grace, &mut monitor)
            .await
            .is_err()
        {
            debug!(server = %self.server, "Tool server did not exit after stdin closed");
            let _ = kill_tx.send(());
            let _ = monitor.await;
        }
        self.pending.close().await;
        info!(server = %self.server, "Tool server connection closed");
    }
}

#[cfg(all(test, unix))]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sh(script: &str) -> StdioServerConfig {
        StdioServerConfig {
            command: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            ..Default::default()
        }
    }

    /// Echo server: turns every request into a response whose result is the
    /// request's method name.
    fn echo() -> StdioServerConfig {
        StdioServerConfig {
            command: "sed".to_string(),
            args: vec!["-u".to_string(), "s/\"method\"/\"result\"/".to_string()],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn call_round_trips_through_child() {
        let client = StdioClient::spawn("echo", &echo()).unwrap();
        let result = client
            .call("ping", None, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(result, json!("ping"));
        client.close().await;
    }

    #[tokio::test]
    async fn concurrent_calls_each_get_their_own_response() {
        let client = StdioClient::spawn("echo", &echo()).unwrap();
        let timeout = Duration::from_secs(5);
        let (a, b, c) = tokio::join!(
            client.call("alpha", None, timeout),
            client.call("beta", None, timeout),
            client.call("gamma", None, timeout),
        );
        assert_eq!(a.unwrap(), json!("alpha"));
        assert_eq!(b.unwrap(), json!("beta"));
        assert_eq!(c.unwrap(), json!("gamma"));
        client.close().await;
    }

    #[tokio::test]
    async fn exit_fails_calls_with_transport_closed() {
        let client = StdioClient::spawn("gone", &sh("exit 0")).unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        let err = client
            .call("ping", None, Duration::from_secs(2))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::TransportClosed), "{err:?}");
    }

    #[tokio::test]
    async fn silent_server_times_out() {
        let client = StdioClient::spawn("silent", &sh("sleep 5"))
            .unwrap()
            .with_close_grace(Duration::from_millis(50));
        let err = client
            .call("ping", None, Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Timeout(_)));
        assert!(client.pending.is_empty().await);
        client.close().await;
    }

    #[tokio::test]
    async fn close_kills_unresponsive_child_and_rejects_calls() {
        let client = StdioClient::spawn("stubborn", &sh("trap '' TERM; sleep 30"))
            .unwrap()
            .with_close_grace(Duration::from_millis(100));

        let started = std::time::Instant::now();
        client.close().await;
        assert!(started.elapsed() < Duration::from_secs(10));

        let err = client
            .call("ping", None, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::TransportClosed));
    }

    #[tokio::test]
    async fn spawn_failure_is_reported() {
        let config = StdioServerConfig {
            command: "/nonexistent/toolgate-test-binary".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            StdioClient::spawn("missing", &config),
            Err(TransportError::Spawn(_))
        ));
    }
}
