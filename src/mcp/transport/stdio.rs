//! Subprocess transport: spawns the server as a child process and frames
//! JSON-RPC over its stdin/stdout, one message per line.

use crate::mcp::error::McpError;
use crate::mcp::transport::McpTransport;
use async_trait::async_trait;
use rust_mcp_schema::schema_utils::{
    ClientMessage, FromMessage, MessageFromClient, NotificationFromClient, RequestFromClient,
    ServerMessage,
};
use rust_mcp_schema::RequestId;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStdin, Command};
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, warn};

type PendingMap = Arc<Mutex<HashMap<RequestId, oneshot::Sender<ServerMessage>>>>;

#[derive(Debug)]
pub struct StdioTransport {
    server_id: String,
    stdin: Mutex<ChildStdin>,
    pending: PendingMap,
    next_request_id: AtomicI64,
    alive: Arc<AtomicBool>,
    shutdown: Mutex<Option<oneshot::Sender<()>>>,
}

impl StdioTransport {
    /// Spawns the child process and starts its reader tasks. Fails with
    /// [`McpError::Connection`] when the executable cannot be started.
    pub fn spawn(
        server_id: String,
        command: &str,
        args: &[String],
        env: Option<&HashMap<String, String>>,
    ) -> Result<Self, McpError> {
        debug!(server_id = %server_id, command = %command, args = ?args, "Spawning MCP stdio server");
        let mut cmd = Command::new(command);
        cmd.args(args)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped());
        if let Some(env) = env {
            cmd.envs(env);
        }

        let mut child = cmd
            .spawn()
            .map_err(|err| McpError::Connection(format!("failed to spawn {command}: {err}")))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| McpError::Connection("unable to retrieve child stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| McpError::Connection("unable to retrieve child stdout".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| McpError::Connection("unable to retrieve child stderr".to_string()))?;

        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let alive = Arc::new(AtomicBool::new(true));
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        Self::spawn_stdout_reader(pending.clone(), stdout, server_id.clone());
        Self::spawn_stderr_drain(stderr);
        Self::spawn_exit_monitor(
            child,
            shutdown_rx,
            pending.clone(),
            alive.clone(),
            server_id.clone(),
        );

        Ok(Self {
            server_id,
            stdin: Mutex::new(stdin),
            pending,
            next_request_id: AtomicI64::new(0),
            alive,
            shutdown: Mutex::new(Some(shutdown_tx)),
        })
    }

    fn spawn_stdout_reader(pending: PendingMap, stdout: tokio::process::ChildStdout, server_id: String) {
        tokio::spawn(async move {
            let mut reader = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = reader.next_line().await {
                let value = match serde_json::from_str::<serde_json::Value>(&line) {
                    Ok(value) => value,
                    Err(_) => continue,
                };
                if let Some(items) = value.as_array() {
                    for item in items {
                        if let Ok(message) = serde_json::from_value::<ServerMessage>(item.clone()) {
                            Self::dispatch_message(&pending, message, &server_id).await;
                        }
                    }
                } else if let Ok(message) = serde_json::from_value::<ServerMessage>(value) {
                    Self::dispatch_message(&pending, message, &server_id).await;
                }
            }
        });
    }

    fn spawn_stderr_drain(stderr: tokio::process::ChildStderr) {
        tokio::spawn(async move {
            let mut reader = BufReader::new(stderr).lines();
            while let Ok(Some(_)) = reader.next_line().await {}
        });
    }

    /// Owns the child handle: waits for an unsolicited exit or a close
    /// request, then marks the transport dead and fails all in-flight
    /// calls by dropping their response senders.
    fn spawn_exit_monitor(
        mut child: tokio::process::Child,
        shutdown_rx: oneshot::Receiver<()>,
        pending: PendingMap,
        alive: Arc<AtomicBool>,
        server_id: String,
    ) {
        tokio::spawn(async move {
            tokio::select! {
                status = child.wait() => {
                    debug!(server_id = %server_id, status = ?status, "MCP stdio server exited");
                }
                _ = shutdown_rx => {
                    if let Err(err) = child.kill().await {
                        warn!(server_id = %server_id, error = %err, "Failed to kill MCP stdio server");
                    }
                }
            }
            alive.store(false, Ordering::SeqCst);
            pending.lock().await.clear();
        });
    }

    async fn dispatch_message(pending: &PendingMap, message: ServerMessage, server_id: &str) {
        match &message {
            ServerMessage::Response(response) => {
                debug!(server_id = %server_id, response_id = ?response.id, "Received MCP stdio response");
                if let Some(tx) = pending.lock().await.remove(&response.id) {
                    let _ = tx.send(message);
                }
            }
            ServerMessage::Error(error) => {
                debug!(
                    server_id = %server_id,
                    error_id = ?error.id,
                    error_code = error.error.code,
                    "Received MCP stdio error"
                );
                if let Some(id) = error.id.as_ref() {
                    if let Some(tx) = pending.lock().await.remove(id) {
                        let _ = tx.send(message);
                    }
                }
            }
            ServerMessage::Request(request) => {
                debug!(
                    server_id = %server_id,
                    method = %request.method(),
                    "Ignoring MCP stdio server-initiated request"
                );
            }
            ServerMessage::Notification(_) => {
                debug!(server_id = %server_id, "Received MCP stdio notification");
            }
        }
    }

    fn next_request_id(&self) -> RequestId {
        let id = self.next_request_id.fetch_add(1, Ordering::SeqCst);
        RequestId::Integer(id)
    }

    async fn write_line(&self, payload: &str) -> Result<(), McpError> {
        let mut stdin = self.stdin.lock().await;
        let write = async {
            stdin.write_all(payload.as_bytes()).await?;
            stdin.write_all(b"\n").await?;
            stdin.flush().await
        };
        write.await.map_err(|err| {
            McpError::Transport(format!("stdio write to {} failed: {err}", self.server_id))
        })
    }
}

#[async_trait]
impl McpTransport for StdioTransport {
    async fn request(&self, request: RequestFromClient) -> Result<ServerMessage, McpError> {
        if !self.is_alive() {
            return Err(McpError::ConnectionLost(self.server_id.clone()));
        }

        let request_id = self.next_request_id();
        debug!(server_id = %self.server_id, request_id = ?request_id, "Sending MCP stdio request");
        let message = ClientMessage::from_message(
            MessageFromClient::RequestFromClient(request),
            Some(request_id.clone()),
        )
        .map_err(|err| McpError::Transport(err.to_string()))?;
        let payload =
            serde_json::to_string(&message).map_err(|err| McpError::Transport(err.to_string()))?;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(request_id.clone(), tx);

        if let Err(err) = self.write_line(&payload).await {
            self.pending.lock().await.remove(&request_id);
            return Err(err);
        }

        // No deadline here: callers needing bounded wait apply their own.
        // The sender is dropped when the child exits, which resolves the
        // receiver with an error.
        match rx.await {
            Ok(message) => Ok(message),
            Err(_) => Err(McpError::ConnectionLost(self.server_id.clone())),
        }
    }

    async fn notify(&self, notification: NotificationFromClient) -> Result<(), McpError> {
        if !self.is_alive() {
            return Err(McpError::ConnectionLost(self.server_id.clone()));
        }
        let message = ClientMessage::from_message(
            MessageFromClient::NotificationFromClient(notification),
            None,
        )
        .map_err(|err| McpError::Transport(err.to_string()))?;
        let payload =
            serde_json::to_string(&message).map_err(|err| McpError::Transport(err.to_string()))?;
        self.write_line(&payload).await
    }

    async fn close(&self) {
        self.alive.store(false, Ordering::SeqCst);
        if let Some(tx) = self.shutdown.lock().await.take() {
            let _ = tx.send(());
        }
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn spawn_fails_for_missing_executable() {
        let err = StdioTransport::spawn(
            "alpha".to_string(),
            "/definitely-missing-command",
            &[],
            None,
        )
        .expect_err("expected spawn failure");
        assert!(matches!(err, McpError::Connection(_)));
    }

    #[tokio::test]
    async fn request_after_close_reports_connection_lost() {
        let transport = StdioTransport::spawn("alpha".to_string(), "cat", &[], None)
            .expect("cat should spawn");
        transport.close().await;
        let err = transport
            .request(RequestFromClient::PingRequest(None))
            .await
            .expect_err("expected connection-lost error");
        assert!(matches!(err, McpError::ConnectionLost(_)));
    }
}
