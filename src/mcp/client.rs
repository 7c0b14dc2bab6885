//! Stdio MCP client.
//!
//! Spawns the server as a child process and exchanges newline-delimited
//! JSON-RPC 2.0 messages over its stdin/stdout. A reader task routes each
//! response to the waiting caller by id.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{oneshot, Mutex as AsyncMutex};
use tracing::{debug, info, warn};

use super::manager::McpServerDescriptor;
use super::protocol::{
    InitializeResult, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, ListToolsResult,
    McpToolDef, McpToolResult, PROTOCOL_VERSION,
};
use super::{McpError, McpSession};

/// Per-request timeout.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Waiters keyed by request id. Closed once the server's stdout ends; no
/// waiter is registered after that.
#[derive(Default)]
struct PendingState {
    waiters: HashMap<u64, oneshot::Sender<JsonRpcResponse>>,
    closed: bool,
}

#[derive(Clone, Default)]
struct Pending(Arc<Mutex<PendingState>>);

impl Pending {
    fn register(
        &self,
        id: u64,
    ) -> Result<(PendingGuard, oneshot::Receiver<JsonRpcResponse>), McpError> {
        let mut state = self.0.lock();
        if state.closed {
            return Err(McpError::Closed);
        }
        let (tx, rx) = oneshot::channel();
        state.waiters.insert(id, tx);
        Ok((
            PendingGuard {
                pending: self.clone(),
                id,
            },
            rx,
        ))
    }

    fn resolve(&self, id: u64, response: JsonRpcResponse) {
        let waiter = self.0.lock().waiters.remove(&id);
        if let Some(tx) = waiter {
            let _ = tx.send(response);
        }
    }

    /// Drop every sender, waking each waiter with `Closed`.
    fn close(&self) {
        let mut state = self.0.lock();
        state.closed = true;
        state.waiters.clear();
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.0.lock().waiters.len()
    }
}

/// Removes its waiter on drop, including when the request is cancelled.
struct PendingGuard {
    pending: Pending,
    id: u64,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.pending.0.lock().waiters.remove(&self.id);
    }
}

/// MCP client talking to a server subprocess over stdio.
pub struct McpClient {
    server_name: String,
    stdin: AsyncMutex<ChildStdin>,
    _child: Child,
    pending: Pending,
    next_id: AtomicU64,
    timeout: Duration,
    server_version: String,
}

impl McpClient {
    /// Spawn the server described by `descriptor` and run the handshake.
    pub async fn connect(
        name: impl Into<String>,
        descriptor: &McpServerDescriptor,
    ) -> Result<Self, McpError> {
        let server_name = name.into();
        let mut command = Command::new(&descriptor.command);
        command
            .args(&descriptor.args)
            .envs(&descriptor.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|e| McpError::Spawn {
            command: descriptor.command.clone(),
            message: e.to_string(),
        })?;

        let stdin = child.stdin.take().ok_or_else(|| McpError::Spawn {
            command: descriptor.command.clone(),
            message: "stdin not available".to_string(),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| McpError::Spawn {
            command: descriptor.command.clone(),
            message: "stdout not available".to_string(),
        })?;

        let pending = Pending::default();
        tokio::spawn(read_responses(server_name.clone(), stdout, pending.clone()));

        let mut client = Self {
            server_name,
            stdin: AsyncMutex::new(stdin),
            _child: child,
            pending,
            next_id: AtomicU64::new(1),
            timeout: REQUEST_TIMEOUT,
            server_version: String::new(),
        };

        let init = client.initialize().await?;
        client.server_version = init.protocol_version.clone();
        info!(
            server = %client.server_name,
            version = %init.protocol_version,
            "MCP server initialized"
        );

        client
            .notify(JsonRpcNotification::new("notifications/initialized", None))
            .await?;

        Ok(client)
    }

    /// Protocol version reported by the server.
    pub fn protocol_version(&self) -> &str {
        &self.server_version
    }

    async fn write_line(&self, line: String) -> Result<(), McpError> {
        let mut stdin = self.stdin.lock().await;
        stdin.write_all(line.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        stdin.flush().await?;
        Ok(())
    }

    async fn notify(&self, notification: JsonRpcNotification) -> Result<(), McpError> {
        self.write_line(serde_json::to_string(&notification)?).await
    }

    async fn request(&self, method: &str, params: Option<JsonValue>) -> Result<JsonValue, McpError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let line = serde_json::to_string(&JsonRpcRequest::new(id, method, params))?;

        let (_guard, rx) = self.pending.register(id)?;
        self.write_line(line).await?;

        let response = match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => return Err(McpError::Closed),
            Err(_) => return Err(McpError::Timeout(method.to_string())),
        };

        if let Some(err) = response.error {
            return Err(McpError::Rpc {
                code: err.code,
                message: err.message,
            });
        }
        response
            .result
            .ok_or_else(|| McpError::Protocol(format!("empty result for '{}'", method)))
    }

    async fn initialize(&self) -> Result<InitializeResult, McpError> {
        let params = serde_json::json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": {
                "name": env!("CARGO_PKG_NAME"),
                "version": env!("CARGO_PKG_VERSION")
            }
        });
        let result = self.request("initialize", Some(params)).await?;
        Ok(serde_json::from_value(result)?)
    }
}

async fn read_responses(server: String, stdout: ChildStdout, pending: Pending) {
    let mut reader = BufReader::new(stdout);
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => {
                debug!(server = %server, "MCP server stdout closed");
                break;
            }
            Ok(_) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                match serde_json::from_str::<JsonRpcResponse>(trimmed) {
                    Ok(response) => {
                        let Some(id) = response.id else {
                            // Server notification.
                            continue;
                        };
                        pending.resolve(id, response);
                    }
                    Err(e) => {
                        debug!(server = %server, error = %e, "Ignoring non JSON-RPC line");
                    }
                }
            }
            Err(e) => {
                warn!(server = %server, error = %e, "Failed reading MCP server stdout");
                break;
            }
        }
    }
    pending.close();
}

#[async_trait]
impl McpSession for McpClient {
    fn server_name(&self) -> &str {
        &self.server_name
    }

    async fn list_tools(&self) -> Result<Vec<McpToolDef>, McpError> {
        let result = self.request("tools/list", None).await?;
        let list: ListToolsResult = serde_json::from_value(result)?;
        debug!(server = %self.server_name, tools = list.tools.len(), "Listed MCP tools");
        Ok(list.tools)
    }

    async fn call_tool(&self, name: &str, arguments: JsonValue) -> Result<McpToolResult, McpError> {
        let params = serde_json::json!({ "name": name, "arguments": arguments });
        let result = self.request("tools/call", Some(params)).await?;
        Ok(serde_json::from_value(result)?)
    }
}
