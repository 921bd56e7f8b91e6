//! Subprocess transport client
//!
//! Spawns a backend tool server as a child process and speaks line-delimited
//! JSON-RPC over its stdio. A stdin writer task drains an outbound channel
//! and a stdout reader task routes responses to pending callers by id.

use crate::config::ServerDescriptor;
use crate::error::{RelayError, Result};
use crate::mcp::types::{self, McpRequest, McpResponse, Tool};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio::time::{timeout, Duration};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Grace period for process exit on disconnect
const STOP_GRACE: Duration = Duration::from_secs(5);

/// Child-process client for backend tool servers
pub struct SubprocessTransport {
    /// Server name for identification
    server_name: String,
    /// Command to execute
    command: String,
    /// Command arguments
    args: Vec<String>,
    /// Environment variables (values support ${VAR} expansion)
    env: Option<HashMap<String, String>>,
    /// Working directory
    cwd: Option<String>,
    /// Default request timeout
    request_timeout: Duration,
    /// The spawned child process
    process: Arc<Mutex<Option<Child>>>,
    /// Channel for sending JSON-RPC lines to the process
    stdin_sender: Arc<Mutex<Option<mpsc::UnboundedSender<String>>>>,
    /// Pending requests waiting for responses
    pending_requests: Arc<Mutex<HashMap<String, oneshot::Sender<McpResponse>>>>,
    /// Process health, flipped by the stdout reader
    is_healthy: Arc<RwLock<bool>>,
}

impl SubprocessTransport {
    /// Create a new subprocess transport from a server descriptor
    pub fn new(descriptor: &ServerDescriptor) -> Result<Self> {
        let command = descriptor
            .command
            .clone()
            .filter(|c| !c.is_empty())
            .ok_or_else(|| RelayError::config(format!("Server '{}' has no command", descriptor.name)))?;

        Ok(Self {
            server_name: descriptor.name.clone(),
            command,
            args: descriptor.args.clone(),
            env: descriptor.env.clone(),
            cwd: descriptor.cwd.clone(),
            request_timeout: Duration::from_secs(descriptor.timeouts.request_secs),
            process: Arc::new(Mutex::new(None)),
            stdin_sender: Arc::new(Mutex::new(None)),
            pending_requests: Arc::new(Mutex::new(HashMap::new())),
            is_healthy: Arc::new(RwLock::new(false)),
        })
    }

    /// Spawn the process and wire its stdio
    pub async fn connect(&self) -> Result<()> {
        info!("Starting subprocess server '{}': {}", self.server_name, self.command);

        let mut cmd = Command::new(&self.command);
        cmd.args(&self.args);

        if let Some(env) = &self.env {
            for (key, value) in env {
                cmd.env(key, expand_env_value(value));
            }
        }

        if let Some(cwd) = &self.cwd {
            cmd.current_dir(cwd);
        }

        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| RelayError::connection(format!("Failed to spawn server '{}': {}", self.server_name, e)))?;

        let stdin = child.stdin.take().ok_or_else(|| {
            RelayError::connection(format!("Failed to open stdin for server '{}'", self.server_name))
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            RelayError::connection(format!("Failed to open stdout for server '{}'", self.server_name))
        })?;

        // Stdin writer task
        let (stdin_tx, mut stdin_rx) = mpsc::unbounded_channel::<String>();
        let server_name = self.server_name.clone();
        tokio::spawn(async move {
            let mut stdin = stdin;
            while let Some(message) = stdin_rx.recv().await {
                if let Err(e) = stdin.write_all(message.as_bytes()).await {
                    error!("Failed to write to server '{}' stdin: {}", server_name, e);
                    break;
                }
                if let Err(e) = stdin.write_all(b"\n").await {
                    error!("Failed to write newline to server '{}' stdin: {}", server_name, e);
                    break;
                }
                if let Err(e) = stdin.flush().await {
                    error!("Failed to flush server '{}' stdin: {}", server_name, e);
                    break;
                }
            }
        });

        // Stdout reader task
        let pending_requests = Arc::clone(&self.pending_requests);
        let server_name = self.server_name.clone();
        let is_healthy = Arc::clone(&self.is_healthy);
        tokio::spawn(async move {
            let reader = BufReader::new(stdout);
            let mut lines = reader.lines();

            while let Ok(Some(line)) = lines.next_line().await {
                match serde_json::from_str::<McpResponse>(&line) {
                    Ok(response) => {
                        let id = response.id.clone();
                        let mut pending = pending_requests.lock().await;
                        if let Some(sender) = pending.remove(&id) {
                            if sender.send(response).is_err() {
                                debug!("Discarding response {} for abandoned request on '{}'", id, server_name);
                            }
                        } else {
                            warn!("Response for unknown request id {} from server '{}'", id, server_name);
                        }

                        *is_healthy.write().await = true;
                    }
                    Err(e) => {
                        warn!(
                            "Unparseable stdout line from server '{}': {} (line: {})",
                            server_name, e, line
                        );
                    }
                }
            }

            warn!("Stdout reader ended for server '{}'", server_name);
            *is_healthy.write().await = false;
            pending_requests.lock().await.clear();
        });

        *self.stdin_sender.lock().await = Some(stdin_tx);
        *self.process.lock().await = Some(child);
        *self.is_healthy.write().await = true;

        info!("Started subprocess server '{}'", self.server_name);
        Ok(())
    }

    /// Send a JSON-RPC request and await the correlated response
    pub async fn send_request(&self, method: &str, params: Option<Value>, timeout_dur: Duration) -> Result<McpResponse> {
        let request_id = Uuid::new_v4().to_string();
        let request = McpRequest::new(request_id.clone(), method, params);
        let request_json = serde_json::to_string(&request)?;

        debug!("Sending request to subprocess server '{}': method={}", self.server_name, method);

        let (response_tx, response_rx) = oneshot::channel();
        {
            let mut pending = self.pending_requests.lock().await;
            pending.insert(request_id.clone(), response_tx);
        }

        {
            let sender = self.stdin_sender.lock().await;
            match sender.as_ref() {
                Some(sender) => {
                    if sender.send(request_json).is_err() {
                        self.pending_requests.lock().await.remove(&request_id);
                        return Err(RelayError::connection(format!(
                            "Stdin writer for server '{}' has stopped",
                            self.server_name
                        )));
                    }
                }
                None => {
                    self.pending_requests.lock().await.remove(&request_id);
                    return Err(RelayError::connection(format!(
                        "Subprocess server '{}' is not running",
                        self.server_name
                    )));
                }
            }
        }

        match timeout(timeout_dur, response_rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(RelayError::connection(format!(
                "Subprocess server '{}' exited mid-request",
                self.server_name
            ))),
            Err(_) => {
                self.pending_requests.lock().await.remove(&request_id);
                Err(RelayError::connection(format!(
                    "Request to subprocess server '{}' timed out",
                    self.server_name
                )))
            }
        }
    }

    /// List tools published by the server
    pub async fn list_tools(&self) -> Result<Vec<Tool>> {
        let response = self.send_request("tools/list", None, self.request_timeout).await?;
        types::tools_from_response(response, &self.server_name)
    }

    /// Call a tool on the child process
    pub async fn call_tool(&self, tool_name: &str, arguments: Value, timeout_dur: Duration) -> Result<Value> {
        let response = self
            .send_request(
                "tools/call",
                Some(json!({
                    "name": tool_name,
                    "arguments": arguments
                })),
                timeout_dur,
            )
            .await
            .map_err(|e| match e {
                RelayError::Connection { message } if message.contains("timed out") => {
                    RelayError::tool_call_timeout(tool_name, timeout_dur.as_secs())
                }
                other => other,
            })?;

        types::call_result_from_response(response, tool_name)
    }

    /// Liveness probe: process spawned and its reader still healthy
    pub async fn ping(&self) -> bool {
        self.process.lock().await.is_some() && *self.is_healthy.read().await
    }

    /// Kill the process and fail in-flight calls
    pub async fn disconnect(&self) -> Result<()> {
        info!("Stopping subprocess server '{}'", self.server_name);

        if let Some(mut process) = self.process.lock().await.take() {
            if let Err(e) = process.kill().await {
                warn!("Failed to kill server '{}': {}", self.server_name, e);
            }

            match timeout(STOP_GRACE, process.wait()).await {
                Ok(Ok(status)) => {
                    info!("Subprocess server '{}' exited with status: {}", self.server_name, status);
                }
                Ok(Err(e)) => {
                    error!("Error waiting for server '{}' to exit: {}", self.server_name, e);
                }
                Err(_) => {
                    warn!("Subprocess server '{}' did not exit within grace period", self.server_name);
                }
            }
        }

        *self.stdin_sender.lock().await = None;
        *self.is_healthy.write().await = false;
        self.pending_requests.lock().await.clear();

        Ok(())
    }

    pub fn server_name(&self) -> &str {
        &self.server_name
    }
}

/// Expand `$VAR`/`${VAR}` references in a descriptor env value.
/// Unknown variables expand to empty rather than failing the spawn.
fn expand_env_value(value: &str) -> String {
    shellexpand::env_with_context_no_errors(value, |var| Some(std::env::var(var).unwrap_or_default()))
        .into_owned()
}
