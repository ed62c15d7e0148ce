//! Transport implementations for MCP communication: launch a server as a
//! subprocess and speak newline-delimited JSON-RPC over its stdio, or POST
//! to a remote server over HTTP.

use std::collections::VecDeque;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;
use tokio::io::AsyncBufReadExt;
use tokio::io::AsyncWriteExt;
use tokio::io::BufReader;
use tokio::process::Child;
use tokio::process::ChildStdin;
use tokio::process::ChildStdout;
use tokio::process::Command;

/// Cap on a single stdio line, to bound memory use against a server that
/// never terminates a line.
const MAX_LINE_BYTES: usize = 10 * 1024 * 1024;
/// Number of stderr lines retained for diagnostics.
const STDERR_RING_CAPACITY: usize = 20;

/// Environment variables always forwarded to an MCP subprocess, regardless
/// of `env_passthrough`. Everything else is dropped unless explicitly
/// configured via `env` or `env_passthrough`.
const ENV_ALLOWLIST: &[&str] = &["PATH", "HOME", "USER", "LANG", "LC_ALL", "LC_CTYPE", "LANGUAGE"];

/// Whether a variable name looks like a secret that should never be
/// forwarded implicitly, even if named in `env_passthrough`.
fn looks_like_secret(key: &str) -> bool {
    let upper = key.to_uppercase();
    upper.ends_with("_API_KEY") || upper.ends_with("_TOKEN") || upper.contains("_SECRET")
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("MCP server command not found: {0}")]
    CommandNotFound(String),

    #[error("failed to start MCP server: {0}")]
    SpawnFailed(String),

    #[error("transport not connected")]
    NotConnected,

    #[error("failed to send message: {0}")]
    SendFailed(String),

    #[error("MCP server closed (exit code: {0:?})")]
    ServerClosed(Option<i32>),

    #[error("line exceeds maximum length of {MAX_LINE_BYTES} bytes")]
    LineTooLong,

    #[error("invalid JSON from server: {0}")]
    InvalidJson(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error("{0}")]
    Unsupported(&'static str),
}

#[async_trait::async_trait]
pub trait Transport: Send {
    async fn connect(&mut self) -> Result<(), TransportError>;
    async fn send(&mut self, message: &Value) -> Result<(), TransportError>;
    async fn receive(&mut self) -> Result<Value, TransportError>;

    /// Send `message` and return its matching response as a single atomic
    /// operation, with no response ever held in shared state between the
    /// two halves. Transports whose inbound channel is independent of the
    /// outbound one (stdio, where unrelated notifications can arrive on the
    /// same stream) fall back to `send` then `receive`; transports where a
    /// request and its response are inherently paired (HTTP) override this
    /// directly instead of splitting across `send`/`receive`.
    async fn request(&mut self, message: &Value) -> Result<Value, TransportError> {
        self.send(message).await?;
        self.receive().await
    }

    async fn close(&mut self);
}

async fn read_line_capped(reader: &mut BufReader<ChildStdout>) -> Result<String, TransportError> {
    let mut buf = Vec::new();
    let n = reader.read_until(b'\n', &mut buf).await?;
    if n == 0 {
        return Ok(String::new());
    }
    if buf.len() > MAX_LINE_BYTES {
        return Err(TransportError::LineTooLong);
    }
    while buf.last() == Some(&b'\n') || buf.last() == Some(&b'\r') {
        buf.pop();
    }
    String::from_utf8(buf).map_err(|e| TransportError::InvalidJson(e.to_string()))
}

pub struct StdioTransport {
    command: Vec<String>,
    extra_env: Vec<(String, String)>,
    env_passthrough: Vec<String>,
    cwd: Option<String>,
    child: Option<Child>,
    stdin: Option<ChildStdin>,
    stdout: Option<BufReader<ChildStdout>>,
    stderr_tail: Arc<StdMutex<VecDeque<String>>>,
}

impl StdioTransport {
    pub fn new(command: Vec<String>, extra_env: Vec<(String, String)>, cwd: Option<String>) -> Self {
        Self::with_passthrough(command, extra_env, Vec::new(), cwd)
    }

    pub fn with_passthrough(
        command: Vec<String>,
        extra_env: Vec<(String, String)>,
        env_passthrough: Vec<String>,
        cwd: Option<String>,
    ) -> Self {
        Self {
            command,
            extra_env,
            env_passthrough,
            cwd,
            child: None,
            stdin: None,
            stdout: None,
            stderr_tail: Arc::new(StdMutex::new(VecDeque::new())),
        }
    }

    /// Recently captured stderr lines from the subprocess, for diagnostics.
    pub fn stderr_tail(&self) -> Vec<String> {
        self.stderr_tail.lock().unwrap_or_else(|e| e.into_inner()).iter().cloned().collect()
    }
}

#[async_trait::async_trait]
impl Transport for StdioTransport {
    async fn connect(&mut self) -> Result<(), TransportError> {
        let [program, args @ ..] = self.command.as_slice() else {
            return Err(TransportError::SpawnFailed("empty command".to_string()));
        };

        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        cmd.env_clear();
        for key in ENV_ALLOWLIST {
            if let Ok(value) = std::env::var(key) {
                cmd.env(key, value);
            }
        }
        for key in &self.env_passthrough {
            if looks_like_secret(key) {
                continue;
            }
            if let Ok(value) = std::env::var(key) {
                cmd.env(key, value);
            }
        }
        for (k, v) in &self.extra_env {
            cmd.env(k, v);
        }
        if let Some(cwd) = &self.cwd {
            cmd.current_dir(cwd);
        }

        let mut child = cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                TransportError::CommandNotFound(program.clone())
            } else {
                TransportError::SpawnFailed(e.to_string())
            }
        })?;

        let stdin = child.stdin.take().ok_or(TransportError::NotConnected)?;
        let stdout = child.stdout.take().ok_or(TransportError::NotConnected)?;
        let stderr = child.stderr.take();

        if let Some(stderr) = stderr {
            let tail = self.stderr_tail.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    let mut guard = tail.lock().unwrap_or_else(|e| e.into_inner());
                    if guard.len() >= STDERR_RING_CAPACITY {
                        guard.pop_front();
                    }
                    guard.push_back(line);
                }
            });
        }

        self.child = Some(child);
        self.stdin = Some(stdin);
        self.stdout = Some(BufReader::new(stdout));
        Ok(())
    }

    async fn send(&mut self, message: &Value) -> Result<(), TransportError> {
        let stdin = self.stdin.as_mut().ok_or(TransportError::NotConnected)?;
        let mut data = serde_json::to_vec(message).map_err(|e| TransportError::SendFailed(e.to_string()))?;
        data.push(b'\n');
        stdin.write_all(&data).await.map_err(|e| TransportError::SendFailed(e.to_string()))?;
        stdin.flush().await.map_err(|e| TransportError::SendFailed(e.to_string()))?;
        Ok(())
    }

    async fn receive(&mut self) -> Result<Value, TransportError> {
        let reader = self.stdout.as_mut().ok_or(TransportError::NotConnected)?;
        let line = read_line_capped(reader).await?;
        if line.is_empty() {
            let code = self.child.as_mut().and_then(|c| c.try_wait().ok().flatten()).and_then(|s| s.code());
            return Err(TransportError::ServerClosed(code));
        }
        serde_json::from_str(&line).map_err(|e| TransportError::InvalidJson(e.to_string()))
    }

    async fn close(&mut self) {
        self.stdin = None;
        if let Some(mut child) = self.child.take() {
            match tokio::time::timeout(Duration::from_secs(2), child.wait()).await {
                Ok(_) => {}
                Err(_) => {
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                }
            }
        }
    }
}

/// Request/response transport over HTTP POST. Each request is served by
/// `request()` in a single atomic POST-and-decode with no response ever
/// parked in shared state, so concurrent callers each get back exactly the
/// response to their own POST. MCP's streamable-HTTP transport also
/// supports server-initiated SSE pushes; this implementation covers the
/// common request/response exchange only.
pub struct HttpTransport {
    url: String,
    headers: Vec<(String, String)>,
    client: Option<reqwest::Client>,
}

impl HttpTransport {
    pub fn new(url: String, headers: Vec<(String, String)>) -> Self {
        Self { url, headers, client: None }
    }

    fn build_request(&self, client: &reqwest::Client, message: &Value) -> reqwest::RequestBuilder {
        let mut builder = client.post(&self.url).json(message);
        for (k, v) in &self.headers {
            builder = builder.header(k, v);
        }
        builder
    }
}

#[async_trait::async_trait]
impl Transport for HttpTransport {
    async fn connect(&mut self) -> Result<(), TransportError> {
        // SSRF hardening: never let the MCP server's response redirect us
        // into POSTing the request elsewhere.
        self.client = Some(reqwest::Client::builder().redirect(reqwest::redirect::Policy::none()).build()?);
        Ok(())
    }

    /// Fire-and-forget send for notifications (no `id`, no response
    /// expected). Requests awaiting a response must go through `request()`.
    async fn send(&mut self, message: &Value) -> Result<(), TransportError> {
        let client = self.client.as_ref().ok_or(TransportError::NotConnected)?;
        self.build_request(client, message).send().await?;
        Ok(())
    }

    async fn receive(&mut self) -> Result<Value, TransportError> {
        Err(TransportError::Unsupported(
            "HTTP transport pairs each request with its response directly; use request()",
        ))
    }

    async fn request(&mut self, message: &Value) -> Result<Value, TransportError> {
        let client = self.client.as_ref().ok_or(TransportError::NotConnected)?;
        let response = self.build_request(client, message).send().await?;
        Ok(response.json().await?)
    }

    async fn close(&mut self) {
        self.client = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stdio_transport_not_connected_errors() {
        let mut transport = StdioTransport::new(vec!["true".to_string()], vec![], None);
        let err = transport.send(&serde_json::json!({})).await.unwrap_err();
        assert!(matches!(err, TransportError::NotConnected));
    }

    #[tokio::test]
    async fn http_transport_receive_is_unsupported() {
        let mut transport = HttpTransport::new("http://127.0.0.1:1/rpc".to_string(), vec![]);
        let err = transport.receive().await.unwrap_err();
        assert!(matches!(err, TransportError::Unsupported(_)));
    }

    #[tokio::test]
    async fn http_transport_request_without_connect_errors() {
        let mut transport = HttpTransport::new("http://127.0.0.1:1/rpc".to_string(), vec![]);
        let err = transport.request(&serde_json::json!({"jsonrpc":"2.0","id":1,"method":"ping"})).await.unwrap_err();
        assert!(matches!(err, TransportError::NotConnected));
    }
}
