//! Minimal HTTP/1.1 server for JSON-RPC-over-POST, hand-rolled rather than
//! built on a framework so every size/timeout limit below is enforced by
//! the read loop itself rather than trusted to a dependency's defaults.

use std::sync::Arc;
use std::time::Duration;

use nexus_protocol::INVALID_REQUEST;
use nexus_protocol::PARSE_ERROR;
use nexus_protocol::make_error_response;
use nexus_protocol::parse_request;
use nexus_protocol::serialize_response;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio::io::BufReader;
use tokio::net::TcpListener;
use tokio::net::TcpStream;
use tracing::Instrument;

use crate::global_dispatcher::GlobalDispatcher;
use crate::pool::AgentPool;
use crate::token_store::validate_api_key;

const MAX_REQUEST_LINE: usize = 8 * 1024;
const MAX_HEADER_NAME: usize = 1024;
const MAX_HEADER_VALUE: usize = 8 * 1024;
const MAX_HEADER_COUNT: usize = 128;
const MAX_TOTAL_HEADER_BYTES: usize = 32 * 1024;
const MAX_BODY_SIZE: usize = 1024 * 1024;
const READ_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum HttpParseError {
    #[error("request timeout")]
    Timeout,
    #[error("empty request")]
    Empty,
    #[error("request line too long")]
    RequestLineTooLong,
    #[error("invalid request line: {0}")]
    InvalidRequestLine(String),
    #[error("header name too long")]
    HeaderNameTooLong,
    #[error("header value too long")]
    HeaderValueTooLong,
    #[error("too many headers")]
    TooManyHeaders,
    #[error("total headers size exceeds limit")]
    TotalHeadersTooLarge,
    #[error("invalid Content-Length: {0}")]
    InvalidContentLength(String),
    #[error("request body too large: {0} > {MAX_BODY_SIZE}")]
    BodyTooLarge(usize),
    #[error("incomplete body")]
    IncompleteBody,
    #[error("invalid UTF-8 in request")]
    InvalidEncoding,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub struct HttpRequest {
    pub method: String,
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl HttpRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

async fn read_line_limited(
    reader: &mut BufReader<TcpStream>,
    max_len: usize,
) -> Result<String, HttpParseError> {
    let mut buf = Vec::new();
    loop {
        let mut byte = [0u8; 1];
        let n = tokio::time::timeout(READ_TIMEOUT, reader.read(&mut byte))
            .await
            .map_err(|_| HttpParseError::Timeout)??;
        if n == 0 {
            if buf.is_empty() {
                return Err(HttpParseError::Empty);
            }
            break;
        }
        if byte[0] == b'\n' {
            break;
        }
        if byte[0] != b'\r' {
            buf.push(byte[0]);
        }
        if buf.len() > max_len {
            return Err(HttpParseError::RequestLineTooLong);
        }
    }
    String::from_utf8(buf).map_err(|_| HttpParseError::InvalidEncoding)
}

pub async fn read_http_request(
    reader: &mut BufReader<TcpStream>,
) -> Result<HttpRequest, HttpParseError> {
    let request_line = read_line_limited(reader, MAX_REQUEST_LINE).await?;
    if request_line.is_empty() {
        return Err(HttpParseError::Empty);
    }

    let parts: Vec<&str> = request_line.split(' ').collect();
    if parts.len() != 3 {
        return Err(HttpParseError::InvalidRequestLine(request_line));
    }
    let method = parts[0].to_string();
    let path = parts[1].to_string();

    let mut headers = Vec::new();
    let mut total_header_bytes = 0usize;
    loop {
        let line = read_line_limited(reader, MAX_HEADER_VALUE + MAX_HEADER_NAME + 2).await?;
        if line.is_empty() {
            break;
        }
        total_header_bytes += line.len();
        if total_header_bytes > MAX_TOTAL_HEADER_BYTES {
            return Err(HttpParseError::TotalHeadersTooLarge);
        }
        if headers.len() >= MAX_HEADER_COUNT {
            return Err(HttpParseError::TooManyHeaders);
        }
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let name = name.trim();
        let value = value.trim();
        if name.len() > MAX_HEADER_NAME {
            return Err(HttpParseError::HeaderNameTooLong);
        }
        if value.len() > MAX_HEADER_VALUE {
            return Err(HttpParseError::HeaderValueTooLong);
        }
        headers.push((name.to_ascii_lowercase(), value.to_string()));
    }

    let content_length: usize = headers
        .iter()
        .find(|(k, _)| k == "content-length")
        .map(|(_, v)| v.as_str())
        .unwrap_or("0")
        .parse()
        .map_err(|_| {
            HttpParseError::InvalidContentLength(
                headers
                    .iter()
                    .find(|(k, _)| k == "content-length")
                    .map(|(_, v)| v.clone())
                    .unwrap_or_default(),
            )
        })?;

    if content_length > MAX_BODY_SIZE {
        return Err(HttpParseError::BodyTooLarge(content_length));
    }

    let mut body = String::new();
    if content_length > 0 {
        let mut buf = vec![0u8; content_length];
        tokio::time::timeout(READ_TIMEOUT, reader.read_exact(&mut buf))
            .await
            .map_err(|_| HttpParseError::Timeout)?
            .map_err(|_| HttpParseError::IncompleteBody)?;
        body = String::from_utf8(buf).map_err(|_| HttpParseError::InvalidEncoding)?;
    }

    Ok(HttpRequest { method, path, headers, body })
}

pub async fn send_http_response(
    stream: &mut TcpStream,
    status: u16,
    body: &str,
) -> std::io::Result<()> {
    let status_message = match status {
        200 => "OK",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        500 => "Internal Server Error",
        _ => "Unknown",
    };
    let body_bytes = body.as_bytes();
    let header = format!(
        "HTTP/1.1 {status} {status_message}\r\n\
         Content-Type: application/json; charset=utf-8\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\r\n",
        body_bytes.len()
    );
    stream.write_all(header.as_bytes()).await?;
    stream.write_all(body_bytes).await?;
    stream.flush().await
}

fn extract_agent_id(path: &str) -> Option<&str> {
    path.strip_prefix("/agent/").filter(|s| !s.is_empty())
}

pub struct HttpServer {
    pool: Arc<AgentPool>,
    global_dispatcher: Arc<GlobalDispatcher>,
    token: Option<String>,
}

impl HttpServer {
    pub fn new(pool: Arc<AgentPool>, global_dispatcher: Arc<GlobalDispatcher>, token: Option<String>) -> Self {
        Self { pool, global_dispatcher, token }
    }

    /// Bind and serve until the pool or the global dispatcher signals
    /// shutdown. `host` must be a loopback address.
    pub async fn run(&self, host: &str, port: u16) -> std::io::Result<()> {
        if !matches!(host, "127.0.0.1" | "localhost" | "::1") {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("HTTP server must bind to localhost only, not {host:?}"),
            ));
        }

        let listener = TcpListener::bind((host, port)).await?;
        tracing::info!(%host, %port, "JSON-RPC HTTP server listening");

        loop {
            if self.pool.should_shutdown().await || self.global_dispatcher.shutdown_requested() {
                tracing::info!("HTTP server stopping");
                return Ok(());
            }

            let accept = tokio::time::timeout(Duration::from_millis(100), listener.accept()).await;
            let Ok(accept) = accept else { continue };
            let (stream, _) = accept?;

            let pool = self.pool.clone();
            let global_dispatcher = self.global_dispatcher.clone();
            let token = self.token.clone();
            tokio::spawn(async move {
                handle_connection(stream, pool, global_dispatcher, token).await;
            });
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    pool: Arc<AgentPool>,
    global_dispatcher: Arc<GlobalDispatcher>,
    token: Option<String>,
) {
    let mut reader = BufReader::new(stream);
    let http_request = match read_http_request(&mut reader).await {
        Ok(req) => req,
        Err(e) => {
            let mut stream = reader.into_inner();
            let _ = send_http_response(&mut stream, 400, &format!("{{\"error\": \"{e}\"}}")).await;
            return;
        }
    };
    let mut stream = reader.into_inner();

    if http_request.method != "POST" {
        let _ = send_http_response(&mut stream, 405, "{\"error\": \"Method not allowed. Use POST.\"}").await;
        return;
    }

    if let Some(expected) = &token {
        match http_request.header("authorization") {
            None => {
                let resp = make_error_response(None, INVALID_REQUEST, "Authorization header required", None);
                let _ = send_http_response(&mut stream, 401, &serialize_response(&resp)).await;
                return;
            }
            Some(header) => {
                let provided = header.strip_prefix("Bearer ").unwrap_or("");
                if !validate_api_key(provided, expected) {
                    let resp = make_error_response(None, INVALID_REQUEST, "Invalid token", None);
                    let _ = send_http_response(&mut stream, 403, &serialize_response(&resp)).await;
                    return;
                }
            }
        }
    }

    let requester_id = http_request.header("x-nexus-agent").map(str::to_string);

    let rpc_request = match parse_request(&http_request.body) {
        Ok(req) => req,
        Err(e) if e.is_syntax() => {
            let resp = make_error_response(None, PARSE_ERROR, e.message(), None);
            let _ = send_http_response(&mut stream, 400, &serialize_response(&resp)).await;
            return;
        }
        Err(e) => {
            let resp = make_error_response(None, INVALID_REQUEST, e.message(), None);
            let _ = send_http_response(&mut stream, 200, &serialize_response(&resp)).await;
            return;
        }
    };

    let rpc_response = if matches!(http_request.path.as_str(), "/" | "/rpc") {
        global_dispatcher.dispatch(rpc_request, requester_id.as_deref()).await
    } else if let Some(agent_id) = extract_agent_id(&http_request.path) {
        if crate::agent_id::validate_agent_id(agent_id).is_err() {
            let _ = send_http_response(&mut stream, 404, &format!("{{\"error\": \"Not found: {agent_id}\"}}")).await;
            return;
        }
        let session_manager = crate::session::FilesystemSessionManager::new(pool.base_log_dir().to_path_buf());
        match pool.get_or_restore(agent_id, &session_manager).await {
            Ok(Some(agent)) => {
                let span = agent.log_span.clone();
                agent.dispatcher.dispatch(rpc_request).instrument(span).await
            }
            Ok(None) => {
                let _ = send_http_response(
                    &mut stream,
                    404,
                    &format!("{{\"error\": \"Agent not found: {agent_id}\"}}"),
                )
                .await;
                return;
            }
            Err(e) => {
                let resp = make_error_response(None, e.rpc_code(), e.to_string(), None);
                let _ = send_http_response(&mut stream, 200, &serialize_response(&resp)).await;
                return;
            }
        }
    } else {
        let _ = send_http_response(&mut stream, 404, "{\"error\": \"Not found. Use /, /rpc, or /agent/{agent_id}.\"}").await;
        return;
    };

    match rpc_response {
        Some(response) => {
            let _ = send_http_response(&mut stream, 200, &serialize_response(&response)).await;
        }
        None => {
            let _ = send_http_response(&mut stream, 200, "").await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_agent_id_requires_nonempty_suffix() {
        assert_eq!(extract_agent_id("/agent/w1"), Some("w1"));
        assert_eq!(extract_agent_id("/agent/"), None);
        assert_eq!(extract_agent_id("/rpc"), None);
    }
}
