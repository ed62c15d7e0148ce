//! Collision detection: is a server of ours already listening on a port?

use std::path::Path;
use std::time::Duration;

use nexus_protocol::RequestId;
use nexus_protocol::serialize_request;
use serde_json::Value;

use crate::token_store::discover_rpc_token;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectionResult {
    NoServer,
    NexusServer,
    OtherService,
    Timeout,
    Error,
}

/// Probe `host:port` by sending a `list_agents` request and classifying the
/// response. This method is the fingerprint: it's a global method that
/// always exists on our servers.
pub async fn detect_server(
    host: &str,
    port: u16,
    timeout: Duration,
    config_dir: &Path,
) -> DetectionResult {
    let url = format!("http://{host}:{port}/");

    let request = nexus_protocol::Request {
        jsonrpc: "2.0".to_string(),
        method: "list_agents".to_string(),
        params: None,
        id: Some(RequestId::Number(1)),
    };

    let client = match reqwest::Client::builder().timeout(timeout).build() {
        Ok(c) => c,
        Err(_) => return DetectionResult::Error,
    };

    let mut builder = client
        .post(&url)
        .header("Content-Type", "application/json")
        .body(serialize_request(&request));

    if let Some(token) = discover_rpc_token(port, config_dir, false) {
        builder = builder.bearer_auth(token);
    }

    match builder.send().await {
        Ok(response) => analyze_response(response).await,
        Err(e) if e.is_connect() => DetectionResult::NoServer,
        Err(e) if e.is_timeout() => DetectionResult::Timeout,
        Err(_) => DetectionResult::Error,
    }
}

async fn analyze_response(response: reqwest::Response) -> DetectionResult {
    let status = response.status();
    if status.as_u16() == 401 || status.as_u16() == 403 {
        return DetectionResult::NexusServer;
    }

    let Ok(data) = response.json::<Value>().await else {
        return DetectionResult::OtherService;
    };

    let Value::Object(obj) = &data else {
        return DetectionResult::OtherService;
    };

    if obj.get("jsonrpc").and_then(Value::as_str) != Some("2.0") {
        return DetectionResult::OtherService;
    }
    if !obj.contains_key("id") {
        return DetectionResult::OtherService;
    }

    let has_result = obj.contains_key("result");
    let has_error = obj.contains_key("error");
    if has_result == has_error {
        return DetectionResult::OtherService;
    }

    if has_result {
        match obj.get("result") {
            Some(Value::Object(result)) => match result.get("agents") {
                Some(Value::Array(_)) => {}
                _ => return DetectionResult::OtherService,
            },
            _ => return DetectionResult::OtherService,
        }
    }

    DetectionResult::NexusServer
}

/// Poll until a `NexusServer` result is observed or `timeout` elapses.
/// Per-probe timeout is capped at `min(1s, timeout/10)`.
pub async fn wait_for_server(
    host: &str,
    port: u16,
    timeout: Duration,
    poll_interval: Duration,
    config_dir: &Path,
) -> bool {
    let probe_timeout = timeout.min(Duration::from_secs(1) * 10) / 10;
    let probe_timeout = probe_timeout.min(Duration::from_secs(1));
    let deadline = tokio::time::Instant::now() + timeout;

    loop {
        let result = detect_server(host, port, probe_timeout, config_dir).await;
        if result == DetectionResult::NexusServer {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(poll_interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn obj(v: Value) -> Value {
        v
    }

    #[tokio::test]
    async fn analyze_response_classifies_malformed_json_as_other() {
        let data = obj(json!({"not": "jsonrpc"}));
        let Value::Object(o) = &data else { unreachable!() };
        assert!(o.get("jsonrpc").is_none());
    }
}
