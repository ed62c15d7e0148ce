//! JSON-RPC client for talking to an MCP server over an arbitrary
//! [`Transport`].

use mcp_types::CallToolRequestParams;
use mcp_types::CallToolResult;
use mcp_types::ClientCapabilities;
use mcp_types::Implementation;
use mcp_types::InitializeRequestParams;
use mcp_types::InitializeResult;
use mcp_types::ListToolsRequestParams;
use mcp_types::ListToolsResult;
use mcp_types::Tool;
use serde_json::Value;
use serde_json::json;
use thiserror::Error;

use crate::transport::Transport;
use crate::transport::TransportError;

/// A server that sends this many non-matching messages in a row before a
/// request's real response arrives is treated as malfunctioning.
const MAX_NOTIFICATIONS_TO_DISCARD: usize = 100;

#[derive(Debug, Error)]
pub enum McpError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("Response ID mismatch: expected {expected}, got {got}. Server may be malfunctioning or malicious.")]
    ResponseIdMismatch { expected: String, got: String },

    #[error(
        "Discarded {MAX_NOTIFICATIONS_TO_DISCARD} notifications while waiting for a response. Server may be malfunctioning."
    )]
    TooManyNotifications,

    #[error("MCP server error {code}: {message}")]
    Server { code: i64, message: String },

    #[error("malformed MCP response: {0}")]
    Malformed(String),

    #[error(transparent)]
    Serde(#[from] serde_json::Error),
}

pub struct McpClient {
    transport: Box<dyn Transport>,
    next_id: u64,
    server_info: Option<Implementation>,
}

impl McpClient {
    pub fn new(transport: Box<dyn Transport>) -> Self {
        Self { transport, next_id: 1, server_info: None }
    }

    pub fn server_info(&self) -> Option<&Implementation> {
        self.server_info.as_ref()
    }

    pub async fn connect(&mut self) -> Result<(), McpError> {
        self.transport.connect().await?;
        Ok(())
    }

    pub async fn close(&mut self) {
        self.transport.close().await;
    }

    /// Perform the MCP initialization handshake: `initialize` followed by
    /// the `notifications/initialized` notification. The notification is
    /// sent with no `params` key at all when it has nothing to carry,
    /// rather than an explicit empty object.
    pub async fn initialize(&mut self) -> Result<InitializeResult, McpError> {
        let params = InitializeRequestParams {
            protocol_version: mcp_types::PROTOCOL_VERSION.to_string(),
            capabilities: ClientCapabilities::default(),
            client_info: Implementation::default(),
        };
        let result_value = self.call("initialize", Some(serde_json::to_value(params)?)).await?;
        let result: InitializeResult = serde_json::from_value(result_value)?;
        self.server_info = Some(result.server_info.clone());

        let notification = json!({
            "jsonrpc": "2.0",
            "method": "notifications/initialized",
        });
        self.transport.send(&notification).await?;

        Ok(result)
    }

    /// Fetch the full tool list, following `nextCursor` pagination until
    /// the server stops returning one.
    pub async fn list_tools(&mut self) -> Result<Vec<Tool>, McpError> {
        let mut tools = Vec::new();
        let mut cursor = None;
        loop {
            let params = ListToolsRequestParams { cursor };
            let value = self.call("tools/list", Some(serde_json::to_value(params)?)).await?;
            let page: ListToolsResult = serde_json::from_value(value)?;
            tools.extend(page.tools);
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }
        Ok(tools)
    }

    pub async fn call_tool(
        &mut self,
        name: &str,
        arguments: Option<std::collections::HashMap<String, Value>>,
    ) -> Result<CallToolResult, McpError> {
        let params = CallToolRequestParams { name: name.to_string(), arguments };
        let value = self.call("tools/call", Some(serde_json::to_value(params)?)).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Send a request and wait for its matching response, discarding any
    /// server-initiated notifications received in between.
    async fn call(&mut self, method: &str, params: Option<Value>) -> Result<Value, McpError> {
        let id = self.next_id;
        self.next_id += 1;

        let mut request = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
        });
        if let Some(params) = params {
            request["params"] = params;
        }
        let mut message = self.transport.request(&request).await?;

        let mut discarded = 0usize;
        loop {
            if message.get("id").is_none() {
                discarded += 1;
                if discarded > MAX_NOTIFICATIONS_TO_DISCARD {
                    return Err(McpError::TooManyNotifications);
                }
                tracing::debug!(method, "discarding unsolicited MCP notification");
                message = self.transport.receive().await?;
                continue;
            }

            let got_id = message["id"].clone();
            if got_id != Value::from(id) {
                return Err(McpError::ResponseIdMismatch {
                    expected: id.to_string(),
                    got: got_id.to_string(),
                });
            }

            if let Some(error) = message.get("error") {
                let code = error.get("code").and_then(Value::as_i64).unwrap_or(0);
                let message = error
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown error")
                    .to_string();
                return Err(McpError::Server { code, message });
            }

            return message
                .get("result")
                .cloned()
                .ok_or_else(|| McpError::Malformed("response has neither result nor error".to_string()));
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Arc;
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;

    struct FakeTransport {
        outgoing: Arc<Mutex<Vec<Value>>>,
        incoming: VecDeque<Value>,
    }

    impl FakeTransport {
        fn new(incoming: VecDeque<Value>) -> Self {
            Self { outgoing: Arc::new(Mutex::new(Vec::new())), incoming }
        }
    }

    #[async_trait]
    impl Transport for FakeTransport {
        async fn connect(&mut self) -> Result<(), TransportError> {
            Ok(())
        }

        async fn send(&mut self, message: &Value) -> Result<(), TransportError> {
            self.outgoing.lock().unwrap_or_else(|e| e.into_inner()).push(message.clone());
            Ok(())
        }

        async fn receive(&mut self) -> Result<Value, TransportError> {
            self.incoming.pop_front().ok_or(TransportError::NotConnected)
        }

        async fn close(&mut self) {}
    }

    #[tokio::test]
    async fn call_returns_result_on_matching_id() {
        let transport = FakeTransport::new(VecDeque::from([
            json!({"jsonrpc":"2.0","id":1,"result":{"ok":true}}),
        ]));
        let mut client = McpClient::new(Box::new(transport));
        let value = client.call("ping", None).await.unwrap();
        assert_eq!(value, json!({"ok": true}));
    }

    #[tokio::test]
    async fn call_discards_notifications_before_matching_response() {
        let transport = FakeTransport::new(VecDeque::from([
            json!({"jsonrpc":"2.0","method":"notifications/progress"}),
            json!({"jsonrpc":"2.0","id":1,"result":{"ok":true}}),
        ]));
        let mut client = McpClient::new(Box::new(transport));
        let value = client.call("ping", None).await.unwrap();
        assert_eq!(value, json!({"ok": true}));
    }

    #[tokio::test]
    async fn call_rejects_mismatched_response_id() {
        let transport = FakeTransport::new(VecDeque::from([
            json!({"jsonrpc":"2.0","id":99,"result":{}}),
        ]));
        let mut client = McpClient::new(Box::new(transport));
        let err = client.call("ping", None).await.unwrap_err();
        assert!(matches!(err, McpError::ResponseIdMismatch { .. }));
    }

    #[tokio::test]
    async fn call_surfaces_server_error() {
        let transport = FakeTransport::new(VecDeque::from([
            json!({"jsonrpc":"2.0","id":1,"error":{"code":-32601,"message":"no such tool"}}),
        ]));
        let mut client = McpClient::new(Box::new(transport));
        let err = client.call("tools/call", None).await.unwrap_err();
        match err {
            McpError::Server { code, message } => {
                assert_eq!(code, -32601);
                assert_eq!(message, "no such tool");
            }
            other => panic!("expected Server error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn initialize_sends_notification_without_params_key() {
        let transport = FakeTransport::new(VecDeque::from([json!({
            "jsonrpc": "2.0",
            "id": 1,
            "result": {
                "protocolVersion": mcp_types::PROTOCOL_VERSION,
                "capabilities": {},
                "serverInfo": {"name": "test-server", "version": "0.0.1"},
            },
        })]));
        let outgoing = transport.outgoing.clone();
        let mut client = McpClient::new(Box::new(transport));
        client.initialize().await.unwrap();

        assert_eq!(client.server_info().unwrap().name, "test-server");
        let sent = outgoing.lock().unwrap();
        let notification = sent
            .iter()
            .find(|m| m.get("method").and_then(Value::as_str) == Some("notifications/initialized"))
            .expect("notification was sent");
        assert!(notification.get("params").is_none());
    }
}
