//! Owns the configured MCP tool servers: lazily connects a `McpClient` per
//! server on first use and gates every call through
//! [`crate::permissions::can_use_mcp`].

use std::collections::HashMap;

use nexus_mcp_client::McpClient;
use nexus_mcp_client::StdioTransport;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::config::McpServerConfig;
use crate::permissions::AgentPermissions;
use crate::permissions::can_use_mcp;

#[derive(Debug, Error)]
pub enum McpManagerError {
    #[error("unknown MCP server: {0}")]
    UnknownServer(String),

    #[error("agent is not permitted to use MCP server '{0}'")]
    PermissionDenied(String),

    #[error(transparent)]
    Client(#[from] nexus_mcp_client::McpError),
}

struct ServerHandle {
    config: McpServerConfig,
    client: Mutex<Option<McpClient>>,
}

pub struct McpManager {
    servers: HashMap<String, ServerHandle>,
}

impl McpManager {
    pub fn new(servers: HashMap<String, McpServerConfig>) -> Self {
        Self {
            servers: servers
                .into_iter()
                .map(|(name, config)| (name, ServerHandle { config, client: Mutex::new(None) }))
                .collect(),
        }
    }

    pub fn server_names(&self) -> Vec<String> {
        self.servers.keys().cloned().collect()
    }

    async fn connected_client<'a>(
        &'a self,
        handle: &'a ServerHandle,
    ) -> Result<tokio::sync::MutexGuard<'a, Option<McpClient>>, McpManagerError> {
        let mut guard = handle.client.lock().await;
        if guard.is_none() {
            let mut command = vec![handle.config.command.clone()];
            command.extend(handle.config.args.clone());
            let env = handle.config.env.clone().unwrap_or_default().into_iter().collect();
            let transport =
                StdioTransport::with_passthrough(command, env, handle.config.env_passthrough.clone(), None);
            let mut client = McpClient::new(Box::new(transport));
            client.connect().await?;
            client.initialize().await?;
            *guard = Some(client);
        }
        Ok(guard)
    }

    pub async fn list_tools(
        &self,
        server_name: &str,
        requester_permissions: Option<&AgentPermissions>,
    ) -> Result<Vec<mcp_types::Tool>, McpManagerError> {
        let handle = self
            .servers
            .get(server_name)
            .ok_or_else(|| McpManagerError::UnknownServer(server_name.to_string()))?;
        if !can_use_mcp(requester_permissions, server_name) {
            return Err(McpManagerError::PermissionDenied(server_name.to_string()));
        }
        let mut guard = self.connected_client(handle).await?;
        let client = guard.as_mut().expect("connected_client always leaves Some");
        Ok(client.list_tools().await?)
    }

    pub async fn call_tool(
        &self,
        server_name: &str,
        requester_permissions: Option<&AgentPermissions>,
        tool_name: &str,
        arguments: Option<HashMap<String, Value>>,
    ) -> Result<mcp_types::CallToolResult, McpManagerError> {
        let handle = self
            .servers
            .get(server_name)
            .ok_or_else(|| McpManagerError::UnknownServer(server_name.to_string()))?;
        if !can_use_mcp(requester_permissions, server_name) {
            return Err(McpManagerError::PermissionDenied(server_name.to_string()));
        }
        let mut guard = self.connected_client(handle).await?;
        let client = guard.as_mut().expect("connected_client always leaves Some");
        Ok(client.call_tool(tool_name, arguments).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_names_reflects_config() {
        let mut servers = HashMap::new();
        servers.insert(
            "fs".to_string(),
            McpServerConfig { command: "mcp-fs".to_string(), args: vec![], env: None, env_passthrough: vec![] },
        );
        let manager = McpManager::new(servers);
        assert_eq!(manager.server_names(), vec!["fs".to_string()]);
    }

    #[tokio::test]
    async fn unknown_server_is_rejected() {
        let manager = McpManager::new(HashMap::new());
        let err = manager.list_tools("missing", None).await.unwrap_err();
        assert!(matches!(err, McpManagerError::UnknownServer(_)));
    }

    #[tokio::test]
    async fn denies_by_default_with_no_permissions() {
        let mut servers = HashMap::new();
        servers.insert(
            "fs".to_string(),
            McpServerConfig { command: "mcp-fs".to_string(), args: vec![], env: None, env_passthrough: vec![] },
        );
        let manager = McpManager::new(servers);
        let err = manager.list_tools("fs", None).await.unwrap_err();
        assert!(matches!(err, McpManagerError::PermissionDenied(_)));
    }
}
