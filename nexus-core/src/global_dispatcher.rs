//! Routes the global (non-agent-specific) RPC methods that operate on the
//! pool rather than a single agent's session: `create_agent`,
//! `destroy_agent`, `list_agents`, `shutdown_server`.

use std::path::Path;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use nexus_protocol::Request;
use nexus_protocol::RequestId;
use nexus_protocol::Response;
use serde_json::Value;
use serde_json::json;

use crate::dispatch_core::DispatchError;
use crate::dispatch_core::respond;
use crate::permissions::AgentPermissions;
use crate::permissions::PermissionDelta;
use crate::permissions::ToolPermission;
use crate::permissions::validate_path;
use crate::pool::AgentConfig;
use crate::pool::AgentPool;
use crate::pool::AuthorizationError;
use crate::error::NexusError;

const WRITE_FILE_TOOLS: [&str; 5] = ["write_file", "edit_file", "append_file", "regex_replace", "mkdir"];
const MIXED_FILE_TOOLS: [&str; 2] = ["copy_file", "rename"];
const VALID_PRESETS: [&str; 3] = ["trusted", "sandboxed", "worker"];

pub struct GlobalDispatcher {
    pool: Arc<AgentPool>,
    shutdown_requested: AtomicBool,
}

impl GlobalDispatcher {
    pub fn new(pool: Arc<AgentPool>) -> Self {
        Self {
            pool,
            shutdown_requested: AtomicBool::new(false),
        }
    }

    pub fn shutdown_requested(&self) -> bool {
        self.shutdown_requested.load(Ordering::SeqCst)
    }

    /// Signal shutdown without going through the `shutdown_server` RPC,
    /// e.g. in response to a process signal.
    pub fn request_shutdown(&self) {
        self.shutdown_requested.store(true, Ordering::SeqCst);
    }

    pub async fn dispatch(&self, request: Request, requester_id: Option<&str>) -> Option<Response> {
        let id = request.id.clone();
        let params = request.params.clone().unwrap_or(json!({}));
        let outcome = match request.method.as_str() {
            "create_agent" => self.handle_create_agent(params).await,
            "destroy_agent" => self.handle_destroy_agent(params, requester_id).await,
            "list_agents" => self.handle_list_agents().await,
            "shutdown_server" => self.handle_shutdown_server().await,
            other => Err(DispatchError::InvalidParams(format!("Method not found: {other}"))),
        };
        respond(id, outcome)
    }

    async fn handle_create_agent(&self, params: Value) -> Result<Value, DispatchError> {
        let agent_id = optional_string(&params, "agent_id")?;
        let system_prompt = optional_string(&params, "system_prompt")?;
        let preset = optional_string(&params, "preset")?;
        let disable_tools = optional_string_array(&params, "disable_tools")?;
        let parent_agent_id = optional_string(&params, "parent_agent_id")?;
        let cwd_param = optional_string(&params, "cwd")?;
        let allowed_write_paths = optional_string_array(&params, "allowed_write_paths")?;
        let model = optional_string(&params, "model")?;
        let initial_message = optional_string(&params, "initial_message")?;

        if let Some(preset) = &preset
            && !VALID_PRESETS.contains(&preset.as_str())
        {
            return Err(DispatchError::InvalidParams(format!(
                "Invalid preset: {preset}. Valid: [\"sandboxed\", \"trusted\", \"worker\"]"
            )));
        }

        if let Some(msg) = &initial_message
            && msg.trim().is_empty()
        {
            return Err(DispatchError::InvalidParams("initial_message cannot be empty".into()));
        }

        let (parent_permissions, parent_cwd) = match &parent_agent_id {
            None => (None, None),
            Some(parent_id) => {
                let parent = self
                    .pool
                    .get(parent_id)
                    .await
                    .ok_or_else(|| DispatchError::InvalidParams(format!("Parent agent not found: {parent_id}")))?;
                (
                    Some(parent.services.permissions.clone()),
                    parent.services.cwd.clone(),
                )
            }
        };

        let cwd_path = resolve_cwd(cwd_param, parent_cwd.as_deref(), parent_permissions.as_ref())?;

        let write_paths = resolve_write_paths(
            allowed_write_paths,
            cwd_path.as_deref(),
            parent_cwd.as_deref(),
            preset.as_deref().unwrap_or("sandboxed"),
        )?;

        let delta = build_delta(disable_tools, write_paths, preset.as_deref().unwrap_or("sandboxed"));

        let config = AgentConfig {
            agent_id: agent_id.clone(),
            system_prompt,
            preset,
            cwd: cwd_path.clone(),
            delta,
            parent_permissions,
            parent_agent_id: parent_agent_id.clone(),
            model,
            wait_for_initial_response: false,
        };

        let agent = self
            .pool
            .create(agent_id, config)
            .await
            .map_err(nexus_error_to_dispatch)?;

        tracing::info!(
            agent_id = %agent.agent_id,
            cwd = ?cwd_path,
            "agent created",
        );

        let mut result = json!({
            "agent_id": agent.agent_id,
            "url": format!("/agent/{}", agent.agent_id),
        });

        if let Some(content) = initial_message {
            let wait_for_initial_response = params
                .get("wait_for_initial_response")
                .map(|v| {
                    v.as_bool()
                        .ok_or_else(|| DispatchError::InvalidParams("wait_for_initial_response must be boolean".into()))
                })
                .transpose()?
                .unwrap_or(false);

            let request_id = uuid::Uuid::new_v4().to_string();
            result["initial_request_id"] = json!(request_id);

            let send_request = Request {
                jsonrpc: "2.0".to_string(),
                method: "send".to_string(),
                params: Some(json!({"content": content, "request_id": request_id})),
                id: Some(RequestId::String("initial_message".to_string())),
            };

            if wait_for_initial_response {
                match agent.dispatcher.dispatch(send_request).await {
                    Some(response) if response.result.is_some() => {
                        result["response"] = response.result.unwrap();
                    }
                    Some(response) if response.error.is_some() => {
                        result["response"] = json!({"error": response.error});
                    }
                    _ => {}
                }
            } else {
                let agent = agent.clone();
                tokio::spawn(async move {
                    if let Some(response) = agent.dispatcher.dispatch(send_request).await
                        && let Some(error) = response.error
                    {
                        tracing::error!(agent_id = %agent.agent_id, error = ?error, "background initial message failed");
                    }
                });
                result["initial_status"] = json!("queued");
            }
        }

        Ok(result)
    }

    async fn handle_destroy_agent(&self, params: Value, requester_id: Option<&str>) -> Result<Value, DispatchError> {
        let agent_id = params
            .get("agent_id")
            .and_then(Value::as_str)
            .ok_or_else(|| DispatchError::InvalidParams("Missing required parameter: agent_id".into()))?
            .to_string();

        let success = self
            .pool
            .destroy(&agent_id, requester_id, false)
            .await
            .map_err(nexus_error_to_dispatch)?;

        if success {
            tracing::info!(%agent_id, requester = requester_id.unwrap_or("external"), "agent destroyed");
        } else {
            tracing::warn!(%agent_id, "agent destroy failed: not found");
        }

        Ok(json!({"success": success, "agent_id": agent_id}))
    }

    async fn handle_list_agents(&self) -> Result<Value, DispatchError> {
        let agents = self.pool.list().await;
        Ok(json!({"agents": agents}))
    }

    async fn handle_shutdown_server(&self) -> Result<Value, DispatchError> {
        self.shutdown_requested.store(true, Ordering::SeqCst);
        tracing::info!("server shutdown requested");
        Ok(json!({"success": true, "message": "Server shutting down"}))
    }
}

fn nexus_error_to_dispatch(err: NexusError) -> DispatchError {
    if let NexusError::Authorization(AuthorizationError { requester, target }) = &err {
        return DispatchError::InvalidParams(format!(
            "agent '{requester}' is not authorized to destroy agent '{target}'"
        ));
    }
    DispatchError::InvalidParams(err.to_string())
}

fn optional_string(params: &Value, key: &str) -> Result<Option<String>, DispatchError> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(other) => Err(DispatchError::InvalidParams(format!(
            "{key} must be string, got: {}",
            type_name(other)
        ))),
    }
}

fn optional_string_array(params: &Value, key: &str) -> Result<Option<Vec<String>>, DispatchError> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Array(items)) => {
            let mut out = Vec::with_capacity(items.len());
            for (i, item) in items.iter().enumerate() {
                match item {
                    Value::String(s) => out.push(s.clone()),
                    other => {
                        return Err(DispatchError::InvalidParams(format!(
                            "{key}[{i}] must be string, got: {}",
                            type_name(other)
                        )));
                    }
                }
            }
            Ok(Some(out))
        }
        Some(other) => Err(DispatchError::InvalidParams(format!(
            "{key} must be array, got: {}",
            type_name(other)
        ))),
    }
}

fn type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn resolve_cwd(
    cwd_param: Option<String>,
    parent_cwd: Option<&Path>,
    parent_permissions: Option<&AgentPermissions>,
) -> Result<Option<PathBuf>, DispatchError> {
    let cwd_path = match cwd_param {
        Some(raw) => {
            let input = PathBuf::from(&raw);
            let base = if input.is_absolute() {
                input.clone()
            } else if let Some(parent_cwd) = parent_cwd {
                parent_cwd.join(&input)
            } else {
                input.clone()
            };
            let resolved = validate_path(&base, &std::env::current_dir().unwrap_or_default(), None)
                .map_err(|e| DispatchError::InvalidParams(format!("cwd invalid: {e}")))?;
            if !resolved.exists() {
                return Err(DispatchError::InvalidParams(format!("cwd does not exist: {}", resolved.display())));
            }
            if !resolved.is_dir() {
                return Err(DispatchError::InvalidParams(format!("cwd is not a directory: {}", resolved.display())));
            }
            Some(resolved)
        }
        None => parent_cwd.map(Path::to_path_buf),
    };

    if let (Some(cwd), Some(perms)) = (&cwd_path, parent_permissions) {
        if let Some(allowed) = &perms.effective_policy.allowed_paths {
            validate_path(cwd, cwd, Some(allowed))
                .map_err(|_| DispatchError::InvalidParams(format!("cwd '{}' is outside parent's allowed paths", cwd.display())))?;
        }
        if let Some(parent_cwd) = parent_cwd
            && !cwd.starts_with(parent_cwd)
        {
            return Err(DispatchError::InvalidParams(format!(
                "cwd '{}' is outside parent's cwd '{}'",
                cwd.display(),
                parent_cwd.display()
            )));
        }
    }

    Ok(cwd_path)
}

fn resolve_write_paths(
    allowed_write_paths: Option<Vec<String>>,
    cwd_path: Option<&Path>,
    parent_cwd: Option<&Path>,
    effective_preset: &str,
) -> Result<Option<Vec<PathBuf>>, DispatchError> {
    let Some(raw_paths) = allowed_write_paths else {
        return Ok(None);
    };

    let base = cwd_path
        .map(Path::to_path_buf)
        .unwrap_or_else(|| std::env::current_dir().unwrap_or_default());

    let write_paths: Vec<PathBuf> = raw_paths
        .into_iter()
        .map(|wp| {
            let wp_path = PathBuf::from(wp);
            if wp_path.is_absolute() { wp_path } else { base.join(wp_path) }
        })
        .collect();

    if matches!(effective_preset, "sandboxed" | "worker") {
        let sandbox_root = cwd_path.unwrap_or(&base);
        for wp in &write_paths {
            if !wp.starts_with(sandbox_root) {
                return Err(DispatchError::InvalidParams(format!(
                    "allowed_write_path '{}' is outside sandbox root '{}'",
                    wp.display(),
                    sandbox_root.display()
                )));
            }
        }
    }

    if let Some(parent_cwd) = parent_cwd {
        for wp in &write_paths {
            if !wp.starts_with(parent_cwd) {
                return Err(DispatchError::InvalidParams(format!(
                    "allowed_write_path '{}' is outside parent's cwd '{}'",
                    wp.display(),
                    parent_cwd.display()
                )));
            }
        }
    }

    Ok(Some(write_paths))
}

fn build_delta(
    disable_tools: Option<Vec<String>>,
    write_paths: Option<Vec<PathBuf>>,
    effective_preset: &str,
) -> Option<PermissionDelta> {
    let mut delta = PermissionDelta::default();
    let mut touched = false;

    if let Some(tools) = disable_tools
        && !tools.is_empty()
    {
        delta.disable_tools = tools;
        touched = true;
    }

    if matches!(effective_preset, "sandboxed" | "worker") {
        touched = true;
        match &write_paths {
            Some(paths) if !paths.is_empty() => {
                for tool in WRITE_FILE_TOOLS.iter().chain(MIXED_FILE_TOOLS.iter()) {
                    delta
                        .tool_overrides
                        .insert(tool.to_string(), ToolPermission::enabled_with_paths(paths.clone()));
                }
            }
            _ => {
                for tool in WRITE_FILE_TOOLS.iter().chain(MIXED_FILE_TOOLS.iter()) {
                    delta.tool_overrides.insert(tool.to_string(), ToolPermission::disabled());
                }
            }
        }
    } else if let Some(paths) = &write_paths {
        touched = true;
        for tool in WRITE_FILE_TOOLS.iter().chain(MIXED_FILE_TOOLS.iter()) {
            delta
                .tool_overrides
                .insert(tool.to_string(), ToolPermission::enabled_with_paths(paths.clone()));
        }
    }

    touched.then_some(delta)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::SharedComponents;
    use crate::session::EchoSession;
    use crate::session::Session;

    fn make_dispatcher() -> GlobalDispatcher {
        let shared = Arc::new(SharedComponents::new(PathBuf::from("/tmp/nexus-test-logs")));
        let pool = Arc::new(AgentPool::new(shared, Box::new(|| Arc::new(EchoSession) as Arc<dyn Session>)));
        GlobalDispatcher::new(pool)
    }

    fn req(method: &str, params: Value) -> Request {
        Request {
            jsonrpc: "2.0".to_string(),
            method: method.to_string(),
            params: Some(params),
            id: Some(RequestId::Number(1)),
        }
    }

    #[tokio::test]
    async fn create_agent_rejects_yolo_preset() {
        let d = make_dispatcher();
        let resp = d
            .dispatch(req("create_agent", json!({"agent_id": "a", "preset": "yolo"})), None)
            .await
            .unwrap();
        assert_eq!(resp.error.unwrap().code, nexus_protocol::INVALID_PARAMS);
    }

    #[tokio::test]
    async fn create_agent_assigns_requested_id() {
        let d = make_dispatcher();
        let resp = d
            .dispatch(req("create_agent", json!({"agent_id": "a1"})), None)
            .await
            .unwrap();
        let result = resp.result.unwrap();
        assert_eq!(result["agent_id"], "a1");
        assert_eq!(result["url"], "/agent/a1");
    }

    #[tokio::test]
    async fn destroy_agent_requires_agent_id() {
        let d = make_dispatcher();
        let resp = d.dispatch(req("destroy_agent", json!({})), None).await.unwrap();
        assert_eq!(resp.error.unwrap().code, nexus_protocol::INVALID_PARAMS);
    }

    #[tokio::test]
    async fn list_agents_returns_created_agents() {
        let d = make_dispatcher();
        d.dispatch(req("create_agent", json!({"agent_id": "a1"})), None).await;
        let resp = d.dispatch(req("list_agents", json!({})), None).await.unwrap();
        let agents = resp.result.unwrap()["agents"].as_array().unwrap().len();
        assert_eq!(agents, 1);
    }

    #[tokio::test]
    async fn shutdown_server_sets_flag() {
        let d = make_dispatcher();
        assert!(!d.shutdown_requested());
        d.dispatch(req("shutdown_server", json!({})), None).await;
        assert!(d.shutdown_requested());
    }
}
