//! Central lifecycle authority for agents: creation ordering, parent/child
//! tracking, atomic get-or-restore, and destruction.

use std::collections::HashMap;
use std::collections::HashSet;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use chrono::DateTime;
use chrono::Utc;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::agent_id::validate_agent_id;
use crate::dispatcher::Dispatcher;
use crate::error::NexusError;
use crate::permissions::AgentPermissions;
use crate::session::ContextManager;
use crate::session::NullContextManager;
use crate::session::Session;
use crate::session::SessionManager;

pub const MAX_AGENT_DEPTH: u32 = 5;

#[derive(Debug, Error)]
#[error("agent '{requester}' is not authorized to destroy agent '{target}'")]
pub struct AuthorizationError {
    pub requester: String,
    pub target: String,
}

/// Immutable, process-wide bundle threaded through every agent.
pub struct SharedComponents {
    pub base_log_dir: PathBuf,
    pub custom_presets: HashMap<String, String>,
    pub mcp_manager: Option<Arc<crate::mcp_manager::McpManager>>,
}

impl SharedComponents {
    pub fn new(base_log_dir: PathBuf) -> Self {
        Self {
            base_log_dir,
            custom_presets: HashMap::new(),
            mcp_manager: None,
        }
    }

    pub fn with_mcp_manager(mut self, mcp_manager: Arc<crate::mcp_manager::McpManager>) -> Self {
        self.mcp_manager = Some(mcp_manager);
        self
    }
}

/// Heterogeneous per-agent values. Modeled as a struct with optional typed
/// fields rather than a type-erased map, per the design note on the service
/// bag: the set of keys is finite and known up front.
pub struct ServiceBag {
    pub cwd: Option<PathBuf>,
    pub parent_agent_id: Option<String>,
    pub model: Option<String>,
    pub permissions: AgentPermissions,
}

/// Creation-time parameter object.
#[derive(Default)]
pub struct AgentConfig {
    pub agent_id: Option<String>,
    pub system_prompt: Option<String>,
    pub preset: Option<String>,
    pub cwd: Option<PathBuf>,
    pub delta: Option<crate::permissions::PermissionDelta>,
    pub parent_permissions: Option<AgentPermissions>,
    pub parent_agent_id: Option<String>,
    pub model: Option<String>,
    pub wait_for_initial_response: bool,
}

pub struct Agent {
    pub agent_id: String,
    pub is_temp: bool,
    pub system_prompt: Option<String>,
    pub services: ServiceBag,
    pub dispatcher: Arc<Dispatcher>,
    pub context: Arc<dyn ContextManager>,
    pub created_at: DateTime<Utc>,
    pub last_action_at: StdMutex<Option<DateTime<Utc>>>,
    /// Tags every log line emitted while handling this agent's requests
    /// with its `agent_id`, entered by the HTTP layer around dispatch.
    pub log_span: tracing::Span,
}

impl Agent {
    pub fn record_action(&self) {
        *self.last_action_at.lock().unwrap_or_else(|e| e.into_inner()) = Some(Utc::now());
    }
}

#[derive(serde::Serialize)]
pub struct AgentInfo {
    pub agent_id: String,
    pub is_temp: bool,
    pub created_at: String,
    pub message_count: usize,
    pub should_shutdown: bool,
    pub parent_agent_id: Option<String>,
    pub child_count: usize,
    pub halted_at_iteration_limit: bool,
    pub model: Option<String>,
    pub last_action_at: Option<String>,
    pub permission_level: Option<String>,
    pub cwd: Option<String>,
    pub write_paths: Option<Vec<String>>,
}

struct PoolInner {
    agents: HashMap<String, Arc<Agent>>,
    children: HashMap<String, HashSet<String>>,
}

pub struct AgentPool {
    inner: Mutex<PoolInner>,
    shared: Arc<SharedComponents>,
    session_factory: Box<dyn Fn() -> Arc<dyn Session> + Send + Sync>,
}

impl AgentPool {
    pub fn new(
        shared: Arc<SharedComponents>,
        session_factory: Box<dyn Fn() -> Arc<dyn Session> + Send + Sync>,
    ) -> Self {
        Self {
            inner: Mutex::new(PoolInner {
                agents: HashMap::new(),
                children: HashMap::new(),
            }),
            shared,
            session_factory,
        }
    }

    pub async fn get(&self, agent_id: &str) -> Option<Arc<Agent>> {
        self.inner.lock().await.agents.get(agent_id).cloned()
    }

    /// Root directory under which each agent's log directory is created.
    pub fn base_log_dir(&self) -> &Path {
        &self.shared.base_log_dir
    }

    pub async fn list(&self) -> Vec<AgentInfo> {
        let guard = self.inner.lock().await;
        guard
            .agents
            .values()
            .map(|agent| {
                let perms = &agent.services.permissions;
                AgentInfo {
                    agent_id: agent.agent_id.clone(),
                    is_temp: agent.is_temp,
                    created_at: agent.created_at.to_rfc3339(),
                    message_count: agent.context.message_count(),
                    should_shutdown: agent.dispatcher.should_shutdown(),
                    parent_agent_id: agent.services.parent_agent_id.clone(),
                    child_count: guard
                        .children
                        .get(&agent.agent_id)
                        .map(|c| c.len())
                        .unwrap_or(0),
                    halted_at_iteration_limit: false,
                    model: agent.services.model.clone(),
                    last_action_at: agent
                        .last_action_at
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .map(|t| t.to_rfc3339()),
                    permission_level: Some(perms.effective_policy.level.to_string()),
                    cwd: agent.services.cwd.as_ref().map(|p| p.display().to_string()),
                    write_paths: perms
                        .tool_permissions
                        .get("write_file")
                        .and_then(|p| p.allowed_paths.as_ref())
                        .map(|paths| paths.iter().map(|p| p.display().to_string()).collect()),
                }
            })
            .collect()
    }

    /// `true` iff the pool is non-empty and every agent has shut down.
    pub async fn should_shutdown(&self) -> bool {
        let guard = self.inner.lock().await;
        !guard.agents.is_empty() && guard.agents.values().all(|a| a.dispatcher.should_shutdown())
    }

    pub async fn get_children(&self, agent_id: &str) -> Vec<String> {
        let guard = self.inner.lock().await;
        guard
            .children
            .get(agent_id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn create(
        &self,
        agent_id: Option<String>,
        config: AgentConfig,
    ) -> Result<Arc<Agent>, NexusError> {
        let mut guard = self.inner.lock().await;
        let resolved_id = config
            .agent_id
            .clone()
            .or(agent_id)
            .unwrap_or_else(|| generate_random_hex(8));
        self.create_locked(&mut guard, resolved_id, false, config)
    }

    /// Generate the next unused `.N` ID (lowest `N >= 1`) and create under
    /// it. The mutex is held across both ID generation and insertion:
    /// releasing between them would admit duplicate IDs under concurrent
    /// callers.
    pub async fn create_temp(&self, config: AgentConfig) -> Result<Arc<Agent>, NexusError> {
        let mut guard = self.inner.lock().await;
        let mut n: u64 = 1;
        loop {
            let candidate = format!(".{n}");
            if !guard.agents.contains_key(&candidate) {
                return self.create_locked(&mut guard, candidate, true, config);
            }
            n += 1;
        }
    }

    fn create_locked(
        &self,
        guard: &mut PoolInner,
        resolved_id: String,
        is_temp: bool,
        config: AgentConfig,
    ) -> Result<Arc<Agent>, NexusError> {
        validate_agent_id(&resolved_id)?;

        if guard.agents.contains_key(&resolved_id) {
            return Err(NexusError::AgentAlreadyExists(resolved_id));
        }

        let log_dir = self.shared.base_log_dir.join(&resolved_id);

        let preset = config.preset.as_deref().unwrap_or("sandboxed");
        let mut permissions = AgentPermissions::from_preset(preset, config.cwd.as_deref());

        if let Some(parent_permissions) = &config.parent_permissions {
            if parent_permissions.depth >= MAX_AGENT_DEPTH {
                return Err(NexusError::MaxDepthExceeded(MAX_AGENT_DEPTH as usize));
            }
            if !parent_permissions.can_grant(&permissions) {
                return Err(NexusError::CeilingExceeded(resolved_id.clone()));
            }
        }

        if let Some(delta) = &config.delta {
            permissions = permissions.apply_delta(delta);
        }

        if let Some(parent_permissions) = &config.parent_permissions
            && !parent_permissions.can_grant(&permissions)
        {
            return Err(NexusError::CeilingExceeded(resolved_id.clone()));
        }

        let depth = config
            .parent_permissions
            .as_ref()
            .map(|p| p.depth + 1)
            .unwrap_or(0);
        permissions.ceiling = config.parent_permissions.map(Box::new);
        permissions.parent_agent_id = config.parent_agent_id.clone();
        permissions.depth = depth;

        std::fs::create_dir_all(&log_dir)?;

        let services = ServiceBag {
            cwd: config.cwd,
            parent_agent_id: config.parent_agent_id.clone(),
            model: config.model,
            permissions,
        };

        let session = (self.session_factory)();
        let context: Arc<dyn ContextManager> = Arc::new(NullContextManager);
        let dispatcher = Arc::new(Dispatcher::new(session, context.clone()));

        let log_span = tracing::info_span!("agent", agent_id = %resolved_id);

        let agent = Arc::new(Agent {
            agent_id: resolved_id.clone(),
            is_temp,
            system_prompt: config.system_prompt,
            services,
            dispatcher,
            context,
            created_at: Utc::now(),
            last_action_at: StdMutex::new(None),
            log_span,
        });

        guard.agents.insert(resolved_id.clone(), agent.clone());
        if let Some(parent_id) = &config.parent_agent_id {
            guard
                .children
                .entry(parent_id.clone())
                .or_default()
                .insert(resolved_id.clone());
        }

        Ok(agent)
    }

    pub async fn destroy(
        &self,
        agent_id: &str,
        requester_id: Option<&str>,
        admin_override: bool,
    ) -> Result<bool, NexusError> {
        let mut guard = self.inner.lock().await;
        let Some(target) = guard.agents.get(agent_id).cloned() else {
            return Ok(false);
        };

        if !admin_override
            && let Some(requester) = requester_id
        {
            let self_destruct = requester == agent_id;
            let parent_destroy = target.services.parent_agent_id.as_deref() == Some(requester);
            if !self_destruct && !parent_destroy {
                return Err(NexusError::Authorization(AuthorizationError {
                    requester: requester.to_string(),
                    target: agent_id.to_string(),
                }));
            }
        }

        guard.agents.remove(agent_id);
        if let Some(parent_id) = &target.services.parent_agent_id
            && let Some(children) = guard.children.get_mut(parent_id)
        {
            children.remove(agent_id);
        }
        guard.children.remove(agent_id);

        target.dispatcher.cancel_all_requests();

        Ok(true)
    }

    /// Atomic get-or-restore: fixes the TOCTOU window between "is it
    /// active?" and "restore it" by holding the pool mutex across both
    /// steps.
    pub async fn get_or_restore(
        &self,
        agent_id: &str,
        session_manager: &dyn SessionManager,
    ) -> Result<Option<Arc<Agent>>, NexusError> {
        let mut guard = self.inner.lock().await;
        if let Some(agent) = guard.agents.get(agent_id) {
            return Ok(Some(agent.clone()));
        }

        if session_manager.session_exists(agent_id) {
            let config = AgentConfig {
                agent_id: Some(agent_id.to_string()),
                ..AgentConfig::default()
            };
            let agent = self.create_locked(&mut guard, agent_id.to_string(), false, config)?;
            return Ok(Some(agent));
        }

        Ok(None)
    }
}

fn generate_random_hex(bytes: usize) -> String {
    use rand::RngCore;
    let mut buf = vec![0u8; bytes];
    rand::rng().fill_bytes(&mut buf);
    hex::encode(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::EchoSession;
    use std::sync::Arc;

    fn make_pool() -> AgentPool {
        let shared = Arc::new(SharedComponents::new(PathBuf::from("/tmp/nexus-test-logs")));
        AgentPool::new(shared, Box::new(|| Arc::new(EchoSession) as Arc<dyn Session>))
    }

    #[tokio::test]
    async fn create_assigns_requested_id() {
        let pool = make_pool();
        let agent = pool
            .create(
                None,
                AgentConfig {
                    agent_id: Some("w1".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(agent.agent_id, "w1");
        assert!(pool.get("w1").await.is_some());
    }

    #[tokio::test]
    async fn create_rejects_duplicate_ids() {
        let pool = make_pool();
        pool.create(
            None,
            AgentConfig {
                agent_id: Some("w1".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        let err = pool
            .create(
                None,
                AgentConfig {
                    agent_id: Some("w1".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, NexusError::AgentAlreadyExists(_)));
    }

    #[tokio::test]
    async fn create_rejects_invalid_agent_id() {
        let pool = make_pool();
        let err = pool
            .create(
                None,
                AgentConfig {
                    agent_id: Some("../etc/passwd".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, NexusError::Validation(_)));
    }

    #[tokio::test]
    async fn temp_ids_are_sequential_and_reusable_after_destroy() {
        let pool = make_pool();
        let a = pool.create_temp(AgentConfig::default()).await.unwrap();
        let b = pool.create_temp(AgentConfig::default()).await.unwrap();
        assert_eq!(a.agent_id, ".1");
        assert_eq!(b.agent_id, ".2");

        pool.destroy(".1", None, true).await.unwrap();
        let c = pool.create_temp(AgentConfig::default()).await.unwrap();
        assert_eq!(c.agent_id, ".1");
    }

    #[tokio::test]
    async fn concurrent_temp_creates_yield_distinct_ids() {
        let pool = Arc::new(make_pool());
        let mut handles = Vec::new();
        for _ in 0..20 {
            let pool = pool.clone();
            handles.push(tokio::spawn(async move {
                pool.create_temp(AgentConfig::default()).await.unwrap().agent_id.clone()
            }));
        }
        let mut ids = Vec::new();
        for h in handles {
            ids.push(h.await.unwrap());
        }
        let unique: HashSet<_> = ids.iter().cloned().collect();
        assert_eq!(unique.len(), ids.len());
    }

    #[tokio::test]
    async fn ceiling_rejects_escalated_preset() {
        let pool = make_pool();
        let parent = pool
            .create(
                None,
                AgentConfig {
                    agent_id: Some("parent".to_string()),
                    preset: Some("sandboxed".to_string()),
                    cwd: Some(PathBuf::from("/tmp/parent")),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let err = pool
            .create(
                None,
                AgentConfig {
                    agent_id: Some("child".to_string()),
                    preset: Some("trusted".to_string()),
                    parent_agent_id: Some("parent".to_string()),
                    parent_permissions: Some(parent.services.permissions.clone()),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, NexusError::CeilingExceeded(_)));
        assert!(pool.get("child").await.is_none());
    }

    #[tokio::test]
    async fn destroy_requires_authorization() {
        let pool = make_pool();
        pool.create(
            None,
            AgentConfig {
                agent_id: Some("w1".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let err = pool
            .destroy("w1", Some("someone-else"), false)
            .await
            .unwrap_err();
        assert!(matches!(err, NexusError::Authorization(_)));

        let ok = pool.destroy("w1", Some("w1"), false).await.unwrap();
        assert!(ok);
    }

    #[tokio::test]
    async fn destroy_missing_agent_returns_false() {
        let pool = make_pool();
        let ok = pool.destroy("nope", None, true).await.unwrap();
        assert!(!ok);
    }
}
