//! The narrow seam this core needs from the reasoning loop, which is an
//! external collaborator and out of scope here. Implemented as a task that
//! writes chunks to a bounded channel per the async-generator-as-task design
//! note, rather than a native async generator.

use std::path::PathBuf;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::cancel::CancellationToken;

const SEND_CHANNEL_CAPACITY: usize = 128;

#[async_trait]
pub trait Session: Send + Sync {
    /// Begin producing response chunks for `content`. The returned receiver
    /// is drained by the dispatcher; the cancellation token is checked
    /// between chunk writes.
    async fn send(&self, content: &str, cancel: CancellationToken) -> mpsc::Receiver<String>;
}

/// Test double / default for configurations with no reasoning loop wired.
pub struct EchoSession;

#[async_trait]
impl Session for EchoSession {
    async fn send(&self, content: &str, cancel: CancellationToken) -> mpsc::Receiver<String> {
        let (tx, rx) = mpsc::channel(SEND_CHANNEL_CAPACITY);
        let content = content.to_string();
        tokio::spawn(async move {
            if cancel.raise_if_cancelled().is_err() {
                return;
            }
            let _ = tx.send(content).await;
        });
        rx
    }
}

/// Per-agent context/token-accounting interface, consumed by `get_tokens`
/// and `get_context`.
pub trait ContextManager: Send + Sync {
    fn message_count(&self) -> usize;
    fn has_system_prompt(&self) -> bool;
    fn token_usage(&self) -> serde_json::Value;
}

pub struct NullContextManager;

impl ContextManager for NullContextManager {
    fn message_count(&self) -> usize {
        0
    }

    fn has_system_prompt(&self) -> bool {
        false
    }

    fn token_usage(&self) -> serde_json::Value {
        serde_json::json!({})
    }
}

/// Restoration hook for persisted sessions, consumed by
/// [`crate::pool::AgentPool::get_or_restore`]. The concrete persistence
/// format is an external collaborator and out of scope here.
pub trait SessionManager: Send + Sync {
    fn session_exists(&self, agent_id: &str) -> bool;
}

pub struct NullSessionManager;

impl SessionManager for NullSessionManager {
    fn session_exists(&self, _agent_id: &str) -> bool {
        false
    }
}

/// Treats the presence of an agent's log directory under `base_dir` as
/// evidence that agent was created before and can be restored.
pub struct FilesystemSessionManager {
    base_dir: PathBuf,
}

impl FilesystemSessionManager {
    pub fn new(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }
}

impl SessionManager for FilesystemSessionManager {
    fn session_exists(&self, agent_id: &str) -> bool {
        self.base_dir.join(agent_id).is_dir()
    }
}
