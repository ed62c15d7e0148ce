use thiserror::Error;
use uuid::Uuid;

use crate::agent_id::ValidationError;
use crate::permissions::PathSecurityError;

pub type Result<T> = std::result::Result<T, NexusError>;

#[derive(Error, Debug)]
pub enum NexusError {
    #[error("agent not found: {0}")]
    AgentNotFound(String),

    #[error("agent already exists: {0}")]
    AgentAlreadyExists(String),

    #[error("{0}")]
    Validation(#[from] ValidationError),

    #[error("{0}")]
    PathSecurity(#[from] PathSecurityError),

    #[error("{0}")]
    Authorization(#[from] crate::pool::AuthorizationError),

    #[error("exceeds parent ceiling: {0}")]
    CeilingExceeded(String),

    #[error("max agent depth exceeded ({0})")]
    MaxDepthExceeded(usize),

    #[error("invalid parameters: {0}")]
    InvalidParams(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error("conversation not found: {0}")]
    ConversationNotFound(Uuid),
}

impl NexusError {
    /// JSON-RPC error code this error maps onto, per the taxonomy in
    /// the global error-handling design.
    pub fn rpc_code(&self) -> i64 {
        use nexus_protocol::INTERNAL_ERROR;
        use nexus_protocol::INVALID_PARAMS;
        match self {
            NexusError::Validation(_)
            | NexusError::PathSecurity(_)
            | NexusError::Authorization(_)
            | NexusError::CeilingExceeded(_)
            | NexusError::MaxDepthExceeded(_)
            | NexusError::InvalidParams(_)
            | NexusError::AgentAlreadyExists(_) => INVALID_PARAMS,
            _ => INTERNAL_ERROR,
        }
    }
}
