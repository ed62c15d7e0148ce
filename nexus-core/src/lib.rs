pub mod agent_id;
pub mod cancel;
pub mod config;
pub mod detection;
pub mod dispatch_core;
pub mod dispatcher;
pub mod error;
pub mod global_dispatcher;
pub mod http;
pub mod mcp_manager;
pub mod permissions;
pub mod pool;
pub mod session;
pub mod token_store;

pub use error::NexusError;
pub use error::Result;
