//! Client for the Model Context Protocol: launch or connect to a tool
//! server and drive its JSON-RPC request/response cycle.

pub mod client;
pub mod transport;

pub use client::McpClient;
pub use client::McpError;
pub use transport::HttpTransport;
pub use transport::StdioTransport;
pub use transport::Transport;
pub use transport::TransportError;
