//! MCP connection registry and capability layer.

pub mod builtin;
pub mod client;
pub mod error;
pub mod protocol;
pub mod registry;
pub mod transport;
pub mod types;

pub use builtin::{BuiltinProvider, BUILTIN_SERVER_ID};
pub use client::McpClient;
pub use error::McpError;
pub use registry::McpRegistry;
pub use types::{ConnectionStatus, ToolResult};
