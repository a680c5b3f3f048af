//! Error taxonomy for MCP connections and capability calls.
//!
//! Peer-reported tool failures are deliberately absent here: a tool that
//! runs and reports failure is a successful invocation with
//! `ToolResult::is_error` set, not an `McpError`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum McpError {
    /// The server config is missing a field required by its transport kind.
    /// Connect is never attempted.
    #[error("invalid server config: {0}")]
    Config(String),

    /// Spawn, dial, or handshake failed while opening a connection. No
    /// registry entry remains after this is returned.
    #[error("connection failed: {0}")]
    Connection(String),

    /// A capability call was routed to an id with no active entry.
    #[error("MCP server is not connected: {0}")]
    NotConnected(String),

    /// The peer process exited or the stream dropped while the connection
    /// was in use.
    #[error("connection to MCP server lost: {0}")]
    ConnectionLost(String),

    /// A framed round trip failed below the protocol layer (I/O, HTTP,
    /// serialization).
    #[error("transport error: {0}")]
    Transport(String),

    /// The peer answered with a JSON-RPC error.
    #[error("MCP error {code}: {message}")]
    Rpc { code: i64, message: String },

    /// The peer answered with a message that is neither a response nor an
    /// error for the outstanding request.
    #[error("unexpected MCP server message: {0}")]
    UnexpectedMessage(String),
}

impl McpError {
    pub fn rpc(code: i64, message: impl Into<String>) -> Self {
        Self::Rpc {
            code,
            message: message.into(),
        }
    }

    /// True when the peer reported the JSON-RPC method-not-found code,
    /// which servers use as a soft "capability unsupported" signal.
    pub fn is_method_not_found(&self) -> bool {
        matches!(self, Self::Rpc { code, .. } if *code == crate::mcp::transport::MCP_METHOD_NOT_FOUND)
    }
}
