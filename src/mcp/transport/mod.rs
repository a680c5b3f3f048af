//! Point-to-point channels to MCP peers.
//!
//! Implementations normalize lifecycle differences between locally spawned
//! subprocesses and remote streamable-HTTP endpoints so the capability
//! client can treat both as one framed request/response contract.

use crate::mcp::error::McpError;
use async_trait::async_trait;
use memchr::memchr;
use rust_mcp_schema::schema_utils::{NotificationFromClient, RequestFromClient, ServerMessage};

pub mod stdio;
pub mod streamable_http;

pub use stdio::StdioTransport;
pub use streamable_http::StreamableHttpTransport;

/// JSON-RPC code used by servers to indicate unsupported list methods.
pub const MCP_METHOD_NOT_FOUND: i64 = -32601;

/// Framed request/response contract shared by both transport variants.
///
/// Both implementations are call-concurrent: stdio correlates concurrent
/// calls by request id over one pipe, and streamable HTTP issues
/// independent POSTs. No per-connection call queue is layered on top.
#[async_trait]
pub trait McpTransport: Send + Sync {
    /// Performs one correlated round trip. Fails with
    /// [`McpError::ConnectionLost`] when the peer has terminated.
    async fn request(&self, request: RequestFromClient) -> Result<ServerMessage, McpError>;

    /// Sends a fire-and-forget notification.
    async fn notify(&self, notification: NotificationFromClient) -> Result<(), McpError>;

    /// Tears the channel down. Idempotent; the subprocess variant
    /// guarantees the child is terminated.
    async fn close(&self);

    /// False once unsolicited peer termination has been detected.
    fn is_alive(&self) -> bool;
}

/// Incremental splitter for byte streams carrying newline-delimited
/// payloads (SSE frames, stdio JSON-RPC lines).
#[derive(Default)]
pub struct SseLineBuffer {
    pending: Vec<u8>,
}

impl SseLineBuffer {
    /// Appends a chunk and returns every complete line it closed.
    /// Blank lines and non-UTF-8 lines are dropped; a trailing partial
    /// line stays buffered for the next chunk.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);

        let mut lines = Vec::new();
        let mut start = 0;
        while let Some(offset) = memchr(b'\n', &self.pending[start..]) {
            let end = start + offset;
            Self::keep_line(&self.pending[start..end], &mut lines);
            start = end + 1;
        }
        self.pending.drain(..start);
        lines
    }

    /// Flushes any buffered partial line at end of stream.
    pub fn finish(&mut self) -> Vec<String> {
        self.push(b"\n")
    }

    fn keep_line(raw: &[u8], lines: &mut Vec<String>) {
        let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
        if let Ok(text) = std::str::from_utf8(raw) {
            let text = text.trim();
            if !text.is_empty() {
                lines.push(text.to_string());
            }
        }
    }
}

pub fn is_event_stream_content_type(content_type: &str) -> bool {
    content_type
        .split(';')
        .next()
        .map(str::trim)
        .is_some_and(|value| value.eq_ignore_ascii_case("text/event-stream"))
}

pub fn sse_data_payload(line: &str) -> Option<&str> {
    line.strip_prefix("data:").map(str::trim)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sse_line_buffer_handles_chunk_boundaries() {
        let mut buffer = SseLineBuffer::default();
        assert_eq!(buffer.push(b"data: one\n\n"), vec!["data: one"]);
        assert_eq!(buffer.push(b"data: t"), Vec::<String>::new());
        assert_eq!(buffer.push(b"wo\r\n"), vec!["data: two"]);
        assert_eq!(buffer.finish(), Vec::<String>::new());
    }

    #[test]
    fn sse_line_buffer_flushes_trailing_partial_line() {
        let mut buffer = SseLineBuffer::default();
        assert!(buffer.push(b"data: tail").is_empty());
        assert_eq!(buffer.finish(), vec!["data: tail"]);
    }

    #[test]
    fn detects_event_stream_content_type() {
        assert!(is_event_stream_content_type(
            "text/event-stream; charset=utf-8"
        ));
        assert!(!is_event_stream_content_type("application/json"));
    }

    #[test]
    fn extracts_sse_payload() {
        assert_eq!(sse_data_payload("data: {\"id\":1}"), Some("{\"id\":1}"));
        assert_eq!(sse_data_payload("event: ping"), None);
    }
}
