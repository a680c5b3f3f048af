//! Streamable-HTTP transport: every call is an HTTP POST that the server
//! may answer with a plain JSON body or a short-lived SSE stream.
//!
//! Session state (`mcp-session-id`) and the negotiated protocol version
//! are captured from responses and echoed on subsequent requests.

use crate::mcp::error::McpError;
use crate::mcp::transport::{is_event_stream_content_type, sse_data_payload, McpTransport, SseLineBuffer};
use async_trait::async_trait;
use futures_util::StreamExt;
use rust_mcp_schema::schema_utils::{
    ClientMessage, FromMessage, MessageFromClient, NotificationFromClient, RequestFromClient,
    ServerMessage,
};
use rust_mcp_schema::RequestId;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::debug;

const MCP_JSON_CONTENT_TYPE: &str = "application/json";
const MCP_JSON_AND_SSE_ACCEPT: &str = "application/json, text/event-stream";
const MCP_PROTOCOL_VERSION_HEADER: &str = "MCP-Protocol-Version";
const MCP_SESSION_ID_HEADER: &str = "mcp-session-id";
const MCP_HTTP_CONNECT_TIMEOUT_SECONDS: u64 = 10;
const MCP_HTTP_POOL_IDLE_TIMEOUT_SECONDS: u64 = 90;
const MCP_HTTP_POOL_MAX_IDLE_PER_HOST: usize = 8;

pub fn build_mcp_http_client() -> Result<reqwest::Client, McpError> {
    reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(MCP_HTTP_CONNECT_TIMEOUT_SECONDS))
        .pool_idle_timeout(Duration::from_secs(MCP_HTTP_POOL_IDLE_TIMEOUT_SECONDS))
        .pool_max_idle_per_host(MCP_HTTP_POOL_MAX_IDLE_PER_HOST)
        .build()
        .map_err(|err| McpError::Connection(format!("failed to build HTTP client: {err}")))
}

pub struct StreamableHttpTransport {
    server_id: String,
    client: reqwest::Client,
    url: String,
    session_id: RwLock<Option<String>>,
    protocol_version: RwLock<Option<String>>,
    next_request_id: AtomicI64,
    alive: AtomicBool,
}

impl StreamableHttpTransport {
    pub fn new(server_id: String, url: String) -> Result<Self, McpError> {
        let client = build_mcp_http_client()?;
        Ok(Self {
            server_id,
            client,
            url,
            session_id: RwLock::new(None),
            protocol_version: RwLock::new(None),
            next_request_id: AtomicI64::new(0),
            alive: AtomicBool::new(true),
        })
    }

    fn next_request_id(&self) -> RequestId {
        RequestId::Integer(self.next_request_id.fetch_add(1, Ordering::SeqCst))
    }

    async fn build_post(&self, payload: String) -> reqwest::RequestBuilder {
        let mut request = self
            .client
            .post(&self.url)
            .header("Content-Type", MCP_JSON_CONTENT_TYPE)
            .header("Accept", MCP_JSON_AND_SSE_ACCEPT)
            .body(payload);
        if let Some(protocol_version) = self.protocol_version.read().await.as_deref() {
            if !protocol_version.trim().is_empty() {
                request = request.header(MCP_PROTOCOL_VERSION_HEADER, protocol_version);
            }
        }
        if let Some(session_id) = self.session_id.read().await.as_deref() {
            request = request.header(MCP_SESSION_ID_HEADER, session_id);
        }
        request
    }

    async fn capture_session_id(&self, response: &reqwest::Response) {
        if let Some(session_id) = response
            .headers()
            .get(MCP_SESSION_ID_HEADER)
            .and_then(|value| value.to_str().ok())
        {
            *self.session_id.write().await = Some(session_id.to_string());
        }
    }

    /// Initialize responses carry the version the server settled on; it
    /// has to be echoed as a header on every later request.
    async fn capture_protocol_version(&self, message: &ServerMessage) {
        let ServerMessage::Response(response) = message else {
            return;
        };
        let Ok(result) = serde_json::to_value(&response.result) else {
            return;
        };
        if let Some(protocol_version) = result.get("protocolVersion").and_then(|v| v.as_str()) {
            if !protocol_version.trim().is_empty() {
                *self.protocol_version.write().await = Some(protocol_version.to_string());
            }
        }
    }

    async fn post_message(
        &self,
        message: ClientMessage,
        expect_response: bool,
    ) -> Result<Option<ServerMessage>, McpError> {
        let payload =
            serde_json::to_string(&message).map_err(|err| McpError::Transport(err.to_string()))?;
        debug!(server_id = %self.server_id, url = %self.url, "Sending MCP HTTP request");
        let response = self
            .build_post(payload)
            .await
            .send()
            .await
            .map_err(|err| McpError::Transport(err.to_string()))?;
        if !response.status().is_success() {
            return Err(McpError::Transport(format!(
                "HTTP error: {}",
                response.status()
            )));
        }
        self.capture_session_id(&response).await;

        // Notification POSTs are acknowledged with an empty 202 body.
        if !expect_response {
            return Ok(None);
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or("")
            .to_string();

        let server_message = if is_event_stream_content_type(&content_type) {
            next_sse_server_message(response, &self.server_id).await?
        } else {
            let body = response
                .bytes()
                .await
                .map_err(|err| McpError::Transport(err.to_string()))?;
            serde_json::from_slice::<ServerMessage>(&body)
                .map_err(|err| McpError::Transport(err.to_string()))?
        };

        self.capture_protocol_version(&server_message).await;
        Ok(Some(server_message))
    }
}

#[async_trait]
impl McpTransport for StreamableHttpTransport {
    async fn request(&self, request: RequestFromClient) -> Result<ServerMessage, McpError> {
        if !self.is_alive() {
            return Err(McpError::ConnectionLost(self.server_id.clone()));
        }
        let message = ClientMessage::from_message(
            MessageFromClient::RequestFromClient(request),
            Some(self.next_request_id()),
        )
        .map_err(|err| McpError::Transport(err.to_string()))?;
        match self.post_message(message, true).await? {
            Some(server_message) => Ok(server_message),
            None => Err(McpError::UnexpectedMessage(
                "empty response to MCP request".to_string(),
            )),
        }
    }

    async fn notify(&self, notification: NotificationFromClient) -> Result<(), McpError> {
        if !self.is_alive() {
            return Err(McpError::ConnectionLost(self.server_id.clone()));
        }
        let message = ClientMessage::from_message(
            MessageFromClient::NotificationFromClient(notification),
            None,
        )
        .map_err(|err| McpError::Transport(err.to_string()))?;
        self.post_message(message, false).await?;
        Ok(())
    }

    async fn close(&self) {
        self.alive.store(false, Ordering::SeqCst);
        // Best-effort session teardown; servers without session support
        // answer 404/405 and that is fine.
        let session_id = self.session_id.write().await.take();
        if let Some(session_id) = session_id {
            let _ = self
                .client
                .delete(&self.url)
                .header(MCP_SESSION_ID_HEADER, session_id)
                .send()
                .await;
        }
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }
}

/// Drains an SSE response until the first JSON-RPC response or error
/// frame. Server-initiated requests and notifications inside the stream
/// are logged and skipped.
async fn next_sse_server_message(
    response: reqwest::Response,
    server_id: &str,
) -> Result<ServerMessage, McpError> {
    let mut stream = response.bytes_stream();
    let mut buffer = SseLineBuffer::default();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|err| McpError::Transport(err.to_string()))?;
        for line in buffer.push(&chunk) {
            if let Some(message) = decode_sse_line(&line)? {
                if let Some(message) = filter_terminal(message, server_id) {
                    return Ok(message);
                }
            }
        }
    }

    for line in buffer.finish() {
        if let Some(message) = decode_sse_line(&line)? {
            if let Some(message) = filter_terminal(message, server_id) {
                return Ok(message);
            }
        }
    }

    Err(McpError::UnexpectedMessage(
        "empty event-stream response".to_string(),
    ))
}

fn filter_terminal(message: ServerMessage, server_id: &str) -> Option<ServerMessage> {
    match message {
        ServerMessage::Response(_) | ServerMessage::Error(_) => Some(message),
        ServerMessage::Request(request) => {
            debug!(
                server_id = %server_id,
                method = %request.method(),
                "Ignoring MCP HTTP server-initiated request"
            );
            None
        }
        ServerMessage::Notification(_) => {
            debug!(server_id = %server_id, "Received MCP HTTP notification");
            None
        }
    }
}

fn decode_sse_line(line: &str) -> Result<Option<ServerMessage>, McpError> {
    let Some(payload) = sse_data_payload(line) else {
        return Ok(None);
    };
    if payload.is_empty() {
        return Ok(None);
    }
    serde_json::from_str::<ServerMessage>(payload)
        .map(Some)
        .map_err(|err| McpError::Transport(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn request_after_close_reports_connection_lost() {
        let transport =
            StreamableHttpTransport::new("beta".to_string(), "http://127.0.0.1:1/mcp".to_string())
                .expect("client should build");
        transport.close().await;
        let err = transport
            .request(RequestFromClient::PingRequest(None))
            .await
            .expect_err("expected connection-lost error");
        assert!(matches!(err, McpError::ConnectionLost(_)));
    }

    #[tokio::test]
    async fn request_against_unreachable_endpoint_is_transport_error() {
        let transport =
            StreamableHttpTransport::new("beta".to_string(), "http://127.0.0.1:1/mcp".to_string())
                .expect("client should build");
        let err = transport
            .request(RequestFromClient::PingRequest(None))
            .await
            .expect_err("expected transport error");
        assert!(matches!(err, McpError::Transport(_)));
    }
}
