//! Streaming bridge between the upstream chat completions API and a
//! plain byte stream of assistant text.
//!
//! Tool calls emitted by the model are executed against the MCP layer
//! between rounds, and the stream stays open across rounds. Upstream
//! failures after streaming has started are substituted inline as a
//! final notice chunk followed by a normal close; pre-stream failures
//! surface as typed errors instead.

use bytes::Bytes;
use futures_util::StreamExt;
use memchr::memchr;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::api::{ChatMessage, ChatRequest, ChatResponse, ChatToolCall, ChatToolCallFunction, ChatToolDefinition};
use crate::mcp::builtin::BuiltinProvider;
use crate::mcp::registry::McpRegistry;
use crate::mcp::BUILTIN_SERVER_ID;

const STREAM_CHANNEL_CAPACITY: usize = 64;
const MAX_TOOL_ROUNDS: usize = 8;

pub const RATE_LIMIT_NOTICE: &str =
    "\n\n**[System notice] The AI service rate limit has been exceeded. Please wait a moment and try again.**\n";

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("rate limited by upstream provider")]
    RateLimited,
    #[error("upstream request failed: {0}")]
    Upstream(String),
}

/// Maps tool names offered to the model back to the server that owns
/// them, and executes calls through the registry or the builtin
/// provider.
#[derive(Clone)]
pub struct ToolRouter {
    registry: Arc<McpRegistry>,
    builtin: Arc<BuiltinProvider>,
    routes: HashMap<String, String>,
}

impl ToolRouter {
    pub fn new(
        registry: Arc<McpRegistry>,
        builtin: Arc<BuiltinProvider>,
        routes: HashMap<String, String>,
    ) -> Self {
        Self {
            registry,
            builtin,
            routes,
        }
    }

    /// Runs one tool call and renders the outcome as the text fed back
    /// to the model. Transport failures and unknown tools become error
    /// text rather than aborting the stream.
    pub async fn execute(&self, name: &str, raw_arguments: &str) -> String {
        let arguments = match parse_tool_arguments(raw_arguments) {
            Ok(arguments) => arguments,
            Err(err) => return format!("Tool call failed: invalid arguments ({err})"),
        };

        let Some(server_id) = self.routes.get(name) else {
            return format!("Tool call failed: no connected server provides \"{name}\"");
        };

        let result = if server_id == BUILTIN_SERVER_ID {
            Ok(self.builtin.execute(name, arguments.as_ref()).await)
        } else {
            self.registry.call_tool(server_id, name, arguments).await
        };

        match result {
            Ok(result) => {
                let text = result.joined_text();
                if result.is_error() && text.is_empty() {
                    "Tool reported an error with no details.".to_string()
                } else if result.is_error() {
                    format!("Tool error: {text}")
                } else {
                    text
                }
            }
            Err(err) => format!("Tool call failed: {err}"),
        }
    }
}

fn parse_tool_arguments(
    raw: &str,
) -> Result<Option<serde_json::Map<String, serde_json::Value>>, String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    match serde_json::from_str::<serde_json::Value>(trimmed) {
        Ok(serde_json::Value::Object(map)) => Ok(Some(map)),
        Ok(serde_json::Value::Null) => Ok(None),
        Ok(_) => Err("expected a JSON object".to_string()),
        Err(err) => Err(err.to_string()),
    }
}

pub struct StreamParams {
    pub client: reqwest::Client,
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<ChatToolDefinition>,
    pub router: ToolRouter,
}

/// Opens the upstream stream and returns the receiving end of the
/// bridged byte stream. Failure before any byte is produced is returned
/// as a typed error; later failures are reported inline on the stream.
pub async fn open_stream(params: StreamParams) -> Result<mpsc::Receiver<Bytes>, StreamError> {
    let request = build_request(&params, params.messages.clone());
    let response = send_round(&params, &request).await?;

    let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
    tokio::spawn(run_stream(params, request.messages, response, tx));
    Ok(rx)
}

fn build_request(params: &StreamParams, messages: Vec<ChatMessage>) -> ChatRequest {
    ChatRequest {
        model: params.model.clone(),
        messages,
        stream: true,
        tools: (!params.tools.is_empty()).then(|| params.tools.clone()),
    }
}

async fn send_round(
    params: &StreamParams,
    request: &ChatRequest,
) -> Result<reqwest::Response, StreamError> {
    let chat_url = construct_api_url(&params.base_url, "chat/completions");
    let response = params
        .client
        .post(chat_url)
        .header("Content-Type", "application/json")
        .bearer_auth(&params.api_key)
        .json(request)
        .send()
        .await
        .map_err(|err| StreamError::Upstream(err.to_string()))?;

    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        return Err(StreamError::RateLimited);
    }
    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "<no body>".to_string());
    Err(StreamError::Upstream(format_api_error(&body)))
}

async fn run_stream(
    params: StreamParams,
    mut messages: Vec<ChatMessage>,
    first_response: reqwest::Response,
    tx: mpsc::Sender<Bytes>,
) {
    let mut response = first_response;

    for round in 0..MAX_TOOL_ROUNDS {
        let mut progress = RoundProgress::default();
        match drain_round(response, &mut progress, &tx).await {
            RoundEnd::Finished => {}
            RoundEnd::DownstreamClosed => return,
            RoundEnd::Failed(error_text) => {
                let _ = tx.send(Bytes::from(notice_for_error(&error_text))).await;
                return;
            }
        }

        let tool_calls = progress.completed_tool_calls();
        if progress.finish_reason.as_deref() != Some("tool_calls") || tool_calls.is_empty() {
            return;
        }
        debug!(round, tool_calls = tool_calls.len(), "Executing tool round");

        messages.push(ChatMessage {
            role: "assistant".to_string(),
            content: progress.content,
            tool_call_id: None,
            tool_calls: Some(tool_calls.clone()),
        });
        for call in &tool_calls {
            let result_text = params
                .router
                .execute(&call.function.name, &call.function.arguments)
                .await;
            messages.push(ChatMessage {
                role: "tool".to_string(),
                content: result_text,
                tool_call_id: Some(call.id.clone()),
                tool_calls: None,
            });
        }

        let request = build_request(&params, messages.clone());
        response = match send_round(&params, &request).await {
            Ok(response) => response,
            Err(StreamError::RateLimited) => {
                let _ = tx.send(Bytes::from(RATE_LIMIT_NOTICE)).await;
                return;
            }
            Err(StreamError::Upstream(error_text)) => {
                let _ = tx.send(Bytes::from(notice_for_error(&error_text))).await;
                return;
            }
        };
    }

    warn!("Stopping stream after {MAX_TOOL_ROUNDS} tool rounds");
}

enum RoundEnd {
    Finished,
    DownstreamClosed,
    Failed(String),
}

async fn drain_round(
    response: reqwest::Response,
    progress: &mut RoundProgress,
    tx: &mpsc::Sender<Bytes>,
) -> RoundEnd {
    let mut stream = response.bytes_stream();
    let mut buffer: Vec<u8> = Vec::new();

    while let Some(chunk) = stream.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(err) => return RoundEnd::Failed(err.to_string()),
        };
        buffer.extend_from_slice(&chunk);

        while let Some(newline_pos) = memchr(b'\n', &buffer) {
            let line = match std::str::from_utf8(&buffer[..newline_pos]) {
                Ok(line) => line.trim().to_string(),
                Err(_) => {
                    buffer.drain(..=newline_pos);
                    continue;
                }
            };
            buffer.drain(..=newline_pos);

            match parse_sse_line(&line) {
                PayloadEvent::Ignored => {}
                PayloadEvent::Done => return RoundEnd::Finished,
                PayloadEvent::Error(error_text) => return RoundEnd::Failed(error_text),
                PayloadEvent::Response(chat_response) => {
                    if let Some(content) = progress.absorb(chat_response) {
                        if tx.send(Bytes::from(content)).await.is_err() {
                            return RoundEnd::DownstreamClosed;
                        }
                    }
                }
            }
        }
    }

    RoundEnd::Finished
}

enum PayloadEvent {
    Ignored,
    Done,
    Response(ChatResponse),
    Error(String),
}

fn parse_sse_line(line: &str) -> PayloadEvent {
    let Some(payload) = line.strip_prefix("data:").map(str::trim_start) else {
        return PayloadEvent::Ignored;
    };
    if payload == "[DONE]" {
        return PayloadEvent::Done;
    }
    if payload.trim().is_empty() {
        return PayloadEvent::Ignored;
    }
    match serde_json::from_str::<ChatResponse>(payload) {
        Ok(response) => PayloadEvent::Response(response),
        Err(_) => PayloadEvent::Error(format_api_error(payload)),
    }
}

#[derive(Default)]
struct PendingToolCall {
    id: String,
    name: String,
    arguments: String,
}

/// Accumulated state of one streaming round: forwarded text, tool call
/// fragments keyed by delta index, and the finish reason.
#[derive(Default)]
struct RoundProgress {
    content: String,
    tool_calls: BTreeMap<u32, PendingToolCall>,
    finish_reason: Option<String>,
}

impl RoundProgress {
    /// Folds one delta in, returning any assistant text to forward.
    fn absorb(&mut self, response: ChatResponse) -> Option<String> {
        let mut forwarded: Option<String> = None;
        for choice in response.choices {
            if let Some(reason) = choice.finish_reason {
                self.finish_reason = Some(reason);
            }
            if let Some(content) = choice.delta.content {
                if !content.is_empty() {
                    self.content.push_str(&content);
                    forwarded.get_or_insert_with(String::new).push_str(&content);
                }
            }
            for delta in choice.delta.tool_calls.unwrap_or_default() {
                let entry = self
                    .tool_calls
                    .entry(delta.index.unwrap_or(0))
                    .or_default();
                if let Some(id) = delta.id {
                    entry.id = id;
                }
                if let Some(function) = delta.function {
                    if let Some(name) = function.name {
                        entry.name.push_str(&name);
                    }
                    if let Some(arguments) = function.arguments {
                        entry.arguments.push_str(&arguments);
                    }
                }
            }
        }
        forwarded
    }

    fn completed_tool_calls(&self) -> Vec<ChatToolCall> {
        self.tool_calls
            .values()
            .filter(|call| !call.name.is_empty())
            .map(|call| ChatToolCall {
                id: call.id.clone(),
                kind: "function".to_string(),
                function: ChatToolCallFunction {
                    name: call.name.clone(),
                    arguments: call.arguments.clone(),
                },
            })
            .collect()
    }
}

pub fn is_rate_limit_error(error_text: &str) -> bool {
    let lowered = error_text.to_lowercase();
    lowered.contains("429") || lowered.contains("rate limit") || lowered.contains("quota")
}

fn notice_for_error(error_text: &str) -> String {
    if is_rate_limit_error(error_text) {
        RATE_LIMIT_NOTICE.to_string()
    } else {
        format!("\n\n**[System notice] The response was interrupted: {error_text}**\n")
    }
}

fn construct_api_url(base_url: &str, path: &str) -> String {
    format!("{}/{}", base_url.trim_end_matches('/'), path)
}

fn extract_error_summary(value: &serde_json::Value) -> Option<String> {
    let summary = value
        .pointer("/error/message")
        .and_then(|v| v.as_str())
        .map(str::to_owned)
        .or_else(|| {
            value.get("error").and_then(|v| match v {
                serde_json::Value::String(s) => Some(s.to_string()),
                serde_json::Value::Object(map) => map
                    .get("message")
                    .and_then(|message| message.as_str().map(str::to_owned)),
                _ => None,
            })
        })
        .or_else(|| {
            value
                .get("message")
                .and_then(|v| v.as_str().map(str::to_owned))
        });

    summary.map(|text| {
        let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
        collapsed.trim().to_string()
    })
}

fn format_api_error(error_text: &str) -> String {
    let trimmed = error_text.trim();
    if trimmed.is_empty() {
        return "API error: <empty>".to_string();
    }
    if let Ok(json_value) = serde_json::from_str::<serde_json::Value>(trimmed) {
        if let Some(summary) = extract_error_summary(&json_value) {
            if !summary.is_empty() {
                return format!("API error: {summary}");
            }
        }
    }
    format!("API error: {trimmed}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn delta_payload(json: serde_json::Value) -> ChatResponse {
        serde_json::from_value(json).expect("payload should parse")
    }

    fn stream_params() -> StreamParams {
        StreamParams {
            client: reqwest::Client::new(),
            base_url: "http://127.0.0.1:1/v1".to_string(),
            api_key: "test-key".to_string(),
            model: "test-model".to_string(),
            messages: vec![ChatMessage::new("user", "hi")],
            tools: Vec::new(),
            router: ToolRouter::new(
                Arc::new(McpRegistry::new()),
                Arc::new(BuiltinProvider::new()),
                HashMap::new(),
            ),
        }
    }

    fn sse_response(body: &str) -> reqwest::Response {
        http::Response::builder()
            .status(200)
            .header("content-type", "text/event-stream")
            .body(body.to_string())
            .expect("response should build")
            .into()
    }

    async fn bridged_chunks(response: reqwest::Response) -> Vec<String> {
        let (tx, mut rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        let bridge = tokio::spawn(run_stream(stream_params(), Vec::new(), response, tx));
        let mut chunks = Vec::new();
        while let Some(chunk) = rx.recv().await {
            chunks.push(String::from_utf8_lossy(&chunk).into_owned());
        }
        bridge.await.expect("bridge task");
        chunks
    }

    #[tokio::test]
    async fn bridge_forwards_upstream_text_and_closes_without_notice() {
        let body = "data: {\"choices\":[{\"delta\":{\"content\":\"Hello\"}}]}\n\n\
                    data: {\"choices\":[{\"delta\":{\"content\":\" world\"},\"finish_reason\":\"stop\"}]}\n\n\
                    data: [DONE]\n\n";
        let chunks = bridged_chunks(sse_response(body)).await;
        assert_eq!(chunks, vec!["Hello", " world"]);
        assert_eq!(chunks.concat(), "Hello world");
    }

    #[tokio::test]
    async fn mid_stream_rate_limit_appends_notice_then_closes() {
        let body = "data: {\"choices\":[{\"delta\":{\"content\":\"Partial\"}}]}\n\n\
                    data: {\"error\":{\"message\":\"Rate limit exceeded\"}}\n\n";
        let chunks = bridged_chunks(sse_response(body)).await;
        assert_eq!(
            chunks,
            vec!["Partial".to_string(), RATE_LIMIT_NOTICE.to_string()]
        );
    }

    #[tokio::test]
    async fn mid_stream_upstream_failure_appends_interruption_notice() {
        let body = "data: {\"choices\":[{\"delta\":{\"content\":\"Partial\"}}]}\n\n\
                    data: {\"error\":{\"message\":\"model overloaded\"}}\n\n";
        let chunks = bridged_chunks(sse_response(body)).await;
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0], "Partial");
        assert!(chunks[1].contains("interrupted"));
        assert!(chunks[1].contains("model overloaded"));
    }

    #[test]
    fn sse_lines_parse_with_spacing_variants() {
        assert!(matches!(
            parse_sse_line(r#"data: {"choices":[{"delta":{"content":"Hello"}}]}"#),
            PayloadEvent::Response(_)
        ));
        assert!(matches!(
            parse_sse_line(r#"data:{"choices":[{"delta":{"content":"World"}}]}"#),
            PayloadEvent::Response(_)
        ));
        assert!(matches!(parse_sse_line("data: [DONE]"), PayloadEvent::Done));
        assert!(matches!(parse_sse_line("event: ping"), PayloadEvent::Ignored));
        assert!(matches!(
            parse_sse_line(r#"data: {"error":{"message":"boom"}}"#),
            PayloadEvent::Error(_)
        ));
    }

    #[test]
    fn round_progress_accumulates_content_and_finish_reason() {
        let mut progress = RoundProgress::default();
        let first = progress.absorb(delta_payload(serde_json::json!({
            "choices": [{"delta": {"content": "Hello"}}]
        })));
        let second = progress.absorb(delta_payload(serde_json::json!({
            "choices": [{"delta": {"content": " world"}, "finish_reason": "stop"}]
        })));
        assert_eq!(first.as_deref(), Some("Hello"));
        assert_eq!(second.as_deref(), Some(" world"));
        assert_eq!(progress.content, "Hello world");
        assert_eq!(progress.finish_reason.as_deref(), Some("stop"));
    }

    #[test]
    fn tool_call_fragments_merge_by_index() {
        let mut progress = RoundProgress::default();
        progress.absorb(delta_payload(serde_json::json!({
            "choices": [{"delta": {"tool_calls": [
                {"index": 0, "id": "call_1", "function": {"name": "geocode", "arguments": "{\"qu"}}
            ]}}]
        })));
        progress.absorb(delta_payload(serde_json::json!({
            "choices": [{"delta": {"tool_calls": [
                {"index": 0, "function": {"arguments": "ery\":\"Seoul\"}"}}
            ]}, "finish_reason": "tool_calls"}]
        })));
        let calls = progress.completed_tool_calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].id, "call_1");
        assert_eq!(calls[0].function.name, "geocode");
        assert_eq!(calls[0].function.arguments, r#"{"query":"Seoul"}"#);
        assert_eq!(progress.finish_reason.as_deref(), Some("tool_calls"));
    }

    #[test]
    fn rate_limit_errors_substitute_the_fixed_notice() {
        assert_eq!(notice_for_error("HTTP 429 Too Many Requests"), RATE_LIMIT_NOTICE);
        assert_eq!(notice_for_error("Rate limit reached for model"), RATE_LIMIT_NOTICE);
        assert_eq!(notice_for_error("insufficient quota"), RATE_LIMIT_NOTICE);
        let other = notice_for_error("connection reset");
        assert!(other.contains("connection reset"));
        assert_ne!(other, RATE_LIMIT_NOTICE);
    }

    #[test]
    fn tool_arguments_parse_leniently() {
        assert!(parse_tool_arguments("").expect("empty ok").is_none());
        assert!(parse_tool_arguments("null").expect("null ok").is_none());
        let map = parse_tool_arguments(r#"{"query":"Seoul"}"#)
            .expect("object ok")
            .expect("map present");
        assert_eq!(map.get("query").and_then(|v| v.as_str()), Some("Seoul"));
        assert!(parse_tool_arguments("[1,2]").is_err());
        assert!(parse_tool_arguments("{not json").is_err());
    }

    #[test]
    fn api_errors_summarize_json_bodies() {
        assert_eq!(
            format_api_error(r#"{"error":{"message":"model overloaded"}}"#),
            "API error: model overloaded"
        );
        assert_eq!(format_api_error("plain failure"), "API error: plain failure");
        assert_eq!(format_api_error("  "), "API error: <empty>");
    }

    #[test]
    fn api_url_joins_without_duplicate_slash() {
        assert_eq!(
            construct_api_url("https://api.example.com/v1/", "chat/completions"),
            "https://api.example.com/v1/chat/completions"
        );
        assert_eq!(
            construct_api_url("https://api.example.com/v1", "chat/completions"),
            "https://api.example.com/v1/chat/completions"
        );
    }
}
