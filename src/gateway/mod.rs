//! Invocation gateway: the typed request/response surface over the
//! registry, the builtin provider, and the streaming bridge.
//!
//! Response payloads use the wire field names of the MCP capability
//! shapes (camelCase), so they serialize directly as API responses.

use crate::api::{ChatMessage, ChatToolDefinition};
use crate::core::chat_stream::{self, StreamError, StreamParams, ToolRouter};
use crate::core::config::{ProviderConfig, ServerConfig};
use crate::mcp::builtin::BuiltinProvider;
use crate::mcp::error::McpError;
use crate::mcp::registry::McpRegistry;
use crate::mcp::transport::MCP_METHOD_NOT_FOUND;
use crate::mcp::types::{
    ConnectionStatus, PromptDescriptor, PromptMessage, ResourceContent, ResourceDescriptor,
    ResourceTemplateDescriptor, ToolDescriptor, ToolResult,
};
use crate::mcp::BUILTIN_SERVER_ID;
use bytes::Bytes;
use chrono::{Local, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::warn;

const VALID_CHAT_ROLES: [&str; 4] = ["system", "user", "assistant", "tool"];

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("bad request: {0}")]
    BadInput(String),
    #[error("rate limited by upstream provider")]
    RateLimited,
    #[error("upstream failure: {0}")]
    Upstream(String),
}

impl ChatError {
    pub fn status_code(&self) -> u16 {
        match self {
            ChatError::BadInput(_) => 400,
            ChatError::RateLimited => 429,
            ChatError::Upstream(_) => 500,
        }
    }
}

impl From<StreamError> for ChatError {
    fn from(err: StreamError) -> Self {
        match err {
            StreamError::RateLimited => ChatError::RateLimited,
            StreamError::Upstream(message) => ChatError::Upstream(message),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ConnectRequest {
    pub config: ServerConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DisconnectResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerStatusEntry {
    pub id: String,
    pub name: String,
    pub status: ConnectionStatus,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListToolsResponse {
    pub tools: Vec<ToolDescriptor>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CallToolResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<ToolResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListResourcesResponse {
    pub resources: Vec<ResourceDescriptor>,
    pub resource_templates: Vec<ResourceTemplateDescriptor>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadResourceResponse {
    pub contents: Vec<ResourceContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListPromptsResponse {
    pub prompts: Vec<PromptDescriptor>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GetPromptResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub messages: Vec<PromptMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatGenerationRequest {
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub connected_server_ids: Vec<String>,
}

pub struct Gateway {
    registry: Arc<McpRegistry>,
    builtin: Arc<BuiltinProvider>,
    http: reqwest::Client,
    provider: ProviderConfig,
    api_key: String,
}

impl Gateway {
    pub fn new(
        registry: Arc<McpRegistry>,
        builtin: Arc<BuiltinProvider>,
        provider: ProviderConfig,
        api_key: String,
    ) -> Self {
        Self {
            registry,
            builtin,
            http: reqwest::Client::new(),
            provider,
            api_key,
        }
    }

    pub fn registry(&self) -> &Arc<McpRegistry> {
        &self.registry
    }

    /// Connecting the builtin id is a no-op success: its tools are
    /// always available.
    pub async fn connect(&self, config: ServerConfig) -> ConnectResponse {
        if BuiltinProvider::is_builtin_server(&config.id) {
            return ConnectResponse {
                success: true,
                server_id: Some(BUILTIN_SERVER_ID.to_string()),
                error: None,
            };
        }
        let id = config.id.clone();
        match self.registry.connect(config).await {
            Ok(()) => ConnectResponse {
                success: true,
                server_id: Some(id),
                error: None,
            },
            Err(err) => ConnectResponse {
                success: false,
                server_id: None,
                error: Some(err.to_string()),
            },
        }
    }

    pub async fn disconnect(&self, id: &str) -> DisconnectResponse {
        if BuiltinProvider::is_builtin_server(id) {
            return DisconnectResponse {
                success: false,
                error: Some("the builtin server cannot be disconnected".to_string()),
            };
        }
        match self.registry.disconnect(id).await {
            Ok(()) => DisconnectResponse {
                success: true,
                error: None,
            },
            Err(err) => DisconnectResponse {
                success: false,
                error: Some(err.to_string()),
            },
        }
    }

    pub async fn status(&self, id: &str) -> ConnectionStatus {
        if BuiltinProvider::is_builtin_server(id) {
            return ConnectionStatus::Connected;
        }
        self.registry.status(id).await
    }

    /// Status listing over the configured roster, with the builtin
    /// entry first.
    pub async fn server_statuses(&self, configs: &[ServerConfig]) -> Vec<ServerStatusEntry> {
        let mut entries = vec![ServerStatusEntry {
            id: BUILTIN_SERVER_ID.to_string(),
            name: "Builtin tools".to_string(),
            status: ConnectionStatus::Connected,
        }];
        for config in configs {
            entries.push(ServerStatusEntry {
                id: config.id.clone(),
                name: config.name.clone(),
                status: self.registry.status(&config.id).await,
            });
        }
        entries
    }

    pub async fn connected_server_ids(&self) -> Vec<String> {
        let mut ids = vec![BUILTIN_SERVER_ID.to_string()];
        ids.extend(self.registry.connected_ids().await);
        ids
    }

    pub async fn list_tools(&self, id: &str) -> ListToolsResponse {
        if BuiltinProvider::is_builtin_server(id) {
            return ListToolsResponse {
                tools: self.builtin.tools(),
                error: None,
            };
        }
        match self.registry.list_tools(id).await {
            Ok(tools) => ListToolsResponse { tools, error: None },
            Err(err) => ListToolsResponse {
                tools: Vec::new(),
                error: Some(err.to_string()),
            },
        }
    }

    pub async fn call_tool(
        &self,
        id: &str,
        name: &str,
        arguments: Option<serde_json::Map<String, serde_json::Value>>,
    ) -> CallToolResponse {
        let result = if BuiltinProvider::is_builtin_server(id) {
            Ok(self.builtin.execute(name, arguments.as_ref()).await)
        } else {
            self.registry.call_tool(id, name, arguments).await
        };
        match result {
            Ok(result) => CallToolResponse {
                result: Some(result),
                error: None,
            },
            Err(err) => CallToolResponse {
                result: None,
                error: Some(err.to_string()),
            },
        }
    }

    pub async fn list_resources(&self, id: &str) -> ListResourcesResponse {
        if BuiltinProvider::is_builtin_server(id) {
            return ListResourcesResponse {
                resources: Vec::new(),
                resource_templates: Vec::new(),
                error: None,
            };
        }
        match self.registry.list_resources(id).await {
            Ok((resources, resource_templates)) => ListResourcesResponse {
                resources,
                resource_templates,
                error: None,
            },
            Err(err) => ListResourcesResponse {
                resources: Vec::new(),
                resource_templates: Vec::new(),
                error: Some(err.to_string()),
            },
        }
    }

    pub async fn read_resource(&self, id: &str, uri: &str) -> ReadResourceResponse {
        let result = if BuiltinProvider::is_builtin_server(id) {
            Err(McpError::rpc(
                MCP_METHOD_NOT_FOUND,
                "the builtin server has no resources",
            ))
        } else {
            self.registry.read_resource(id, uri).await
        };
        match result {
            Ok(contents) => ReadResourceResponse {
                contents,
                error: None,
            },
            Err(err) => ReadResourceResponse {
                contents: Vec::new(),
                error: Some(err.to_string()),
            },
        }
    }

    pub async fn list_prompts(&self, id: &str) -> ListPromptsResponse {
        if BuiltinProvider::is_builtin_server(id) {
            return ListPromptsResponse {
                prompts: Vec::new(),
                error: None,
            };
        }
        match self.registry.list_prompts(id).await {
            Ok(prompts) => ListPromptsResponse {
                prompts,
                error: None,
            },
            Err(err) => ListPromptsResponse {
                prompts: Vec::new(),
                error: Some(err.to_string()),
            },
        }
    }

    pub async fn get_prompt(
        &self,
        id: &str,
        name: &str,
        arguments: HashMap<String, String>,
    ) -> GetPromptResponse {
        let result = if BuiltinProvider::is_builtin_server(id) {
            Err(McpError::rpc(
                MCP_METHOD_NOT_FOUND,
                "the builtin server has no prompts",
            ))
        } else {
            self.registry.get_prompt(id, name, arguments).await
        };
        match result {
            Ok(prompt) => GetPromptResponse {
                description: prompt.description,
                messages: prompt.messages,
                error: None,
            },
            Err(err) => GetPromptResponse {
                description: None,
                messages: Vec::new(),
                error: Some(err.to_string()),
            },
        }
    }

    /// Starts a chat generation and returns the bridged byte stream.
    pub async fn chat(
        &self,
        request: ChatGenerationRequest,
    ) -> Result<mpsc::Receiver<Bytes>, ChatError> {
        validate_chat_messages(&request.messages)?;

        let (tools, routes) = self.collect_tools(&request.connected_server_ids).await;
        let mut messages = request.messages;
        if !messages.iter().any(|message| message.role == "system") {
            messages.insert(0, ChatMessage::new("system", build_system_instruction()));
        }

        let params = StreamParams {
            client: self.http.clone(),
            base_url: self.provider.base_url.clone(),
            api_key: self.api_key.clone(),
            model: self.provider.model.clone(),
            messages,
            tools,
            router: ToolRouter::new(self.registry.clone(), self.builtin.clone(), routes),
        };
        Ok(chat_stream::open_stream(params).await?)
    }

    /// Gathers tool definitions across the requested server ids.
    /// Servers that fail to list are skipped; the first server to claim
    /// a tool name owns it.
    async fn collect_tools(
        &self,
        server_ids: &[String],
    ) -> (Vec<ChatToolDefinition>, HashMap<String, String>) {
        let mut tools = Vec::new();
        let mut routes: HashMap<String, String> = HashMap::new();

        for id in server_ids {
            let descriptors = if BuiltinProvider::is_builtin_server(id) {
                self.builtin.tools()
            } else {
                match self.registry.list_tools(id).await {
                    Ok(descriptors) => descriptors,
                    Err(err) => {
                        warn!(server_id = %id, error = %err, "Skipping tools from unavailable server");
                        continue;
                    }
                }
            };
            for descriptor in descriptors {
                if routes.contains_key(&descriptor.name) {
                    continue;
                }
                routes.insert(descriptor.name.clone(), id.clone());
                tools.push(ChatToolDefinition::function(
                    descriptor.name,
                    descriptor.description,
                    descriptor
                        .input_schema
                        .unwrap_or_else(|| serde_json::json!({"type": "object"})),
                ));
            }
        }
        (tools, routes)
    }
}

fn validate_chat_messages(messages: &[ChatMessage]) -> Result<(), ChatError> {
    if messages.is_empty() {
        return Err(ChatError::BadInput("messages must not be empty".to_string()));
    }
    for message in messages {
        if !VALID_CHAT_ROLES.contains(&message.role.as_str()) {
            return Err(ChatError::BadInput(format!(
                "unknown message role: {}",
                message.role
            )));
        }
    }
    Ok(())
}

fn build_system_instruction() -> String {
    let utc = Utc::now();
    let local = Local::now();
    format!(
        "You are a helpful assistant with access to external tools.\n\
         Current time (UTC): {}\n\
         Current time (local): {}\n\
         When a tool result is available, ground your answer in it and cite the relevant values.\n\
         For longer answers, lead with a one-line summary, then give the details.",
        utc.format("%Y-%m-%d %H:%M:%S"),
        local.format("%Y-%m-%d %H:%M:%S %Z"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gateway() -> Gateway {
        Gateway::new(
            Arc::new(McpRegistry::new()),
            Arc::new(BuiltinProvider::new()),
            ProviderConfig::default(),
            "test-key".to_string(),
        )
    }

    #[tokio::test]
    async fn builtin_server_is_always_connected() {
        let gateway = gateway();
        assert_eq!(
            gateway.status(BUILTIN_SERVER_ID).await,
            ConnectionStatus::Connected
        );
        let ids = gateway.connected_server_ids().await;
        assert_eq!(ids, vec![BUILTIN_SERVER_ID.to_string()]);
    }

    #[tokio::test]
    async fn builtin_server_refuses_disconnect() {
        let gateway = gateway();
        let response = gateway.disconnect(BUILTIN_SERVER_ID).await;
        assert!(!response.success);
        assert!(response.error.is_some());
    }

    #[tokio::test]
    async fn builtin_tools_list_without_a_connection() {
        let gateway = gateway();
        let response = gateway.list_tools(BUILTIN_SERVER_ID).await;
        assert!(response.error.is_none());
        assert_eq!(response.tools.len(), 1);
        assert_eq!(response.tools[0].name, "geocode");
    }

    #[tokio::test]
    async fn unknown_server_yields_typed_error_text() {
        let gateway = gateway();
        let response = gateway.call_tool("ghost", "lookup", None).await;
        assert!(response.result.is_none());
        assert!(response.error.as_deref().is_some_and(|e| e.contains("ghost")));
    }

    #[tokio::test]
    async fn chat_rejects_empty_and_malformed_requests() {
        let gateway = gateway();
        let err = gateway
            .chat(ChatGenerationRequest {
                messages: Vec::new(),
                connected_server_ids: Vec::new(),
            })
            .await
            .expect_err("expected bad input");
        assert!(matches!(err, ChatError::BadInput(_)));
        assert_eq!(err.status_code(), 400);

        let err = gateway
            .chat(ChatGenerationRequest {
                messages: vec![ChatMessage::new("wizard", "hi")],
                connected_server_ids: Vec::new(),
            })
            .await
            .expect_err("expected bad input");
        assert!(matches!(err, ChatError::BadInput(_)));
    }

    #[tokio::test]
    async fn tool_collection_prefers_first_owner_of_a_name() {
        let gateway = gateway();
        let ids = vec![BUILTIN_SERVER_ID.to_string(), BUILTIN_SERVER_ID.to_string()];
        let (tools, routes) = gateway.collect_tools(&ids).await;
        assert_eq!(tools.len(), 1);
        assert_eq!(
            routes.get("geocode").map(String::as_str),
            Some(BUILTIN_SERVER_ID)
        );
    }

    #[test]
    fn status_codes_follow_error_class() {
        assert_eq!(ChatError::BadInput("x".to_string()).status_code(), 400);
        assert_eq!(ChatError::RateLimited.status_code(), 429);
        assert_eq!(ChatError::Upstream("x".to_string()).status_code(), 500);
    }
}
