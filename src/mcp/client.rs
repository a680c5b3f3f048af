//! Per-connection MCP client: owns one transport, runs the initialize
//! handshake, and exposes the capability operations.

use crate::core::config::{ServerConfig, TransportKind};
use crate::mcp::error::McpError;
use crate::mcp::protocol::{
    self, GetPromptResult, ListPromptsPage, ListResourceTemplatesPage, ListResourcesPage,
    ListToolsPage,
};
use crate::mcp::transport::{McpTransport, StdioTransport, StreamableHttpTransport};
use crate::mcp::types::{
    CapabilitySnapshot, PromptDescriptor, ResourceContent, ResourceDescriptor,
    ResourceTemplateDescriptor, ToolDescriptor, ToolResult,
};
use rust_mcp_schema::schema_utils::{NotificationFromClient, RequestFromClient};
use rust_mcp_schema::{
    CallToolRequestParams, ClientCapabilities, GetPromptRequestParams, Implementation,
    InitializeRequestParams, PaginatedRequestParams, ReadResourceRequestParams,
    LATEST_PROTOCOL_VERSION,
};
use std::collections::HashMap;
use tracing::debug;

/// Hard cap on entries accumulated while following list cursors, so a
/// misbehaving server cannot stall discovery with an endless cursor
/// chain.
pub const MCP_MAX_LIST_ITEMS: usize = 100;

pub struct McpClient {
    server_id: String,
    transport: Box<dyn McpTransport>,
}

impl std::fmt::Debug for McpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("McpClient")
            .field("server_id", &self.server_id)
            .finish_non_exhaustive()
    }
}

impl McpClient {
    /// Opens the transport described by `config` and performs the
    /// initialize handshake. On any failure the transport is torn down
    /// and no client is returned.
    pub async fn connect(config: &ServerConfig) -> Result<Self, McpError> {
        config.validate().map_err(McpError::Config)?;

        let transport: Box<dyn McpTransport> = match config.transport {
            TransportKind::Stdio => {
                let command = config.command.as_deref().unwrap_or_default();
                let args = config.args.clone().unwrap_or_default();
                let env = config.resolved_env();
                Box::new(StdioTransport::spawn(
                    config.id.clone(),
                    command,
                    &args,
                    env.as_ref(),
                )?)
            }
            TransportKind::StreamableHttp => {
                let url = config.url.clone().unwrap_or_default();
                Box::new(StreamableHttpTransport::new(config.id.clone(), url)?)
            }
        };

        let client = Self {
            server_id: config.id.clone(),
            transport,
        };
        if let Err(err) = client.handshake().await {
            client.transport.close().await;
            return Err(McpError::Connection(format!(
                "initialize handshake with {} failed: {err}",
                config.id
            )));
        }
        Ok(client)
    }

    async fn handshake(&self) -> Result<(), McpError> {
        let response = self
            .transport
            .request(RequestFromClient::InitializeRequest(client_details()))
            .await?;
        let initialize = protocol::parse_initialize_result(response)?;
        debug!(
            server_id = %self.server_id,
            protocol_version = %initialize.protocol_version,
            "MCP initialize handshake complete"
        );
        self.transport
            .notify(NotificationFromClient::InitializedNotification(None))
            .await
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_alive()
    }

    pub async fn shutdown(&self) {
        self.transport.close().await;
    }

    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Option<serde_json::Map<String, serde_json::Value>>,
    ) -> Result<ToolResult, McpError> {
        let mut params = CallToolRequestParams::new(name);
        if let Some(arguments) = arguments {
            params = params.with_arguments(arguments);
        }
        let response = self
            .transport
            .request(RequestFromClient::CallToolRequest(params))
            .await?;
        protocol::parse_call_tool(response)
    }

    /// Follows list cursors until exhaustion or the accumulation cap.
    /// Servers that answer method-not-found yield an empty list.
    pub async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, McpError> {
        let mut tools: Vec<ToolDescriptor> = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let response = self
                .transport
                .request(RequestFromClient::ListToolsRequest(paginated_params(cursor)))
                .await?;
            let page: ListToolsPage = match protocol::parse_list_tools(response) {
                Ok(page) => page,
                Err(err) if err.is_method_not_found() => return Ok(Vec::new()),
                Err(err) => return Err(err),
            };
            tools.extend(page.tools);
            if tools.len() >= MCP_MAX_LIST_ITEMS {
                tools.truncate(MCP_MAX_LIST_ITEMS);
                return Ok(tools);
            }
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => return Ok(tools),
            }
        }
    }

    pub async fn list_resources(
        &self,
    ) -> Result<(Vec<ResourceDescriptor>, Vec<ResourceTemplateDescriptor>), McpError> {
        let mut resources: Vec<ResourceDescriptor> = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let response = self
                .transport
                .request(RequestFromClient::ListResourcesRequest(paginated_params(
                    cursor,
                )))
                .await?;
            let page: ListResourcesPage = match protocol::parse_list_resources(response) {
                Ok(page) => page,
                Err(err) if err.is_method_not_found() => {
                    return Ok((Vec::new(), Vec::new()));
                }
                Err(err) => return Err(err),
            };
            resources.extend(page.resources);
            if resources.len() >= MCP_MAX_LIST_ITEMS {
                resources.truncate(MCP_MAX_LIST_ITEMS);
                break;
            }
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        let templates = self.list_resource_templates().await?;
        Ok((resources, templates))
    }

    async fn list_resource_templates(
        &self,
    ) -> Result<Vec<ResourceTemplateDescriptor>, McpError> {
        let mut templates: Vec<ResourceTemplateDescriptor> = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let response = self
                .transport
                .request(RequestFromClient::ListResourceTemplatesRequest(
                    paginated_params(cursor),
                ))
                .await?;
            let page: ListResourceTemplatesPage =
                match protocol::parse_list_resource_templates(response) {
                    Ok(page) => page,
                    Err(err) if err.is_method_not_found() => return Ok(Vec::new()),
                    Err(err) => return Err(err),
                };
            templates.extend(page.resource_templates);
            if templates.len() >= MCP_MAX_LIST_ITEMS {
                templates.truncate(MCP_MAX_LIST_ITEMS);
                return Ok(templates);
            }
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => return Ok(templates),
            }
        }
    }

    pub async fn read_resource(&self, uri: &str) -> Result<Vec<ResourceContent>, McpError> {
        let params = ReadResourceRequestParams {
            meta: None,
            uri: uri.to_string(),
        };
        let response = self
            .transport
            .request(RequestFromClient::ReadResourceRequest(params))
            .await?;
        Ok(protocol::parse_read_resource(response)?.contents)
    }

    pub async fn list_prompts(&self) -> Result<Vec<PromptDescriptor>, McpError> {
        let mut prompts: Vec<PromptDescriptor> = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let response = self
                .transport
                .request(RequestFromClient::ListPromptsRequest(paginated_params(
                    cursor,
                )))
                .await?;
            let page: ListPromptsPage = match protocol::parse_list_prompts(response) {
                Ok(page) => page,
                Err(err) if err.is_method_not_found() => return Ok(Vec::new()),
                Err(err) => return Err(err),
            };
            prompts.extend(page.prompts);
            if prompts.len() >= MCP_MAX_LIST_ITEMS {
                prompts.truncate(MCP_MAX_LIST_ITEMS);
                return Ok(prompts);
            }
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => return Ok(prompts),
            }
        }
    }

    pub async fn get_prompt(
        &self,
        name: &str,
        arguments: HashMap<String, String>,
    ) -> Result<GetPromptResult, McpError> {
        let params = GetPromptRequestParams {
            name: name.to_string(),
            arguments: (!arguments.is_empty()).then_some(arguments),
            meta: None,
        };
        let response = self
            .transport
            .request(RequestFromClient::GetPromptRequest(params))
            .await?;
        protocol::parse_get_prompt(response)
    }

    /// Fetches all capability lists for the advisory snapshot kept by
    /// the registry.
    pub async fn snapshot_capabilities(&self) -> Result<CapabilitySnapshot, McpError> {
        let tools = self.list_tools().await?;
        let (resources, resource_templates) = self.list_resources().await?;
        let prompts = self.list_prompts().await?;
        Ok(CapabilitySnapshot {
            tools,
            resources,
            resource_templates,
            prompts,
        })
    }

    #[cfg(test)]
    pub(crate) fn with_transport(server_id: String, transport: Box<dyn McpTransport>) -> Self {
        Self {
            server_id,
            transport,
        }
    }
}

fn client_details() -> InitializeRequestParams {
    InitializeRequestParams {
        capabilities: ClientCapabilities::default(),
        client_info: Implementation {
            name: "parley".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            title: Some("Parley MCP Client".to_string()),
            description: Some("Parley MCP client runtime".to_string()),
            icons: Vec::new(),
            website_url: None,
        },
        meta: None,
        protocol_version: LATEST_PROTOCOL_VERSION.to_string(),
    }
}

fn paginated_params(cursor: Option<String>) -> Option<PaginatedRequestParams> {
    cursor.map(|cursor| PaginatedRequestParams {
        cursor: Some(cursor),
        meta: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use rust_mcp_schema::schema_utils::ServerMessage;
    use std::sync::Mutex;

    struct ScriptedTransport {
        responses: Mutex<Vec<serde_json::Value>>,
        alive: bool,
    }

    impl ScriptedTransport {
        fn new(responses: Vec<serde_json::Value>) -> Self {
            Self {
                responses: Mutex::new(responses),
                alive: true,
            }
        }
    }

    #[async_trait]
    impl McpTransport for ScriptedTransport {
        async fn request(&self, _request: RequestFromClient) -> Result<ServerMessage, McpError> {
            let next = self.responses.lock().expect("lock").remove(0);
            serde_json::from_value(next).map_err(|err| McpError::Transport(err.to_string()))
        }

        async fn notify(&self, _notification: NotificationFromClient) -> Result<(), McpError> {
            Ok(())
        }

        async fn close(&self) {}

        fn is_alive(&self) -> bool {
            self.alive
        }
    }

    fn list_tools_response(names: &[&str], next_cursor: Option<&str>) -> serde_json::Value {
        let tools: Vec<serde_json::Value> = names
            .iter()
            .map(|name| serde_json::json!({"name": name, "inputSchema": {"type": "object"}}))
            .collect();
        let mut result = serde_json::json!({"tools": tools});
        if let Some(cursor) = next_cursor {
            result["nextCursor"] = serde_json::json!(cursor);
        }
        serde_json::json!({"jsonrpc": "2.0", "id": 1, "result": result})
    }

    #[tokio::test]
    async fn list_tools_follows_cursors() {
        let transport = ScriptedTransport::new(vec![
            list_tools_response(&["a"], Some("next")),
            list_tools_response(&["b"], None),
        ]);
        let client = McpClient::with_transport("alpha".to_string(), Box::new(transport));
        let tools = client.list_tools().await.expect("should list");
        assert_eq!(
            tools.iter().map(|t| t.name.as_str()).collect::<Vec<_>>(),
            vec!["a", "b"]
        );
    }

    #[tokio::test]
    async fn list_tools_treats_method_not_found_as_empty() {
        let transport = ScriptedTransport::new(vec![serde_json::json!({
            "jsonrpc": "2.0",
            "id": 1,
            "error": {"code": -32601, "message": "Method not found"}
        })]);
        let client = McpClient::with_transport("alpha".to_string(), Box::new(transport));
        let tools = client.list_tools().await.expect("should succeed");
        assert!(tools.is_empty());
    }

    #[tokio::test]
    async fn call_tool_surfaces_peer_reported_failure_as_result() {
        let transport = ScriptedTransport::new(vec![serde_json::json!({
            "jsonrpc": "2.0",
            "id": 1,
            "result": {
                "content": [{"type": "text", "text": "lookup failed"}],
                "isError": true
            }
        })]);
        let client = McpClient::with_transport("alpha".to_string(), Box::new(transport));
        let result = client.call_tool("lookup", None).await.expect("call should succeed");
        assert!(result.is_error());
        assert_eq!(result.joined_text(), "lookup failed");
    }

    #[tokio::test]
    async fn connect_rejects_invalid_config() {
        let config = ServerConfig {
            id: "alpha".to_string(),
            name: "Alpha".to_string(),
            transport: TransportKind::Stdio,
            command: None,
            args: None,
            env: None,
            url: None,
        };
        let err = McpClient::connect(&config).await.expect_err("expected config error");
        assert!(matches!(err, McpError::Config(_)));
    }
}
