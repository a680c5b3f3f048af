//! Decoding of JSON-RPC results into the capability data model.
//!
//! Results are taken as raw JSON and deserialized into the local
//! descriptor types so that fields a peer adds beyond the baseline
//! schema survive the round trip through the registry.

use crate::mcp::error::McpError;
use crate::mcp::types::{
    PromptDescriptor, PromptMessage, ResourceContent, ResourceDescriptor,
    ResourceTemplateDescriptor, ToolDescriptor, ToolResult,
};
use rust_mcp_schema::schema_utils::ServerMessage;
use serde::Deserialize;
use serde_json::Value;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListToolsPage {
    #[serde(default)]
    pub tools: Vec<ToolDescriptor>,
    #[serde(default)]
    pub next_cursor: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListResourcesPage {
    #[serde(default)]
    pub resources: Vec<ResourceDescriptor>,
    #[serde(default)]
    pub next_cursor: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListResourceTemplatesPage {
    #[serde(default)]
    pub resource_templates: Vec<ResourceTemplateDescriptor>,
    #[serde(default)]
    pub next_cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListPromptsPage {
    #[serde(default)]
    pub prompts: Vec<PromptDescriptor>,
    #[serde(default)]
    pub next_cursor: Option<String>,
}

#[derive(Deserialize)]
pub struct ReadResourceResult {
    #[serde(default)]
    pub contents: Vec<ResourceContent>,
}

#[derive(Deserialize)]
pub struct GetPromptResult {
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub messages: Vec<PromptMessage>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeSummary {
    pub protocol_version: String,
}

pub fn parse_initialize_result(message: ServerMessage) -> Result<InitializeSummary, McpError> {
    let result: InitializeSummary = parse_response(message)?;
    if result.protocol_version.trim().is_empty() {
        return Err(McpError::UnexpectedMessage(
            "initialize response without protocol version".to_string(),
        ));
    }
    Ok(result)
}

pub fn parse_list_tools(message: ServerMessage) -> Result<ListToolsPage, McpError> {
    parse_response(message)
}

pub fn parse_list_resources(message: ServerMessage) -> Result<ListResourcesPage, McpError> {
    parse_response(message)
}

pub fn parse_list_resource_templates(
    message: ServerMessage,
) -> Result<ListResourceTemplatesPage, McpError> {
    parse_response(message)
}

pub fn parse_list_prompts(message: ServerMessage) -> Result<ListPromptsPage, McpError> {
    parse_response(message)
}

pub fn parse_get_prompt(message: ServerMessage) -> Result<GetPromptResult, McpError> {
    parse_response(message)
}

pub fn parse_read_resource(message: ServerMessage) -> Result<ReadResourceResult, McpError> {
    parse_response(message)
}

pub fn parse_call_tool(message: ServerMessage) -> Result<ToolResult, McpError> {
    parse_response(message)
}

fn parse_response<T: serde::de::DeserializeOwned>(message: ServerMessage) -> Result<T, McpError> {
    let value = parse_response_value(message)?;
    serde_json::from_value::<T>(value).map_err(|err| McpError::Transport(err.to_string()))
}

pub fn parse_response_value(message: ServerMessage) -> Result<Value, McpError> {
    match message {
        ServerMessage::Response(response) => serde_json::to_value(&response.result)
            .map_err(|err| McpError::Transport(err.to_string())),
        ServerMessage::Error(error) => Err(McpError::rpc(error.error.code, error.error.message)),
        ServerMessage::Request(request) => Err(McpError::UnexpectedMessage(format!(
            "server request {} in place of a response",
            request.method()
        ))),
        ServerMessage::Notification(_) => Err(McpError::UnexpectedMessage(
            "server notification in place of a response".to_string(),
        )),
    }
}
