//! Slash-command layer over the gateway.
//!
//! Input that does not start with `/` is passed through as a chat
//! message; everything else is dispatched to a handler that renders its
//! outcome as printable text.

mod prompt_args;

use crate::core::config::Config;
use crate::core::export;
use crate::gateway::Gateway;
use crate::mcp::types::ToolResult;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;

pub enum CommandResult {
    Output(String),
    ProcessAsMessage(String),
    Quit,
}

pub struct CommandContext {
    pub gateway: Arc<Gateway>,
    pub config: Mutex<Config>,
    pub config_path: Option<PathBuf>,
}

pub async fn process_input(ctx: &CommandContext, input: &str) -> CommandResult {
    let trimmed = input.trim();

    if !trimmed.starts_with('/') {
        return CommandResult::ProcessAsMessage(input.to_string());
    }

    let mut parts = trimmed[1..].splitn(2, ' ');
    let command_name = match parts.next() {
        Some(name) if !name.is_empty() => name,
        _ => return CommandResult::ProcessAsMessage(input.to_string()),
    };
    let args = parts.next().unwrap_or("").trim();

    match command_name {
        "help" => CommandResult::Output(help_text()),
        "quit" | "exit" => CommandResult::Quit,
        "servers" | "status" => handle_servers(ctx).await,
        "connect" => handle_connect(ctx, args).await,
        "disconnect" => handle_disconnect(ctx, args).await,
        "refresh" => handle_refresh(ctx).await,
        "tools" => handle_tools(ctx, args).await,
        "call" => handle_call(ctx, args).await,
        "resources" => handle_resources(ctx, args).await,
        "read" => handle_read(ctx, args).await,
        "prompts" => handle_prompts(ctx, args).await,
        "prompt" => handle_prompt(ctx, args).await,
        "export" => handle_export(ctx, args).await,
        "import" => handle_import(ctx, args).await,
        _ => CommandResult::Output(format!(
            "Unknown command: /{command_name}. Try /help."
        )),
    }
}

fn help_text() -> String {
    [
        "Commands:",
        "  /servers                     show configured servers and their status",
        "  /connect <id>                connect a configured server",
        "  /disconnect <id>             disconnect a server",
        "  /refresh                     refresh cached capabilities of live servers",
        "  /tools [id]                  list tools (all connected servers by default)",
        "  /call <id> <tool> [json]     invoke a tool with JSON object arguments",
        "  /resources <id>              list resources and resource templates",
        "  /read <id> <uri>             read a resource",
        "  /prompts <id>                list prompts",
        "  /prompt <id> <name> [k=v]    fetch a prompt with key=value arguments",
        "  /export [path]               export the server roster as JSON (env omitted)",
        "  /import <path>               import servers from an exported JSON file",
        "  /quit                        exit",
        "",
        "Anything else is sent to the model as a chat message.",
    ]
    .join("\n")
}

async fn handle_servers(ctx: &CommandContext) -> CommandResult {
    let config = ctx.config.lock().await;
    let entries = ctx.gateway.server_statuses(&config.servers).await;
    let lines: Vec<String> = entries
        .iter()
        .map(|entry| format!("{:<20} {:<24} {}", entry.id, entry.name, entry.status))
        .collect();
    CommandResult::Output(lines.join("\n"))
}

async fn handle_connect(ctx: &CommandContext, args: &str) -> CommandResult {
    let id = args.trim();
    if id.is_empty() {
        return CommandResult::Output("Usage: /connect <id>".to_string());
    }
    let server = {
        let config = ctx.config.lock().await;
        config.server(id).cloned()
    };
    let Some(server) = server else {
        return CommandResult::Output(format!("No configured server with id '{id}'."));
    };
    let response = ctx.gateway.connect(server).await;
    if response.success {
        CommandResult::Output(format!("Connected to {id}."))
    } else {
        CommandResult::Output(format!(
            "Failed to connect {id}: {}",
            response.error.unwrap_or_else(|| "unknown error".to_string())
        ))
    }
}

async fn handle_disconnect(ctx: &CommandContext, args: &str) -> CommandResult {
    let id = args.trim();
    if id.is_empty() {
        return CommandResult::Output("Usage: /disconnect <id>".to_string());
    }
    let response = ctx.gateway.disconnect(id).await;
    if response.success {
        CommandResult::Output(format!("Disconnected {id}."))
    } else {
        CommandResult::Output(format!(
            "Failed to disconnect {id}: {}",
            response.error.unwrap_or_else(|| "unknown error".to_string())
        ))
    }
}

async fn handle_refresh(ctx: &CommandContext) -> CommandResult {
    ctx.gateway.registry().refresh_capabilities().await;
    CommandResult::Output("Capabilities refreshed.".to_string())
}

async fn handle_tools(ctx: &CommandContext, args: &str) -> CommandResult {
    let ids = if args.trim().is_empty() {
        ctx.gateway.connected_server_ids().await
    } else {
        vec![args.trim().to_string()]
    };

    let mut lines = Vec::new();
    for id in ids {
        let response = ctx.gateway.list_tools(&id).await;
        lines.push(format!("[{id}]"));
        if let Some(error) = response.error {
            lines.push(format!("  error: {error}"));
            continue;
        }
        if response.tools.is_empty() {
            lines.push("  (no tools)".to_string());
        }
        for tool in response.tools {
            match tool.description {
                Some(description) => lines.push(format!("  {} - {description}", tool.name)),
                None => lines.push(format!("  {}", tool.name)),
            }
        }
    }
    CommandResult::Output(lines.join("\n"))
}

async fn handle_call(ctx: &CommandContext, args: &str) -> CommandResult {
    let mut parts = args.splitn(3, ' ');
    let (Some(id), Some(tool)) = (parts.next(), parts.next()) else {
        return CommandResult::Output("Usage: /call <id> <tool> [json]".to_string());
    };
    let raw_arguments = parts.next().unwrap_or("").trim();
    let arguments = if raw_arguments.is_empty() {
        None
    } else {
        match serde_json::from_str::<serde_json::Value>(raw_arguments) {
            Ok(serde_json::Value::Object(map)) => Some(map),
            Ok(_) => {
                return CommandResult::Output(
                    "Tool arguments must be a JSON object.".to_string(),
                )
            }
            Err(err) => return CommandResult::Output(format!("Invalid JSON arguments: {err}")),
        }
    };

    let response = ctx.gateway.call_tool(id, tool, arguments).await;
    match (response.result, response.error) {
        (Some(result), _) => CommandResult::Output(render_tool_result(&result)),
        (None, Some(error)) => CommandResult::Output(format!("Tool call failed: {error}")),
        (None, None) => CommandResult::Output("Tool call returned nothing.".to_string()),
    }
}

fn render_tool_result(result: &ToolResult) -> String {
    let text = result.joined_text();
    if result.is_error() {
        format!("Tool reported an error:\n{text}")
    } else if text.is_empty() {
        "(no text content)".to_string()
    } else {
        text
    }
}

async fn handle_resources(ctx: &CommandContext, args: &str) -> CommandResult {
    let id = args.trim();
    if id.is_empty() {
        return CommandResult::Output("Usage: /resources <id>".to_string());
    }
    let response = ctx.gateway.list_resources(id).await;
    if let Some(error) = response.error {
        return CommandResult::Output(format!("Failed to list resources: {error}"));
    }
    let mut lines = Vec::new();
    if response.resources.is_empty() && response.resource_templates.is_empty() {
        lines.push("(no resources)".to_string());
    }
    for resource in response.resources {
        lines.push(format!("{}  {}", resource.uri, resource.name));
    }
    for template in response.resource_templates {
        lines.push(format!("{}  {} (template)", template.uri_template, template.name));
    }
    CommandResult::Output(lines.join("\n"))
}

async fn handle_read(ctx: &CommandContext, args: &str) -> CommandResult {
    let mut parts = args.splitn(2, ' ');
    let (Some(id), Some(uri)) = (parts.next(), parts.next()) else {
        return CommandResult::Output("Usage: /read <id> <uri>".to_string());
    };
    let response = ctx.gateway.read_resource(id, uri.trim()).await;
    if let Some(error) = response.error {
        return CommandResult::Output(format!("Failed to read resource: {error}"));
    }
    let mut lines = Vec::new();
    for content in response.contents {
        match (content.text, content.blob) {
            (Some(text), _) => lines.push(text),
            (None, Some(_)) => lines.push(format!(
                "(binary content, {})",
                content.mime_type.unwrap_or_else(|| "unknown type".to_string())
            )),
            (None, None) => lines.push(format!("(empty content at {})", content.uri)),
        }
    }
    if lines.is_empty() {
        lines.push("(no contents)".to_string());
    }
    CommandResult::Output(lines.join("\n"))
}

async fn handle_prompts(ctx: &CommandContext, args: &str) -> CommandResult {
    let id = args.trim();
    if id.is_empty() {
        return CommandResult::Output("Usage: /prompts <id>".to_string());
    }
    let response = ctx.gateway.list_prompts(id).await;
    if let Some(error) = response.error {
        return CommandResult::Output(format!("Failed to list prompts: {error}"));
    }
    if response.prompts.is_empty() {
        return CommandResult::Output("(no prompts)".to_string());
    }
    let lines: Vec<String> = response
        .prompts
        .iter()
        .map(|prompt| {
            let arg_names: Vec<&str> = prompt
                .arguments
                .as_deref()
                .unwrap_or_default()
                .iter()
                .map(|arg| arg.name.as_str())
                .collect();
            if arg_names.is_empty() {
                prompt.name.clone()
            } else {
                format!("{} ({})", prompt.name, arg_names.join(", "))
            }
        })
        .collect();
    CommandResult::Output(lines.join("\n"))
}

async fn handle_prompt(ctx: &CommandContext, args: &str) -> CommandResult {
    let mut parts = args.splitn(3, ' ');
    let (Some(id), Some(name)) = (parts.next(), parts.next()) else {
        return CommandResult::Output("Usage: /prompt <id> <name> [key=value ...]".to_string());
    };
    let arguments = match prompt_args::parse_kv_args(parts.next().unwrap_or("")) {
        Ok(arguments) => arguments,
        Err(err) => return CommandResult::Output(err),
    };

    let response = ctx.gateway.get_prompt(id, name, arguments).await;
    if let Some(error) = response.error {
        return CommandResult::Output(format!("Failed to fetch prompt: {error}"));
    }
    let mut lines = Vec::new();
    if let Some(description) = response.description {
        lines.push(description);
    }
    for message in response.messages {
        let text = message.content.text.as_deref().unwrap_or("(non-text content)");
        lines.push(format!("[{}] {}", message.role, text));
    }
    CommandResult::Output(lines.join("\n"))
}

async fn handle_export(ctx: &CommandContext, args: &str) -> CommandResult {
    let servers = {
        let config = ctx.config.lock().await;
        config.servers.clone()
    };
    let json = match export::export_to_json(&servers) {
        Ok(json) => json,
        Err(err) => return CommandResult::Output(format!("Export failed: {err}")),
    };
    let path = args.trim();
    if path.is_empty() {
        return CommandResult::Output(json);
    }
    match std::fs::write(path, &json) {
        Ok(()) => CommandResult::Output(format!("Exported {} servers to {path}.", servers.len())),
        Err(err) => CommandResult::Output(format!("Export failed: {err}")),
    }
}

async fn handle_import(ctx: &CommandContext, args: &str) -> CommandResult {
    let path = args.trim();
    if path.is_empty() {
        return CommandResult::Output("Usage: /import <path>".to_string());
    }
    let json = match std::fs::read_to_string(path) {
        Ok(json) => json,
        Err(err) => return CommandResult::Output(format!("Import failed: {err}")),
    };
    let imported = match export::import_servers(&json) {
        Ok(imported) => imported,
        Err(err) => return CommandResult::Output(format!("Import failed: {err}")),
    };

    let count = imported.len();
    let mut config = ctx.config.lock().await;
    for server in imported {
        match config.servers.iter_mut().find(|existing| existing.id == server.id) {
            Some(existing) => *existing = server,
            None => config.servers.push(server),
        }
    }
    if let Some(path) = &ctx.config_path {
        if let Err(err) = config.save_to_path(path) {
            return CommandResult::Output(format!(
                "Imported {count} servers, but saving the config failed: {err}"
            ));
        }
    }
    CommandResult::Output(format!("Imported {count} servers."))
}
