//! Command-line entrypoint: argument parsing and the interactive loop.

use clap::Parser;
use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use crate::api::ChatMessage;
use crate::commands::{self, CommandContext, CommandResult};
use crate::core::config::Config;
use crate::gateway::{ChatGenerationRequest, Gateway};
use crate::mcp::builtin::BuiltinProvider;
use crate::mcp::registry::McpRegistry;

#[derive(Parser)]
#[command(name = "parley")]
#[command(about = "A terminal chat client that bridges MCP servers into an OpenAI-compatible API")]
#[command(
    long_about = "Parley connects to MCP servers over stdio or streamable HTTP, exposes their \
tools to an OpenAI-compatible chat model, and streams the responses to the terminal.\n\n\
Configuration lives in a TOML file (see --config). The API key is read from the \
environment variable named by the provider config (default OPENAI_API_KEY).\n\n\
Type /help at the prompt for the command list."
)]
pub struct Args {
    /// Path to the config file (defaults to the platform config directory)
    #[arg(short, long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Model to use for chat
    #[arg(short, long, value_name = "MODEL")]
    pub model: Option<String>,

    /// Base URL of the OpenAI-compatible API
    #[arg(long, value_name = "URL")]
    pub base_url: Option<String>,

    /// Environment variable holding the API key
    #[arg(long, value_name = "VAR")]
    pub api_key_env: Option<String>,
}

pub async fn run() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config_path = args.config.clone().or_else(Config::default_config_path);
    let mut config = match &config_path {
        Some(path) => Config::load_from_path(path)?,
        None => Config::default(),
    };

    if let Some(model) = args.model {
        config.provider.model = model;
    }
    if let Some(base_url) = args.base_url {
        config.provider.base_url = base_url;
    }
    if let Some(api_key_env) = args.api_key_env {
        config.provider.api_key_env = api_key_env;
    }

    let api_key = std::env::var(&config.provider.api_key_env).unwrap_or_default();
    if api_key.is_empty() {
        warn!(
            variable = %config.provider.api_key_env,
            "API key environment variable is empty; chat requests will fail to authenticate"
        );
    }

    let registry = Arc::new(McpRegistry::new());
    let builtin = Arc::new(BuiltinProvider::new());
    let gateway = Arc::new(Gateway::new(
        registry.clone(),
        builtin,
        config.provider.clone(),
        api_key,
    ));

    let startup = registry.connect_all(config.servers.clone()).await;
    for (id, result) in &startup {
        match result {
            Ok(()) => println!("Connected to {id}."),
            Err(err) => println!("Failed to connect {id}: {err}"),
        }
    }

    let ctx = CommandContext {
        gateway: gateway.clone(),
        config: Mutex::new(config),
        config_path,
    };

    run_repl(&ctx, gateway).await?;

    registry.disconnect_all().await;
    Ok(())
}

async fn run_repl(ctx: &CommandContext, gateway: Arc<Gateway>) -> Result<(), Box<dyn Error>> {
    let mut history: Vec<ChatMessage> = Vec::new();
    let stdin = BufReader::new(tokio::io::stdin());
    let mut lines = stdin.lines();
    let mut stdout = tokio::io::stdout();

    loop {
        stdout.write_all(b"> ").await?;
        stdout.flush().await?;

        let Some(line) = lines.next_line().await? else {
            break;
        };
        if line.trim().is_empty() {
            continue;
        }

        match commands::process_input(ctx, &line).await {
            CommandResult::Quit => break,
            CommandResult::Output(text) => {
                stdout.write_all(text.as_bytes()).await?;
                stdout.write_all(b"\n").await?;
                stdout.flush().await?;
            }
            CommandResult::ProcessAsMessage(message) => {
                history.push(ChatMessage::new("user", message));
                let request = ChatGenerationRequest {
                    messages: history.clone(),
                    connected_server_ids: gateway.connected_server_ids().await,
                };
                match gateway.chat(request).await {
                    Ok(mut rx) => {
                        let mut assistant_text = String::new();
                        while let Some(chunk) = rx.recv().await {
                            if let Ok(text) = std::str::from_utf8(&chunk) {
                                assistant_text.push_str(text);
                            }
                            stdout.write_all(&chunk).await?;
                            stdout.flush().await?;
                        }
                        stdout.write_all(b"\n").await?;
                        stdout.flush().await?;
                        history.push(ChatMessage::new("assistant", assistant_text));
                    }
                    Err(err) => {
                        stdout
                            .write_all(
                                format!("Request failed ({}): {err}\n", err.status_code())
                                    .as_bytes(),
                            )
                            .await?;
                        stdout.flush().await?;
                        // Keep the failed turn out of the history.
                        history.pop();
                    }
                }
            }
        }
    }

    Ok(())
}
