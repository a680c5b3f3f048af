//! Parley is a terminal chat client that bridges a streaming LLM API with
//! MCP (Model Context Protocol) tool servers.
//!
//! The crate is organized around a small set of collaborating layers:
//! - [`mcp`] owns the connection registry, the stdio/streamable-HTTP
//!   transports, the capability client, and the builtin tool provider.
//! - [`gateway`] exposes the uniform invocation surface: typed connect,
//!   disconnect, tool, resource, and prompt operations plus the streaming
//!   chat entry point.
//! - [`core`] holds configuration (including the import/export document)
//!   and the chat streaming bridge that forwards model output downstream.
//! - [`commands`] implements slash-command parsing and execution used by
//!   the REPL.
//! - [`api`] defines the chat payloads exchanged with the upstream model
//!   API.
//!
//! Runtime entrypoints live in the binary crate (`src/main.rs`) and route
//! through [`cli::run`], which builds the registry, connects configured
//! servers, and drives the interactive session.

pub mod api;
pub mod cli;
pub mod commands;
pub mod core;
pub mod gateway;
pub mod mcp;
