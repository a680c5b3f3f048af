//! Shareable JSON export of the server roster.
//!
//! Env maps are stripped on export so credentials referenced through
//! `$VAR` values never leave the local config.

use crate::core::config::{ServerConfig, TransportKind};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const EXPORT_FORMAT_VERSION: &str = "1.0";

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportedConfig {
    pub version: String,
    pub servers: Vec<ExportedServerConfig>,
    pub exported_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportedServerConfig {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub transport: TransportKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl From<&ServerConfig> for ExportedServerConfig {
    fn from(config: &ServerConfig) -> Self {
        Self {
            id: config.id.clone(),
            name: config.name.clone(),
            transport: config.transport,
            command: config.command.clone(),
            args: config.args.clone(),
            url: config.url.clone(),
        }
    }
}

impl From<ExportedServerConfig> for ServerConfig {
    fn from(exported: ExportedServerConfig) -> Self {
        Self {
            id: exported.id,
            name: exported.name,
            transport: exported.transport,
            command: exported.command,
            args: exported.args,
            env: None,
            url: exported.url,
        }
    }
}

pub fn export_servers(servers: &[ServerConfig]) -> ExportedConfig {
    ExportedConfig {
        version: EXPORT_FORMAT_VERSION.to_string(),
        servers: servers.iter().map(ExportedServerConfig::from).collect(),
        exported_at: Utc::now(),
    }
}

pub fn export_to_json(servers: &[ServerConfig]) -> Result<String, String> {
    serde_json::to_string_pretty(&export_servers(servers)).map_err(|err| err.to_string())
}

pub fn import_servers(json: &str) -> Result<Vec<ServerConfig>, String> {
    let exported: ExportedConfig =
        serde_json::from_str(json).map_err(|err| format!("invalid export file: {err}"))?;
    let servers: Vec<ServerConfig> = exported
        .servers
        .into_iter()
        .map(ServerConfig::from)
        .collect();
    for server in &servers {
        server.validate()?;
    }
    Ok(servers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn roster() -> Vec<ServerConfig> {
        let mut env = HashMap::new();
        env.insert("TOKEN".to_string(), "$SECRET_TOKEN".to_string());
        vec![
            ServerConfig {
                id: "alpha".to_string(),
                name: "Alpha".to_string(),
                transport: TransportKind::Stdio,
                command: Some("alpha-server".to_string()),
                args: Some(vec!["--quiet".to_string()]),
                env: Some(env),
                url: None,
            },
            ServerConfig {
                id: "beta".to_string(),
                name: "Beta".to_string(),
                transport: TransportKind::StreamableHttp,
                command: None,
                args: None,
                env: None,
                url: Some("https://mcp.example.com/mcp".to_string()),
            },
        ]
    }

    #[test]
    fn export_strips_env_and_round_trips() {
        let json = export_to_json(&roster()).expect("should serialize");
        assert!(!json.contains("SECRET_TOKEN"));
        assert!(json.contains("\"exportedAt\""));

        let imported = import_servers(&json).expect("should import");
        assert_eq!(imported.len(), 2);
        assert_eq!(imported[0].id, "alpha");
        assert!(imported[0].env.is_none());
        assert_eq!(imported[1].transport, TransportKind::StreamableHttp);
    }

    #[test]
    fn import_rejects_invalid_entries() {
        let json = serde_json::json!({
            "version": "1.0",
            "servers": [{"id": "bad", "name": "Bad", "type": "stdio"}],
            "exportedAt": "2026-01-01T00:00:00Z"
        })
        .to_string();
        assert!(import_servers(&json).is_err());
    }
}
