//! TOML configuration: upstream provider settings plus the MCP server
//! roster loaded at startup.

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::error::Error as StdError;
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub provider: ProviderConfig,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub servers: Vec<ServerConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    pub base_url: String,
    pub api_key_env: String,
    pub model: String,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            api_key_env: "OPENAI_API_KEY".to_string(),
            model: "gpt-4o-mini".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransportKind {
    Stdio,
    #[default]
    #[serde(alias = "http", alias = "streamable_http")]
    StreamableHttp,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Stdio => f.write_str("stdio"),
            TransportKind::StreamableHttp => f.write_str("streamable-http"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub id: String,
    pub name: String,
    #[serde(default, alias = "type")]
    pub transport: TransportKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<HashMap<String, String>>,
    #[serde(default, alias = "base_url", skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl ServerConfig {
    /// Checks that the fields required by the transport kind are present.
    pub fn validate(&self) -> Result<(), String> {
        if self.id.trim().is_empty() {
            return Err("server id must not be empty".to_string());
        }
        match self.transport {
            TransportKind::Stdio => match self.command.as_deref() {
                Some(command) if !command.trim().is_empty() => Ok(()),
                _ => Err(format!("server {}: command is required for stdio", self.id)),
            },
            TransportKind::StreamableHttp => match self.url.as_deref() {
                Some(url) if !url.trim().is_empty() => Ok(()),
                _ => Err(format!(
                    "server {}: url is required for streamable-http",
                    self.id
                )),
            },
        }
    }

    /// Environment for a spawned server. Values of the form `$NAME` are
    /// replaced with the process environment value of `NAME`; unset
    /// variables resolve to an empty string.
    pub fn resolved_env(&self) -> Option<HashMap<String, String>> {
        let env = self.env.as_ref()?;
        let resolved = env
            .iter()
            .map(|(key, value)| (key.clone(), resolve_env_value(value)))
            .collect();
        Some(resolved)
    }
}

fn resolve_env_value(value: &str) -> String {
    match value.strip_prefix('$') {
        Some(name) if !name.is_empty() => std::env::var(name).unwrap_or_default(),
        _ => value.to_string(),
    }
}

pub fn path_display<P: AsRef<Path>>(path: P) -> String {
    let path = path.as_ref();

    #[cfg(unix)]
    {
        if let Some(home) = std::env::var_os("HOME") {
            let home_path = PathBuf::from(home);
            if let Ok(relative) = path.strip_prefix(&home_path) {
                return format!("~/{}", relative.display());
            }
        }
    }

    path.display().to_string()
}

/// Errors that can occur when loading configuration from disk.
#[derive(Debug)]
pub enum ConfigError {
    /// Failed to read the configuration file from disk.
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Failed to parse the configuration file as valid TOML.
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "Failed to read config at {}: {}", path_display(path), source)
            }
            ConfigError::Parse { path, source } => {
                write!(f, "Failed to parse config at {}: {}", path_display(path), source)
            }
        }
    }
}

impl StdError for ConfigError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
        }
    }
}

impl Config {
    pub fn load_from_path(config_path: &PathBuf) -> Result<Config, Box<dyn std::error::Error>> {
        if config_path.exists() {
            let contents = fs::read_to_string(config_path).map_err(|source| ConfigError::Read {
                path: config_path.clone(),
                source,
            })?;
            let config: Config =
                toml::from_str(&contents).map_err(|source| ConfigError::Parse {
                    path: config_path.clone(),
                    source,
                })?;
            Ok(config)
        } else {
            Ok(Config::default())
        }
    }

    pub fn save_to_path(&self, config_path: &Path) -> Result<(), Box<dyn std::error::Error>> {
        let parent = config_path
            .parent()
            .filter(|dir| !dir.as_os_str().is_empty());

        if let Some(dir) = parent {
            fs::create_dir_all(dir)?;
        }

        let contents = toml::to_string_pretty(self)?;
        let mut temp_file = match parent {
            Some(dir) => NamedTempFile::new_in(dir)?,
            None => NamedTempFile::new()?,
        };

        temp_file.write_all(contents.as_bytes())?;
        temp_file.as_file_mut().sync_all()?;
        temp_file
            .persist(config_path)
            .map_err(|err| -> Box<dyn std::error::Error> { Box::new(err) })?;
        Ok(())
    }

    pub fn default_config_path() -> Option<PathBuf> {
        ProjectDirs::from("org", "parley", "parley")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    pub fn server(&self, id: &str) -> Option<&ServerConfig> {
        self.servers.iter().find(|server| server.id == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stdio_config_requires_command() {
        let config = ServerConfig {
            id: "alpha".to_string(),
            name: "Alpha".to_string(),
            transport: TransportKind::Stdio,
            command: None,
            args: None,
            env: None,
            url: None,
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn http_config_requires_url() {
        let config = ServerConfig {
            id: "beta".to_string(),
            name: "Beta".to_string(),
            transport: TransportKind::StreamableHttp,
            command: None,
            args: None,
            env: None,
            url: None,
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn transport_kind_accepts_aliases() {
        let parsed: TransportKind =
            serde_json::from_value(serde_json::json!("streamable-http")).expect("should parse");
        assert_eq!(parsed, TransportKind::StreamableHttp);
        let parsed: TransportKind =
            serde_json::from_value(serde_json::json!("http")).expect("should parse");
        assert_eq!(parsed, TransportKind::StreamableHttp);
        let parsed: TransportKind =
            serde_json::from_value(serde_json::json!("stdio")).expect("should parse");
        assert_eq!(parsed, TransportKind::Stdio);
    }

    #[test]
    fn env_values_resolve_process_variables() {
        std::env::set_var("PARLEY_TEST_TOKEN", "secret");
        let mut env = HashMap::new();
        env.insert("TOKEN".to_string(), "$PARLEY_TEST_TOKEN".to_string());
        env.insert("LITERAL".to_string(), "as-is".to_string());
        env.insert("MISSING".to_string(), "$PARLEY_TEST_UNSET".to_string());
        let config = ServerConfig {
            id: "alpha".to_string(),
            name: "Alpha".to_string(),
            transport: TransportKind::Stdio,
            command: Some("cat".to_string()),
            args: None,
            env: Some(env),
            url: None,
        };
        let resolved = config.resolved_env().expect("env should resolve");
        assert_eq!(resolved.get("TOKEN").map(String::as_str), Some("secret"));
        assert_eq!(resolved.get("LITERAL").map(String::as_str), Some("as-is"));
        assert_eq!(resolved.get("MISSING").map(String::as_str), Some(""));
    }

    #[test]
    fn config_round_trips_through_toml() {
        let toml_text = r#"
            [provider]
            base_url = "https://api.example.com/v1"
            api_key_env = "EXAMPLE_KEY"
            model = "example-model"

            [[servers]]
            id = "alpha"
            name = "Alpha"
            transport = "stdio"
            command = "alpha-server"
            args = ["--quiet"]

            [[servers]]
            id = "beta"
            name = "Beta"
            type = "streamable-http"
            url = "https://mcp.example.com/mcp"
        "#;
        let config: Config = toml::from_str(toml_text).expect("should parse");
        assert_eq!(config.servers.len(), 2);
        assert_eq!(config.servers[0].transport, TransportKind::Stdio);
        assert_eq!(config.servers[1].transport, TransportKind::StreamableHttp);
        assert!(config.server("beta").is_some());
        assert!(config.server("gamma").is_none());
    }
}
