//! Builtin tool provider: tools served in-process under a reserved
//! server id, with no subprocess or remote peer behind them.
//!
//! The provider is always addressable. It never appears in the registry,
//! cannot be disconnected, and reports `Connected` unconditionally.

use crate::mcp::types::{ToolDescriptor, ToolResult};
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

pub const BUILTIN_SERVER_ID: &str = "__builtin__";
pub const GEOCODE_TOOL_NAME: &str = "geocode";

const NOMINATIM_SEARCH_URL: &str = "https://nominatim.openstreetmap.org/search";
const NOMINATIM_USER_AGENT: &str = concat!("parley/", env!("CARGO_PKG_VERSION"));
const GEOCODE_DEFAULT_LIMIT: u64 = 1;
const GEOCODE_MAX_LIMIT: u64 = 10;
const GEOCODE_REQUEST_TIMEOUT_SECONDS: u64 = 15;

#[derive(Debug, Deserialize)]
struct NominatimResult {
    lat: String,
    lon: String,
    display_name: String,
    #[serde(rename = "type", default)]
    kind: Option<String>,
}

pub struct BuiltinProvider {
    http: reqwest::Client,
}

impl Default for BuiltinProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl BuiltinProvider {
    pub fn new() -> Self {
        // Nominatim usage policy requires an identifying User-Agent.
        let http = reqwest::Client::builder()
            .user_agent(NOMINATIM_USER_AGENT)
            .timeout(Duration::from_secs(GEOCODE_REQUEST_TIMEOUT_SECONDS))
            .build()
            .unwrap_or_default();
        Self { http }
    }

    pub fn is_builtin_server(server_id: &str) -> bool {
        server_id == BUILTIN_SERVER_ID
    }

    pub fn tools(&self) -> Vec<ToolDescriptor> {
        vec![ToolDescriptor {
            name: GEOCODE_TOOL_NAME.to_string(),
            description: Some(
                "Resolves a city name or address to latitude and longitude coordinates \
                 using the Nominatim OpenStreetMap API."
                    .to_string(),
            ),
            input_schema: Some(serde_json::json!({
                "type": "object",
                "properties": {
                    "query": {
                        "type": "string",
                        "description": "City name or address to search for (e.g. \"Seoul\", \"Tokyo\", \"123 Main St, New York\")"
                    },
                    "limit": {
                        "type": "number",
                        "description": "Maximum number of results to return (default: 1, max: 10)",
                        "default": 1
                    }
                },
                "required": ["query"]
            })),
        }]
    }

    pub fn has_tool(&self, name: &str) -> bool {
        name == GEOCODE_TOOL_NAME
    }

    /// Runs a builtin tool. An unknown tool name is a tool-level failure
    /// carried in the result, not an `Err`.
    pub async fn execute(
        &self,
        name: &str,
        arguments: Option<&serde_json::Map<String, Value>>,
    ) -> ToolResult {
        match name {
            GEOCODE_TOOL_NAME => self.execute_geocode(arguments).await,
            other => ToolResult::error_text(format!("Unknown builtin tool: {other}")),
        }
    }

    async fn execute_geocode(&self, arguments: Option<&serde_json::Map<String, Value>>) -> ToolResult {
        let query = arguments
            .and_then(|args| args.get("query"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .trim()
            .to_string();
        if query.is_empty() {
            return ToolResult::error_text("Error: a search query is required.");
        }

        let limit = clamp_limit(
            arguments
                .and_then(|args| args.get("limit"))
                .and_then(Value::as_u64),
        );
        debug!(query = %query, limit, "Executing builtin geocode tool");

        match self.search_nominatim(&query, limit).await {
            Ok(results) if results.is_empty() => ToolResult::text(format!(
                "No results found for \"{query}\". Try a different search term."
            )),
            Ok(results) => ToolResult::text(format_geocode_results(&query, &results)),
            Err(message) => ToolResult::error_text(format!("Geocode error: {message}")),
        }
    }

    async fn search_nominatim(
        &self,
        query: &str,
        limit: u64,
    ) -> Result<Vec<NominatimResult>, String> {
        let response = self
            .http
            .get(NOMINATIM_SEARCH_URL)
            .query(&[
                ("q", query),
                ("format", "json"),
                ("limit", &limit.to_string()),
                ("addressdetails", "1"),
            ])
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|err| err.to_string())?;
        if !response.status().is_success() {
            return Err(format!("Nominatim request failed: {}", response.status()));
        }
        response
            .json::<Vec<NominatimResult>>()
            .await
            .map_err(|err| err.to_string())
    }
}

fn clamp_limit(limit: Option<u64>) -> u64 {
    limit
        .unwrap_or(GEOCODE_DEFAULT_LIMIT)
        .clamp(GEOCODE_DEFAULT_LIMIT, GEOCODE_MAX_LIMIT)
}

fn format_geocode_results(query: &str, results: &[NominatimResult]) -> String {
    if let [only] = results {
        return format!(
            "Results for \"{query}\":\n\nPlace: {}\nLatitude: {}\nLongitude: {}\nType: {}",
            only.display_name,
            only.lat,
            only.lon,
            only.kind.as_deref().unwrap_or("unknown")
        );
    }

    let listing = results
        .iter()
        .enumerate()
        .map(|(index, result)| {
            format!(
                "{}. {}\n   Latitude: {}, Longitude: {}\n   Type: {}",
                index + 1,
                result.display_name,
                result.lat,
                result.lon,
                result.kind.as_deref().unwrap_or("unknown")
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n");
    format!(
        "Results for \"{query}\" ({} matches):\n\n{listing}",
        results.len()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limit_clamps_into_allowed_range() {
        assert_eq!(clamp_limit(None), 1);
        assert_eq!(clamp_limit(Some(0)), 1);
        assert_eq!(clamp_limit(Some(3)), 3);
        assert_eq!(clamp_limit(Some(15)), 10);
    }

    #[tokio::test]
    async fn empty_query_fails_without_network() {
        let provider = BuiltinProvider::new();
        let mut args = serde_json::Map::new();
        args.insert("query".to_string(), serde_json::json!("   "));
        let result = provider.execute(GEOCODE_TOOL_NAME, Some(&args)).await;
        assert!(result.is_error());
    }

    #[tokio::test]
    async fn unknown_tool_is_a_result_level_error() {
        let provider = BuiltinProvider::new();
        let result = provider.execute("teleport", None).await;
        assert!(result.is_error());
        assert!(result.joined_text().contains("teleport"));
    }

    #[test]
    fn single_and_multi_results_format_differently() {
        let single = vec![NominatimResult {
            lat: "37.56".to_string(),
            lon: "126.97".to_string(),
            display_name: "Seoul, South Korea".to_string(),
            kind: Some("city".to_string()),
        }];
        let text = format_geocode_results("Seoul", &single);
        assert!(text.contains("Place: Seoul, South Korea"));

        let multi = vec![
            NominatimResult {
                lat: "1".to_string(),
                lon: "2".to_string(),
                display_name: "A".to_string(),
                kind: None,
            },
            NominatimResult {
                lat: "3".to_string(),
                lon: "4".to_string(),
                display_name: "B".to_string(),
                kind: None,
            },
        ];
        let text = format_geocode_results("x", &multi);
        assert!(text.contains("(2 matches)"));
        assert!(text.contains("1. A"));
        assert!(text.contains("2. B"));
    }
}
