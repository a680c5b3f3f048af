//! Connection registry: the single owner of live MCP connections, keyed
//! by server id.
//!
//! Connect and disconnect for one id are serialized through a per-id
//! lock, so overlapping lifecycle calls cannot interleave teardown and
//! handshake. A failed connect never leaves a registry entry behind.

use crate::core::config::ServerConfig;
use crate::mcp::client::McpClient;
use crate::mcp::error::McpError;
use crate::mcp::protocol::GetPromptResult;
use crate::mcp::types::{
    CapabilitySnapshot, ConnectionStatus, PromptDescriptor, ResourceContent, ResourceDescriptor,
    ResourceTemplateDescriptor, ToolDescriptor, ToolResult,
};
use futures_util::stream::{FuturesUnordered, StreamExt};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

const MCP_STARTUP_CONCURRENCY_LIMIT: usize = 3;
const MCP_REFRESH_CONCURRENCY_LIMIT: usize = 4;

pub struct ConnectionEntry {
    pub config: ServerConfig,
    pub client: Arc<McpClient>,
    pub capabilities: RwLock<CapabilitySnapshot>,
}

#[cfg(test)]
type ClientFactory = Box<dyn Fn(&ServerConfig) -> Result<McpClient, McpError> + Send + Sync>;

#[derive(Default)]
pub struct McpRegistry {
    entries: RwLock<HashMap<String, Arc<ConnectionEntry>>>,
    connect_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    pending_connects: Mutex<HashSet<String>>,
    #[cfg(test)]
    client_factory: Mutex<Option<ClientFactory>>,
}

impl McpRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    async fn connect_lock(&self, id: &str) -> Arc<Mutex<()>> {
        self.connect_locks
            .lock()
            .await
            .entry(id.to_string())
            .or_default()
            .clone()
    }

    /// Opens a connection for `config`, replacing any existing entry for
    /// the same id. The old connection is torn down before the new
    /// handshake starts.
    pub async fn connect(&self, config: ServerConfig) -> Result<(), McpError> {
        config.validate().map_err(McpError::Config)?;

        let id = config.id.clone();
        let lock = self.connect_lock(&id).await;
        let _guard = lock.lock().await;

        if let Some(existing) = self.entries.write().await.remove(&id) {
            debug!(server_id = %id, "Replacing existing MCP connection");
            existing.client.shutdown().await;
        }

        self.pending_connects.lock().await.insert(id.clone());
        let result = self.open_entry(&config).await;
        self.pending_connects.lock().await.remove(&id);

        let entry = result?;
        self.entries.write().await.insert(id, entry);
        Ok(())
    }

    #[cfg(not(test))]
    async fn open_client(&self, config: &ServerConfig) -> Result<McpClient, McpError> {
        McpClient::connect(config).await
    }

    #[cfg(test)]
    async fn open_client(&self, config: &ServerConfig) -> Result<McpClient, McpError> {
        if let Some(factory) = self.client_factory.lock().await.as_ref() {
            return factory(config);
        }
        McpClient::connect(config).await
    }

    async fn open_entry(&self, config: &ServerConfig) -> Result<Arc<ConnectionEntry>, McpError> {
        let client = Arc::new(self.open_client(config).await?);
        let capabilities = match client.snapshot_capabilities().await {
            Ok(capabilities) => capabilities,
            Err(err) => {
                client.shutdown().await;
                return Err(McpError::Connection(format!(
                    "capability discovery for {} failed: {err}",
                    config.id
                )));
            }
        };
        debug!(
            server_id = %config.id,
            tools = capabilities.tools.len(),
            resources = capabilities.resources.len(),
            prompts = capabilities.prompts.len(),
            "MCP server connected"
        );
        Ok(Arc::new(ConnectionEntry {
            config: config.clone(),
            client,
            capabilities: RwLock::new(capabilities),
        }))
    }

    /// Removes and tears down the entry for `id`. Disconnecting an
    /// absent id is not an error.
    pub async fn disconnect(&self, id: &str) -> Result<(), McpError> {
        let lock = self.connect_lock(id).await;
        {
            let _guard = lock.lock().await;
            if let Some(entry) = self.entries.write().await.remove(id) {
                entry.client.shutdown().await;
                debug!(server_id = %id, "MCP server disconnected");
            }
        }
        self.prune_connect_lock(id, &lock).await;
        Ok(())
    }

    /// Drops the per-id lock once nothing else holds or awaits it, so
    /// the lock map stays bounded by the ids currently in use.
    async fn prune_connect_lock(&self, id: &str, lock: &Arc<Mutex<()>>) {
        let mut locks = self.connect_locks.lock().await;
        let unshared = locks
            .get(id)
            .is_some_and(|existing| Arc::ptr_eq(existing, lock))
            && Arc::strong_count(lock) == 2;
        if unshared {
            locks.remove(id);
        }
    }

    pub async fn disconnect_all(&self) {
        let ids: Vec<String> = self.entries.read().await.keys().cloned().collect();
        for id in ids {
            let _ = self.disconnect(&id).await;
        }
    }

    pub async fn status(&self, id: &str) -> ConnectionStatus {
        if self.pending_connects.lock().await.contains(id) {
            return ConnectionStatus::Connecting;
        }
        match self.entries.read().await.get(id) {
            Some(entry) if entry.client.is_connected() => ConnectionStatus::Connected,
            Some(_) => ConnectionStatus::Error,
            None => ConnectionStatus::Disconnected,
        }
    }

    pub async fn connected_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .entries
            .read()
            .await
            .iter()
            .filter(|(_, entry)| entry.client.is_connected())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub async fn entry(&self, id: &str) -> Option<Arc<ConnectionEntry>> {
        self.entries.read().await.get(id).cloned()
    }

    pub async fn capabilities(&self, id: &str) -> Option<CapabilitySnapshot> {
        let entry = self.entry(id).await?;
        let snapshot = entry.capabilities.read().await.clone();
        Some(snapshot)
    }

    async fn client(&self, id: &str) -> Result<Arc<McpClient>, McpError> {
        match self.entries.read().await.get(id) {
            Some(entry) if entry.client.is_connected() => Ok(entry.client.clone()),
            Some(_) => Err(McpError::ConnectionLost(id.to_string())),
            None => Err(McpError::NotConnected(id.to_string())),
        }
    }

    pub async fn call_tool(
        &self,
        id: &str,
        name: &str,
        arguments: Option<serde_json::Map<String, serde_json::Value>>,
    ) -> Result<ToolResult, McpError> {
        self.client(id).await?.call_tool(name, arguments).await
    }

    pub async fn list_tools(&self, id: &str) -> Result<Vec<ToolDescriptor>, McpError> {
        self.client(id).await?.list_tools().await
    }

    pub async fn list_resources(
        &self,
        id: &str,
    ) -> Result<(Vec<ResourceDescriptor>, Vec<ResourceTemplateDescriptor>), McpError> {
        self.client(id).await?.list_resources().await
    }

    pub async fn read_resource(
        &self,
        id: &str,
        uri: &str,
    ) -> Result<Vec<ResourceContent>, McpError> {
        self.client(id).await?.read_resource(uri).await
    }

    pub async fn list_prompts(&self, id: &str) -> Result<Vec<PromptDescriptor>, McpError> {
        self.client(id).await?.list_prompts().await
    }

    pub async fn get_prompt(
        &self,
        id: &str,
        name: &str,
        arguments: HashMap<String, String>,
    ) -> Result<GetPromptResult, McpError> {
        self.client(id).await?.get_prompt(name, arguments).await
    }

    /// Connects every config at startup with bounded concurrency.
    /// Returns the per-id outcome so callers can report failures.
    pub async fn connect_all(
        self: &Arc<Self>,
        configs: Vec<ServerConfig>,
    ) -> Vec<(String, Result<(), McpError>)> {
        let mut results = Vec::with_capacity(configs.len());
        let mut stream = futures_util::stream::iter(configs.into_iter().map(|config| {
            let registry = self.clone();
            async move {
                let id = config.id.clone();
                let result = registry.connect(config).await;
                if let Err(err) = &result {
                    warn!(server_id = %id, error = %err, "MCP startup connect failed");
                }
                (id, result)
            }
        }))
        .buffer_unordered(MCP_STARTUP_CONCURRENCY_LIMIT);
        while let Some(outcome) = stream.next().await {
            results.push(outcome);
        }
        results
    }

    /// Re-fetches capability snapshots for all live entries. Failures
    /// leave the previous snapshot in place.
    pub async fn refresh_capabilities(&self) {
        let entries: Vec<Arc<ConnectionEntry>> = self
            .entries
            .read()
            .await
            .values()
            .filter(|entry| entry.client.is_connected())
            .cloned()
            .collect();

        let mut refreshes: FuturesUnordered<_> = FuturesUnordered::new();
        let mut queue = entries.into_iter();
        for entry in queue.by_ref().take(MCP_REFRESH_CONCURRENCY_LIMIT) {
            refreshes.push(refresh_entry(entry));
        }
        while let Some(()) = refreshes.next().await {
            if let Some(entry) = queue.next() {
                refreshes.push(refresh_entry(entry));
            }
        }
    }
}

async fn refresh_entry(entry: Arc<ConnectionEntry>) {
    match entry.client.snapshot_capabilities().await {
        Ok(snapshot) => {
            *entry.capabilities.write().await = snapshot;
        }
        Err(err) => {
            warn!(
                server_id = %entry.config.id,
                error = %err,
                "MCP capability refresh failed"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::TransportKind;
    use crate::mcp::transport::McpTransport;
    use async_trait::async_trait;
    use rust_mcp_schema::schema_utils::{NotificationFromClient, RequestFromClient, ServerMessage};
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Transport that answers every request with method-not-found and
    /// records whether it has been closed.
    struct InertTransport {
        closed: Arc<AtomicBool>,
    }

    #[async_trait]
    impl McpTransport for InertTransport {
        async fn request(&self, _request: RequestFromClient) -> Result<ServerMessage, McpError> {
            let message = serde_json::json!({
                "jsonrpc": "2.0",
                "id": 0,
                "error": {"code": -32601, "message": "Method not found"}
            });
            serde_json::from_value(message).map_err(|err| McpError::Transport(err.to_string()))
        }

        async fn notify(&self, _notification: NotificationFromClient) -> Result<(), McpError> {
            Ok(())
        }

        async fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }

        fn is_alive(&self) -> bool {
            !self.closed.load(Ordering::SeqCst)
        }
    }

    fn stdio_config(id: &str, command: Option<&str>) -> ServerConfig {
        ServerConfig {
            id: id.to_string(),
            name: id.to_string(),
            transport: TransportKind::Stdio,
            command: command.map(str::to_string),
            args: None,
            env: None,
            url: None,
        }
    }

    #[tokio::test]
    async fn unknown_id_defaults_to_disconnected() {
        let registry = McpRegistry::new();
        assert_eq!(
            registry.status("ghost").await,
            ConnectionStatus::Disconnected
        );
    }

    #[tokio::test]
    async fn disconnecting_absent_id_is_not_an_error() {
        let registry = McpRegistry::new();
        assert!(registry.disconnect("ghost").await.is_ok());
    }

    #[tokio::test]
    async fn invalid_config_is_rejected_without_side_effects() {
        let registry = McpRegistry::new();
        let err = registry
            .connect(stdio_config("alpha", None))
            .await
            .expect_err("expected config error");
        assert!(matches!(err, McpError::Config(_)));
        assert_eq!(
            registry.status("alpha").await,
            ConnectionStatus::Disconnected
        );
    }

    #[tokio::test]
    async fn failed_spawn_leaves_no_entry() {
        let registry = McpRegistry::new();
        let err = registry
            .connect(stdio_config("alpha", Some("/definitely-missing-command")))
            .await
            .expect_err("expected connection error");
        assert!(matches!(err, McpError::Connection(_)));
        assert_eq!(
            registry.status("alpha").await,
            ConnectionStatus::Disconnected
        );
        assert!(registry.connected_ids().await.is_empty());
    }

    #[tokio::test]
    async fn concurrent_failing_connects_leave_no_entry() {
        let registry = Arc::new(McpRegistry::new());
        let a = {
            let registry = registry.clone();
            tokio::spawn(async move {
                registry
                    .connect(stdio_config("alpha", Some("/definitely-missing-command")))
                    .await
            })
        };
        let b = {
            let registry = registry.clone();
            tokio::spawn(async move {
                registry
                    .connect(stdio_config("alpha", Some("/definitely-missing-command")))
                    .await
            })
        };
        assert!(a.await.expect("task").is_err());
        assert!(b.await.expect("task").is_err());
        assert_eq!(
            registry.status("alpha").await,
            ConnectionStatus::Disconnected
        );
    }

    #[tokio::test]
    async fn racing_connects_keep_one_entry_and_close_the_loser() {
        let registry = Arc::new(McpRegistry::new());
        let close_flags: Arc<std::sync::Mutex<Vec<Arc<AtomicBool>>>> =
            Arc::new(std::sync::Mutex::new(Vec::new()));
        {
            let close_flags = close_flags.clone();
            *registry.client_factory.lock().await = Some(Box::new(move |config| {
                let closed = Arc::new(AtomicBool::new(false));
                close_flags.lock().expect("lock").push(closed.clone());
                Ok(McpClient::with_transport(
                    config.id.clone(),
                    Box::new(InertTransport { closed }),
                ))
            }));
        }

        let a = {
            let registry = registry.clone();
            tokio::spawn(
                async move { registry.connect(stdio_config("alpha", Some("server-a"))).await },
            )
        };
        let b = {
            let registry = registry.clone();
            tokio::spawn(
                async move { registry.connect(stdio_config("alpha", Some("server-b"))).await },
            )
        };
        assert!(a.await.expect("task").is_ok());
        assert!(b.await.expect("task").is_ok());

        assert_eq!(registry.status("alpha").await, ConnectionStatus::Connected);
        assert_eq!(registry.connected_ids().await, vec!["alpha".to_string()]);
        assert_eq!(registry.entries.read().await.len(), 1);

        let close_flags = close_flags.lock().expect("lock");
        assert_eq!(close_flags.len(), 2);
        let closed = close_flags
            .iter()
            .filter(|flag| flag.load(Ordering::SeqCst))
            .count();
        assert_eq!(closed, 1);
    }

    #[tokio::test]
    async fn per_id_locks_are_pruned_after_disconnect() {
        let registry = McpRegistry::new();
        let _ = registry
            .connect(stdio_config("alpha", Some("/definitely-missing-command")))
            .await;
        assert!(!registry.connect_locks.lock().await.is_empty());

        registry.disconnect("alpha").await.expect("disconnect");
        assert!(registry.connect_locks.lock().await.is_empty());
    }

    #[tokio::test]
    async fn capability_calls_require_a_connection() {
        let registry = McpRegistry::new();
        let err = registry
            .call_tool("ghost", "lookup", None)
            .await
            .expect_err("expected not-connected error");
        assert!(matches!(err, McpError::NotConnected(_)));
    }
}
