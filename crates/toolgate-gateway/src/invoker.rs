//! Tool invocation: registry lookup, one cached connection per server,
//! latency tracking around every call.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use toolgate_core::jsonrpc::namespaced_tool;

use crate::registry::{RegistryError, ServerRegistry};
use crate::stats::CallStatsTracker;
use crate::transport::{self, TransportClient, TransportError};

#[derive(Debug, thiserror::Error)]
pub enum InvokeError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("Unexpected tool server reply: {0}")]
    UnexpectedReply(String),
}

impl InvokeError {
    pub const fn user_message(&self) -> &'static str {
        match self {
            Self::Transport(e) => e.user_message(),
            _ => "tool call failed",
        }
    }
}

pub struct ToolInvoker {
    registry: Arc<ServerRegistry>,
    stats: Arc<CallStatsTracker>,
    clients: Mutex<HashMap<String, Arc<TransportClient>>>,
    connect_timeout: Duration,
}

impl ToolInvoker {
    pub fn new(
        registry: Arc<ServerRegistry>,
        stats: Arc<CallStatsTracker>,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            stats,
            clients: Mutex::new(HashMap::new()),
            connect_timeout,
        }
    }

    pub const fn stats(&self) -> &Arc<CallStatsTracker> {
        &self.stats
    }

    /// Connected client for `server`, connecting on first use.
    async fn client(&self, server: &str) -> Result<Arc<TransportClient>, InvokeError> {
        let mut clients = self.clients.lock().await;
        if let Some(client) = clients.get(server) {
            return Ok(Arc::clone(client));
        }

        let registry = self.registry.load().await?;
        let entry = registry
            .get(server)
            .ok_or_else(|| RegistryError::UnknownServer(server.to_string()))?;
        let client = Arc::new(
            transport::connect(
                server,
                &entry.config,
                self.registry.client_info(),
                self.connect_timeout,
            )
            .await?,
        );
        clients.insert(server.to_string(), Arc::clone(&client));
        drop(clients);
        Ok(client)
    }

    async fn evict(&self, server: &str) {
        if let Some(client) = self.clients.lock().await.remove(server) {
            debug!(server, "Dropping closed tool server connection");
            client.close().await;
        }
    }

    async fn request(
        &self,
        server: &str,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, InvokeError> {
        let client = self.client(server).await?;
        let result = client.call(method, Some(params), timeout).await;
        if matches!(result, Err(TransportError::TransportClosed)) {
            self.evict(server).await;
        }
        Ok(result?)
    }

    /// Invoke `tool` on `server`. The duration is recorded whatever the
    /// outcome of the call.
    pub async fn call_tool(
        &self,
        server: &str,
        tool: &str,
        arguments: Value,
        timeout: Duration,
    ) -> Result<Value, InvokeError> {
        let params = json!({ "name": tool, "arguments": arguments });
        let token = self.stats.record_start(server, tool);
        let result = self.request(server, "tools/call", params, timeout).await;
        let elapsed = self.stats.record_end(token).await;

        match &result {
            Ok(_) => info!(server, tool, ?elapsed, "Tool call completed"),
            Err(e) => warn!(server, tool, ?elapsed, error = %e, "Tool call failed"),
        }
        result
    }

    /// Namespaced names (`server__tool`) of every tool `server` offers.
    pub async fn list_tools(&self, server: &str, timeout: Duration) -> Result<Vec<String>, InvokeError> {
        let result = self.request(server, "tools/list", json!({}), timeout).await?;
        let tools = result
            .get("tools")
            .and_then(Value::as_array)
            .ok_or_else(|| InvokeError::UnexpectedReply("missing `tools` array".to_string()))?;
        Ok(tools
            .iter()
            .filter_map(|tool| tool.get("name").and_then(Value::as_str))
            .map(|name| namespaced_tool(server, name))
            .collect())
    }

    /// Close every cached connection.
    pub async fn shutdown(&self) {
        let clients: Vec<_> = self.clients.lock().await.drain().collect();
        for (server, client) in clients {
            debug!(server = %server, "Closing tool server connection");
            client.close().await;
        }
    }
}
