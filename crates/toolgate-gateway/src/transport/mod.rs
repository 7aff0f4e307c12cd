//! JSON-RPC transport clients for tool servers.

mod error;
pub mod http;
mod pending;
pub mod sse;
pub mod stdio;

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{info, warn};

use toolgate_core::jsonrpc::PROTOCOL_VERSION;

use crate::registry::ToolServerConfig;

pub use error::TransportError;
pub use http::HttpClient;
pub use pending::{PendingCalls, Reply};
pub use sse::SseClient;
pub use stdio::StdioClient;

/// Upper bound for fire-and-forget notifications over HTTP.
pub const NOTIFY_TIMEOUT: Duration = Duration::from_secs(10);

/// Identity announced in `initialize`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientInfo {
    pub name: String,
    pub version: String,
}

impl Default for ClientInfo {
    fn default() -> Self {
        Self {
            name: "toolgate".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// A connected tool server, whichever transport it uses.
pub enum TransportClient {
    Stdio(StdioClient),
    Sse(SseClient),
    Http(HttpClient),
}

impl TransportClient {
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Stdio(_) => "stdio",
            Self::Sse(_) => "sse",
            Self::Http(_) => "http",
        }
    }

    /// Send a request and wait up to `timeout` for its response.
    pub async fn call(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value, TransportError> {
        match self {
            Self::Stdio(client) => client.call(method, params, timeout).await,
            Self::Sse(client) => client.call(method, params, timeout).await,
            Self::Http(client) => client.call(method, params, timeout).await,
        }
    }

    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), TransportError> {
        match self {
            Self::Stdio(client) => client.notify(method, params).await,
            Self::Sse(client) => client.notify(method, params).await,
            Self::Http(client) => client.notify(method, params).await,
        }
    }

    pub async fn close(&self) {
        match self {
            Self::Stdio(client) => client.close().await,
            Self::Sse(client) => client.close().await,
            Self::Http(client) => client.close().await,
        }
    }
}

/// Open a transport for `config` and perform the `initialize` handshake.
///
/// `timeout` bounds connection setup and the handshake request each.
pub async fn connect(
    server: &str,
    config: &ToolServerConfig,
    client_info: &ClientInfo,
    timeout: Duration,
) -> Result<TransportClient, TransportError> {
    let client = match config {
        ToolServerConfig::Stdio(stdio) => TransportClient::Stdio(StdioClient::spawn(server, stdio)?),
        ToolServerConfig::Sse(remote) => {
            TransportClient::Sse(SseClient::connect(server, remote, timeout).await?)
        }
        ToolServerConfig::Http(remote) => TransportClient::Http(HttpClient::new(server, remote)?),
    };

    match initialize(&client, client_info, timeout).await {
        Ok(server_info) => {
            info!(
                server,
                transport = client.kind(),
                remote = %server_info,
                "Tool server initialized"
            );
            Ok(client)
        }
        Err(e) => {
            warn!(server, error = %e, "Tool server handshake failed");
            client.close().await;
            Err(e)
        }
    }
}

async fn initialize(
    client: &TransportClient,
    client_info: &ClientInfo,
    timeout: Duration,
) -> Result<Value, TransportError> {
    let params = json!({
        "protocolVersion": PROTOCOL_VERSION,
        "capabilities": {},
        "clientInfo": client_info,
    });
    let result = client.call("initialize", Some(params), timeout).await?;
    if !result.is_object() {
        return Err(TransportError::Protocol(
            "initialize result must be an object".to_string(),
        ));
    }
    client.notify("notifications/initialized", None).await?;
    Ok(result.get("serverInfo").cloned().unwrap_or(Value::Null))
}
