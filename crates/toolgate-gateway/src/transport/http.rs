//! Streamable HTTP transport: one POST per message. The response body is
//! either a JSON-RPC message or an SSE stream carrying it.

use std::collections::BTreeMap;
use std::time::Duration;

use reqwest::Url;
use reqwest::header::{ACCEPT, CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue};
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, info};

use toolgate_core::jsonrpc::JsonRpcRequest;

use super::error::TransportError;
use super::pending::PendingCalls;
use super::sse::SseDecoder;
use crate::registry::RemoteServerConfig;

pub const SESSION_HEADER: &str = "Mcp-Session-Id";

/// Build the shared reqwest client.
pub fn build_http_client() -> Result<reqwest::Client, TransportError> {
    // reqwest is built with rustls-no-provider; Err means already installed.
    let _ = rustls::crypto::ring::default_provider().install_default();
    Ok(reqwest::Client::builder().build()?)
}

/// Convert configured headers, rejecting names or values HTTP cannot carry.
pub fn header_map(headers: &BTreeMap<String, String>) -> Result<HeaderMap, TransportError> {
    let mut map = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| TransportError::Transport(format!("invalid header name {name:?}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|_| TransportError::Transport(format!("invalid value for header {name}")))?;
        map.insert(name, value);
    }
    Ok(map)
}

/// Client for a tool server reached over plain HTTP POSTs.
pub struct HttpClient {
    server: String,
    http: reqwest::Client,
    url: Url,
    headers: HeaderMap,
    session_id: RwLock<Option<String>>,
    pending: PendingCalls,
}

impl HttpClient {
    pub fn new(server: &str, config: &RemoteServerConfig) -> Result<Self, TransportError> {
        let url = Url::parse(&config.url)
            .map_err(|e| TransportError::Transport(format!("invalid url {}: {e}", config.url)))?;
        Ok(Self {
            server: server.to_string(),
            http: build_http_client()?,
            url,
            headers: header_map(&config.headers)?,
            session_id: RwLock::new(None),
            pending: PendingCalls::new(),
        })
    }

    pub async fn session_id(&self) -> Option<String> {
        self.session_id.read().await.clone()
    }

    /// POST one message and route whatever comes back.
    async fn post(&self, message: &JsonRpcRequest) -> Result<(), TransportError> {
        let mut request = self
            .http
            .post(self.url.clone())
            .headers(self.headers.clone())
            .header(ACCEPT, "application/json, text/event-stream")
            .json(message);
        if let Some(session_id) = self.session_id.read().await.as_deref() {
            request = request.header(SESSION_HEADER, session_id);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Transport(format!(
                "POST {} failed: HTTP {status}",
                self.url
            )));
        }

        if let Some(session_id) = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            let mut current = self.session_id.write().await;
            if current.as_deref() != Some(session_id) {
                debug!(server = %self.server, session_id, "Tool server session established");
                *current = Some(session_id.to_string());
            }
        }

        let is_event_stream = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.starts_with("text/event-stream"));
        let body = response.text().await?;

        if is_event_stream {
            let mut decoder = SseDecoder::new();
            let mut events = decoder.push(body.as_bytes());
            events.extend(decoder.finish());
            for event in events.into_iter().filter(|e| e.event == "message") {
                self.pending.route_message(&event.data).await;
            }
        } else {
            self.route_json_body(&body).await;
        }
        Ok(())
    }

    async fn route_json_body(&self, body: &str) {
        // A batch reply carries several messages in one array.
        match serde_json::from_str::<Value>(body) {
            Ok(Value::Array(messages)) => {
                for message in messages {
                    self.pending.route_message(&message.to_string()).await;
                }
            }
            _ => self.pending.route_message(body).await,
        }
    }

    pub async fn call(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value, TransportError> {
        let (id, mut rx) = self.pending.register().await?;
        let request = JsonRpcRequest::new(id, method, params);

        let outcome = tokio::time::timeout(timeout, self.post(&request)).await;
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                self.pending.remove(id).await;
                return Err(e);
            }
            Err(_) => {
                self.pending.remove(id).await;
                return Err(TransportError::Timeout(timeout));
            }
        }

        if let Ok(reply) = rx.try_recv() {
            reply
        } else {
            self.pending.remove(id).await;
            Err(TransportError::Protocol(format!(
                "response body did not answer request {id}"
            )))
        }
    }

    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), TransportError> {
        if self.pending.is_closed().await {
            return Err(TransportError::TransportClosed);
        }
        tokio::time::timeout(
            super::NOTIFY_TIMEOUT,
            self.post(&JsonRpcRequest::notification(method, params)),
        )
        .await
        .map_err(|_| TransportError::Timeout(super::NOTIFY_TIMEOUT))?
    }

    pub async fn close(&self) {
        self.pending.close().await;
        info!(server = %self.server, "HTTP connection closed");
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn header_map_rejects_invalid_headers() {
        let mut headers = BTreeMap::new();
        headers.insert("X-Ok".to_string(), "yes".to_string());
        assert_eq!(header_map(&headers).unwrap().len(), 1);

        headers.insert("bad header".to_string(), "x".to_string());
        assert!(header_map(&headers).is_err());
    }

    #[test]
    fn new_rejects_unparseable_url() {
        let config = RemoteServerConfig {
            url: "not a url".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            HttpClient::new("broken", &config),
            Err(TransportError::Transport(_))
        ));
    }
}
