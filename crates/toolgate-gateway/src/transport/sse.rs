//! Server-Sent Events transport.
//!
//! The client holds a long-lived `GET` stream. The server first announces an
//! `endpoint` event naming the URL requests must be POSTed to; responses then
//! arrive on the stream as `message` events.

use std::time::Duration;

use futures_util::StreamExt;
use reqwest::Url;
use reqwest::header::{ACCEPT, HeaderMap};
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use toolgate_core::jsonrpc::JsonRpcRequest;

use super::error::TransportError;
use super::http::{build_http_client, header_map};
use super::pending::PendingCalls;
use crate::registry::RemoteServerConfig;

/// One decoded event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    /// Event name; `message` when the server sent none.
    pub event: String,
    pub data: String,
}

/// Incremental `text/event-stream` decoder.
///
/// Buffers raw bytes so a multi-byte character split across network chunks
/// is only decoded once its event block is complete.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and return every event it completes.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(chunk);
        if self.buffer.contains(&b'\r') {
            self.buffer = strip_crlf(&self.buffer);
        }

        let mut events = Vec::new();
        while let Some(end) = self.buffer.windows(2).position(|w| w == b"\n\n") {
            let block: Vec<u8> = self.buffer.drain(..end + 2).collect();
            if let Some(event) = decode_block(block) {
                events.push(event);
            }
        }
        events
    }

    /// Flush a trailing event that was not followed by a blank line.
    pub fn finish(&mut self) -> Option<SseEvent> {
        decode_block(std::mem::take(&mut self.buffer))
    }
}

/// `\r\n` to `\n`. A lone trailing `\r` is kept until its `\n` arrives.
fn strip_crlf(bytes: &[u8]) -> Vec<u8> {
    bytes
        .iter()
        .enumerate()
        .filter(|&(i, &b)| !(b == b'\r' && bytes.get(i + 1) == Some(&b'\n')))
        .map(|(_, &b)| b)
        .collect()
}

fn decode_block(block: Vec<u8>) -> Option<SseEvent> {
    match String::from_utf8(block) {
        Ok(block) => parse_block(&block),
        Err(e) => {
            warn!(error = %e, "Dropping SSE event that is not valid UTF-8");
            None
        }
    }
}

fn parse_block(block: &str) -> Option<SseEvent> {
    let mut event = None;
    let mut data_lines = Vec::new();
    for line in block.lines() {
        if let Some(data) = line.strip_prefix("data:") {
            data_lines.push(data.strip_prefix(' ').unwrap_or(data));
        } else if let Some(name) = line.strip_prefix("event:") {
            event = Some(name.trim());
        }
        // id:, retry: and comments are ignored
    }
    if data_lines.is_empty() {
        return None;
    }
    Some(SseEvent {
        event: event.unwrap_or("message").to_string(),
        data: data_lines.join("\n"),
    })
}

/// Client for a tool server speaking the SSE transport.
pub struct SseClient {
    server: String,
    http: reqwest::Client,
    endpoint: Url,
    headers: HeaderMap,
    pending: PendingCalls,
    reader: JoinHandle<()>,
}

impl SseClient {
    /// Open the event stream and wait (up to `timeout`) for the endpoint
    /// announcement.
    pub async fn connect(
        server: &str,
        config: &RemoteServerConfig,
        timeout: Duration,
    ) -> Result<Self, TransportError> {
        let stream_url = Url::parse(&config.url)
            .map_err(|e| TransportError::Transport(format!("invalid url {}: {e}", config.url)))?;
        let headers = header_map(&config.headers)?;
        let http = build_http_client()?;

        info!(server, url = %stream_url, "Opening SSE stream");
        let response = tokio::time::timeout(
            timeout,
            http.get(stream_url.clone())
                .headers(headers.clone())
                .header(ACCEPT, "text/event-stream")
                .send(),
        )
        .await
        .map_err(|_| TransportError::Timeout(timeout))??;

        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Transport(format!(
                "SSE connection failed: HTTP {status}"
            )));
        }

        let pending = PendingCalls::new();
        let (endpoint_tx, endpoint_rx) = oneshot::channel::<Url>();
        let reader = tokio::spawn(read_stream(
            server.to_string(),
            response,
            stream_url,
            pending.clone(),
            endpoint_tx,
        ));

        let endpoint = match tokio::time::timeout(timeout, endpoint_rx).await {
            Ok(Ok(endpoint)) => endpoint,
            Ok(Err(_)) => {
                reader.abort();
                return Err(TransportError::TransportClosed);
            }
            Err(_) => {
                reader.abort();
                return Err(TransportError::Timeout(timeout));
            }
        };
        debug!(server, %endpoint, "SSE endpoint announced");

        Ok(Self {
            server: server.to_string(),
            http,
            endpoint,
            headers,
            pending,
            reader,
        })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    async fn post(&self, message: &JsonRpcRequest, timeout: Duration) -> Result<(), TransportError> {
        let response = self
            .http
            .post(self.endpoint.clone())
            .headers(self.headers.clone())
            .timeout(timeout)
            .json(message)
            .send()
            .await?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(TransportError::Transport(format!(
                "POST {} failed: HTTP {status}",
                self.endpoint
            )))
        }
    }

    pub async fn call(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value, TransportError> {
        let (id, rx) = self.pending.register().await?;
        let request = JsonRpcRequest::new(id, method, params);
        if let Err(e) = self.post(&request, timeout).await {
            self.pending.remove(id).await;
            return Err(e);
        }
        debug!(server = %self.server, id, method, "Posted request");
        self.pending.wait(id, rx, timeout).await
    }

    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), TransportError> {
        if self.pending.is_closed().await {
            return Err(TransportError::TransportClosed);
        }
        self.post(
            &JsonRpcRequest::notification(method, params),
            super::NOTIFY_TIMEOUT,
        )
        .await
    }

    pub async fn close(&self) {
        self.reader.abort();
        self.pending.close().await;
        info!(server = %self.server, "SSE connection closed");
    }
}

impl Drop for SseClient {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

async fn read_stream(
    server: String,
    response: reqwest::Response,
    stream_url: Url,
    pending: PendingCalls,
    endpoint_tx: oneshot::Sender<Url>,
) {
    let mut endpoint_tx = Some(endpoint_tx);
    let mut decoder = SseDecoder::new();
    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(e) => {
                warn!(server = %server, error = %e, "SSE stream failed");
                break;
            }
        };
        for event in decoder.push(&chunk) {
            handle_event(&server, &stream_url, &pending, &mut endpoint_tx, event).await;
        }
    }
    if let Some(event) = decoder.finish() {
        handle_event(&server, &stream_url, &pending, &mut endpoint_tx, event).await;
    }

    info!(server = %server, "SSE stream ended");
    pending.close().await;
}

async fn handle_event(
    server: &str,
    stream_url: &Url,
    pending: &PendingCalls,
    endpoint_tx: &mut Option<oneshot::Sender<Url>>,
    event: SseEvent,
) {
    match event.event.as_str() {
        "endpoint" => match stream_url.join(event.data.trim()) {
            Ok(endpoint) => {
                if let Some(tx) = endpoint_tx.take() {
                    let _ = tx.send(endpoint);
                }
            }
            Err(e) => warn!(server, error = %e, data = %event.data, "Bad endpoint event"),
        },
        "message" => pending.route_message(&event.data).await,
        other => debug!(server, event = other, "Ignoring SSE event"),
    }
}
