//! Approval prompt tool server.
//!
//! The agent runtime launches `toolgate permission-server` as a stdio tool
//! server and routes every permission check to its `approval_prompt` tool.
//! Each call runs the permission gateway in its own task, so many approvals
//! can wait at once on one connection.

use std::sync::Arc;

use serde::Deserialize;
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use toolgate_core::jsonrpc::{
    JSONRPC_VERSION, JsonRpcError, JsonRpcRequest, JsonRpcResponse, Message, PROTOCOL_VERSION,
    RequestId, error_codes,
};

use super::gateway::PermissionGateway;
use super::types::PermissionRequest;
use crate::store::Namespace;

pub const APPROVAL_TOOL: &str = "approval_prompt";

/// Text of the tool result when the gateway itself failed.
pub const APPROVAL_FAILED_MESSAGE: &str = "approval could not be completed";

#[derive(Debug, Deserialize)]
struct ToolCallParams {
    name: String,
    #[serde(default)]
    arguments: Value,
}

#[derive(Debug, Deserialize)]
struct ApprovalArguments {
    tool_name: String,
    #[serde(default)]
    input: Value,
}

/// Identity of the chat session this server acts for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionIdentity {
    pub requesting_user: String,
    pub origin_context: String,
}

pub struct ApprovalServer {
    gateway: Arc<PermissionGateway>,
    identity: SessionIdentity,
}

impl ApprovalServer {
    pub const fn new(gateway: Arc<PermissionGateway>, identity: SessionIdentity) -> Self {
        Self { gateway, identity }
    }

    /// Serve newline-delimited JSON-RPC until `reader` reaches EOF.
    pub async fn serve<R, W>(self: Arc<Self>, reader: R, writer: W) -> std::io::Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        self.sweep_expired().await;

        let (out_tx, mut out_rx) = mpsc::channel::<String>(64);
        let writer_task = tokio::spawn(async move {
            let mut writer = writer;
            while let Some(line) = out_rx.recv().await {
                writer.write_all(line.as_bytes()).await?;
                writer.write_all(b"\n").await?;
                writer.flush().await?;
            }
            Ok::<(), std::io::Error>(())
        });

        let mut calls = JoinSet::new();
        let mut lines = BufReader::new(reader).lines();
        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            // Reap finished call tasks as we go.
            while calls.try_join_next().is_some() {}

            match Message::parse(&line) {
                Ok(Message::Request(request)) => {
                    self.handle_request(request, &out_tx, &mut calls).await;
                }
                Ok(Message::Notification(note)) => {
                    debug!(method = %note.method, "Ignoring notification");
                }
                Ok(Message::Response(_)) => debug!("Ignoring unsolicited response"),
                Err(e) => {
                    warn!(error = %e, "Unusable request");
                    let error = match &e {
                        toolgate_core::Error::Json(json) if json.is_syntax() || json.is_eof() => {
                            JsonRpcError::new(error_codes::PARSE_ERROR, "Parse error")
                        }
                        _ => JsonRpcError::new(error_codes::INVALID_REQUEST, "Invalid Request"),
                    };
                    send(&out_tx, &JsonRpcResponse::failure(None, error)).await;
                }
            }
        }

        info!(in_flight = calls.len(), "Agent runtime closed the connection");
        calls.abort_all();
        while calls.join_next().await.is_some() {}
        drop(out_tx);
        match writer_task.await {
            Ok(result) => result,
            Err(e) => Err(std::io::Error::other(e)),
        }
    }

    async fn handle_request(
        self: &Arc<Self>,
        request: JsonRpcRequest,
        out_tx: &mpsc::Sender<String>,
        calls: &mut JoinSet<()>,
    ) {
        let Some(id) = request.id.clone() else {
            return;
        };
        if request.jsonrpc != JSONRPC_VERSION {
            warn!(version = %request.jsonrpc, "Rejecting request with unsupported JSON-RPC version");
            let reply = JsonRpcResponse::failure(
                Some(id),
                JsonRpcError::new(
                    error_codes::INVALID_REQUEST,
                    format!("Invalid Request: jsonrpc must be {JSONRPC_VERSION:?}"),
                ),
            );
            send(out_tx, &reply).await;
            return;
        }
        let reply = match request.method.as_str() {
            "initialize" => JsonRpcResponse::success(
                id,
                json!({
                    "protocolVersion": PROTOCOL_VERSION,
                    "capabilities": { "tools": {} },
                    "serverInfo": {
                        "name": "toolgate-approval",
                        "version": env!("CARGO_PKG_VERSION"),
                    },
                }),
            ),
            "ping" => JsonRpcResponse::success(id, json!({})),
            "tools/list" => JsonRpcResponse::success(id, tool_list()),
            "tools/call" => {
                let server = Arc::clone(self);
                let out_tx = out_tx.clone();
                calls.spawn(async move {
                    let reply = server.call_tool(id, request.params).await;
                    send(&out_tx, &reply).await;
                });
                return;
            }
            other => JsonRpcResponse::failure(
                Some(id),
                JsonRpcError::new(
                    error_codes::METHOD_NOT_FOUND,
                    format!("Method not found: {other}"),
                ),
            ),
        };
        send(out_tx, &reply).await;
    }

    async fn call_tool(&self, id: RequestId, params: Option<Value>) -> JsonRpcResponse {
        let params: ToolCallParams = match serde_json::from_value(params.unwrap_or(Value::Null)) {
            Ok(params) => params,
            Err(e) => return invalid_params(id, &e.to_string()),
        };
        if params.name != APPROVAL_TOOL {
            return invalid_params(id, &format!("unknown tool {:?}", params.name));
        }
        let arguments: ApprovalArguments = match serde_json::from_value(params.arguments) {
            Ok(arguments) => arguments,
            Err(e) => return invalid_params(id, &e.to_string()),
        };

        let request = PermissionRequest {
            tool_name: arguments.tool_name,
            input: arguments.input,
            requesting_user: self.identity.requesting_user.clone(),
            origin_context: self.identity.origin_context.clone(),
        };
        match self.gateway.request(request).await {
            Ok(decision) => match serde_json::to_string(&decision) {
                Ok(text) => JsonRpcResponse::success(id, tool_result(&text, false)),
                Err(e) => {
                    error!(error = %e, "Failed to encode decision");
                    JsonRpcResponse::success(id, tool_result(APPROVAL_FAILED_MESSAGE, true))
                }
            },
            Err(e) => {
                error!(error = %e, "Approval request failed");
                JsonRpcResponse::success(id, tool_result(APPROVAL_FAILED_MESSAGE, true))
            }
        }
    }

    async fn sweep_expired(&self) {
        let store = self.gateway.store();
        for namespace in [Namespace::Pending, Namespace::Resolved] {
            match store.sweep_expired(namespace).await {
                Ok(0) => {}
                Ok(removed) => info!(namespace = namespace.as_str(), removed, "Swept expired approvals"),
                Err(e) => warn!(namespace = namespace.as_str(), error = %e, "Approval sweep failed"),
            }
        }
    }
}

fn tool_list() -> Value {
    json!({
        "tools": [{
            "name": APPROVAL_TOOL,
            "description": "Ask the requesting user to approve or deny a tool call",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "tool_name": { "type": "string" },
                    "input": { "type": "object" },
                },
                "required": ["tool_name", "input"],
            },
        }]
    })
}

fn tool_result(text: &str, is_error: bool) -> Value {
    json!({
        "content": [{ "type": "text", "text": text }],
        "isError": is_error,
    })
}

fn invalid_params(id: RequestId, detail: &str) -> JsonRpcResponse {
    JsonRpcResponse::failure(
        Some(id),
        JsonRpcError::new(error_codes::INVALID_PARAMS, format!("Invalid params: {detail}")),
    )
}

async fn send(out_tx: &mpsc::Sender<String>, reply: &JsonRpcResponse) {
    match serde_json::to_string(reply) {
        Ok(line) => {
            if out_tx.send(line).await.is_err() {
                warn!("Output closed, dropping reply");
            }
        }
        Err(e) => error!(error = %e, "Failed to encode reply"),
    }
}
