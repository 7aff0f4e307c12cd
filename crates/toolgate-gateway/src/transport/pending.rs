//! Request/response correlation shared by every transport.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{Mutex, oneshot};
use tracing::{debug, warn};

use toolgate_core::jsonrpc::{JsonRpcResponse, Message, RequestId};

use super::error::TransportError;

pub type Reply = Result<Value, TransportError>;

#[derive(Default)]
struct PendingState {
    waiters: HashMap<u64, oneshot::Sender<Reply>>,
    closed: bool,
}

/// Table of in-flight requests keyed by JSON-RPC id.
///
/// Ids are allocated from a monotonically increasing counter starting at 1.
/// Once closed, every waiter receives [`TransportError::TransportClosed`] and
/// new registrations are refused.
#[derive(Clone)]
pub struct PendingCalls {
    state: Arc<Mutex<PendingState>>,
    next_id: Arc<AtomicU64>,
}

impl Default for PendingCalls {
    fn default() -> Self {
        Self::new()
    }
}

impl PendingCalls {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(PendingState::default())),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Allocate an id and a receiver for its response.
    pub async fn register(&self) -> Result<(u64, oneshot::Receiver<Reply>), TransportError> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(TransportError::TransportClosed);
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        state.waiters.insert(id, tx);
        drop(state);
        Ok((id, rx))
    }

    /// Deliver a reply. Returns `false` when nobody is waiting on `id`.
    pub async fn complete(&self, id: u64, reply: Reply) -> bool {
        let waiter = self.state.lock().await.waiters.remove(&id);
        waiter.is_some_and(|tx| tx.send(reply).is_ok())
    }

    /// Forget `id` without delivering anything.
    pub async fn remove(&self, id: u64) {
        self.state.lock().await.waiters.remove(&id);
    }

    /// Fail every outstanding call and refuse new ones.
    pub async fn close(&self) {
        let waiters = {
            let mut state = self.state.lock().await;
            state.closed = true;
            std::mem::take(&mut state.waiters)
        };
        if !waiters.is_empty() {
            debug!(outstanding = waiters.len(), "Failing outstanding calls");
        }
        for (_, tx) in waiters {
            let _ = tx.send(Err(TransportError::TransportClosed));
        }
    }

    pub async fn is_closed(&self) -> bool {
        self.state.lock().await.closed
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.waiters.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Wait for the reply to `id`, removing the entry on timeout.
    pub async fn wait(
        &self,
        id: u64,
        rx: oneshot::Receiver<Reply>,
        timeout: Duration,
    ) -> Reply {
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => Err(TransportError::TransportClosed),
            Err(_) => {
                self.remove(id).await;
                debug!(id, ?timeout, "Call timed out");
                Err(TransportError::Timeout(timeout))
            }
        }
    }

    /// Route a response to its waiter. Unknown ids are dropped.
    pub async fn dispatch(&self, response: JsonRpcResponse) {
        let Some(id) = response.id.as_ref().and_then(RequestId::as_u64) else {
            debug!(id = ?response.id, "Ignoring response without a numeric id");
            return;
        };
        let reply = response.into_result().map_err(|e| TransportError::Rpc {
            code: e.code,
            message: e.message,
        });
        if !self.complete(id, reply).await {
            debug!(id, "Ignoring response for unknown request id");
        }
    }

    /// Route one framed message from the peer. Server-initiated requests and
    /// notifications are ignored.
    pub async fn route_message(&self, text: &str) {
        let text = text.trim();
        if text.is_empty() {
            return;
        }
        match Message::parse(text) {
            Ok(Message::Response(response)) => self.dispatch(response).await,
            Ok(Message::Request(request)) => {
                debug!(method = %request.method, "Ignoring server-initiated request");
            }
            Ok(Message::Notification(note)) => {
                debug!(method = %note.method, "Ignoring server notification");
            }
            Err(e) => warn!(error = %e, "Discarding unparseable message from tool server"),
        }
    }
}
