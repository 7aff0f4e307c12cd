//! Prompt rendering collaborators.
//!
//! The gateway never talks to the chat platform itself; it hands a
//! [`RenderRequest`] to a [`PromptRenderer`] and polls the store.

use async_trait::async_trait;
use tracing::info;

use super::types::RenderRequest;
use crate::transport::http::build_http_client;

#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Webhook returned HTTP {0}")]
    Status(u16),

    #[error("{0}")]
    Other(String),
}

/// Delivers approval prompts to whoever can act on them.
#[async_trait]
pub trait PromptRenderer: Send + Sync {
    async fn render(&self, request: &RenderRequest) -> Result<(), RenderError>;
}

/// Writes the prompt to the log. Useful when the chat side tails logs or
/// resolves through `toolgate resolve`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogRenderer;

#[async_trait]
impl PromptRenderer for LogRenderer {
    async fn render(&self, request: &RenderRequest) -> Result<(), RenderError> {
        info!(
            approval_id = %request.approval_id,
            tool = %request.tool_name,
            requesting_user = %request.requesting_user,
            origin = %request.origin_context,
            expires_at = request.expires_at,
            input = %request.input_summary,
            "Approval required"
        );
        Ok(())
    }
}

/// POSTs the render request as JSON to a fixed URL.
#[derive(Debug, Clone)]
pub struct WebhookRenderer {
    http: reqwest::Client,
    url: String,
}

impl WebhookRenderer {
    pub fn new(url: impl Into<String>) -> Result<Self, RenderError> {
        let http = build_http_client().map_err(|e| RenderError::Other(e.to_string()))?;
        Ok(Self {
            http,
            url: url.into(),
        })
    }
}

#[async_trait]
impl PromptRenderer for WebhookRenderer {
    async fn render(&self, request: &RenderRequest) -> Result<(), RenderError> {
        let response = self.http.post(&self.url).json(request).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(RenderError::Status(status.as_u16()));
        }
        info!(approval_id = %request.approval_id, url = %self.url, "Approval prompt delivered");
        Ok(())
    }
}
