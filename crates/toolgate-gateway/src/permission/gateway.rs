//! Permission gateway: turns a privileged tool call into a pending approval,
//! asks the chat side to render it, and waits for the human's decision.
//!
//! Each call to [`PermissionGateway::request`] is an independent state
//! machine (`Requested -> Allowed/Denied -> Consumed`, or
//! `Requested -> Expired`). The only shared state is the approval store.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, info, warn};

use toolgate_core::clock::duration_millis;
use toolgate_core::config::ApprovalConfig;

use super::render::PromptRenderer;
use super::types::{
    Behavior, GatewayError, PendingApproval, PermissionDecision, PermissionRequest,
    PermissionResolution, RenderRequest,
};
use crate::store::{ApprovalStore, Namespace, StoreError};

/// Reason returned when nobody decided in time.
pub const EXPIRED_MESSAGE: &str = "approval request expired";

/// Reason returned for a deny without a note.
pub const DEFAULT_DENY_MESSAGE: &str = "denied by user";

/// Timing of the approval window and the poll loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GatewayOptions {
    pub window: Duration,
    pub poll_initial: Duration,
    pub poll_max: Duration,
}

impl Default for GatewayOptions {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(300),
            poll_initial: Duration::from_millis(250),
            poll_max: Duration::from_secs(2),
        }
    }
}

impl From<&ApprovalConfig> for GatewayOptions {
    fn from(config: &ApprovalConfig) -> Self {
        let poll_initial = Duration::from_millis(config.poll_initial_ms.max(1));
        Self {
            window: config.window(),
            poll_initial,
            poll_max: Duration::from_millis(config.poll_max_ms).max(poll_initial),
        }
    }
}

pub struct PermissionGateway {
    store: ApprovalStore,
    renderer: Arc<dyn PromptRenderer>,
    options: GatewayOptions,
}

impl PermissionGateway {
    pub fn new(
        store: ApprovalStore,
        renderer: Arc<dyn PromptRenderer>,
        options: GatewayOptions,
    ) -> Self {
        Self {
            store,
            renderer,
            options,
        }
    }

    pub const fn store(&self) -> &ApprovalStore {
        &self.store
    }

    pub const fn options(&self) -> &GatewayOptions {
        &self.options
    }

    /// Ask for approval and wait until it is decided or expires.
    pub async fn request(
        &self,
        request: PermissionRequest,
    ) -> Result<PermissionDecision, GatewayError> {
        let approval_id = uuid::Uuid::new_v4().to_string();
        let created_at = self.store.now_millis();
        let expires_at = created_at.saturating_add(duration_millis(self.options.window).max(1));

        let pending = PendingApproval {
            approval_id: approval_id.clone(),
            tool_name: request.tool_name,
            input: request.input,
            requesting_user: request.requesting_user,
            origin_context: request.origin_context,
            created_at,
            expires_at,
        };
        self.store
            .put(Namespace::Pending, &approval_id, &pending, expires_at)
            .await?;
        info!(
            approval_id = %approval_id,
            tool = %pending.tool_name,
            requesting_user = %pending.requesting_user,
            expires_at,
            "Approval requested"
        );

        if let Err(e) = self.renderer.render(&RenderRequest::from(&pending)).await {
            warn!(approval_id = %approval_id, error = %e, "Approval prompt could not be rendered");
            if let Err(cleanup) = self.store.delete(Namespace::Pending, &approval_id).await {
                warn!(approval_id = %approval_id, error = %cleanup, "Failed to remove pending approval");
            }
            return Err(GatewayError::Render(e.to_string()));
        }

        self.await_resolution(&pending).await
    }

    async fn await_resolution(
        &self,
        pending: &PendingApproval,
    ) -> Result<PermissionDecision, GatewayError> {
        let id = pending.approval_id.as_str();
        let mut delay = self.options.poll_initial;

        loop {
            match self.store.get::<Value>(Namespace::Resolved, id).await {
                Ok(raw) => return self.consume(pending, raw).await,
                Err(e) if e.is_not_found() => {}
                Err(StoreError::Serialization(e)) => {
                    return self.reject_malformed(id, e.to_string()).await;
                }
                Err(e) => return Err(e.into()),
            }

            let now = self.store.now_millis();
            if now > pending.expires_at {
                return self.expire(id).await;
            }

            let remaining = u64::try_from(pending.expires_at - now)
                .map(|ms| Duration::from_millis(ms.saturating_add(1)))
                .unwrap_or(delay);
            tokio::time::sleep(delay.min(remaining)).await;
            delay = delay.saturating_mul(2).min(self.options.poll_max);
        }
    }

    async fn consume(
        &self,
        pending: &PendingApproval,
        raw: Value,
    ) -> Result<PermissionDecision, GatewayError> {
        let id = pending.approval_id.as_str();
        let resolution: PermissionResolution = match serde_json::from_value(raw) {
            Ok(resolution) => resolution,
            Err(e) => return self.reject_malformed(id, e.to_string()).await,
        };
        if resolution.approval_id != id {
            return self
                .reject_malformed(
                    id,
                    format!("resolution names approval {}", resolution.approval_id),
                )
                .await;
        }

        self.remove_both(id).await?;

        info!(
            approval_id = id,
            behavior = resolution.behavior.as_str(),
            resolved_by = %resolution.resolved_by,
            "Approval consumed"
        );
        #[cfg(feature = "metrics")]
        toolgate_core::metrics::record_approval(match resolution.behavior {
            Behavior::Allow => "allowed",
            Behavior::Deny => "denied",
        });

        Ok(match resolution.behavior {
            Behavior::Allow => PermissionDecision::Allow {
                updated_input: resolution
                    .updated_input
                    .unwrap_or_else(|| pending.input.clone()),
            },
            Behavior::Deny => PermissionDecision::Deny {
                message: resolution
                    .message
                    .unwrap_or_else(|| DEFAULT_DENY_MESSAGE.to_string()),
            },
        })
    }

    async fn expire(&self, id: &str) -> Result<PermissionDecision, GatewayError> {
        self.store.delete(Namespace::Pending, id).await?;
        info!(approval_id = id, "Approval expired");
        #[cfg(feature = "metrics")]
        toolgate_core::metrics::record_approval("expired");
        Ok(PermissionDecision::Deny {
            message: EXPIRED_MESSAGE.to_string(),
        })
    }

    async fn reject_malformed(
        &self,
        id: &str,
        reason: String,
    ) -> Result<PermissionDecision, GatewayError> {
        warn!(approval_id = id, %reason, "Discarding malformed resolution");
        self.remove_both(id).await?;
        Err(GatewayError::MalformedResolution {
            approval_id: id.to_string(),
            reason,
        })
    }

    async fn remove_both(&self, id: &str) -> Result<(), StoreError> {
        self.store.delete(Namespace::Resolved, id).await?;
        self.store.delete(Namespace::Pending, id).await?;
        debug!(approval_id = id, "Approval entries removed");
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::permission::render::RenderError;
    use crate::permission::resolver::ApprovalResolver;
    use async_trait::async_trait;
    use serde_json::json;
    use tempfile::TempDir;
    use tokio::sync::mpsc;
    use toolgate_core::clock::ManualClock;

    const T0: i64 = 1_700_000_000_000;

    struct ChannelRenderer(mpsc::UnboundedSender<RenderRequest>);

    #[async_trait]
    impl PromptRenderer for ChannelRenderer {
        async fn render(&self, request: &RenderRequest) -> Result<(), RenderError> {
            self.0
                .send(request.clone())
                .map_err(|e| RenderError::Other(e.to_string()))
        }
    }

    struct BrokenRenderer;

    #[async_trait]
    impl PromptRenderer for BrokenRenderer {
        async fn render(&self, _request: &RenderRequest) -> Result<(), RenderError> {
            Err(RenderError::Status(502))
        }
    }

    fn fast_options() -> GatewayOptions {
        GatewayOptions {
            window: Duration::from_secs(300),
            poll_initial: Duration::from_millis(5),
            poll_max: Duration::from_millis(20),
        }
    }

    fn request_from(user: &str) -> PermissionRequest {
        PermissionRequest {
            tool_name: "github__create_issue".into(),
            input: json!({"title": "bug"}),
            requesting_user: user.into(),
            origin_context: "C1/1700000000.0001".into(),
        }
    }

    fn setup(
        dir: &TempDir,
    ) -> (
        Arc<PermissionGateway>,
        ApprovalResolver,
        Arc<ManualClock>,
        mpsc::UnboundedReceiver<RenderRequest>,
    ) {
        let clock = Arc::new(ManualClock::new(T0));
        let store = ApprovalStore::with_clock(dir.path(), clock.clone());
        let (tx, rx) = mpsc::unbounded_channel();
        let gateway = Arc::new(PermissionGateway::new(
            store.clone(),
            Arc::new(ChannelRenderer(tx)),
            fast_options(),
        ));
        (gateway, ApprovalResolver::new(store), clock, rx)
    }

    #[tokio::test]
    async fn allow_within_window_returns_original_input() {
        let dir = TempDir::new().unwrap();
        let (gateway, resolver, clock, mut prompts) = setup(&dir);

        let waiting = tokio::spawn({
            let gateway = gateway.clone();
            async move { gateway.request(request_from("U001")).await }
        });

        let prompt = prompts.recv().await.unwrap();
        assert_eq!(prompt.requesting_user, "U001");
        assert_eq!(prompt.expires_at, T0 + 300_000);

        clock.advance(Duration::from_secs(60));
        resolver
            .resolve(&prompt.approval_id, "U001", Behavior::Allow, None, None)
            .await
            .unwrap();

        let decision = waiting.await.unwrap().unwrap();
        assert_eq!(
            decision,
            PermissionDecision::Allow {
                updated_input: json!({"title": "bug"})
            }
        );
        assert!(gateway
            .store()
            .get::<Value>(Namespace::Pending, &prompt.approval_id)
            .await
            .unwrap_err()
            .is_not_found());
    }

    #[tokio::test]
    async fn deny_and_updated_input_are_passed_through() {
        let dir = TempDir::new().unwrap();
        let (gateway, resolver, _clock, mut prompts) = setup(&dir);

        let first = tokio::spawn({
            let gateway = gateway.clone();
            async move { gateway.request(request_from("U001")).await }
        });
        let prompt = prompts.recv().await.unwrap();
        resolver
            .resolve(
                &prompt.approval_id,
                "U001",
                Behavior::Deny,
                None,
                Some("not on main".into()),
            )
            .await
            .unwrap();
        assert_eq!(
            first.await.unwrap().unwrap(),
            PermissionDecision::Deny {
                message: "not on main".into()
            }
        );

        let second = tokio::spawn({
            let gateway = gateway.clone();
            async move { gateway.request(request_from("U001")).await }
        });
        let prompt = prompts.recv().await.unwrap();
        resolver
            .resolve(
                &prompt.approval_id,
                "U001",
                Behavior::Allow,
                Some(json!({"title": "edited"})),
                None,
            )
            .await
            .unwrap();
        assert_eq!(
            second.await.unwrap().unwrap(),
            PermissionDecision::Allow {
                updated_input: json!({"title": "edited"})
            }
        );
    }

    #[tokio::test]
    async fn expires_when_nobody_decides() {
        let dir = TempDir::new().unwrap();
        let (gateway, resolver, clock, mut prompts) = setup(&dir);

        let waiting = tokio::spawn({
            let gateway = gateway.clone();
            async move { gateway.request(request_from("U001")).await }
        });
        let prompt = prompts.recv().await.unwrap();

        clock.advance(Duration::from_secs(6 * 60));
        let decision = waiting.await.unwrap().unwrap();
        assert_eq!(
            decision,
            PermissionDecision::Deny {
                message: EXPIRED_MESSAGE.into()
            }
        );

        let late = resolver
            .resolve(&prompt.approval_id, "U001", Behavior::Allow, None, None)
            .await
            .unwrap_err();
        assert!(matches!(late, crate::permission::ResolveError::NotFound { .. }));
    }

    #[tokio::test]
    async fn render_failure_removes_pending_entry() {
        let dir = TempDir::new().unwrap();
        let store = ApprovalStore::with_clock(dir.path(), Arc::new(ManualClock::new(T0)));
        let gateway = PermissionGateway::new(store, Arc::new(BrokenRenderer), fast_options());

        let err = gateway.request(request_from("U001")).await.unwrap_err();
        assert!(matches!(err, GatewayError::Render(_)));

        let leftovers = std::fs::read_dir(dir.path().join("pending"))
            .map(|entries| entries.count())
            .unwrap_or(0);
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn mismatched_resolution_is_malformed() {
        let dir = TempDir::new().unwrap();
        let (gateway, _resolver, _clock, mut prompts) = setup(&dir);

        let waiting = tokio::spawn({
            let gateway = gateway.clone();
            async move { gateway.request(request_from("U001")).await }
        });
        let prompt = prompts.recv().await.unwrap();

        let forged = PermissionResolution {
            approval_id: "someone-else".into(),
            behavior: Behavior::Allow,
            updated_input: None,
            message: None,
            resolved_by: "U001".into(),
            resolved_at: T0,
        };
        gateway
            .store()
            .put(Namespace::Resolved, &prompt.approval_id, &forged, T0 + 300_000)
            .await
            .unwrap();

        let err = waiting.await.unwrap().unwrap_err();
        assert!(matches!(err, GatewayError::MalformedResolution { .. }));
    }

    #[tokio::test]
    async fn concurrent_approvals_are_independent() {
        let dir = TempDir::new().unwrap();
        let (gateway, resolver, _clock, mut prompts) = setup(&dir);

        let a = tokio::spawn({
            let gateway = gateway.clone();
            async move { gateway.request(request_from("U001")).await }
        });
        let b = tokio::spawn({
            let gateway = gateway.clone();
            async move { gateway.request(request_from("U002")).await }
        });

        let mut prompt_a = prompts.recv().await.unwrap();
        let mut prompt_b = prompts.recv().await.unwrap();
        if prompt_a.requesting_user != "U001" {
            std::mem::swap(&mut prompt_a, &mut prompt_b);
        }

        resolver
            .resolve(&prompt_b.approval_id, "U002", Behavior::Deny, None, None)
            .await
            .unwrap();
        assert!(!b.await.unwrap().unwrap().is_allow());

        resolver
            .resolve(&prompt_a.approval_id, "U001", Behavior::Allow, None, None)
            .await
            .unwrap();
        assert!(a.await.unwrap().unwrap().is_allow());
    }

    #[test]
    fn options_from_config_keep_backoff_bounded() {
        let config = ApprovalConfig {
            window_secs: 90,
            poll_initial_ms: 500,
            poll_max_ms: 100,
            ..ApprovalConfig::default()
        };
        let options = GatewayOptions::from(&config);
        assert_eq!(options.window, Duration::from_secs(90));
        assert_eq!(options.poll_initial, Duration::from_millis(500));
        assert_eq!(options.poll_max, Duration::from_millis(500));
    }
}
