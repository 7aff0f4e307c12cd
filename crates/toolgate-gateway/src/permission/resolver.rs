//! Approval resolver: records a human's decision for a pending approval.
//!
//! Only the user who triggered the approval may decide it, and each approval
//! is decided at most once. A second decision is rejected with
//! [`ResolveError::AlreadyResolved`].

use std::time::Duration;

use serde_json::Value;
use tracing::{info, warn};

use toolgate_core::clock::duration_millis;

use super::types::{Behavior, PendingApproval, PermissionResolution, ResolveError};
use crate::store::{ApprovalStore, Namespace, StoreError};

/// How long a resolution outlives its pending approval, so a decision made
/// just before the deadline is still picked up by the gateway's next poll.
pub const RESOLUTION_GRACE: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct ApprovalResolver {
    store: ApprovalStore,
}

impl ApprovalResolver {
    pub const fn new(store: ApprovalStore) -> Self {
        Self { store }
    }

    /// The live pending approval, for re-rendering a prompt.
    pub async fn describe(&self, approval_id: &str) -> Result<PendingApproval, ResolveError> {
        self.store
            .get(Namespace::Pending, approval_id)
            .await
            .map_err(|e| not_found_or_store(approval_id, e))
    }

    /// Record `acting_user`'s decision on `approval_id`.
    pub async fn resolve(
        &self,
        approval_id: &str,
        acting_user: &str,
        behavior: Behavior,
        updated_input: Option<Value>,
        message: Option<String>,
    ) -> Result<PermissionResolution, ResolveError> {
        let pending = self.describe(approval_id).await?;

        if pending.requesting_user != acting_user {
            warn!(
                approval_id,
                acting_user,
                requesting_user = %pending.requesting_user,
                "Rejected resolution from non-requester"
            );
            return Err(ResolveError::Forbidden {
                approval_id: approval_id.to_string(),
                acting_user: acting_user.to_string(),
            });
        }

        let resolution = PermissionResolution {
            approval_id: approval_id.to_string(),
            behavior,
            updated_input,
            message,
            resolved_by: acting_user.to_string(),
            resolved_at: self.store.now_millis(),
        };
        let expires_at = pending
            .expires_at
            .saturating_add(duration_millis(RESOLUTION_GRACE));

        let created = self
            .store
            .put_new(Namespace::Resolved, approval_id, &resolution, expires_at)
            .await
            .map_err(|e| not_found_or_store(approval_id, e))?;
        if !created {
            return Err(ResolveError::AlreadyResolved {
                approval_id: approval_id.to_string(),
            });
        }

        // The window may have closed while the decision was being written.
        if self.store.now_millis() > pending.expires_at {
            warn!(approval_id, "Approval expired during resolution, withdrawing decision");
            if let Err(e) = self.store.delete(Namespace::Resolved, approval_id).await {
                warn!(approval_id, error = %e, "Failed to withdraw late resolution");
            }
            return Err(ResolveError::NotFound {
                approval_id: approval_id.to_string(),
            });
        }

        info!(
            approval_id,
            behavior = behavior.as_str(),
            resolved_by = acting_user,
            "Approval resolved"
        );
        Ok(resolution)
    }
}

fn not_found_or_store(approval_id: &str, e: StoreError) -> ResolveError {
    match e {
        // An id that cannot be a store key cannot name a live approval either.
        StoreError::NotFound { .. } | StoreError::InvalidKey(_) => ResolveError::NotFound {
            approval_id: approval_id.to_string(),
        },
        other => ResolveError::Store(other),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;
    use toolgate_core::clock::{Clock, ManualClock};

    const T0: i64 = 1_700_000_000_000;
    const WINDOW_MS: i64 = 5 * 60 * 1000;

    async fn seed(store: &ApprovalStore, id: &str, user: &str) -> PendingApproval {
        let pending = PendingApproval {
            approval_id: id.into(),
            tool_name: "Bash".into(),
            input: json!({"command": "rm -rf build"}),
            requesting_user: user.into(),
            origin_context: "C1".into(),
            created_at: T0,
            expires_at: T0 + WINDOW_MS,
        };
        store
            .put(Namespace::Pending, id, &pending, pending.expires_at)
            .await
            .unwrap();
        pending
    }

    fn setup(dir: &TempDir) -> (ApprovalStore, ApprovalResolver, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(T0));
        let store = ApprovalStore::with_clock(dir.path(), clock.clone());
        (store.clone(), ApprovalResolver::new(store), clock)
    }

    #[tokio::test]
    async fn requester_can_allow_within_window() {
        let dir = TempDir::new().unwrap();
        let (store, resolver, clock) = setup(&dir);
        seed(&store, "a1", "U001").await;

        clock.advance(Duration::from_secs(60));
        let resolution = resolver
            .resolve("a1", "U001", Behavior::Allow, None, None)
            .await
            .unwrap();
        assert_eq!(resolution.resolved_by, "U001");
        assert_eq!(resolution.resolved_at, T0 + 60_000);

        let stored: PermissionResolution = store.get(Namespace::Resolved, "a1").await.unwrap();
        assert_eq!(stored, resolution);
    }

    #[tokio::test]
    async fn after_window_is_not_found() {
        let dir = TempDir::new().unwrap();
        let (store, resolver, clock) = setup(&dir);
        seed(&store, "a1", "U001").await;

        clock.advance(Duration::from_secs(6 * 60));
        let err = resolver
            .resolve("a1", "U001", Behavior::Allow, None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ResolveError::NotFound { .. }));
        assert_eq!(err.user_message(), "request no longer available");
    }

    #[tokio::test]
    async fn other_user_is_forbidden_and_store_untouched() {
        let dir = TempDir::new().unwrap();
        let (store, resolver, _clock) = setup(&dir);
        let pending = seed(&store, "a1", "U001").await;

        let err = resolver
            .resolve("a1", "U999", Behavior::Allow, None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ResolveError::Forbidden { .. }));

        let still: PendingApproval = store.get(Namespace::Pending, "a1").await.unwrap();
        assert_eq!(still, pending);
        assert!(store
            .get::<Value>(Namespace::Resolved, "a1")
            .await
            .unwrap_err()
            .is_not_found());
    }

    #[tokio::test]
    async fn second_resolution_is_rejected() {
        let dir = TempDir::new().unwrap();
        let (store, resolver, _clock) = setup(&dir);
        seed(&store, "a1", "U001").await;

        resolver
            .resolve("a1", "U001", Behavior::Deny, None, Some("no".into()))
            .await
            .unwrap();
        let err = resolver
            .resolve("a1", "U001", Behavior::Allow, None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ResolveError::AlreadyResolved { .. }));

        let stored: PermissionResolution = store.get(Namespace::Resolved, "a1").await.unwrap();
        assert_eq!(stored.behavior, Behavior::Deny);
    }

    #[tokio::test]
    async fn unknown_or_unsafe_ids_are_not_found() {
        let dir = TempDir::new().unwrap();
        let (_store, resolver, _clock) = setup(&dir);

        for id in ["missing", "../pending/x"] {
            let err = resolver
                .resolve(id, "U001", Behavior::Allow, None, None)
                .await
                .unwrap_err();
            assert!(matches!(err, ResolveError::NotFound { .. }), "{id}");
        }
    }

    #[tokio::test]
    async fn describe_returns_live_pending() {
        let dir = TempDir::new().unwrap();
        let (store, resolver, clock) = setup(&dir);
        let pending = seed(&store, "a1", "U001").await;

        assert_eq!(resolver.describe("a1").await.unwrap(), pending);
        clock.advance(Duration::from_secs(301));
        assert!(matches!(
            resolver.describe("a1").await,
            Err(ResolveError::NotFound { .. })
        ));
    }

    /// Reads `before` for the first `switch_after` reads and `after` from then on.
    #[derive(Debug)]
    struct SteppingClock {
        reads: AtomicUsize,
        switch_after: usize,
        before: i64,
        after: i64,
    }

    impl Clock for SteppingClock {
        fn now_millis(&self) -> i64 {
            if self.reads.fetch_add(1, Ordering::SeqCst) < self.switch_after {
                self.before
            } else {
                self.after
            }
        }
    }

    #[tokio::test]
    async fn window_closing_mid_resolution_withdraws_the_decision() {
        let dir = TempDir::new().unwrap();
        let seeder = ApprovalStore::with_clock(dir.path(), Arc::new(ManualClock::new(T0)));
        seed(&seeder, "a1", "U001").await;

        // The pending read and the resolution timestamp see a live window;
        // the clock has passed the deadline once the write has landed.
        let clock = Arc::new(SteppingClock {
            reads: AtomicUsize::new(0),
            switch_after: 2,
            before: T0 + WINDOW_MS - 1,
            after: T0 + WINDOW_MS + 1,
        });
        let resolver = ApprovalResolver::new(ApprovalStore::with_clock(dir.path(), clock));

        let err = resolver
            .resolve("a1", "U001", Behavior::Allow, None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ResolveError::NotFound { .. }), "{err:?}");
        assert!(seeder
            .get::<Value>(Namespace::Resolved, "a1")
            .await
            .unwrap_err()
            .is_not_found());
    }
}
