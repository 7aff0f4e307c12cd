//! Approval workflow types.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::store::StoreError;

/// Longest input summary shown in a prompt.
pub const INPUT_SUMMARY_MAX_CHARS: usize = 500;

/// A privileged tool call awaiting a human decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingApproval {
    pub approval_id: String,
    pub tool_name: String,
    pub input: Value,
    pub requesting_user: String,
    pub origin_context: String,
    /// Unix millis.
    pub created_at: i64,
    /// Unix millis. Always later than `created_at`.
    pub expires_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Behavior {
    Allow,
    Deny,
}

impl Behavior {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Allow => "allow",
            Self::Deny => "deny",
        }
    }
}

/// The human's decision, written once by the resolver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PermissionResolution {
    pub approval_id: String,
    pub behavior: Behavior,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_input: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub resolved_by: String,
    pub resolved_at: i64,
}

/// What the agent runtime asks the gateway to approve.
#[derive(Debug, Clone, PartialEq)]
pub struct PermissionRequest {
    pub tool_name: String,
    pub input: Value,
    pub requesting_user: String,
    pub origin_context: String,
}

/// Everything the chat side needs to draw an approve/deny prompt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderRequest {
    pub approval_id: String,
    pub tool_name: String,
    pub input_summary: String,
    pub requesting_user: String,
    pub origin_context: String,
    pub expires_at: i64,
}

impl From<&PendingApproval> for RenderRequest {
    fn from(pending: &PendingApproval) -> Self {
        Self {
            approval_id: pending.approval_id.clone(),
            tool_name: pending.tool_name.clone(),
            input_summary: summarize_input(&pending.input),
            requesting_user: pending.requesting_user.clone(),
            origin_context: pending.origin_context.clone(),
            expires_at: pending.expires_at,
        }
    }
}

/// Compact one-line rendering of a tool input, truncated for display.
pub fn summarize_input(input: &Value) -> String {
    let text = match input {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    if text.chars().count() <= INPUT_SUMMARY_MAX_CHARS {
        return text;
    }
    let mut truncated: String = text.chars().take(INPUT_SUMMARY_MAX_CHARS).collect();
    truncated.push('…');
    truncated
}

/// Outcome returned to the agent runtime.
///
/// Serializes to the prompt-tool reply shape:
/// `{"behavior":"allow","updatedInput":...}` or `{"behavior":"deny","message":...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "behavior", rename_all = "lowercase")]
pub enum PermissionDecision {
    Allow {
        #[serde(rename = "updatedInput")]
        updated_input: Value,
    },
    Deny {
        message: String,
    },
}

impl PermissionDecision {
    pub const fn is_allow(&self) -> bool {
        matches!(self, Self::Allow { .. })
    }
}

/// Errors from the gateway's request/poll loop.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Malformed resolution for {approval_id}: {reason}")]
    MalformedResolution { approval_id: String, reason: String },

    #[error("Failed to render approval prompt: {0}")]
    Render(String),
}

/// Errors from resolving an approval.
#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    /// No live pending approval; never existed and expired look the same.
    #[error("Approval not found: {approval_id}")]
    NotFound { approval_id: String },

    #[error("User {acting_user} may not resolve approval {approval_id}")]
    Forbidden {
        approval_id: String,
        acting_user: String,
    },

    #[error("Approval already resolved: {approval_id}")]
    AlreadyResolved { approval_id: String },

    #[error(transparent)]
    Store(StoreError),
}

impl ResolveError {
    /// Text for the human who clicked the button.
    pub const fn user_message(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "request no longer available",
            Self::Forbidden { .. } => "only the requester may decide this",
            Self::AlreadyResolved { .. } => "this request was already decided",
            Self::Store(_) => "could not record the decision, try again",
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decision_serializes_to_prompt_reply() {
        let allow = PermissionDecision::Allow {
            updated_input: json!({"command": "ls"}),
        };
        assert_eq!(
            serde_json::to_value(&allow).unwrap(),
            json!({"behavior": "allow", "updatedInput": {"command": "ls"}})
        );

        let deny = PermissionDecision::Deny {
            message: "no".into(),
        };
        assert_eq!(
            serde_json::to_value(&deny).unwrap(),
            json!({"behavior": "deny", "message": "no"})
        );
    }

    #[test]
    fn summary_truncates_long_input() {
        let long = "x".repeat(INPUT_SUMMARY_MAX_CHARS + 10);
        let summary = summarize_input(&Value::String(long));
        assert_eq!(summary.chars().count(), INPUT_SUMMARY_MAX_CHARS + 1);
        assert!(summary.ends_with('…'));

        assert_eq!(summarize_input(&json!({"a": 1})), r#"{"a":1}"#);
    }

    #[test]
    fn user_messages() {
        let id = "a".to_string();
        assert_eq!(
            ResolveError::NotFound {
                approval_id: id.clone()
            }
            .user_message(),
            "request no longer available"
        );
        assert_eq!(
            ResolveError::Forbidden {
                approval_id: id.clone(),
                acting_user: "U999".into()
            }
            .user_message(),
            "only the requester may decide this"
        );
        assert_eq!(
            ResolveError::AlreadyResolved { approval_id: id }.user_message(),
            "this request was already decided"
        );
    }
}
