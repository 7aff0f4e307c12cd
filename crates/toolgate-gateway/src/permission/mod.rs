//! Human approval of privileged tool calls across a process boundary.
//!
//! The gateway (inside the tool-serving process) writes a pending approval
//! to the shared store and waits; the resolver (inside the chat process)
//! writes the human's decision next to it.

mod gateway;
mod render;
mod resolver;
mod server;
mod types;

pub use gateway::{DEFAULT_DENY_MESSAGE, EXPIRED_MESSAGE, GatewayOptions, PermissionGateway};
pub use render::{LogRenderer, PromptRenderer, RenderError, WebhookRenderer};
pub use resolver::{ApprovalResolver, RESOLUTION_GRACE};
pub use server::{APPROVAL_FAILED_MESSAGE, APPROVAL_TOOL, ApprovalServer, SessionIdentity};
pub use types::{
    Behavior, GatewayError, PendingApproval, PermissionDecision, PermissionRequest,
    PermissionResolution, RenderRequest, ResolveError, summarize_input,
};
