//! toolgate Gateway Library
//!
//! Tool invocation and human approval for an agent runtime:
//! - File-backed approval store shared between processes
//! - Permission gateway, approval resolver and the approval prompt server
//! - Tool server registry with credential injection
//! - JSON-RPC transport clients (stdio, SSE, streamable HTTP)
//! - Call statistics for progress estimation

pub mod invoker;
pub mod permission;
pub mod registry;
pub mod stats;
pub mod store;
pub mod transport;

pub use invoker::{InvokeError, ToolInvoker};
