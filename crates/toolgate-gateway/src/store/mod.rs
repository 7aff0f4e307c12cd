//! File-backed approval store shared between processes.
//!
//! Two namespaces (pending requests and resolutions) keyed by approval id,
//! each entry carrying its own deadline. Coordination relies only on atomic
//! rename; there is no cross-process lock.

mod error;
mod file;

pub use error::StoreError;
pub use file::{ApprovalStore, Namespace};
pub(crate) use file::write_atomic;
