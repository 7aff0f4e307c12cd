//! `toolgate` Core Library
//!
//! Shared functionality for `toolgate` components:
//! - Gateway settings resolution and hierarchy
//! - JSON-RPC 2.0 wire types and tool-name namespacing
//! - Wall-clock abstraction used for approval expiry
//! - Tracing (and optional metrics) initialisation
//! - Common error types

pub mod clock;
pub mod config;
pub mod error;
pub mod jsonrpc;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod tracing_init;

pub use clock::{Clock, SystemClock};
pub use config::GatewayConfig;
pub use error::{Error, Result};
