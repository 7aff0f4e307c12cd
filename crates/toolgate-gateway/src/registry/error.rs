use std::path::PathBuf;

use crate::transport::TransportError;

/// Errors from the tool server registry.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// The server configuration file cannot be used at all.
    #[error("Invalid server configuration {path}: {reason}")]
    ConfigInvalid { path: PathBuf, reason: String },

    #[error("Unknown tool server: {0}")]
    UnknownServer(String),

    #[error(transparent)]
    Transport(#[from] TransportError),
}
