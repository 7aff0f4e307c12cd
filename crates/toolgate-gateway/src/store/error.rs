//! Approval store error types.

/// Errors from approval store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// No live entry. Covers entries that were lazily expired on read.
    #[error("Entry not found: {namespace}/{key}")]
    NotFound { namespace: &'static str, key: String },

    #[error("Invalid store key: {0:?}")]
    InvalidKey(String),

    #[error("Store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Store serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}
