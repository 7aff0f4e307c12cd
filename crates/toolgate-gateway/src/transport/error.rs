//! Transport error types.

use std::time::Duration;

/// Errors from tool server transports.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    /// The connection or subprocess is gone. New calls are rejected until a
    /// fresh client is connected.
    #[error("Transport closed")]
    TransportClosed,

    /// Connectivity failure: connect refused, non-success status, broken pipe.
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("JSON-RPC error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Failed to spawn tool server: {0}")]
    Spawn(String),
}

impl TransportError {
    /// Text safe to show to an end user. Never includes protocol detail.
    pub const fn user_message(&self) -> &'static str {
        match self {
            Self::Timeout(_) => "tool call timed out",
            _ => "tool call failed",
        }
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        Self::Transport(e.to_string())
    }
}

impl From<serde_json::Error> for TransportError {
    fn from(e: serde_json::Error) -> Self {
        Self::Protocol(e.to_string())
    }
}

impl From<toolgate_core::Error> for TransportError {
    fn from(e: toolgate_core::Error) -> Self {
        Self::Protocol(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_message_hides_protocol_detail() {
        let err = TransportError::Rpc {
            code: -32000,
            message: "stack trace: secret".into(),
        };
        assert_eq!(err.user_message(), "tool call failed");
        assert!(!err.user_message().contains("secret"));
        assert_eq!(
            TransportError::Timeout(Duration::from_secs(1)).user_message(),
            "tool call timed out"
        );
    }
}
