//! Credential provider boundary.
//!
//! Tokens are fetched fresh every time the registry loads; the provider owns
//! refresh and storage.

use std::fmt;

use async_trait::async_trait;

use toolgate_core::clock::unix_timestamp_millis;

/// A bearer token with an optional deadline (Unix millis).
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    pub token: String,
    pub expires_at: Option<i64>,
}

impl Credential {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            expires_at: None,
        }
    }

    pub fn is_expired_at(&self, now_millis: i64) -> bool {
        self.expires_at.is_some_and(|deadline| now_millis >= deadline)
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("Credential unavailable: {0}")]
    Unavailable(String),

    #[error("Credential expired")]
    Expired,
}

/// Source of live credentials for credentialed tool servers.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn get_token(&self) -> Result<Credential, CredentialError>;
}

/// Always returns the same token.
#[derive(Clone)]
pub struct StaticTokenProvider {
    credential: Credential,
}

impl StaticTokenProvider {
    pub fn new(credential: Credential) -> Self {
        Self { credential }
    }
}

#[async_trait]
impl CredentialProvider for StaticTokenProvider {
    async fn get_token(&self) -> Result<Credential, CredentialError> {
        if self.credential.is_expired_at(unix_timestamp_millis()) {
            return Err(CredentialError::Expired);
        }
        Ok(self.credential.clone())
    }
}

/// Reads the token from an environment variable on every fetch.
#[derive(Debug, Clone)]
pub struct EnvTokenProvider {
    var: String,
}

impl EnvTokenProvider {
    pub fn new(var: impl Into<String>) -> Self {
        Self { var: var.into() }
    }
}

#[async_trait]
impl CredentialProvider for EnvTokenProvider {
    async fn get_token(&self) -> Result<Credential, CredentialError> {
        match std::env::var(&self.var) {
            Ok(token) if !token.trim().is_empty() => Ok(Credential::new(token.trim())),
            _ => Err(CredentialError::Unavailable(format!("{} is not set", self.var))),
        }
    }
}
