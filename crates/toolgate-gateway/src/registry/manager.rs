//! Effective server registry: file-declared servers plus synthesized ones,
//! with credentials injected at load time.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use toolgate_core::clock::unix_timestamp_millis;
use toolgate_core::config::ServersConfig;
use toolgate_core::jsonrpc::server_prefix;

use super::config::{SkippedEntry, ToolServerConfig, load_servers_file};
use super::credentials::{Credential, CredentialError, CredentialProvider};
use super::error::RegistryError;
use crate::transport::{self, ClientInfo, TransportError};

/// Name of the synthesized source-control server.
pub const SOURCE_CONTROL_SERVER: &str = "github";

/// Name of the synthesized filesystem server.
pub const FILESYSTEM_SERVER: &str = "filesystem";

const FILESYSTEM_COMMAND: &str = "npx";
const FILESYSTEM_PACKAGE: &str = "@modelcontextprotocol/server-filesystem";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerOrigin {
    File,
    Synthesized,
}

/// One server as the gateway will reach it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisteredServer {
    pub name: String,
    pub config: ToolServerConfig,
    pub origin: ServerOrigin,
    /// A live credential was injected into `config`.
    pub credential_injected: bool,
}

/// Snapshot produced by one load.
#[derive(Debug, Clone, Default)]
pub struct EffectiveServerRegistry {
    servers: BTreeMap<String, RegisteredServer>,
    skipped: Vec<SkippedEntry>,
}

impl EffectiveServerRegistry {
    pub fn get(&self, name: &str) -> Option<&RegisteredServer> {
        self.servers.get(name)
    }

    pub fn servers(&self) -> impl Iterator<Item = &RegisteredServer> {
        self.servers.values()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.servers.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    /// Entries dropped from the file, with reasons.
    pub fn skipped(&self) -> &[SkippedEntry] {
        &self.skipped
    }

    /// `"<server>__"` for every server.
    pub fn allowed_tool_prefixes(&self) -> BTreeSet<String> {
        self.servers.keys().map(|name| server_prefix(name)).collect()
    }
}

/// Inputs to a registry load.
#[derive(Debug, Clone)]
pub struct RegistryOptions {
    pub config_path: PathBuf,
    pub filesystem_root: Option<PathBuf>,
    pub credentialed_servers: Vec<String>,
    pub source_control_url: String,
    pub token_env: String,
}

impl RegistryOptions {
    pub fn from_config(servers: &ServersConfig, config_path: PathBuf) -> Self {
        Self {
            config_path,
            filesystem_root: servers.filesystem_root.clone(),
            credentialed_servers: servers.credentialed_servers.clone(),
            source_control_url: servers.source_control_url.clone(),
            token_env: servers.token_env.clone(),
        }
    }

    /// Options with library defaults and the given server file.
    pub fn with_config_path(config_path: impl Into<PathBuf>) -> Self {
        Self::from_config(&ServersConfig::default(), config_path.into())
    }
}

/// Loads and caches the effective server set.
pub struct ServerRegistry {
    options: RegistryOptions,
    credentials: Option<Arc<dyn CredentialProvider>>,
    client_info: ClientInfo,
    cache: RwLock<Option<Arc<EffectiveServerRegistry>>>,
}

impl ServerRegistry {
    pub fn new(options: RegistryOptions) -> Self {
        Self {
            options,
            credentials: None,
            client_info: ClientInfo::default(),
            cache: RwLock::new(None),
        }
    }

    #[must_use]
    pub fn with_credential_provider(mut self, provider: Arc<dyn CredentialProvider>) -> Self {
        self.credentials = Some(provider);
        self
    }

    #[must_use]
    pub fn with_client_info(mut self, client_info: ClientInfo) -> Self {
        self.client_info = client_info;
        self
    }

    pub const fn options(&self) -> &RegistryOptions {
        &self.options
    }

    pub const fn client_info(&self) -> &ClientInfo {
        &self.client_info
    }

    /// Cached registry, loading on first use.
    pub async fn load(&self) -> Result<Arc<EffectiveServerRegistry>, RegistryError> {
        if let Some(registry) = self.cache.read().await.as_ref() {
            return Ok(Arc::clone(registry));
        }

        let mut cache = self.cache.write().await;
        if let Some(registry) = cache.as_ref() {
            return Ok(Arc::clone(registry));
        }
        let registry = Arc::new(self.build().await?);
        *cache = Some(Arc::clone(&registry));
        drop(cache);
        Ok(registry)
    }

    /// Drop the cache and re-read the file with fresh credentials.
    pub async fn reload(&self) -> Result<Arc<EffectiveServerRegistry>, RegistryError> {
        let registry = Arc::new(self.build().await?);
        *self.cache.write().await = Some(Arc::clone(&registry));
        Ok(registry)
    }

    pub async fn effective_allowed_tool_prefixes(&self) -> Result<BTreeSet<String>, RegistryError> {
        Ok(self.load().await?.allowed_tool_prefixes())
    }

    /// Connect to `name`, complete the handshake within `timeout`, close.
    pub async fn check_connectivity(&self, name: &str, timeout: Duration) -> Result<(), RegistryError> {
        let registry = self.load().await?;
        let server = registry
            .get(name)
            .ok_or_else(|| RegistryError::UnknownServer(name.to_string()))?;

        let client = tokio::time::timeout(
            timeout,
            transport::connect(name, &server.config, &self.client_info, timeout),
        )
        .await
        .map_err(|_| TransportError::Timeout(timeout))??;
        client.close().await;
        info!(server = name, "Tool server reachable");
        Ok(())
    }

    async fn build(&self) -> Result<EffectiveServerRegistry, RegistryError> {
        let file = load_servers_file(&self.options.config_path).await?;
        let credential = self.fetch_credential().await;

        let mut servers = BTreeMap::new();
        for (name, mut config) in file.servers {
            let mut credential_injected = false;
            if self.options.credentialed_servers.contains(&name) {
                if let Some(credential) = &credential {
                    config.inject_token(&self.options.token_env, &credential.token);
                    credential_injected = true;
                } else {
                    debug!(server = %name, "No live credential, using static configuration");
                }
            }
            servers.insert(
                name.clone(),
                RegisteredServer {
                    name,
                    config,
                    origin: ServerOrigin::File,
                    credential_injected,
                },
            );
        }

        if self.credentials.is_some() && !servers.contains_key(SOURCE_CONTROL_SERVER) {
            if let Some(credential) = &credential {
                let mut config = ToolServerConfig::http(&self.options.source_control_url);
                config.inject_token(&self.options.token_env, &credential.token);
                insert_synthesized(&mut servers, SOURCE_CONTROL_SERVER, config, true);
            } else {
                warn!(
                    server = SOURCE_CONTROL_SERVER,
                    "Credential unavailable, omitting synthesized server"
                );
            }
        }

        if let Some(root) = &self.options.filesystem_root {
            let config = ToolServerConfig::stdio(
                FILESYSTEM_COMMAND,
                [
                    "-y".to_string(),
                    FILESYSTEM_PACKAGE.to_string(),
                    root.display().to_string(),
                ],
            );
            insert_synthesized(&mut servers, FILESYSTEM_SERVER, config, false);
        }

        info!(
            path = %self.options.config_path.display(),
            servers = servers.len(),
            skipped = file.skipped.len(),
            "Tool server registry loaded"
        );
        Ok(EffectiveServerRegistry {
            servers,
            skipped: file.skipped,
        })
    }

    async fn fetch_credential(&self) -> Option<Credential> {
        let provider = self.credentials.as_ref()?;
        let result = provider.get_token().await.and_then(|credential| {
            if credential.is_expired_at(unix_timestamp_millis()) {
                Err(CredentialError::Expired)
            } else {
                Ok(credential)
            }
        });
        match result {
            Ok(credential) => Some(credential),
            Err(e) => {
                warn!(error = %e, "Credential fetch failed, falling back to static configuration");
                None
            }
        }
    }
}

/// File-declared servers always win over synthesized ones.
fn insert_synthesized(
    servers: &mut BTreeMap<String, RegisteredServer>,
    name: &str,
    config: ToolServerConfig,
    credential_injected: bool,
) {
    if servers.contains_key(name) {
        debug!(server = name, "File declares server, not synthesizing");
        return;
    }
    servers.insert(
        name.to_string(),
        RegisteredServer {
            name: name.to_string(),
            config,
            origin: ServerOrigin::Synthesized,
            credential_injected,
        },
    );
}
