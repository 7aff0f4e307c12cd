//! Declarative tool server configuration.
//!
//! The file is JSON or TOML (picked by extension) with a top-level
//! `mcpServers` table mapping server names to transport configurations:
//!
//! ```json
//! {
//!   "mcpServers": {
//!     "fs":     { "command": "fs-server", "args": ["/srv"] },
//!     "issues": { "type": "http", "url": "https://issues.example/mcp" }
//!   }
//! }
//! ```

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use toolgate_core::jsonrpc::NAMESPACE_SEPARATOR;

use super::error::RegistryError;

const SERVERS_KEY: &str = "mcpServers";

/// How to reach one tool server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ToolServerConfig {
    Stdio(StdioServerConfig),
    Sse(RemoteServerConfig),
    Http(RemoteServerConfig),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StdioServerConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteServerConfig {
    pub url: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

impl ToolServerConfig {
    pub fn stdio(command: impl Into<String>, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self::Stdio(StdioServerConfig {
            command: command.into(),
            args: args.into_iter().map(Into::into).collect(),
            env: BTreeMap::new(),
        })
    }

    pub fn http(url: impl Into<String>) -> Self {
        Self::Http(RemoteServerConfig {
            url: url.into(),
            headers: BTreeMap::new(),
        })
    }

    pub fn sse(url: impl Into<String>) -> Self {
        Self::Sse(RemoteServerConfig {
            url: url.into(),
            headers: BTreeMap::new(),
        })
    }

    pub const fn transport_kind(&self) -> &'static str {
        match self {
            Self::Stdio(_) => "stdio",
            Self::Sse(_) => "sse",
            Self::Http(_) => "http",
        }
    }

    /// Inject a bearer token: as env var `token_env` for stdio servers, as
    /// an `Authorization` header for remote ones.
    pub fn inject_token(&mut self, token_env: &str, token: &str) {
        match self {
            Self::Stdio(stdio) => {
                stdio.env.insert(token_env.to_string(), token.to_string());
            }
            Self::Sse(remote) | Self::Http(remote) => {
                remote
                    .headers
                    .insert("Authorization".to_string(), format!("Bearer {token}"));
            }
        }
    }

    fn validate(&self) -> Result<(), String> {
        match self {
            Self::Stdio(stdio) if stdio.command.trim().is_empty() => {
                Err("`command` must not be empty".to_string())
            }
            Self::Stdio(_) => Ok(()),
            Self::Sse(remote) | Self::Http(remote) => {
                let url = reqwest::Url::parse(&remote.url)
                    .map_err(|e| format!("invalid `url` {:?}: {e}", remote.url))?;
                match url.scheme() {
                    "http" | "https" => Ok(()),
                    other => Err(format!("unsupported url scheme {other:?}")),
                }
            }
        }
    }
}

/// An entry dropped while loading, reported alongside the loaded servers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedEntry {
    pub name: String,
    pub reason: String,
}

/// Result of reading the server configuration file.
#[derive(Debug, Clone, Default)]
pub struct ServersFile {
    pub servers: BTreeMap<String, ToolServerConfig>,
    pub skipped: Vec<SkippedEntry>,
}

/// Read and parse the server configuration file.
///
/// A missing or blank file yields no servers.
pub async fn load_servers_file(path: &Path) -> Result<ServersFile, RegistryError> {
    let invalid = |reason: String| RegistryError::ConfigInvalid {
        path: path.to_path_buf(),
        reason,
    };

    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(ServersFile::default()),
        Err(e) => return Err(invalid(e.to_string())),
    };
    if content.trim().is_empty() {
        return Ok(ServersFile::default());
    }

    let is_toml = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    let document: Value = if is_toml {
        toml::from_str(&content).map_err(|e| invalid(e.to_string()))?
    } else {
        serde_json::from_str(&content).map_err(|e| invalid(e.to_string()))?
    };

    parse_servers_document(document).map_err(invalid)
}

/// Parse an already-decoded configuration document.
///
/// Top-level shape errors fail the whole document; a bad entry is skipped.
pub fn parse_servers_document(document: Value) -> Result<ServersFile, String> {
    let Value::Object(mut root) = document else {
        return Err("top level must be an object".to_string());
    };

    let entries = match root.remove(SERVERS_KEY) {
        None | Some(Value::Null) => return Ok(ServersFile::default()),
        Some(Value::Object(entries)) => entries,
        Some(_) => return Err(format!("`{SERVERS_KEY}` must be an object")),
    };

    let mut parsed = ServersFile::default();
    for (name, entry) in entries {
        match parse_entry(&name, entry) {
            Ok(config) => {
                parsed.servers.insert(name, config);
            }
            Err(reason) => {
                tracing::warn!(server = %name, %reason, "Skipping invalid tool server entry");
                parsed.skipped.push(SkippedEntry { name, reason });
            }
        }
    }
    Ok(parsed)
}

fn parse_entry(name: &str, entry: Value) -> Result<ToolServerConfig, String> {
    if name.is_empty() {
        return Err("server name must not be empty".to_string());
    }
    if name.contains(NAMESPACE_SEPARATOR) {
        return Err(format!(
            "server name must not contain {NAMESPACE_SEPARATOR:?}"
        ));
    }

    let Value::Object(mut fields) = entry else {
        return Err("entry must be an object".to_string());
    };
    fields
        .entry("type")
        .or_insert_with(|| Value::String("stdio".to_string()));

    let config: ToolServerConfig =
        serde_json::from_value(Value::Object(fields)).map_err(|e| e.to_string())?;
    config.validate()?;
    Ok(config)
}
