//! Configuration resolution for toolgate.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults
//! 2. Global config (~/.config/toolgate/settings.json)
//! 3. Project config (.toolgate/settings.json)
//! 4. Environment variables (`TOOLGATE_*`)
//! 5. CLI arguments (highest priority, applied by the binary)

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};

/// Complete toolgate configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct GatewayConfig {
    #[serde(default)]
    pub approvals: ApprovalConfig,
    #[serde(default)]
    pub servers: ServersConfig,
    #[serde(default)]
    pub stats: StatsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Human-approval workflow configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApprovalConfig {
    /// How long a pending approval stays resolvable (seconds).
    pub window_secs: u64,
    /// First poll delay while waiting for a resolution (milliseconds).
    pub poll_initial_ms: u64,
    /// Upper bound for the poll backoff (milliseconds).
    pub poll_max_ms: u64,
    /// Root of the shared approval store. Defaults to `<data_dir>/approvals`.
    pub store_dir: Option<PathBuf>,
    /// Optional URL that receives prompt render requests as JSON.
    pub render_webhook_url: Option<String>,
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self {
            window_secs: 5 * 60,
            poll_initial_ms: 250,
            poll_max_ms: 2_000,
            store_dir: None,
            render_webhook_url: None,
        }
    }
}

/// Tool server registry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServersConfig {
    /// Declarative server file. Defaults to `<config_dir>/servers.json`.
    pub config_path: Option<PathBuf>,
    /// When set, a filesystem server scoped to this directory is synthesized.
    pub filesystem_root: Option<PathBuf>,
    /// Default per-call timeout for tool server requests (seconds).
    pub call_timeout_secs: u64,
    /// Servers that receive a freshly fetched credential at load time.
    pub credentialed_servers: Vec<String>,
    /// Endpoint of the synthesized source-control server.
    pub source_control_url: String,
    /// Environment variable used to hand the credential to stdio servers.
    pub token_env: String,
}

impl Default for ServersConfig {
    fn default() -> Self {
        Self {
            config_path: None,
            filesystem_root: None,
            call_timeout_secs: 30,
            credentialed_servers: vec!["github".to_string()],
            source_control_url: "https://api.githubcopilot.com/mcp/".to_string(),
            token_env: "GITHUB_PERSONAL_ACCESS_TOKEN".to_string(),
        }
    }
}

/// Call statistics configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct StatsConfig {
    /// Persistence file. Defaults to `<data_dir>/call-stats.json`.
    pub path: Option<PathBuf>,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl ApprovalConfig {
    /// How long a pending approval stays resolvable.
    pub const fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

impl GatewayConfig {
    pub const fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.servers.call_timeout_secs)
    }

    /// Resolved approval store root.
    pub fn approval_store_dir(&self) -> PathBuf {
        self.approvals
            .store_dir
            .clone()
            .unwrap_or_else(|| data_dir().join("approvals"))
    }

    /// Resolved call statistics file.
    pub fn stats_path(&self) -> PathBuf {
        self.stats
            .path
            .clone()
            .unwrap_or_else(|| data_dir().join("call-stats.json"))
    }

    /// Resolved declarative server file.
    pub fn servers_config_path(&self) -> PathBuf {
        self.servers
            .config_path
            .clone()
            .unwrap_or_else(|| config_dir().join("servers.json"))
    }
}

/// Load configuration with hierarchical resolution.
pub fn load_config(project_dir: Option<&Path>) -> Result<GatewayConfig> {
    let mut config = load_config_from(global_config_path().as_deref(), project_dir)?;
    apply_env_overrides(&mut config, |key| std::env::var(key).ok());
    Ok(config)
}

/// Load from an explicit global settings path and optional project directory,
/// without consulting the environment.
///
/// Layers are deep-merged as JSON before deserialising, so a project file
/// that sets one field leaves the global value of every other field intact.
pub fn load_config_from(
    global_path: Option<&Path>,
    project_dir: Option<&Path>,
) -> Result<GatewayConfig> {
    let mut merged = serde_json::Value::Object(serde_json::Map::new());

    if let Some(global_path) = global_path {
        if global_path.exists() {
            deep_merge(&mut merged, &load_config_file(global_path)?);
        }
    }

    if let Some(dir) = project_dir {
        let project_path = dir.join(".toolgate").join("settings.json");
        if project_path.exists() {
            deep_merge(&mut merged, &load_config_file(&project_path)?);
        }
    }

    serde_json::from_value(merged)
        .map_err(|e| Error::Config(format!("Invalid configuration: {e}")))
}

/// Per-user configuration directory (`~/.config/toolgate` on Linux).
pub fn config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("toolgate")
}

/// Per-user data directory (`~/.local/share/toolgate` on Linux).
pub fn data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("toolgate")
}

/// Get the global settings file path.
pub fn global_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("toolgate").join("settings.json"))
}

fn load_config_file(path: &Path) -> Result<serde_json::Value> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    serde_json::from_str(&content).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })
}

/// Recursively merge `overlay` into `base`. Objects merge per key; scalars
/// and arrays from the overlay replace the base value.
fn deep_merge(base: &mut serde_json::Value, overlay: &serde_json::Value) {
    match (base, overlay) {
        (serde_json::Value::Object(base_map), serde_json::Value::Object(overlay_map)) => {
            for (key, overlay_val) in overlay_map {
                if let Some(base_val) = base_map.get_mut(key) {
                    deep_merge(base_val, overlay_val);
                } else {
                    base_map.insert(key.clone(), overlay_val.clone());
                }
            }
        }
        (base, overlay) => {
            *base = overlay.clone();
        }
    }
}

/// Apply `TOOLGATE_*` overrides using `lookup` to read variables.
pub fn apply_env_overrides(config: &mut GatewayConfig, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(n) = lookup("TOOLGATE_APPROVAL_WINDOW_SECS").and_then(|v| v.parse().ok()) {
        config.approvals.window_secs = n;
    }
    if let Some(dir) = lookup("TOOLGATE_STORE_DIR") {
        config.approvals.store_dir = Some(PathBuf::from(dir));
    }
    if let Some(url) = lookup("TOOLGATE_RENDER_WEBHOOK_URL") {
        config.approvals.render_webhook_url = Some(url);
    }
    if let Some(path) = lookup("TOOLGATE_SERVERS_CONFIG") {
        config.servers.config_path = Some(PathBuf::from(path));
    }
    if let Some(root) = lookup("TOOLGATE_FILESYSTEM_ROOT") {
        config.servers.filesystem_root = Some(PathBuf::from(root));
    }
    if let Some(n) = lookup("TOOLGATE_CALL_TIMEOUT_SECS").and_then(|v| v.parse().ok()) {
        config.servers.call_timeout_secs = n;
    }
    if let Some(path) = lookup("TOOLGATE_STATS_PATH") {
        config.stats.path = Some(PathBuf::from(path));
    }
    if let Some(level) = lookup("TOOLGATE_LOG_LEVEL") {
        config.logging.level = level;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    #[test]
    fn default_config_has_five_minute_window() {
        let config = GatewayConfig::default();
        assert_eq!(config.approvals.window(), Duration::from_secs(300));
        assert_eq!(config.call_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn project_config_overrides_global() {
        let dir = TempDir::new().unwrap();
        let global = dir.path().join("global.json");
        std::fs::write(
            &global,
            r#"{"approvals": {"window_secs": 120, "poll_max_ms": 900}, "servers": {"filesystem_root": "/srv"}}"#,
        )
        .unwrap();
        let project = dir.path().join("proj");
        std::fs::create_dir_all(project.join(".toolgate")).unwrap();
        std::fs::write(
            project.join(".toolgate").join("settings.json"),
            r#"{"approvals": {"window_secs": 60}}"#,
        )
        .unwrap();

        let config = load_config_from(Some(&global), Some(&project)).unwrap();
        assert_eq!(config.approvals.window_secs, 60);
        assert_eq!(config.approvals.poll_max_ms, 900);
        assert_eq!(config.servers.filesystem_root, Some(PathBuf::from("/srv")));
    }

    #[test]
    fn malformed_settings_file_is_config_error() {
        let dir = TempDir::new().unwrap();
        let global = dir.path().join("global.json");
        std::fs::write(&global, "{not json").unwrap();
        let err = load_config_from(Some(&global), None).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn env_overrides_apply() {
        let vars: HashMap<&str, &str> = [
            ("TOOLGATE_APPROVAL_WINDOW_SECS", "30"),
            ("TOOLGATE_STORE_DIR", "/tmp/approvals"),
            ("TOOLGATE_CALL_TIMEOUT_SECS", "not-a-number"),
        ]
        .into_iter()
        .collect();
        let mut config = GatewayConfig::default();
        apply_env_overrides(&mut config, |k| vars.get(k).map(ToString::to_string));

        assert_eq!(config.approvals.window_secs, 30);
        assert_eq!(config.approval_store_dir(), PathBuf::from("/tmp/approvals"));
        assert_eq!(config.servers.call_timeout_secs, 30);
    }
}
