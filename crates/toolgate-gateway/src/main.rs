//! `toolgate`
//!
//! Runs the approval prompt server for an agent runtime, records human
//! decisions for pending approvals, and inspects or calls configured tool
//! servers.
//!
//! User-facing output uses writeln! to stdout; logs go to stderr.

use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::{info, warn};

use toolgate_core::GatewayConfig;
use toolgate_core::config::load_config;
use toolgate_core::jsonrpc::split_namespaced;
use toolgate_gateway::ToolInvoker;
use toolgate_gateway::permission::{
    ApprovalResolver, ApprovalServer, Behavior, GatewayOptions, LogRenderer, PermissionGateway,
    PromptRenderer, SessionIdentity, WebhookRenderer,
};
use toolgate_gateway::registry::{EnvTokenProvider, RegistryOptions, ServerRegistry};
use toolgate_gateway::stats::CallStatsTracker;
use toolgate_gateway::store::ApprovalStore;

/// Environment variable holding the source-control credential.
const CREDENTIAL_ENV: &str = "TOOLGATE_SOURCE_CONTROL_TOKEN";

#[derive(Parser, Debug)]
#[command(name = "toolgate")]
#[command(version, about = "Tool invocation gateway with human approval")]
struct Cli {
    /// Project directory whose `.toolgate/settings.json` is layered over the
    /// global settings.
    #[arg(long, global = true, env = "TOOLGATE_PROJECT_DIR")]
    project_dir: Option<PathBuf>,

    /// Approval store root (overrides settings).
    #[arg(long, global = true)]
    store_dir: Option<PathBuf>,

    /// Declarative tool server file (overrides settings).
    #[arg(long, global = true)]
    servers_config: Option<PathBuf>,

    /// Output logs as JSON.
    #[arg(long, global = true, env = "TOOLGATE_LOG_JSON")]
    log_json: bool,

    /// OpenTelemetry OTLP endpoint for metrics export
    /// (e.g. `http://localhost:4317`). Requires the `metrics` feature.
    #[cfg(feature = "metrics")]
    #[arg(long, global = true, env = "TOOLGATE_METRICS_ENDPOINT")]
    metrics_endpoint: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the approval prompt tool over stdin/stdout.
    PermissionServer {
        /// Chat user on whose behalf tools run.
        #[arg(long, env = "TOOLGATE_REQUESTING_USER")]
        requesting_user: String,

        /// Channel or thread the prompt belongs to.
        #[arg(long, env = "TOOLGATE_ORIGIN_CONTEXT", default_value = "")]
        origin_context: String,
    },
    /// Record a decision for a pending approval.
    Resolve {
        approval_id: String,

        /// User making the decision.
        #[arg(long, env = "TOOLGATE_ACTING_USER")]
        user: String,

        #[arg(long, conflicts_with = "deny", required_unless_present = "deny")]
        allow: bool,

        #[arg(long)]
        deny: bool,

        /// Reason shown to the agent on denial.
        #[arg(long)]
        message: Option<String>,

        /// Replacement tool input (JSON) to run instead of the original.
        #[arg(long)]
        updated_input: Option<String>,
    },
    /// List the effective tool servers.
    Servers {
        /// Also handshake with every server.
        #[arg(long)]
        check: bool,
    },
    /// Call a tool on a configured server.
    Call {
        /// Server name. When omitted, `--tool` must be namespaced as
        /// `server__tool`.
        #[arg(long)]
        server: Option<String>,

        #[arg(long)]
        tool: String,

        /// Tool arguments as a JSON object.
        #[arg(long, default_value = "{}")]
        params: String,

        /// Per-call timeout in seconds (defaults to settings).
        #[arg(long)]
        timeout: Option<u64>,
    },
    /// Show recorded call statistics.
    Stats,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Err means a provider is already installed.
    let _ = rustls::crypto::ring::default_provider().install_default();

    let mut config = load_config(cli.project_dir.as_deref())?;
    apply_cli_overrides(&mut config, &cli);

    let log_filter = format!(
        "toolgate={level},toolgate_gateway={level}",
        level = config.logging.level
    );
    let log_json = cli.log_json || config.logging.json;

    // Hold the guard so the OTel pipeline stays alive for the process lifetime.
    #[cfg(feature = "metrics")]
    let _metrics_guard = toolgate_core::tracing_init::init_tracing_with_metrics(
        &log_filter,
        log_json,
        cli.metrics_endpoint.as_deref(),
    );
    #[cfg(not(feature = "metrics"))]
    toolgate_core::tracing_init::init_tracing(&log_filter, log_json);

    match cli.command {
        Command::PermissionServer {
            requesting_user,
            origin_context,
        } => {
            permission_server(
                &config,
                SessionIdentity {
                    requesting_user,
                    origin_context,
                },
            )
            .await
        }
        Command::Resolve {
            approval_id,
            user,
            allow,
            deny: _,
            message,
            updated_input,
        } => resolve(&config, &approval_id, &user, allow, message, updated_input.as_deref()).await,
        Command::Servers { check } => servers(&config, check).await,
        Command::Call {
            server,
            tool,
            params,
            timeout,
        } => {
            let timeout = timeout.map_or_else(|| config.call_timeout(), Duration::from_secs);
            let (server, tool) = call_target(server.as_deref(), &tool)?;
            call(&config, server, tool, &params, timeout).await
        }
        Command::Stats => stats(&config).await,
    }
}

fn apply_cli_overrides(config: &mut GatewayConfig, cli: &Cli) {
    if let Some(dir) = &cli.store_dir {
        config.approvals.store_dir = Some(dir.clone());
    }
    if let Some(path) = &cli.servers_config {
        config.servers.config_path = Some(path.clone());
    }
}

async fn permission_server(config: &GatewayConfig, identity: SessionIdentity) -> anyhow::Result<()> {
    let store_dir = config.approval_store_dir();
    let renderer: Arc<dyn PromptRenderer> = match &config.approvals.render_webhook_url {
        Some(url) => Arc::new(WebhookRenderer::new(url)?),
        None => Arc::new(LogRenderer),
    };
    let gateway = Arc::new(PermissionGateway::new(
        ApprovalStore::new(&store_dir),
        renderer,
        GatewayOptions::from(&config.approvals),
    ));

    info!(
        version = env!("CARGO_PKG_VERSION"),
        store = %store_dir.display(),
        requesting_user = %identity.requesting_user,
        "Starting approval prompt server"
    );
    let server = Arc::new(ApprovalServer::new(gateway, identity));
    server.serve(tokio::io::stdin(), tokio::io::stdout()).await?;
    info!("Approval prompt server stopped");
    Ok(())
}

async fn resolve(
    config: &GatewayConfig,
    approval_id: &str,
    user: &str,
    allow: bool,
    message: Option<String>,
    updated_input: Option<&str>,
) -> anyhow::Result<()> {
    let updated_input = updated_input
        .map(serde_json::from_str::<serde_json::Value>)
        .transpose()
        .map_err(|e| anyhow::anyhow!("--updated-input is not valid JSON: {e}"))?;
    let behavior = if allow { Behavior::Allow } else { Behavior::Deny };

    let resolver = ApprovalResolver::new(ApprovalStore::new(config.approval_store_dir()));
    let mut out = io::stdout();
    match resolver
        .resolve(approval_id, user, behavior, updated_input, message)
        .await
    {
        Ok(resolution) => {
            writeln!(
                out,
                "{} {} (by {})",
                resolution.approval_id,
                resolution.behavior.as_str(),
                resolution.resolved_by
            )?;
            Ok(())
        }
        Err(e) => {
            warn!(approval_id, error = %e, "Resolution rejected");
            anyhow::bail!("{}", e.user_message())
        }
    }
}

/// `(server, tool)` from explicit flags or a namespaced tool name.
fn call_target<'a>(server: Option<&'a str>, tool: &'a str) -> anyhow::Result<(&'a str, &'a str)> {
    match server {
        Some(server) => Ok((server, tool)),
        None => split_namespaced(tool).ok_or_else(|| {
            anyhow::anyhow!("--tool {tool:?} is not namespaced as server__tool; pass --server")
        }),
    }
}

fn registry(config: &GatewayConfig) -> ServerRegistry {
    let options = RegistryOptions::from_config(&config.servers, config.servers_config_path());
    let registry = ServerRegistry::new(options);
    if std::env::var_os(CREDENTIAL_ENV).is_some() {
        registry.with_credential_provider(Arc::new(EnvTokenProvider::new(CREDENTIAL_ENV)))
    } else {
        registry
    }
}

async fn servers(config: &GatewayConfig, check: bool) -> anyhow::Result<()> {
    let registry = registry(config);
    let effective = registry.load().await?;
    let mut out = io::stdout();

    if effective.is_empty() {
        writeln!(out, "No tool servers configured")?;
    }
    for server in effective.servers() {
        let status = if check {
            match registry
                .check_connectivity(&server.name, config.call_timeout())
                .await
            {
                Ok(()) => "  reachable".to_string(),
                Err(e) => format!("  unreachable: {e}"),
            }
        } else {
            String::new()
        };
        writeln!(
            out,
            "{:<20} {:<6} {:?}{}{status}",
            server.name,
            server.config.transport_kind(),
            server.origin,
            if server.credential_injected {
                " (credentialed)"
            } else {
                ""
            },
        )?;
    }
    for skipped in effective.skipped() {
        writeln!(out, "skipped {}: {}", skipped.name, skipped.reason)?;
    }

    let prefixes: Vec<String> = effective.allowed_tool_prefixes().into_iter().collect();
    writeln!(out, "Allowed tool prefixes: {}", prefixes.join(", "))?;
    Ok(())
}

async fn call(
    config: &GatewayConfig,
    server: &str,
    tool: &str,
    params: &str,
    timeout: Duration,
) -> anyhow::Result<()> {
    let arguments: serde_json::Value = serde_json::from_str(params)
        .map_err(|e| anyhow::anyhow!("--params is not valid JSON: {e}"))?;
    let invoker = ToolInvoker::new(
        Arc::new(registry(config)),
        Arc::new(CallStatsTracker::load(config.stats_path()).await),
        config.call_timeout(),
    );

    let result = invoker.call_tool(server, tool, arguments, timeout).await;
    invoker.shutdown().await;
    match result {
        Ok(value) => {
            writeln!(io::stdout(), "{}", serde_json::to_string_pretty(&value)?)?;
            Ok(())
        }
        Err(e) => {
            warn!(server, tool, error = %e, "Tool call failed");
            anyhow::bail!("{}", e.user_message())
        }
    }
}

async fn stats(config: &GatewayConfig) -> anyhow::Result<()> {
    let tracker = CallStatsTracker::load(config.stats_path()).await;
    let entries = tracker.snapshot();

    let mut out = io::stdout();
    if entries.is_empty() {
        writeln!(out, "No calls recorded")?;
        return Ok(());
    }
    for entry in entries {
        let mean = entry
            .mean()
            .map_or_else(|| "unknown".to_string(), |mean| format!("{mean:?}"));
        writeln!(
            out,
            "{:<40} {:>6} calls  mean {mean}",
            format!("{}/{}", entry.server, entry.tool),
            entry.count,
        )?;
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn resolve_requires_a_decision() {
        let err = Cli::try_parse_from(["toolgate", "resolve", "a1", "--user", "U1"]);
        assert!(err.is_err());

        let cli =
            Cli::try_parse_from(["toolgate", "resolve", "a1", "--user", "U1", "--deny"]).unwrap();
        assert!(matches!(cli.command, Command::Resolve { allow: false, deny: true, .. }));
    }

    #[test]
    fn call_accepts_namespaced_tool_names() {
        assert_eq!(
            call_target(None, "github__create_issue").unwrap(),
            ("github", "create_issue")
        );
        assert_eq!(
            call_target(Some("fs"), "read__file").unwrap(),
            ("fs", "read__file")
        );
        assert!(call_target(None, "create_issue").is_err());
        assert!(call_target(None, "__create_issue").is_err());

        let cli = Cli::try_parse_from(["toolgate", "call", "--tool", "fs__read_file"]).unwrap();
        assert!(matches!(cli.command, Command::Call { server: None, .. }));
    }

    #[test]
    fn cli_overrides_win() {
        let cli = Cli::try_parse_from(["toolgate", "--store-dir", "/tmp/s", "stats"]).unwrap();
        let mut config = GatewayConfig::default();
        apply_cli_overrides(&mut config, &cli);
        assert_eq!(config.approval_store_dir(), PathBuf::from("/tmp/s"));
    }
}
