//! Shared tracing/logging initialization.
//!
//! Every toolgate process sets up `tracing_subscriber` with an env-filter and
//! optional JSON output. Logs always go to stderr: the approval prompt server
//! speaks JSON-RPC on stdout and must keep it protocol-clean.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Initialise the global tracing subscriber.
///
/// * `default_filter` -- default `RUST_LOG` value when the env-var is not set
///   (e.g. `"toolgate_gateway=info"`).
/// * `log_json` -- when `true`, emit structured JSON log lines instead of the
///   human-readable format.
pub fn init_tracing(default_filter: &str, log_json: bool) {
    let env_filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| default_filter.into()),
    );
    if log_json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

/// Initialise tracing and, when `metrics_endpoint` is set, the OTLP metrics
/// pipeline. A pipeline that fails to build is logged and skipped.
#[cfg(feature = "metrics")]
pub fn init_tracing_with_metrics(
    default_filter: &str,
    log_json: bool,
    metrics_endpoint: Option<&str>,
) -> Option<crate::metrics::MetricsGuard> {
    init_tracing(default_filter, log_json);
    let endpoint = metrics_endpoint?;
    match crate::metrics::init_metrics(endpoint) {
        Ok(guard) => {
            tracing::info!(endpoint, "OpenTelemetry metrics exporter initialised");
            Some(guard)
        }
        Err(e) => {
            tracing::warn!(endpoint, error = %e, "Failed to initialise metrics exporter");
            None
        }
    }
}
