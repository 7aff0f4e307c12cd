//! Shared `OpenTelemetry` metrics.
//!
//! This module is only compiled when the `metrics` Cargo feature is enabled.
//! It sets up the OTLP metrics exporter and exposes the handful of
//! instruments toolgate records: tool-call latency and approval outcomes.

use std::sync::OnceLock;
use std::time::Duration;

use opentelemetry::KeyValue;
use opentelemetry::global;
use opentelemetry::metrics::{Counter, Histogram};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::metrics::SdkMeterProvider;

/// Errors that can occur during metrics pipeline initialisation.
#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    /// Failed to build an OTLP exporter.
    #[error("failed to build OTLP exporter: {0}")]
    ExporterBuild(#[from] opentelemetry_otlp::ExporterBuildError),

    /// Failed during `OTel` SDK shutdown or flush.
    #[error("OpenTelemetry SDK error: {0}")]
    Sdk(#[from] opentelemetry_sdk::error::OTelSdkError),
}

/// Keeps the meter provider alive. Call [`MetricsGuard::shutdown`] before
/// exiting to flush buffered measurements.
pub struct MetricsGuard {
    meter_provider: SdkMeterProvider,
}

impl MetricsGuard {
    pub fn shutdown(self) -> Result<(), MetricsError> {
        self.meter_provider.shutdown()?;
        Ok(())
    }
}

/// Initialise the OTLP metrics pipeline.
///
/// * `endpoint` -- OTLP receiver URL, e.g. `"http://localhost:4317"` (gRPC).
pub fn init_metrics(endpoint: &str) -> Result<MetricsGuard, MetricsError> {
    let metric_exporter = opentelemetry_otlp::MetricExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()?;

    let meter_provider = SdkMeterProvider::builder()
        .with_periodic_exporter(metric_exporter)
        .build();

    global::set_meter_provider(meter_provider.clone());

    Ok(MetricsGuard { meter_provider })
}

struct Instruments {
    tool_call_duration: Histogram<f64>,
    approvals: Counter<u64>,
}

fn instruments() -> &'static Instruments {
    static INSTRUMENTS: OnceLock<Instruments> = OnceLock::new();
    INSTRUMENTS.get_or_init(|| {
        let meter = global::meter("toolgate");
        Instruments {
            tool_call_duration: meter
                .f64_histogram("toolgate.tool_call.duration")
                .with_unit("ms")
                .with_description("Wall-clock duration of tool server calls")
                .build(),
            approvals: meter
                .u64_counter("toolgate.approvals")
                .with_description("Approval requests by outcome")
                .build(),
        }
    })
}

/// Record one completed tool call.
pub fn record_tool_call(server: &str, tool: &str, duration: Duration) {
    instruments().tool_call_duration.record(
        duration.as_secs_f64() * 1000.0,
        &[
            KeyValue::new("server", server.to_string()),
            KeyValue::new("tool", tool.to_string()),
        ],
    );
}

/// Record the terminal state of one approval (`allowed`, `denied`, `expired`).
pub fn record_approval(outcome: &'static str) {
    instruments()
        .approvals
        .add(1, &[KeyValue::new("outcome", outcome)]);
}
