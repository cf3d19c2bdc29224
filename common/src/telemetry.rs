// Telemetry module for structured logging, metrics, and tracing

use crate::config::ObservabilityConfig;
use anyhow::Result;
use metrics::{counter, describe_counter, describe_histogram, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{
    trace::{RandomIdGenerator, Sampler, TracerProvider},
    Resource,
};
use std::net::SocketAddr;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Initialize structured logging with JSON formatting and trace context
///
/// This function sets up the tracing subscriber with:
/// - JSON formatting for structured logs
/// - Trace context (trace_id, span_id) in all log entries
/// - Log levels from configuration or environment
/// - Optional OpenTelemetry integration
#[tracing::instrument(skip_all)]
pub fn init_logging(log_level: &str, tracing_endpoint: Option<&str>) -> Result<()> {
    // Create environment filter from log level
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .map_err(|e| anyhow::anyhow!("Failed to create env filter: {}", e))?;

    // Create JSON formatting layer with trace context
    let json_layer = fmt::layer()
        .json()
        .with_current_span(true)
        .with_span_list(true)
        .with_target(true)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_file(true)
        .with_line_number(true)
        .with_filter(env_filter);

    // Initialize the subscriber with optional OpenTelemetry layer
    let registry = tracing_subscriber::registry().with(json_layer);

    if let Some(endpoint) = tracing_endpoint {
        // Initialize OpenTelemetry if endpoint is provided
        let tracer = init_tracer(endpoint)?;
        let telemetry_layer = tracing_opentelemetry::layer().with_tracer(tracer);
        registry
            .with(telemetry_layer)
            .try_init()
            .map_err(|e| anyhow::anyhow!("Failed to initialize tracing subscriber: {}", e))?;
    } else {
        registry
            .try_init()
            .map_err(|e| anyhow::anyhow!("Failed to initialize tracing subscriber: {}", e))?;
    }

    tracing::info!(
        log_level = log_level,
        tracing_endpoint = tracing_endpoint,
        "Structured logging initialized with JSON formatting"
    );

    Ok(())
}

/// Initialize OpenTelemetry tracer with OTLP exporter
///
/// This function sets up OpenTelemetry tracing with:
/// - OTLP exporter to send traces to a collector (e.g., Jaeger)
/// - Service name and version as resource attributes
/// - Random ID generator for trace and span IDs
/// - Always-on sampler for all traces
#[tracing::instrument(skip_all)]
fn init_tracer(endpoint: &str) -> Result<opentelemetry_sdk::trace::Tracer> {
    use opentelemetry_sdk::runtime::Tokio;

    // Create OTLP exporter
    let exporter = opentelemetry_otlp::new_exporter()
        .tonic()
        .with_endpoint(endpoint)
        .build_span_exporter()
        .map_err(|e| anyhow::anyhow!("Failed to build span exporter: {}", e))?;

    // Create tracer provider with resource attributes
    let tracer_provider = TracerProvider::builder()
        .with_batch_exporter(exporter, Tokio)
        .with_config(
            opentelemetry_sdk::trace::Config::default()
                .with_sampler(Sampler::AlwaysOn)
                .with_id_generator(RandomIdGenerator::default())
                .with_resource(Resource::new(vec![
                    KeyValue::new("service.name", "azdsdr"),
                    KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
                ])),
        )
        .build();

    // Set global tracer provider
    global::set_tracer_provider(tracer_provider.clone());

    // Get tracer
    let tracer = tracer_provider.tracer("azdsdr");

    tracing::info!(
        endpoint = endpoint,
        "OpenTelemetry tracer initialized with OTLP exporter"
    );

    Ok(tracer)
}

/// Shutdown OpenTelemetry tracer provider
///
/// This should be called on graceful shutdown to flush remaining spans
pub fn shutdown_tracer() {
    global::shutdown_tracer_provider();
}

/// Initialize logging and, when a port is configured, the metrics exporter
pub fn init(config: &ObservabilityConfig) -> Result<()> {
    init_logging(&config.log_level, config.tracing_endpoint.as_deref())?;
    if let Some(port) = config.metrics_port {
        init_metrics(port)?;
    }
    Ok(())
}

/// Initialize Prometheus metrics exporter
///
/// Registers the pipeline metrics:
/// - pipeline_runs_total: Counter of pipeline runs by flow and status
/// - pipeline_duration_seconds: Histogram of end-to-end pipeline duration
/// - poll_attempts_total: Counter of status checks by poll target
/// - cleanup_failures_total: Counter of failed cleanup steps by artifact kind
#[tracing::instrument(skip_all)]
pub fn init_metrics(metrics_port: u16) -> Result<()> {
    let addr: SocketAddr = format!("0.0.0.0:{}", metrics_port)
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid metrics port: {}", e))?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| anyhow::anyhow!("Failed to install Prometheus exporter: {}", e))?;

    describe_counter!("pipeline_runs_total", "Total number of pipeline runs");
    describe_histogram!(
        "pipeline_duration_seconds",
        "Duration of pipeline runs in seconds"
    );
    describe_counter!(
        "poll_attempts_total",
        "Total number of status checks against external services"
    );
    describe_counter!(
        "cleanup_failures_total",
        "Total number of cleanup steps that failed"
    );

    tracing::info!(
        metrics_port = metrics_port,
        metrics_endpoint = format!("http://0.0.0.0:{}/metrics", metrics_port),
        "Prometheus metrics exporter initialized"
    );

    Ok(())
}

/// Record a finished pipeline run
#[inline]
pub fn record_pipeline_run(flow: &str, status: &str, duration_seconds: f64) {
    counter!(
        "pipeline_runs_total",
        "flow" => flow.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
    histogram!("pipeline_duration_seconds", "flow" => flow.to_string()).record(duration_seconds);
}

/// Record one status check
#[inline]
pub fn record_poll_attempt(target: &str) {
    counter!("poll_attempts_total", "target" => target.to_string()).increment(1);
}

/// Record a failed cleanup step
///
/// Only the artifact kind is used as a label; file names are unbounded.
#[inline]
pub fn record_cleanup_failure(artifact: &str) {
    let kind = artifact.split(':').next().unwrap_or("unknown");
    counter!("cleanup_failures_total", "artifact" => kind.to_string()).increment(1);
}
