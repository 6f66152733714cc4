//! Tracing and logging setup.
//!
//! Structured logging through `tracing-subscriber`, optional OTLP trace
//! export, and span helpers for the grading pipeline.

use anyhow::{anyhow, Result};
use opentelemetry::global;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::trace::Sampler;
use tracing_subscriber::prelude::*;

use crate::observability_config::ObservabilityConfig;

/// Builds the env filter: `RUST_LOG` first, then this crate's level.
fn build_filter(config: &ObservabilityConfig) -> Result<tracing_subscriber::EnvFilter> {
    let mut filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive(format!("omr_grader={}", config.log_level).parse()?)
        .add_directive(format!("omr_pipeline={}", config.log_level).parse()?);

    if let Ok(obs_log) = std::env::var("OBSERVABILITY_LOG_LEVEL") {
        filter = filter.add_directive(format!("omr_grader::observability={}", obs_log).parse()?);
    }
    Ok(filter)
}

/// Installs the global subscriber. Fails if one is already installed.
pub fn init_tracing_with_config(config: &ObservabilityConfig) -> Result<()> {
    let filter = build_filter(config)?;

    let installed = if config.use_pretty_logs() {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .pretty()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_thread_names(false),
            )
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_thread_names(true),
            )
            .try_init()
    };
    installed.map_err(|e| anyhow!("Failed to install tracing subscriber: {}", e))?;

    tracing::info!(
        environment = %config.environment,
        log_level = %config.log_level,
        pretty = config.use_pretty_logs(),
        "Tracing initialized with structured logging"
    );
    Ok(())
}

/// Sets the global OTLP tracer provider when an endpoint is configured.
///
/// The gRPC exporter needs a running Tokio runtime when an endpoint is set.
pub fn init_opentelemetry_tracing_with_config(config: &ObservabilityConfig) -> Result<()> {
    let Some(endpoint) = &config.otlp_endpoint else {
        tracing::info!("OpenTelemetry tracing disabled (no OTLP endpoint configured)");
        return Ok(());
    };

    let otlp_exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint.clone())
        .build()?;

    let sampler = if config.enable_trace_sampling {
        Sampler::TraceIdRatioBased(config.trace_sampling_ratio)
    } else {
        Sampler::AlwaysOn
    };

    let tracer_provider = opentelemetry_sdk::trace::SdkTracerProvider::builder()
        .with_batch_exporter(otlp_exporter)
        .with_sampler(sampler)
        .build();

    global::set_tracer_provider(tracer_provider);

    tracing::info!(
        otlp_endpoint = %endpoint,
        trace_sampling_enabled = %config.enable_trace_sampling,
        trace_sampling_ratio = %config.trace_sampling_ratio,
        "OpenTelemetry tracing initialized with OTLP export"
    );
    Ok(())
}

/// Span covering the full pipeline of one image
pub fn grading_span(image_name: &str) -> tracing::Span {
    tracing::info_span!("grade_image", image_name = image_name, component = "omr_pipeline")
}

/// Span covering one batch directory
pub fn batch_span(directory: &str) -> tracing::Span {
    tracing::info_span!("grade_batch", directory = directory, component = "omr_batch")
}

pub fn stage_span(stage: &str) -> tracing::Span {
    tracing::debug_span!("pipeline_stage", stage = stage)
}
