//! Observability setup for the grading engine.
//!
//! This module provides:
//! - Structured logging with configurable levels and formats
//! - Optional distributed tracing with OpenTelemetry
//! - Metrics collection with a Prometheus recorder
//!
//! Rendering or serving the Prometheus output is left to the caller.

pub mod metrics;
pub mod tracing_mod;

use anyhow::Result;
use metrics_exporter_prometheus::PrometheusHandle;

use crate::observability_config::ObservabilityConfig;

pub use tracing_mod::{batch_span, grading_span, stage_span};

/// Initialize the observability stack from the environment
pub fn init_observability() -> Result<Option<PrometheusHandle>> {
    init_observability_with_config(ObservabilityConfig::from_env())
}

/// Initialize the observability stack with custom configuration
///
/// Returns the Prometheus handle when metrics are enabled. Call from within a
/// Tokio runtime when an OTLP endpoint is configured.
pub fn init_observability_with_config(
    config: ObservabilityConfig,
) -> Result<Option<PrometheusHandle>> {
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid observability configuration: {}", e))?;

    tracing_mod::init_tracing_with_config(&config)?;
    let metrics_handle = metrics::init_metrics_with_config(&config)?;
    tracing_mod::init_opentelemetry_tracing_with_config(&config)?;

    tracing::info!(
        environment = %config.environment,
        service = %config.service_name,
        otlp_endpoint = ?config.otlp_endpoint,
        metrics_enabled = %config.enable_metrics,
        "Observability stack initialized successfully"
    );
    Ok(metrics_handle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_config_rejected_before_install() {
        let config = ObservabilityConfig {
            trace_sampling_ratio: 2.0,
            ..Default::default()
        };
        let err = init_observability_with_config(config).unwrap_err();
        assert!(err.to_string().contains("Invalid observability configuration"));
    }
}
