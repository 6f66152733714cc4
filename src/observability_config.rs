//! # Observability Configuration
//!
//! Environment-specific settings for logging, trace export and metrics.

use std::env;

/// Output format of the `fmt` layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
}

impl LogFormat {
    fn parse(value: &str) -> Self {
        if value.eq_ignore_ascii_case("pretty") {
            LogFormat::Pretty
        } else {
            LogFormat::Json
        }
    }
}

/// Observability configuration for different environments
#[derive(Debug, Clone)]
pub struct ObservabilityConfig {
    /// Environment name (development, staging, production)
    pub environment: String,
    pub service_name: String,
    /// OTLP endpoint for trace export; export is disabled when unset
    pub otlp_endpoint: Option<String>,
    /// Default level for this crate's targets
    pub log_level: String,
    pub log_format: LogFormat,
    pub enable_trace_sampling: bool,
    /// Trace sampling ratio (0.0-1.0)
    pub trace_sampling_ratio: f64,
    /// Whether to install the Prometheus recorder
    pub enable_metrics: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            environment: "development".to_string(),
            service_name: "omr-grader".to_string(),
            otlp_endpoint: None,
            log_level: "info".to_string(),
            log_format: LogFormat::Json,
            enable_trace_sampling: false,
            trace_sampling_ratio: 1.0,
            enable_metrics: true,
        }
    }
}

impl ObservabilityConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            environment: env::var("ENVIRONMENT").unwrap_or(defaults.environment),
            service_name: env::var("SERVICE_NAME").unwrap_or(defaults.service_name),
            otlp_endpoint: env::var("OTLP_ENDPOINT").ok().filter(|e| !e.is_empty()),
            log_level: env::var("OMR_LOG_LEVEL").unwrap_or(defaults.log_level),
            log_format: env::var("LOG_FORMAT")
                .map(|v| LogFormat::parse(&v))
                .unwrap_or(defaults.log_format),
            enable_trace_sampling: env::var("ENABLE_TRACE_SAMPLING")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.enable_trace_sampling),
            trace_sampling_ratio: env::var("TRACE_SAMPLING_RATIO")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.trace_sampling_ratio),
            enable_metrics: env::var("ENABLE_METRICS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.enable_metrics),
        }
    }

    pub fn is_production(&self) -> bool {
        self.environment == "production"
    }

    pub fn is_development(&self) -> bool {
        self.environment == "development"
    }

    /// Pretty output in development, otherwise whatever `log_format` says.
    pub fn use_pretty_logs(&self) -> bool {
        self.is_development() || self.log_format == LogFormat::Pretty
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if let Some(endpoint) = &self.otlp_endpoint {
            if !endpoint.starts_with("http://") && !endpoint.starts_with("https://") {
                return Err(format!("Invalid OTLP endpoint format: {}", endpoint));
            }
        }

        if !(0.0..=1.0).contains(&self.trace_sampling_ratio) {
            return Err(format!(
                "Invalid trace sampling ratio: {}",
                self.trace_sampling_ratio
            ));
        }

        if self.log_level.parse::<tracing::Level>().is_err() {
            return Err(format!("Invalid log level: {}", self.log_level));
        }

        if self.service_name.trim().is_empty() {
            return Err("Service name must not be empty".to_string());
        }

        Ok(())
    }
}

/// Environment-specific configuration presets
pub mod presets {
    use super::{LogFormat, ObservabilityConfig};

    pub fn development() -> ObservabilityConfig {
        ObservabilityConfig {
            environment: "development".to_string(),
            log_level: "debug".to_string(),
            log_format: LogFormat::Pretty,
            ..Default::default()
        }
    }

    /// Sampled traces, warnings only
    pub fn production() -> ObservabilityConfig {
        ObservabilityConfig {
            environment: "production".to_string(),
            enable_trace_sampling: true,
            trace_sampling_ratio: 0.1,
            log_level: "warn".to_string(),
            ..Default::default()
        }
    }

    /// One-off grading runs with no metrics recorder.
    pub fn batch() -> ObservabilityConfig {
        ObservabilityConfig {
            environment: "batch".to_string(),
            enable_metrics: false,
            ..Default::default()
        }
    }
}
