//! Metrics collection and Prometheus export.
//!
//! Recording functions are no-ops until a recorder is installed, so the
//! pipeline calls them unconditionally.

use std::time::Duration;

use anyhow::Result;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use crate::observability_config::ObservabilityConfig;

/// Installs the global Prometheus recorder.
pub fn init_metrics() -> Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    tracing::info!("Metrics collection initialized");
    Ok(handle)
}

/// Installs the recorder unless metrics are disabled.
pub fn init_metrics_with_config(config: &ObservabilityConfig) -> Result<Option<PrometheusHandle>> {
    if !config.enable_metrics {
        tracing::info!("Metrics collection disabled");
        return Ok(None);
    }
    init_metrics().map(Some)
}

/// Record feature matching and homography fitting for one warp
pub fn record_warp_metrics(matches: usize, inliers: usize, duration_ms: f64) {
    metrics::histogram!("omr_warp_feature_matches").record(matches as f64);
    metrics::histogram!("omr_warp_ransac_inliers").record(inliers as f64);
    metrics::histogram!("omr_warp_duration_seconds").record(duration_ms / 1000.0);

    if matches > 0 {
        metrics::histogram!("omr_warp_inlier_ratio").record(inliers as f64 / matches as f64);
    }
}

pub fn record_stage_duration(stage: &str, duration: Duration) {
    metrics::histogram!("omr_stage_duration_seconds", "stage" => stage.to_string())
        .record(duration.as_secs_f64());
}

/// Record a per-image failure, labelled by stage and error kind
pub fn record_stage_failure(stage: &str, kind: &str) {
    metrics::counter!(
        "omr_stage_failures_total",
        "stage" => stage.to_string(),
        "kind" => kind.to_string()
    )
    .increment(1);
}

/// Record the final outcome of one image
pub fn record_image_outcome(success: bool, duration: Duration) {
    metrics::counter!("omr_images_processed_total", "result" => if success { "success" } else { "failure" })
        .increment(1);
    metrics::histogram!("omr_image_duration_seconds").record(duration.as_secs_f64());
}

pub fn record_score(score: f64) {
    metrics::histogram!("omr_exam_score").record(score);
}

/// Record totals of a finished batch
pub fn record_batch(total: usize, successful: usize, failed: usize, duration: Duration) {
    metrics::counter!("omr_batches_total").increment(1);
    metrics::counter!("omr_batch_images_total", "result" => "success").increment(successful as u64);
    metrics::counter!("omr_batch_images_total", "result" => "failure").increment(failed as u64);
    metrics::histogram!("omr_batch_size").record(total as f64);
    metrics::histogram!("omr_batch_duration_seconds").record(duration.as_secs_f64());

    let throughput = if duration.as_secs_f64() > 0.0 {
        total as f64 / duration.as_secs_f64()
    } else {
        0.0
    };
    metrics::histogram!("omr_batch_throughput_images_per_sec").record(throughput);
}
