//! # Application Error Types
//!
//! This module defines the error types used throughout the grading pipeline.
//! `GradingError` covers per-image failures, which are always converted into a
//! failure-shaped `ExamResult`. `AppError` covers startup and I/O failures that
//! abort construction or a batch write.

use std::fmt;

/// Per-image pipeline failures.
///
/// Every variant is local to one image. The processor turns it into a failure
/// record carrying `to_string()` as the error and `suggestion()` as the hint.
#[derive(Debug, Clone, PartialEq)]
pub enum GradingError {
    /// Too few reliable feature correspondences between template and photo
    Alignment { found: usize, required: usize, reason: String },
    /// Too few timing marks (or cells) after warping
    GridDetection(String),
    /// The decoded exam code has no answer key
    AnswerKeyNotFound { exam_code: String },
    /// The image could not be read or decoded
    ImageLoad(String),
    /// The per-image wall-clock guard fired
    Timeout { seconds: u64 },
    /// Anything unexpected, caught at the processor boundary
    Internal(String),
}

impl fmt::Display for GradingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GradingError::Alignment {
                found,
                required,
                reason,
            } => write!(
                f,
                "Failed to warp image: {} ({} reliable correspondences found, {} required)",
                reason, found, required
            ),
            GradingError::GridDetection(msg) => write!(f, "Failed to extract cells: {}", msg),
            GradingError::AnswerKeyNotFound { exam_code } => {
                write!(f, "Answer key not found for exam code: {}", exam_code)
            }
            GradingError::ImageLoad(msg) => write!(f, "Failed to load image: {}", msg),
            GradingError::Timeout { seconds } => {
                write!(f, "Image processing timed out after {}s", seconds)
            }
            GradingError::Internal(msg) => write!(f, "Unexpected error: {}", msg),
        }
    }
}

impl std::error::Error for GradingError {}

impl GradingError {
    /// Human-actionable hint stored next to the error in failure records.
    pub fn suggestion(&self) -> &'static str {
        match self {
            GradingError::Alignment { .. } => {
                "Image needs sufficient features matching the template. Re-capture the whole sheet flat and in focus."
            }
            GradingError::GridDetection(_) => {
                "Timing marks not detected. Ensure image is clear and not blurry."
            }
            GradingError::AnswerKeyNotFound { .. } => {
                "Check that the exam code bubbles are filled clearly and that an answer key exists for this exam code."
            }
            GradingError::ImageLoad(_) => "Ensure file exists and is a valid image format",
            GradingError::Timeout { .. } => {
                "Image took too long to process. Re-capture at a lower resolution or raise the per-image timeout."
            }
            GradingError::Internal(_) => "Check image quality or contact support",
        }
    }

    /// Short stable label for metrics and structured logs.
    pub fn kind(&self) -> &'static str {
        match self {
            GradingError::Alignment { .. } => "alignment",
            GradingError::GridDetection(_) => "grid_detection",
            GradingError::AnswerKeyNotFound { .. } => "answer_key_not_found",
            GradingError::ImageLoad(_) => "image_load",
            GradingError::Timeout { .. } => "timeout",
            GradingError::Internal(_) => "internal",
        }
    }
}

impl From<crate::preprocessing::PreprocessingError> for GradingError {
    fn from(err: crate::preprocessing::PreprocessingError) -> Self {
        GradingError::Internal(err.to_string())
    }
}

/// General application error type for startup and I/O failures
#[derive(Debug, Clone, PartialEq)]
pub enum AppError {
    /// Configuration validation errors
    Config(String),
    /// Template image could not be loaded
    Template(String),
    /// File system errors
    FileSystem(String),
    /// JSON encoding/decoding errors
    Serialization(String),
    /// Internal application errors
    Internal(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Config(msg) => write!(f, "[CONFIG] {}", msg),
            AppError::Template(msg) => write!(f, "[TEMPLATE] {}", msg),
            AppError::FileSystem(msg) => write!(f, "[FILESYSTEM] {}", msg),
            AppError::Serialization(msg) => write!(f, "[SERIALIZATION] {}", msg),
            AppError::Internal(msg) => write!(f, "[INTERNAL] {}", msg),
        }
    }
}

impl std::error::Error for AppError {}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::FileSystem(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::Serialization(err.to_string())
    }
}

/// Result type alias for convenience
pub type AppResult<T> = Result<T, AppError>;

/// Standardized error logging utilities for consistent error reporting
pub mod error_logging {
    use tracing::error;

    /// Log a per-image pipeline failure with stage and timing context
    pub fn log_pipeline_error(
        error: &super::GradingError,
        stage: &str,
        image_name: &str,
        processing_duration: Option<std::time::Duration>,
    ) {
        error!(
            error = %error,
            error_kind = %error.kind(),
            stage = %stage,
            image_name = %image_name,
            processing_duration_ms = ?processing_duration.map(|d| d.as_millis()),
            "Exam image grading failed"
        );
    }

    /// Log file system errors with path and operation context
    pub fn log_filesystem_error(
        error: &impl std::fmt::Display,
        operation: &str,
        path: Option<&str>,
        file_size: Option<u64>,
    ) {
        error!(
            error = %error,
            operation = %operation,
            path = ?path,
            file_size_bytes = ?file_size,
            "File system operation failed"
        );
    }

    /// Log configuration errors during startup/initialization
    pub fn log_config_error(error: &impl std::fmt::Display, config_key: &str, operation: &str) {
        error!(
            error = %error,
            config_key = %config_key,
            operation = %operation,
            "Configuration error"
        );
    }
}
