//! # OMR Grader
//!
//! Grades photographed multiple-choice answer sheets. A photo is registered
//! onto a blank template, the bubble grid is rediscovered from printed timing
//! marks, filled bubbles and code digits are decoded, and the result is scored
//! against the answer key of the decoded exam code.

pub mod analysis;
pub mod config;
pub mod errors;
pub mod grading;
pub mod grid;
pub mod image_io;
pub mod observability;
pub mod observability_config;
pub mod preprocessing;
pub mod processor;
pub mod results;
pub mod warp;

// Re-export types for easier access
pub use analysis::{AnswerAnalyzer, Answers, SheetReading};
pub use config::{AnalysisConfig, GraderConfig, ProcessorConfig, SheetLayout, WarpConfig};
pub use errors::{AppError, AppResult, GradingError};
pub use grading::{AnswerKey, ExamResult, GradedExam, GradingEngine, StudentRecord};
pub use grid::{CellExtractor, ExtractedCells};
pub use processor::{ExamProcessor, PipelineStage};
pub use results::{load_results, save_results, BatchReport, BatchSummary, ExamStatistics};
pub use warp::TemplateWarper;
