//! # Batch Results
//!
//! Persistence of batch outcomes and the read-side helpers built on them:
//! score bands and per-exam statistics for reporting collaborators.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::config::EvaluationThresholds;
use crate::errors::{error_logging, AppError, AppResult};
use crate::grading::{round_to_cents, ExamResult};

/// Persisted form of a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchReport {
    pub total_images: usize,
    pub successful: usize,
    pub failed: usize,
    pub results: Vec<ExamResult>,
}

impl BatchReport {
    pub fn new(results: Vec<ExamResult>) -> Self {
        let successful = results.iter().filter(|r| r.is_success()).count();
        Self {
            total_images: results.len(),
            successful,
            failed: results.len() - successful,
            results,
        }
    }

    pub fn summary(&self, output_path: impl Into<PathBuf>) -> BatchSummary {
        BatchSummary {
            total_images: self.total_images,
            successful: self.successful,
            failed: self.failed,
            output_path: output_path.into(),
        }
    }
}

/// Counts of a persisted batch and where it was written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub total_images: usize,
    pub successful: usize,
    pub failed: usize,
    pub output_path: PathBuf,
}

/// Writes `results` as pretty JSON and returns the summary.
pub fn save_results(results: &[ExamResult], output_path: impl AsRef<Path>) -> AppResult<BatchSummary> {
    let output_path = output_path.as_ref();
    let report = BatchReport::new(results.to_vec());
    let json = serde_json::to_string_pretty(&report)?;

    if let Some(parent) = output_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| {
            error_logging::log_filesystem_error(&e, "create_output_dir", parent.to_str(), None);
            AppError::FileSystem(format!("cannot create {}: {}", parent.display(), e))
        })?;
    }
    std::fs::write(output_path, json.as_bytes()).map_err(|e| {
        error_logging::log_filesystem_error(
            &e,
            "write_results",
            output_path.to_str(),
            Some(json.len() as u64),
        );
        AppError::FileSystem(format!("cannot write {}: {}", output_path.display(), e))
    })?;

    tracing::info!(
        total_images = report.total_images,
        successful = report.successful,
        failed = report.failed,
        output_path = %output_path.display(),
        "Saved batch results"
    );
    Ok(report.summary(output_path))
}

/// Reads a batch file written by [`save_results`].
pub fn load_report(input_path: impl AsRef<Path>) -> AppResult<BatchReport> {
    let input_path = input_path.as_ref();
    let raw = std::fs::read_to_string(input_path).map_err(|e| {
        error_logging::log_filesystem_error(&e, "read_results", input_path.to_str(), None);
        AppError::FileSystem(format!("cannot read {}: {}", input_path.display(), e))
    })?;
    Ok(serde_json::from_str(&raw)?)
}

/// Only the result records of a batch file.
pub fn load_results(input_path: impl AsRef<Path>) -> AppResult<Vec<ExamResult>> {
    Ok(load_report(input_path)?.results)
}

/// Score band on the 10-point scale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScoreEvaluation {
    Excellent,
    Good,
    Pass,
    Fail,
}

impl ScoreEvaluation {
    pub fn from_score(score: f64, thresholds: &EvaluationThresholds) -> Self {
        if score >= thresholds.excellent {
            ScoreEvaluation::Excellent
        } else if score >= thresholds.good {
            ScoreEvaluation::Good
        } else if score >= thresholds.pass {
            ScoreEvaluation::Pass
        } else {
            ScoreEvaluation::Fail
        }
    }
}

impl std::fmt::Display for ScoreEvaluation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            ScoreEvaluation::Excellent => "Excellent",
            ScoreEvaluation::Good => "Good",
            ScoreEvaluation::Pass => "Pass",
            ScoreEvaluation::Fail => "Fail",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BandCounts {
    pub excellent: usize,
    pub good: usize,
    pub pass: usize,
    pub fail: usize,
}

/// Aggregate over the successful results of one exam code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExamStatistics {
    pub exam_code: String,
    pub total_students: usize,
    pub average_score: f64,
    pub max_score: f64,
    pub min_score: f64,
    pub bands: BandCounts,
    /// Band of the average score
    pub overall: ScoreEvaluation,
}

impl ExamStatistics {
    /// Returns `None` when no successful result carries `exam_code`.
    pub fn for_exam_code(
        results: &[ExamResult],
        exam_code: &str,
        thresholds: &EvaluationThresholds,
    ) -> Option<Self> {
        let scores: Vec<f64> = results
            .iter()
            .filter_map(ExamResult::as_success)
            .filter(|g| g.exam_code == exam_code)
            .map(|g| g.score)
            .collect();
        if scores.is_empty() {
            return None;
        }

        let mut bands = BandCounts::default();
        for &score in &scores {
            match ScoreEvaluation::from_score(score, thresholds) {
                ScoreEvaluation::Excellent => bands.excellent += 1,
                ScoreEvaluation::Good => bands.good += 1,
                ScoreEvaluation::Pass => bands.pass += 1,
                ScoreEvaluation::Fail => bands.fail += 1,
            }
        }

        let average = scores.iter().sum::<f64>() / scores.len() as f64;
        let average_score = round_to_cents(average);
        Some(Self {
            exam_code: exam_code.to_string(),
            total_students: scores.len(),
            average_score,
            max_score: scores.iter().copied().fold(f64::MIN, f64::max),
            min_score: scores.iter().copied().fold(f64::MAX, f64::min),
            bands,
            overall: ScoreEvaluation::from_score(average_score, thresholds),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::GradingError;
    use crate::grading::{FailedExam, GradedExam};

    fn graded(image: &str, exam_code: &str, score: f64) -> ExamResult {
        ExamResult::Success(GradedExam {
            student_id: None,
            name: None,
            email: None,
            student_code: "000001".to_string(),
            exam_code: exam_code.to_string(),
            total_questions: 10,
            correct: score as u32,
            wrong: 10 - score as u32,
            blank: 0,
            score,
            image_name: image.to_string(),
            details: Vec::new(),
        })
    }

    #[test]
    fn test_save_then_load_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir should be created");
        let path = dir.path().join("out").join("final_result.json");
        let results = vec![
            graded("a", "101", 9.0),
            ExamResult::Failure(FailedExam::from_error(
                &GradingError::GridDetection("3 rows".to_string()),
                "b",
            )),
        ];

        let summary = save_results(&results, &path).expect("save should succeed");
        assert_eq!((summary.total_images, summary.successful, summary.failed), (2, 1, 1));
        assert_eq!(summary.output_path, path);

        let loaded = load_results(&path).expect("load should succeed");
        assert_eq!(loaded, results);
    }

    #[test]
    fn test_load_missing_file_is_filesystem_error() {
        let dir = tempfile::tempdir().expect("tempdir should be created");
        let err = load_report(dir.path().join("missing.json")).unwrap_err();
        assert!(matches!(err, AppError::FileSystem(_)));
    }

    #[test]
    fn test_score_bands() {
        let t = EvaluationThresholds::default();
        assert_eq!(ScoreEvaluation::from_score(8.5, &t), ScoreEvaluation::Excellent);
        assert_eq!(ScoreEvaluation::from_score(8.49, &t), ScoreEvaluation::Good);
        assert_eq!(ScoreEvaluation::from_score(5.0, &t), ScoreEvaluation::Pass);
        assert_eq!(ScoreEvaluation::from_score(4.99, &t), ScoreEvaluation::Fail);
    }

    #[test]
    fn test_statistics_for_exam_code() {
        let results = vec![
            graded("a", "101", 9.0),
            graded("b", "101", 6.0),
            graded("c", "101", 3.0),
            graded("d", "202", 10.0),
            ExamResult::failure(&GradingError::Timeout { seconds: 5 }, "e"),
        ];

        let stats = ExamStatistics::for_exam_code(&results, "101", &EvaluationThresholds::default())
            .expect("exam 101 has results");
        assert_eq!(stats.total_students, 3);
        assert_eq!(stats.average_score, 6.0);
        assert_eq!(stats.max_score, 9.0);
        assert_eq!(stats.min_score, 3.0);
        assert_eq!(
            stats.bands,
            BandCounts {
                excellent: 1,
                good: 0,
                pass: 1,
                fail: 1
            }
        );
        assert_eq!(stats.overall, ScoreEvaluation::Pass);

        assert!(
            ExamStatistics::for_exam_code(&results, "303", &EvaluationThresholds::default())
                .is_none()
        );
    }
}
