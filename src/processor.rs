//! # Exam Processor
//!
//! Drives one photo through `Warp → Extract → Analyze → Grade` and fans the
//! pipeline out over a directory of photos.
//!
//! Every per-image failure, including a panic inside a stage, ends as a
//! failure-shaped [`ExamResult`]; a batch never aborts because of one image.
//! Only construction (template load) and the final batch write can fail with
//! an [`AppError`].

use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use image::GrayImage;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinError;
use tokio::time::error::Elapsed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};

use crate::analysis::AnswerAnalyzer;
use crate::config::GraderConfig;
use crate::errors::{error_logging, AppError, AppResult, GradingError};
use crate::grading::{ExamResult, FailedExam, GradedExam, GradingEngine};
use crate::grid::CellExtractor;
use crate::image_io::{decode_gray_image, image_name, load_gray_image};
use crate::observability::{self, metrics};
use crate::results::{save_results, BatchSummary, ExamStatistics, ScoreEvaluation};
use crate::warp::TemplateWarper;

/// Position of an image in the per-image state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipelineStage {
    Load,
    Warp,
    Extract,
    Analyze,
    Grade,
    Done,
    Failed,
}

impl PipelineStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineStage::Load => "load",
            PipelineStage::Warp => "warp",
            PipelineStage::Extract => "extract",
            PipelineStage::Analyze => "analyze",
            PipelineStage::Grade => "grade",
            PipelineStage::Done => "done",
            PipelineStage::Failed => "failed",
        }
    }
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A stage failure plus whatever the sheet had decoded by then.
struct StageFailure {
    stage: PipelineStage,
    error: GradingError,
    codes: Option<(String, String)>,
}

impl StageFailure {
    fn at(stage: PipelineStage) -> impl FnOnce(GradingError) -> Self {
        move |error| Self {
            stage,
            error,
            codes: None,
        }
    }
}

struct ProcessorInner {
    config: GraderConfig,
    warper: TemplateWarper,
    extractor: CellExtractor,
    analyzer: AnswerAnalyzer,
    engine: GradingEngine,
}

/// Cheap to clone; clones share the template, roster and answer keys.
#[derive(Clone)]
pub struct ExamProcessor {
    inner: Arc<ProcessorInner>,
}

impl ExamProcessor {
    /// Loads the template named by `config.processor.template_path`.
    ///
    /// A missing or unreadable template aborts construction.
    pub fn new(config: GraderConfig, engine: GradingEngine) -> AppResult<Self> {
        config.validate()?;
        let template_path = config.processor.template_path.clone();
        let template = load_gray_image(&template_path, &config.limits).map_err(|e| {
            error_logging::log_filesystem_error(
                &e,
                "load_template",
                template_path.to_str(),
                None,
            );
            AppError::Template(format!(
                "cannot load template {}: {}",
                template_path.display(),
                e
            ))
        })?;
        Self::from_template_image(template, config, engine)
    }

    /// Builds a processor around an already decoded template.
    pub fn from_template_image(
        template: GrayImage,
        config: GraderConfig,
        engine: GradingEngine,
    ) -> AppResult<Self> {
        config.validate()?;
        let start_time = Instant::now();
        let (width, height) = template.dimensions();
        let warper = TemplateWarper::new(template, &config.warp)
            .map_err(|e| AppError::Template(format!("cannot prepare template: {}", e)))?;

        info!(
            template_width = width,
            template_height = height,
            template_keypoints = warper.template().features().len(),
            students = engine.student_count(),
            answer_keys = engine.answer_key_count(),
            setup_ms = start_time.elapsed().as_millis() as u64,
            "Exam processor ready"
        );

        Ok(Self {
            inner: Arc::new(ProcessorInner {
                extractor: CellExtractor::new(config.layout.clone()),
                analyzer: AnswerAnalyzer::new(config.analysis.clone(), config.layout.clone()),
                warper,
                engine,
                config,
            }),
        })
    }

    pub fn config(&self) -> &GraderConfig {
        &self.inner.config
    }

    pub fn engine(&self) -> &GradingEngine {
        &self.inner.engine
    }

    pub fn warper(&self) -> &TemplateWarper {
        &self.inner.warper
    }

    /// Band of `score` under the configured evaluation thresholds.
    pub fn evaluate(&self, score: f64) -> ScoreEvaluation {
        ScoreEvaluation::from_score(score, &self.inner.config.evaluation)
    }

    /// Statistics of one exam code under the configured evaluation thresholds.
    pub fn exam_statistics(&self, results: &[ExamResult], exam_code: &str) -> Option<ExamStatistics> {
        ExamStatistics::for_exam_code(results, exam_code, &self.inner.config.evaluation)
    }

    /// Grades one decoded photo. Never panics and never returns an error.
    pub fn process_image(&self, photo: &GrayImage, image_name: &str) -> ExamResult {
        let span = observability::grading_span(image_name);
        let _enter = span.enter();
        let start_time = Instant::now();

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.run_stages(photo, image_name)))
            .unwrap_or_else(|payload| {
                Err(StageFailure {
                    stage: PipelineStage::Failed,
                    error: GradingError::Internal(panic_message(payload.as_ref())),
                    codes: None,
                })
            });

        self.finish(outcome, image_name, start_time)
    }

    /// Loads, validates and grades one photo file.
    pub fn process_file(&self, path: &Path) -> ExamResult {
        let name = image_name(path);
        let start_time = Instant::now();
        match load_gray_image(path, &self.inner.config.limits) {
            Ok(photo) => self.process_image(&photo, &name),
            Err(error) => self.finish(
                Err(StageFailure::at(PipelineStage::Load)(error)),
                &name,
                start_time,
            ),
        }
    }

    /// Grades a photo held in memory, e.g. an upload.
    pub fn process_bytes(&self, bytes: &[u8], image_name: &str) -> ExamResult {
        let start_time = Instant::now();
        match decode_gray_image(bytes, &self.inner.config.limits) {
            Ok(photo) => self.process_image(&photo, image_name),
            Err(error) => self.finish(
                Err(StageFailure::at(PipelineStage::Load)(error)),
                image_name,
                start_time,
            ),
        }
    }

    fn run_stages(&self, photo: &GrayImage, image_name: &str) -> Result<GradedExam, StageFailure> {
        let inner = &self.inner;

        let warped = timed(PipelineStage::Warp, || inner.warper.warp(photo))
            .map_err(StageFailure::at(PipelineStage::Warp))?;

        let cells = timed(PipelineStage::Extract, || inner.extractor.extract_all(&warped.image))
            .map_err(StageFailure::at(PipelineStage::Extract))?;

        let reading = timed(PipelineStage::Analyze, || {
            inner.analyzer.analyze(
                &cells.answer_cells,
                &cells.student_code_cells,
                &cells.exam_code_cells,
            )
        });

        timed(PipelineStage::Grade, || {
            inner.engine.try_grade(
                &reading.student_code,
                &reading.exam_code,
                &reading.answers,
                image_name,
            )
        })
        .map_err(|error| StageFailure {
            stage: PipelineStage::Grade,
            error,
            codes: Some((reading.student_code.clone(), reading.exam_code.clone())),
        })
    }

    /// Logs, records metrics and folds the outcome into a result record.
    fn finish(
        &self,
        outcome: Result<GradedExam, StageFailure>,
        image_name: &str,
        start_time: Instant,
    ) -> ExamResult {
        let elapsed = start_time.elapsed();
        match outcome {
            Ok(graded) => {
                metrics::record_image_outcome(true, elapsed);
                metrics::record_score(graded.score);
                info!(
                    stage = %PipelineStage::Done,
                    image_name = %image_name,
                    student_code = %graded.student_code,
                    exam_code = %graded.exam_code,
                    score = graded.score,
                    evaluation = %self.evaluate(graded.score),
                    duration_ms = elapsed.as_millis() as u64,
                    "Exam graded"
                );
                ExamResult::Success(graded)
            }
            Err(failure) => {
                metrics::record_image_outcome(false, elapsed);
                metrics::record_stage_failure(failure.stage.as_str(), failure.error.kind());
                error_logging::log_pipeline_error(
                    &failure.error,
                    failure.stage.as_str(),
                    image_name,
                    Some(elapsed),
                );

                let mut failed = FailedExam::from_error(&failure.error, image_name);
                if let Some((student_code, exam_code)) = &failure.codes {
                    failed = failed.with_codes(student_code, exam_code);
                }
                ExamResult::Failure(failed)
            }
        }
    }

    /// Grades every image in `dir` on a bounded worker pool.
    ///
    /// Results follow the sorted file order. A missing directory yields an
    /// empty batch. Once `cancel` fires no further image is started and the
    /// images already started are still collected.
    pub async fn process_directory(
        &self,
        dir: impl AsRef<Path>,
        cancel: &CancellationToken,
    ) -> AppResult<Vec<ExamResult>> {
        let dir = dir.as_ref();
        let span = observability::batch_span(&dir.display().to_string());
        self.run_batch(dir, cancel).instrument(span).await
    }

    async fn run_batch(&self, dir: &Path, cancel: &CancellationToken) -> AppResult<Vec<ExamResult>> {
        let start_time = Instant::now();

        if !dir.is_dir() {
            warn!(directory = %dir.display(), "Image directory not found, nothing to grade");
            return Ok(Vec::new());
        }

        let files = collect_image_files(dir, &self.inner.config.processor.extensions)?;
        let workers = self.inner.config.processor.worker_count();
        let timeout_secs = self.inner.config.processor.per_image_timeout_secs;
        info!(
            directory = %dir.display(),
            images = files.len(),
            workers,
            "Starting batch"
        );

        let semaphore = Arc::new(Semaphore::new(workers));
        let mut handles = Vec::with_capacity(files.len());

        for path in files {
            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    warn!(
                        started = handles.len(),
                        "Batch cancelled, no further images will be started"
                    );
                    break;
                }
                permit = semaphore.clone().acquire_owned() => permit
                    .map_err(|e| AppError::Internal(format!("worker pool closed: {}", e)))?,
            };

            let name = image_name(&path);
            let task_name = name.clone();
            let processor = self.clone();
            let task = async move {
                let deadline = Duration::from_secs(timeout_secs);
                match run_blocking_with_deadline(permit, deadline, move || processor.process_file(&path))
                    .await
                {
                    Ok(Ok(result)) => result,
                    Ok(Err(join_error)) => worker_failure(
                        GradingError::Internal(join_error.to_string()),
                        task_name,
                    ),
                    Err(_) => worker_failure(
                        GradingError::Timeout {
                            seconds: timeout_secs,
                        },
                        task_name,
                    ),
                }
            };
            handles.push((name, tokio::spawn(task.in_current_span())));
        }

        let mut results = Vec::with_capacity(handles.len());
        for (name, handle) in handles {
            let result = match handle.await {
                Ok(result) => result,
                Err(join_error) => {
                    worker_failure(GradingError::Internal(join_error.to_string()), name)
                }
            };
            results.push(result);
        }

        let successful = results.iter().filter(|r| r.is_success()).count();
        let failed = results.len() - successful;
        let elapsed = start_time.elapsed();
        metrics::record_batch(results.len(), successful, failed, elapsed);
        self.log_exam_statistics(&results);
        info!(
            directory = %dir.display(),
            total_images = results.len(),
            successful,
            failed,
            cancelled = cancel.is_cancelled(),
            duration_ms = elapsed.as_millis() as u64,
            "Batch finished"
        );
        Ok(results)
    }

    fn log_exam_statistics(&self, results: &[ExamResult]) {
        let exam_codes: BTreeSet<&str> = results
            .iter()
            .filter_map(ExamResult::as_success)
            .map(|g| g.exam_code.as_str())
            .collect();
        for exam_code in exam_codes {
            if let Some(stats) = self.exam_statistics(results, exam_code) {
                info!(
                    exam_code = %stats.exam_code,
                    students = stats.total_students,
                    average_score = stats.average_score,
                    overall = %stats.overall,
                    excellent = stats.bands.excellent,
                    good = stats.bands.good,
                    pass = stats.bands.pass,
                    fail = stats.bands.fail,
                    "Exam statistics"
                );
            }
        }
    }

    /// Grades a directory and writes the batch to `output`, or to the
    /// configured output path.
    pub async fn process_and_save(
        &self,
        dir: impl AsRef<Path>,
        output: Option<&Path>,
        cancel: &CancellationToken,
    ) -> AppResult<BatchSummary> {
        let results = self.process_directory(dir, cancel).await?;
        let output_path = output
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.inner.config.processor.output_path.clone());

        tokio::task::spawn_blocking(move || save_results(&results, &output_path))
            .await
            .map_err(|e| AppError::Internal(format!("result writer failed: {}", e)))?
    }
}

/// Runs `job` on the blocking pool, waiting at most `deadline` for it.
///
/// The permit moves into the job and is released when the job returns, so a
/// job that outlives its deadline still occupies its worker slot.
async fn run_blocking_with_deadline<T, F>(
    permit: OwnedSemaphorePermit,
    deadline: Duration,
    job: F,
) -> Result<Result<T, JoinError>, Elapsed>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    let worker = tokio::task::spawn_blocking(move || {
        let _permit = permit;
        job()
    });
    tokio::time::timeout(deadline, worker).await
}

/// Failure record for a worker that never returned its own result.
fn worker_failure(error: GradingError, image_name: String) -> ExamResult {
    metrics::record_stage_failure(PipelineStage::Failed.as_str(), error.kind());
    error_logging::log_pipeline_error(&error, PipelineStage::Failed.as_str(), &image_name, None);
    ExamResult::Failure(FailedExam::from_error(&error, image_name))
}

/// Runs one stage, recording its duration.
fn timed<T>(stage: PipelineStage, run: impl FnOnce() -> T) -> T {
    let span = observability::stage_span(stage.as_str());
    let _enter = span.enter();
    let start_time = Instant::now();
    let output = run();
    let elapsed = start_time.elapsed();
    metrics::record_stage_duration(stage.as_str(), elapsed);
    debug!(
        target: "omr_pipeline",
        "Stage {} finished in {}ms",
        stage,
        elapsed.as_millis()
    );
    output
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        format!("pipeline panicked: {}", msg)
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        format!("pipeline panicked: {}", msg)
    } else {
        "pipeline panicked".to_string()
    }
}

/// Image files directly inside `dir` whose extension is in `extensions`.
///
/// Names are compared case-insensitively, so `a.JPG` and `a.jpg` count once.
/// The result is sorted by lowercase file name.
pub fn collect_image_files(dir: &Path, extensions: &[String]) -> AppResult<Vec<PathBuf>> {
    let entries = std::fs::read_dir(dir).map_err(|e| {
        error_logging::log_filesystem_error(&e, "read_image_dir", dir.to_str(), None);
        AppError::FileSystem(format!("cannot read {}: {}", dir.display(), e))
    })?;
    Ok(select_image_files(
        dir,
        entries.map(|entry| entry.map(|e| e.path())),
        extensions,
    ))
}

/// Filters and orders listed paths. Entries the listing failed to read are
/// logged and skipped.
fn select_image_files(
    dir: &Path,
    entries: impl Iterator<Item = io::Result<PathBuf>>,
    extensions: &[String],
) -> Vec<PathBuf> {
    let mut seen = HashSet::new();
    let mut files: Vec<(String, PathBuf)> = Vec::new();
    for entry in entries {
        let path = match entry {
            Ok(path) => path,
            Err(e) => {
                warn!(directory = %dir.display(), error = %e, "Skipping unreadable directory entry");
                continue;
            }
        };
        if !path.is_file() {
            continue;
        }
        let accepted = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| extensions.iter().any(|e| e.eq_ignore_ascii_case(ext)));
        if !accepted {
            continue;
        }
        let Some(file_name) = path.file_name().map(|n| n.to_string_lossy().into_owned()) else {
            continue;
        };
        let key = file_name.to_lowercase();
        if seen.insert(key.clone()) {
            files.push((key, path));
        } else {
            debug!(path = %path.display(), "Skipping case-insensitive duplicate");
        }
    }

    files.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
    files.into_iter().map(|(_, path)| path).collect()
}
