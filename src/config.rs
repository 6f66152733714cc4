//! # Unified Grader Configuration
//!
//! This module consolidates every tunable of the grading pipeline into a single
//! structured configuration object. Defaults describe the 120-question sheet the
//! grader was built for; other sheet designs are supplied as data through
//! [`GraderConfig::from_json_file`]. Paths and the main thresholds can also be
//! overridden from environment variables.

use crate::errors::{error_logging, AppError, AppResult};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};

/// Feature matching and homography settings for template registration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WarpConfig {
    /// Maximum number of keypoints kept per image across all pyramid levels
    pub max_features: usize,
    /// Number of pyramid levels used for scale invariance
    pub pyramid_levels: usize,
    /// Downscale factor between consecutive pyramid levels
    pub pyramid_scale: f32,
    /// FAST intensity threshold for corner detection
    pub fast_threshold: u8,
    /// Non-maximum suppression radius in pixels
    pub nms_radius: u32,
    /// Nearest / second-nearest ratio above which a match is rejected
    pub ratio_threshold: f32,
    /// Absolute Hamming distance above which a match is rejected
    pub max_descriptor_distance: u32,
    /// Median filter radius of the denoise step
    pub denoise_radius: u32,
    /// CLAHE clip limit of the contrast step
    pub clahe_clip_limit: f32,
    /// CLAHE tile grid (columns, rows)
    pub clahe_tile_grid: (u32, u32),
    /// Gaussian sigma of the unsharp mask
    pub sharpen_sigma: f32,
    /// Unsharp mask amount (`I + amount * (I - blur(I))`)
    pub sharpen_amount: f32,
    /// RANSAC iteration cap
    pub ransac_max_iters: usize,
    /// RANSAC inlier reprojection threshold in pixels
    pub ransac_threshold: f64,
    /// Minimum RANSAC inliers for an accepted homography
    pub ransac_min_inliers: usize,
    /// Seed for RANSAC sampling, fixed so grading is reproducible
    pub ransac_seed: u64,
}

impl Default for WarpConfig {
    fn default() -> Self {
        Self {
            max_features: 5000,
            pyramid_levels: 4,
            pyramid_scale: 1.2,
            fast_threshold: 20,
            nms_radius: 3,
            ratio_threshold: 0.75,
            max_descriptor_distance: 80,
            denoise_radius: 1,
            clahe_clip_limit: 2.0,
            clahe_tile_grid: (8, 8),
            sharpen_sigma: 0.8,
            sharpen_amount: 0.5,
            ransac_max_iters: 2000,
            ransac_threshold: 5.0,
            ransac_min_inliers: 6,
            ransac_seed: 0,
        }
    }
}

impl WarpConfig {
    /// Validate warp configuration
    pub fn validate(&self) -> AppResult<()> {
        if self.max_features < 4 {
            return Err(AppError::Config(
                "max_features must be at least 4".to_string(),
            ));
        }
        if self.pyramid_levels == 0 {
            return Err(AppError::Config(
                "pyramid_levels must be greater than 0".to_string(),
            ));
        }
        if self.pyramid_scale <= 1.0 {
            return Err(AppError::Config(format!(
                "pyramid_scale must be greater than 1.0, got {}",
                self.pyramid_scale
            )));
        }
        if !(0.0..=1.0).contains(&self.ratio_threshold) || self.ratio_threshold == 0.0 {
            return Err(AppError::Config(format!(
                "ratio_threshold must be in (0, 1], got {}",
                self.ratio_threshold
            )));
        }
        if self.clahe_clip_limit <= 0.0 {
            return Err(AppError::Config(
                "clahe_clip_limit must be greater than 0".to_string(),
            ));
        }
        if self.clahe_tile_grid.0 == 0 || self.clahe_tile_grid.1 == 0 {
            return Err(AppError::Config(
                "clahe_tile_grid dimensions must be greater than 0".to_string(),
            ));
        }
        if self.sharpen_sigma <= 0.0 {
            return Err(AppError::Config(
                "sharpen_sigma must be greater than 0".to_string(),
            ));
        }
        if self.ransac_max_iters == 0 {
            return Err(AppError::Config(
                "ransac_max_iters must be greater than 0".to_string(),
            ));
        }
        if self.ransac_threshold <= 0.0 {
            return Err(AppError::Config(
                "ransac_threshold must be greater than 0".to_string(),
            ));
        }
        if self.ransac_min_inliers < 4 {
            return Err(AppError::Config(
                "ransac_min_inliers must be at least 4".to_string(),
            ));
        }
        Ok(())
    }
}

/// Timing-mark detection parameters for one strip
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MarkDetectionConfig {
    /// Minimum bounding-box area of a mark in pixels
    pub min_area: u32,
    /// Maximum bounding-box area of a mark in pixels
    pub max_area: u32,
    /// Marks closer than this along the strip axis are collapsed
    pub min_distance: u32,
    /// Accepted width/height range
    pub aspect_ratio_range: (f32, f32),
    /// Components touching this margin across the strip axis are rejected
    pub edge_margin: u32,
    /// Radius of the local-mean window of the adaptive threshold
    pub adaptive_block_radius: u32,
    /// Constant subtracted from the local mean
    pub adaptive_offset: i16,
    /// Gaussian sigma applied before thresholding
    pub blur_sigma: f32,
    /// Apply CLAHE to the strip before thresholding
    pub enhance: bool,
}

impl Default for MarkDetectionConfig {
    fn default() -> Self {
        Self {
            min_area: 150,
            max_area: 8000,
            min_distance: 10,
            aspect_ratio_range: (0.2, 6.0),
            edge_margin: 3,
            adaptive_block_radius: 5,
            adaptive_offset: 2,
            blur_sigma: 0.8,
            enhance: true,
        }
    }
}

/// A bubble column block holding one digit per column (student or exam code)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CodeRegion {
    /// Left edge of the region in template pixels
    pub x: u32,
    /// Total width of the region in template pixels
    pub width: u32,
    /// Number of digit columns
    pub columns: usize,
}

/// Physical layout of one answer-sheet design
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SheetLayout {
    /// Half-size of an answer cell crop (cells are `2 * cell_size` square)
    pub cell_size: u32,
    /// Answer grid rows taken from the row marks
    pub n_rows: usize,
    /// Answer grid columns taken from the column marks
    pub n_cols: usize,
    /// Fail fast below this many row marks
    pub min_row_marks: usize,
    /// Fail fast below this many column marks
    pub min_col_marks: usize,
    /// Right strip width as a fraction of image width
    pub right_strip_ratio: f32,
    /// Bottom strip height as a fraction of image height
    pub bottom_strip_ratio: f32,
    pub marks: MarkDetectionConfig,
    pub student_code: CodeRegion,
    pub exam_code: CodeRegion,
    /// Height of a code cell crop
    pub code_row_height: u32,
    /// First row mark used for digit 0
    pub code_row_start: usize,
    /// Row mark after the digit 9 row (exclusive)
    pub code_row_end: usize,
    /// Number of questions on the sheet
    pub num_questions: usize,
    /// Questions stacked vertically per block
    pub questions_per_block: usize,
    /// Grid row of the first question in every block
    pub first_answer_row: usize,
    /// Grid column of option A of the first block
    pub first_answer_col: usize,
    /// Option labels in column order
    pub option_labels: Vec<String>,
}

impl Default for SheetLayout {
    fn default() -> Self {
        Self {
            cell_size: 15,
            n_rows: 42,
            n_cols: 18,
            min_row_marks: 30,
            min_col_marks: 15,
            right_strip_ratio: 0.05,
            bottom_strip_ratio: 0.05,
            marks: MarkDetectionConfig::default(),
            student_code: CodeRegion {
                x: 892,
                width: 145,
                columns: 6,
            },
            exam_code: CodeRegion {
                x: 1080,
                width: 72,
                columns: 3,
            },
            code_row_height: 35,
            code_row_start: 1,
            code_row_end: 11,
            num_questions: 120,
            questions_per_block: 30,
            first_answer_row: 11,
            first_answer_col: 1,
            option_labels: ["A", "B", "C", "D"].iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl SheetLayout {
    /// Number of candidate digit rows in each code column
    pub fn code_rows(&self) -> usize {
        self.code_row_end.saturating_sub(self.code_row_start)
    }

    /// Number of question blocks laid out side by side
    pub fn blocks(&self) -> usize {
        if self.questions_per_block == 0 {
            return 0;
        }
        self.num_questions.div_ceil(self.questions_per_block)
    }

    /// Validate sheet layout consistency
    pub fn validate(&self) -> AppResult<()> {
        if self.cell_size == 0 {
            return Err(AppError::Config("cell_size cannot be 0".to_string()));
        }
        if self.n_rows == 0 || self.n_cols == 0 {
            return Err(AppError::Config(
                "answer grid dimensions must be greater than 0".to_string(),
            ));
        }
        for (name, ratio) in [
            ("right_strip_ratio", self.right_strip_ratio),
            ("bottom_strip_ratio", self.bottom_strip_ratio),
        ] {
            if !(ratio > 0.0 && ratio < 1.0) {
                return Err(AppError::Config(format!(
                    "{} must be in (0, 1), got {}",
                    name, ratio
                )));
            }
        }
        if self.marks.min_area > self.marks.max_area {
            return Err(AppError::Config(format!(
                "mark min_area ({}) cannot exceed max_area ({})",
                self.marks.min_area, self.marks.max_area
            )));
        }
        if !(self.marks.blur_sigma > 0.0) {
            return Err(AppError::Config(format!(
                "mark blur_sigma must be positive, got {}",
                self.marks.blur_sigma
            )));
        }
        if self.marks.adaptive_block_radius == 0 {
            return Err(AppError::Config(
                "mark adaptive_block_radius must be greater than 0".to_string(),
            ));
        }
        if self.marks.aspect_ratio_range.0 > self.marks.aspect_ratio_range.1 {
            return Err(AppError::Config(
                "mark aspect_ratio_range is inverted".to_string(),
            ));
        }
        if self.code_rows() != 10 {
            return Err(AppError::Config(format!(
                "code regions need exactly 10 digit rows, layout has {}",
                self.code_rows()
            )));
        }
        for (name, region) in [("student_code", &self.student_code), ("exam_code", &self.exam_code)] {
            if region.columns == 0 || region.width == 0 {
                return Err(AppError::Config(format!(
                    "{} region must have columns and width",
                    name
                )));
            }
        }
        if self.option_labels.is_empty() {
            return Err(AppError::Config("option_labels cannot be empty".to_string()));
        }
        if self.questions_per_block == 0 {
            return Err(AppError::Config(
                "questions_per_block cannot be 0".to_string(),
            ));
        }
        if self.first_answer_row + self.questions_per_block > self.n_rows {
            return Err(AppError::Config(format!(
                "question blocks need rows {}..{} but the grid has {} rows",
                self.first_answer_row,
                self.first_answer_row + self.questions_per_block,
                self.n_rows
            )));
        }
        let last_col = self.first_answer_col + self.blocks() * self.option_labels.len();
        if last_col > self.n_cols {
            return Err(AppError::Config(format!(
                "question blocks need columns {}..{} but the grid has {} columns",
                self.first_answer_col, last_col, self.n_cols
            )));
        }
        Ok(())
    }
}

/// Fill detection thresholds used by the answer analyzer
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AnalysisConfig {
    /// A bubble is filled when its foreground count exceeds this
    pub pixel_threshold: u32,
    /// Inverse binarization threshold for answer bubbles
    pub bin_threshold: u8,
    /// Inverse binarization threshold for code cells
    pub code_bin_threshold: u8,
    /// A code column whose best row has at most this many foreground pixels is unknown
    pub code_empty_pixels: u32,
    /// Character emitted for an unknown code digit
    pub unknown_digit: char,
    /// CLAHE clip limit used on code cells
    pub code_clahe_clip_limit: f32,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            pixel_threshold: 100,
            bin_threshold: 128,
            code_bin_threshold: 100,
            code_empty_pixels: 5,
            unknown_digit: '?',
            code_clahe_clip_limit: 2.0,
        }
    }
}

/// Score evaluation thresholds on the 10-point scale
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EvaluationThresholds {
    pub excellent: f64,
    pub good: f64,
    pub pass: f64,
}

impl Default for EvaluationThresholds {
    fn default() -> Self {
        Self {
            excellent: 8.5,
            good: 7.0,
            pass: 5.0,
        }
    }
}

/// Format-specific file size limits for exam photos
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ImageLimits {
    /// General limit when the format cannot be detected
    pub max_file_size: u64,
    pub png_max: u64,
    pub jpeg_max: u64,
    pub bmp_max: u64,
    pub tiff_max: u64,
}

impl Default for ImageLimits {
    fn default() -> Self {
        Self {
            max_file_size: 20 * 1024 * 1024, // 20MB
            png_max: 30 * 1024 * 1024,       // 30MB for PNG
            jpeg_max: 20 * 1024 * 1024,      // 20MB for JPEG
            bmp_max: 60 * 1024 * 1024,       // 60MB for uncompressed BMP
            tiff_max: 60 * 1024 * 1024,      // 60MB for TIFF
        }
    }
}

/// Batch orchestration settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ProcessorConfig {
    /// Blank reference sheet
    pub template_path: PathBuf,
    /// Default destination of `process_and_save`
    pub output_path: PathBuf,
    /// Worker pool size; 0 means one worker per available core
    pub max_workers: usize,
    /// Wall-clock guard per image in seconds
    pub per_image_timeout_secs: u64,
    /// Accepted image extensions, compared case-insensitively
    pub extensions: Vec<String>,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            template_path: PathBuf::from("template.jpg"),
            output_path: PathBuf::from("final_result.json"),
            max_workers: 0,
            per_image_timeout_secs: 60,
            extensions: ["jpg", "jpeg", "png"].iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl ProcessorConfig {
    /// Resolved worker count
    pub fn worker_count(&self) -> usize {
        if self.max_workers > 0 {
            return self.max_workers;
        }
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }

    /// Validate processor configuration
    pub fn validate(&self) -> AppResult<()> {
        if self.per_image_timeout_secs == 0 {
            return Err(AppError::Config(
                "per_image_timeout_secs must be greater than 0".to_string(),
            ));
        }
        if self.extensions.is_empty() {
            return Err(AppError::Config(
                "at least one image extension is required".to_string(),
            ));
        }
        Ok(())
    }
}

/// Main grader configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GraderConfig {
    pub warp: WarpConfig,
    pub layout: SheetLayout,
    pub analysis: AnalysisConfig,
    pub evaluation: EvaluationThresholds,
    pub limits: ImageLimits,
    pub processor: ProcessorConfig,
}

impl GraderConfig {
    /// Load configuration from environment variables on top of the defaults
    pub fn from_env() -> AppResult<Self> {
        let mut config = Self::default();

        if let Ok(path) = env::var("OMR_TEMPLATE_PATH") {
            config.processor.template_path = PathBuf::from(path);
        }
        if let Ok(path) = env::var("OMR_OUTPUT_PATH") {
            config.processor.output_path = PathBuf::from(path);
        }
        config.processor.max_workers = parse_env("OMR_MAX_WORKERS", config.processor.max_workers)?;
        config.processor.per_image_timeout_secs = parse_env(
            "OMR_PER_IMAGE_TIMEOUT_SECS",
            config.processor.per_image_timeout_secs,
        )?;
        config.analysis.pixel_threshold =
            parse_env("OMR_PIXEL_THRESHOLD", config.analysis.pixel_threshold)?;
        config.analysis.bin_threshold =
            parse_env("OMR_BIN_THRESHOLD", config.analysis.bin_threshold)?;
        config.warp.max_features = parse_env("OMR_MAX_FEATURES", config.warp.max_features)?;
        config.warp.ratio_threshold =
            parse_env("OMR_RATIO_THRESHOLD", config.warp.ratio_threshold)?;

        config
            .validate()
            .inspect_err(|e| error_logging::log_config_error(e, "environment", "from_env"))?;
        Ok(config)
    }

    /// Load a full configuration (typically a different sheet layout) from JSON
    pub fn from_json_file(path: impl AsRef<Path>) -> AppResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            AppError::Config(format!("cannot read config file {}: {}", path.display(), e))
        })?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate every section
    pub fn validate(&self) -> AppResult<()> {
        self.warp.validate()?;
        self.layout.validate()?;
        self.processor.validate()?;

        let eval = &self.evaluation;
        if !(eval.pass <= eval.good && eval.good <= eval.excellent) {
            return Err(AppError::Config(format!(
                "evaluation thresholds must be ordered pass <= good <= excellent, got {} / {} / {}",
                eval.pass, eval.good, eval.excellent
            )));
        }
        Ok(())
    }
}

fn parse_env<T>(key: &str, default: T) -> AppResult<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw.trim().parse().map_err(|e| {
            error_logging::log_config_error(&e, key, "from_env");
            AppError::Config(format!("invalid value for {}: {}", key, e))
        }),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = GraderConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.layout.n_rows, 42);
        assert_eq!(config.layout.n_cols, 18);
        assert_eq!(config.layout.code_rows(), 10);
        assert_eq!(config.layout.blocks(), 4);
    }

    #[test]
    fn test_layout_rejects_blocks_outside_grid() {
        let layout = SheetLayout {
            first_answer_row: 20,
            ..Default::default()
        };
        assert!(matches!(layout.validate(), Err(AppError::Config(_))));

        let layout = SheetLayout {
            num_questions: 160,
            ..Default::default()
        };
        assert!(layout.validate().is_err());
    }

    #[test]
    fn test_layout_rejects_degenerate_mark_filters() {
        for sigma in [0.0, -1.0, f32::NAN] {
            let mut layout = SheetLayout::default();
            layout.marks.blur_sigma = sigma;
            assert!(matches!(layout.validate(), Err(AppError::Config(_))), "sigma {sigma}");
        }

        let mut layout = SheetLayout::default();
        layout.marks.adaptive_block_radius = 0;
        assert!(matches!(layout.validate(), Err(AppError::Config(_))));
    }

    /// Serializes tests that touch process environment variables.
    static ENV_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

    const ENV_KEYS: [&str; 8] = [
        "OMR_TEMPLATE_PATH",
        "OMR_OUTPUT_PATH",
        "OMR_MAX_WORKERS",
        "OMR_PER_IMAGE_TIMEOUT_SECS",
        "OMR_PIXEL_THRESHOLD",
        "OMR_BIN_THRESHOLD",
        "OMR_MAX_FEATURES",
        "OMR_RATIO_THRESHOLD",
    ];

    fn clear_env() {
        for key in ENV_KEYS {
            env::remove_var(key);
        }
    }

    #[test]
    fn test_from_env_defaults_and_overrides() {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        clear_env();

        assert_eq!(GraderConfig::from_env().unwrap(), GraderConfig::default());

        env::set_var("OMR_TEMPLATE_PATH", "/srv/omr/blank.png");
        env::set_var("OMR_OUTPUT_PATH", "/srv/omr/out.json");
        env::set_var("OMR_MAX_WORKERS", " 6 ");
        env::set_var("OMR_PER_IMAGE_TIMEOUT_SECS", "45");
        env::set_var("OMR_PIXEL_THRESHOLD", "90");
        env::set_var("OMR_BIN_THRESHOLD", "110");
        env::set_var("OMR_MAX_FEATURES", "2500");
        env::set_var("OMR_RATIO_THRESHOLD", "0.7");
        let config = GraderConfig::from_env();
        clear_env();

        let config = config.unwrap();
        assert_eq!(config.processor.template_path, PathBuf::from("/srv/omr/blank.png"));
        assert_eq!(config.processor.output_path, PathBuf::from("/srv/omr/out.json"));
        assert_eq!(config.processor.max_workers, 6);
        assert_eq!(config.processor.per_image_timeout_secs, 45);
        assert_eq!(config.analysis.pixel_threshold, 90);
        assert_eq!(config.analysis.bin_threshold, 110);
        assert_eq!(config.warp.max_features, 2500);
        assert_eq!(config.warp.ratio_threshold, 0.7);
        assert_eq!(config.layout, SheetLayout::default());
    }

    #[test]
    fn test_from_env_rejects_bad_values() {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        clear_env();

        env::set_var("OMR_MAX_WORKERS", "many");
        let unparsable = GraderConfig::from_env();
        clear_env();
        env::set_var("OMR_RATIO_THRESHOLD", "1.5");
        let out_of_range = GraderConfig::from_env();
        clear_env();

        assert!(matches!(unparsable, Err(AppError::Config(msg)) if msg.contains("OMR_MAX_WORKERS")));
        assert!(matches!(out_of_range, Err(AppError::Config(_))));
    }

    #[test]
    fn test_warp_config_validation() {
        let config = WarpConfig {
            ratio_threshold: 1.5,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = WarpConfig {
            pyramid_scale: 1.0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_json_round_trip_with_partial_override() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("layout.json");
        std::fs::write(
            &path,
            r#"{"layout": {"num_questions": 60, "questions_per_block": 30}, "analysis": {"pixel_threshold": 80}}"#,
        )
        .unwrap();

        let config = GraderConfig::from_json_file(&path).unwrap();
        assert_eq!(config.layout.num_questions, 60);
        assert_eq!(config.layout.blocks(), 2);
        assert_eq!(config.analysis.pixel_threshold, 80);
        assert_eq!(config.analysis.bin_threshold, 128);
        assert_eq!(config.layout.n_rows, 42);
    }

    #[test]
    fn test_worker_count_resolves() {
        let config = ProcessorConfig::default();
        assert!(config.worker_count() >= 1);

        let config = ProcessorConfig {
            max_workers: 3,
            ..Default::default()
        };
        assert_eq!(config.worker_count(), 3);
    }
}
