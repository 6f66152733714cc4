//! # Grid Discovery and Cell Extraction
//!
//! Rediscovers the bubble grid of a warped sheet from its printed timing marks
//! and crops the answer, student-code and exam-code cells.
//!
//! - `marks`: strip binarization and timing-mark detection
//! - `extractor`: grid mapping and cell cropping

pub mod extractor;
pub mod marks;

pub use extractor::{
    extract_answer_cells, extract_code_region_cells, map_cells_to_grid, Cell, CellExtractor,
    ExtractedCells,
};
pub use marks::{detect_grid_marks, detect_timing_marks, GridMarks, MarkAxis};
