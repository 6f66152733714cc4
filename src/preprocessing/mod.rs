//! # Image Preprocessing Module
//!
//! Grayscale image operations shared by the warp, grid and analysis stages.
//!
//! The module is organized into focused sub-modules:
//! - `filtering`: median denoise, CLAHE, unsharp mask and morphological closing
//! - `thresholding`: fixed and adaptive inverse binarization
//! - `types`: Shared types and error definitions

pub mod filtering;
pub mod thresholding;
pub mod types;

// Re-export commonly used types and functions for convenience
pub use types::{
    ClaheImageResult, DenoisedImageResult, MorphologicalImageResult, PreprocessingError,
    SharpenedImageResult, ThresholdMethod, ThresholdedImageResult,
};

pub use filtering::{
    apply_clahe, apply_morphological_closing, enhance_for_matching, reduce_noise, sharpen,
};
pub use thresholding::{adaptive_threshold_inverse, binarize_inverse, count_dark_pixels};
