//! # Shared Types for Image Preprocessing
//!
//! This module contains the shared result and error types used across
//! the preprocessing sub-modules.

use image::GrayImage;

/// Errors that can occur during image preprocessing operations.
#[derive(Debug, Clone, PartialEq)]
pub enum PreprocessingError {
    /// A tuning parameter is outside its valid range
    InvalidParameter { name: &'static str, message: String },
    /// The input image has a zero dimension
    EmptyImage,
}

impl std::fmt::Display for PreprocessingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PreprocessingError::InvalidParameter { name, message } => {
                write!(f, "Invalid {}: {}", name, message)
            }
            PreprocessingError::EmptyImage => write!(f, "Image has zero width or height"),
        }
    }
}

impl std::error::Error for PreprocessingError {}

/// Result of median noise reduction.
#[derive(Debug, Clone)]
pub struct DenoisedImageResult {
    /// The denoised image
    pub image: GrayImage,
    /// Median filter radius (a radius of 1 is a 3x3 window)
    pub radius: u32,
    /// Processing time in milliseconds
    pub processing_time_ms: u32,
}

/// Result of CLAHE contrast enhancement.
#[derive(Debug, Clone)]
pub struct ClaheImageResult {
    /// The contrast-enhanced image
    pub image: GrayImage,
    /// Clip limit relative to a uniform histogram
    pub clip_limit: f32,
    /// Number of tiles (columns, rows)
    pub tile_grid: (u32, u32),
    /// Processing time in milliseconds
    pub processing_time_ms: u32,
}

/// Result of unsharp-mask sharpening.
#[derive(Debug, Clone)]
pub struct SharpenedImageResult {
    pub image: GrayImage,
    pub sigma: f32,
    pub amount: f32,
    pub processing_time_ms: u32,
}

/// How a binary image was produced.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ThresholdMethod {
    /// Global inverse threshold: pixels at or below the value become foreground
    FixedInverse(u8),
    /// Local mean minus an offset over a square window of the given radius
    AdaptiveMeanInverse { block_radius: u32, offset: i16 },
}

/// Result of a binarization step. Foreground is 255, background is 0.
#[derive(Debug, Clone)]
pub struct ThresholdedImageResult {
    /// The binary image
    pub image: GrayImage,
    /// Method and parameters that produced it
    pub method: ThresholdMethod,
    /// Number of foreground pixels
    pub foreground_pixels: u32,
    /// Processing time in milliseconds
    pub processing_time_ms: u32,
}

/// Result of morphological closing on a binary image.
#[derive(Debug, Clone)]
pub struct MorphologicalImageResult {
    pub image: GrayImage,
    /// Kernel size used (e.g., 3 for 3x3 kernel)
    pub kernel_size: u32,
    pub processing_time_ms: u32,
}
