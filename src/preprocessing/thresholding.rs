//! # Image Thresholding Module
//!
//! Inverse binarization used throughout the grid and analysis stages. Ink is
//! dark on paper, so every function here marks dark pixels as foreground (255)
//! and paper as background (0).

use image::{GrayImage, Luma};
use imageproc::filter::box_filter;

use super::types::{PreprocessingError, ThresholdMethod, ThresholdedImageResult};

/// Global inverse threshold: pixels `<= threshold` become foreground.
///
/// # Examples
///
/// ```
/// use image::{GrayImage, Luma};
/// use omr_grader::preprocessing::binarize_inverse;
///
/// let mut cell = GrayImage::from_pixel(4, 4, Luma([255]));
/// cell.put_pixel(1, 1, Luma([20]));
/// let binary = binarize_inverse(&cell, 128);
/// assert_eq!(binary.foreground_pixels, 1);
/// ```
pub fn binarize_inverse(image: &GrayImage, threshold: u8) -> ThresholdedImageResult {
    let start_time = std::time::Instant::now();

    let mut foreground = 0u32;
    let binary = GrayImage::from_fn(image.width(), image.height(), |x, y| {
        if image.get_pixel(x, y)[0] <= threshold {
            foreground += 1;
            Luma([255])
        } else {
            Luma([0])
        }
    });

    ThresholdedImageResult {
        image: binary,
        method: ThresholdMethod::FixedInverse(threshold),
        foreground_pixels: foreground,
        processing_time_ms: start_time.elapsed().as_millis() as u32,
    }
}

/// Counts pixels at or below `threshold` without materializing a binary image.
pub fn count_dark_pixels(image: &GrayImage, threshold: u8) -> u32 {
    image.pixels().filter(|p| p[0] <= threshold).count() as u32
}

/// Adaptive inverse threshold against the local mean.
///
/// A pixel is foreground when it is darker than the mean of its
/// `(2 * block_radius + 1)` square neighbourhood minus `offset`. This isolates
/// small dark dots such as timing marks under uneven lighting.
///
/// # Arguments
///
/// * `image` - The grayscale input image
/// * `block_radius` - Window radius; 5 gives an 11x11 block
/// * `offset` - Constant subtracted from the local mean
pub fn adaptive_threshold_inverse(
    image: &GrayImage,
    block_radius: u32,
    offset: i16,
) -> Result<ThresholdedImageResult, PreprocessingError> {
    let start_time = std::time::Instant::now();

    if image.width() == 0 || image.height() == 0 {
        return Err(PreprocessingError::EmptyImage);
    }
    if block_radius == 0 {
        return Err(PreprocessingError::InvalidParameter {
            name: "block radius",
            message: "must be greater than 0".to_string(),
        });
    }

    let mean = box_filter(image, block_radius, block_radius);
    let mut foreground = 0u32;
    let binary = GrayImage::from_fn(image.width(), image.height(), |x, y| {
        let local = mean.get_pixel(x, y)[0] as i16 - offset;
        if (image.get_pixel(x, y)[0] as i16) <= local {
            foreground += 1;
            Luma([255])
        } else {
            Luma([0])
        }
    });

    let processing_time = start_time.elapsed();

    tracing::debug!(
        target: "omr_pipeline",
        "Adaptive thresholding completed in {}ms: block={}, offset={}, foreground={}, dimensions={}x{}",
        processing_time.as_millis(),
        2 * block_radius + 1,
        offset,
        foreground,
        image.width(),
        image.height()
    );

    Ok(ThresholdedImageResult {
        image: binary,
        method: ThresholdMethod::AdaptiveMeanInverse {
            block_radius,
            offset,
        },
        foreground_pixels: foreground,
        processing_time_ms: processing_time.as_millis() as u32,
    })
}
