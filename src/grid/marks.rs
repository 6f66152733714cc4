//! Timing-mark detection on the right and bottom edge strips.

use std::collections::HashMap;

use image::imageops;
use image::{GrayImage, Luma};
use imageproc::filter::gaussian_blur_f32;
use imageproc::region_labelling::{connected_components, Connectivity};

use crate::config::MarkDetectionConfig;
use crate::preprocessing::{
    adaptive_threshold_inverse, apply_clahe, apply_morphological_closing, PreprocessingError,
};

/// Direction along which a strip's marks are laid out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkAxis {
    /// Right strip, marks stacked top to bottom, positions are y values
    Vertical,
    /// Bottom strip, marks left to right, positions are x values
    Horizontal,
}

/// Row and column mark positions in warped-image pixels, both ascending.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GridMarks {
    pub rows: Vec<u32>,
    pub cols: Vec<u32>,
}

#[derive(Debug, Clone, Copy)]
struct BoundingBox {
    min_x: u32,
    min_y: u32,
    max_x: u32,
    max_y: u32,
}

impl BoundingBox {
    fn width(&self) -> u32 {
        self.max_x - self.min_x + 1
    }

    fn height(&self) -> u32 {
        self.max_y - self.min_y + 1
    }
}

/// Crops the right and bottom strips. Returns `(right, bottom, right_x0, bottom_y0)`
/// where the offsets translate strip coordinates back to image coordinates.
pub fn extract_timing_strips(
    image: &GrayImage,
    right_ratio: f32,
    bottom_ratio: f32,
) -> (GrayImage, GrayImage, u32, u32) {
    let (width, height) = image.dimensions();
    let strip_width = ((width as f32 * right_ratio).round() as u32).clamp(1, width.max(1));
    let strip_height = ((height as f32 * bottom_ratio).round() as u32).clamp(1, height.max(1));
    let right_x0 = width.saturating_sub(strip_width);
    let bottom_y0 = height.saturating_sub(strip_height);

    let right = imageops::crop_imm(image, right_x0, 0, width - right_x0, height).to_image();
    let bottom = imageops::crop_imm(image, 0, bottom_y0, width, height - bottom_y0).to_image();
    (right, bottom, right_x0, bottom_y0)
}

/// Binarizes a strip so that marks become solid foreground blobs.
pub fn preprocess_strip(
    strip: &GrayImage,
    config: &MarkDetectionConfig,
) -> Result<GrayImage, PreprocessingError> {
    let gray = if config.enhance {
        apply_clahe(strip, 2.0, (8, 8))?.image
    } else {
        strip.clone()
    };
    let blurred = gaussian_blur_f32(&gray, config.blur_sigma);
    let binary =
        adaptive_threshold_inverse(&blurred, config.adaptive_block_radius, config.adaptive_offset)?;
    Ok(apply_morphological_closing(&binary.image)?.image)
}

/// Finds mark centers in a binary strip.
///
/// Components are filtered by bounding-box area, aspect ratio (width / height)
/// and distance from the strip's long edges, then sorted along `axis`. A
/// mark closer than `min_distance` to the previously kept one is dropped.
pub fn detect_timing_marks(
    binary: &GrayImage,
    axis: MarkAxis,
    config: &MarkDetectionConfig,
) -> Vec<u32> {
    let (width, height) = binary.dimensions();
    let labels = connected_components(binary, Connectivity::Eight, Luma([0u8]));

    let mut boxes: HashMap<u32, BoundingBox> = HashMap::new();
    for (x, y, label) in labels.enumerate_pixels() {
        let label = label[0];
        if label == 0 {
            continue;
        }
        boxes
            .entry(label)
            .and_modify(|b| {
                b.min_x = b.min_x.min(x);
                b.min_y = b.min_y.min(y);
                b.max_x = b.max_x.max(x);
                b.max_y = b.max_y.max(y);
            })
            .or_insert(BoundingBox {
                min_x: x,
                min_y: y,
                max_x: x,
                max_y: y,
            });
    }

    let margin = config.edge_margin;
    let (min_aspect, max_aspect) = config.aspect_ratio_range;
    let mut candidates: Vec<u32> = boxes
        .values()
        .filter_map(|b| {
            let area = b.width() * b.height();
            if area < config.min_area || area > config.max_area {
                return None;
            }
            let aspect = b.width() as f32 / b.height() as f32;
            if aspect < min_aspect || aspect > max_aspect {
                return None;
            }
            match axis {
                MarkAxis::Vertical => {
                    if b.min_x < margin || b.max_x + 1 > width.saturating_sub(margin) {
                        return None;
                    }
                    Some(b.min_y + b.height() / 2)
                }
                MarkAxis::Horizontal => {
                    if b.min_y < margin || b.max_y + 1 > height.saturating_sub(margin) {
                        return None;
                    }
                    Some(b.min_x + b.width() / 2)
                }
            }
        })
        .collect();
    candidates.sort_unstable();

    let mut marks: Vec<u32> = Vec::with_capacity(candidates.len());
    for pos in candidates {
        match marks.last() {
            Some(&last) if pos - last < config.min_distance => {}
            _ => marks.push(pos),
        }
    }
    marks
}

/// Detects row marks on the right strip and column marks on the bottom strip.
pub fn detect_grid_marks(
    image: &GrayImage,
    right_ratio: f32,
    bottom_ratio: f32,
    config: &MarkDetectionConfig,
) -> Result<GridMarks, PreprocessingError> {
    let start_time = std::time::Instant::now();
    let (right, bottom, _, _) = extract_timing_strips(image, right_ratio, bottom_ratio);

    let rows = detect_timing_marks(&preprocess_strip(&right, config)?, MarkAxis::Vertical, config);
    let cols = detect_timing_marks(
        &preprocess_strip(&bottom, config)?,
        MarkAxis::Horizontal,
        config,
    );

    tracing::debug!(
        target: "omr_pipeline",
        "Timing marks detected in {}ms: rows={}, cols={}",
        start_time.elapsed().as_millis(),
        rows.len(),
        cols.len()
    );

    Ok(GridMarks { rows, cols })
}
