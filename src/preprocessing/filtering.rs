//! # Image Filtering Module
//!
//! Noise reduction, local contrast enhancement, sharpening and morphology for
//! answer-sheet photographs. The warp stage chains these into a fixed
//! denoise → contrast → sharpen step so that lighting and sensor noise do not
//! perturb feature detection.

use image::{GrayImage, Luma};
use imageproc::distance_transform::Norm;
use imageproc::filter::{gaussian_blur_f32, median_filter};
use imageproc::morphology;

use super::types::{
    ClaheImageResult, DenoisedImageResult, MorphologicalImageResult, PreprocessingError,
    SharpenedImageResult,
};

fn ensure_not_empty(image: &GrayImage) -> Result<(), PreprocessingError> {
    if image.width() == 0 || image.height() == 0 {
        return Err(PreprocessingError::EmptyImage);
    }
    Ok(())
}

/// Applies a median filter to remove salt-and-pepper noise while keeping
/// bubble and timing-mark edges sharp.
///
/// # Arguments
///
/// * `image` - The grayscale input image
/// * `radius` - Window radius; 1 gives a 3x3 window
///
/// # Examples
///
/// ```no_run
/// use omr_grader::preprocessing::reduce_noise;
///
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let img = image::open("sheet.jpg")?.to_luma8();
/// let denoised = reduce_noise(&img, 1)?;
/// assert_eq!(denoised.image.dimensions(), img.dimensions());
/// # Ok(())
/// # }
/// ```
pub fn reduce_noise(
    image: &GrayImage,
    radius: u32,
) -> Result<DenoisedImageResult, PreprocessingError> {
    let start_time = std::time::Instant::now();
    ensure_not_empty(image)?;

    if radius == 0 || radius > 10 {
        return Err(PreprocessingError::InvalidParameter {
            name: "median radius",
            message: format!("{} must be between 1 and 10", radius),
        });
    }

    let denoised = median_filter(image, radius, radius);
    let processing_time = start_time.elapsed();

    tracing::debug!(
        target: "omr_pipeline",
        "Median denoise completed in {}ms: radius={}, dimensions={}x{}",
        processing_time.as_millis(),
        radius,
        denoised.width(),
        denoised.height()
    );

    Ok(DenoisedImageResult {
        image: denoised,
        radius,
        processing_time_ms: processing_time.as_millis() as u32,
    })
}

/// Applies Contrast Limited Adaptive Histogram Equalization (CLAHE).
///
/// The image is divided into a `tile_grid` of tiles. Each tile gets a clipped,
/// equalized lookup table and every pixel is mapped through a bilinear blend of
/// the four nearest tile tables, so there are no seams at tile borders.
///
/// # Arguments
///
/// * `image` - The grayscale input image
/// * `clip_limit` - Histogram clip relative to a uniform distribution (2.0 is typical)
/// * `tile_grid` - Number of tiles as (columns, rows)
pub fn apply_clahe(
    image: &GrayImage,
    clip_limit: f32,
    tile_grid: (u32, u32),
) -> Result<ClaheImageResult, PreprocessingError> {
    let start_time = std::time::Instant::now();
    ensure_not_empty(image)?;

    if clip_limit <= 0.0 {
        return Err(PreprocessingError::InvalidParameter {
            name: "clip limit",
            message: format!("{} must be > 0.0", clip_limit),
        });
    }
    if tile_grid.0 == 0 || tile_grid.1 == 0 {
        return Err(PreprocessingError::InvalidParameter {
            name: "tile grid",
            message: "dimensions must be > 0".to_string(),
        });
    }

    let (width, height) = image.dimensions();
    let tile_width = width.div_ceil(tile_grid.0.min(width));
    let tile_height = height.div_ceil(tile_grid.1.min(height));
    // Rounding tile sizes up can leave fewer tiles than requested
    let tiles_x = width.div_ceil(tile_width);
    let tiles_y = height.div_ceil(tile_height);

    let mut luts = Vec::with_capacity((tiles_x * tiles_y) as usize);
    for tile_y in 0..tiles_y {
        for tile_x in 0..tiles_x {
            let x0 = tile_x * tile_width;
            let y0 = tile_y * tile_height;
            let x1 = (x0 + tile_width).min(width);
            let y1 = (y0 + tile_height).min(height);
            luts.push(tile_lut(image, (x0, y0, x1, y1), clip_limit));
        }
    }

    let lut_at = |tx: u32, ty: u32| &luts[(ty * tiles_x + tx) as usize];
    let mut output = GrayImage::new(width, height);

    for (x, y, pixel) in image.enumerate_pixels() {
        let value = pixel[0] as usize;

        // Position relative to tile centers
        let gx = (x as f32 + 0.5) / tile_width as f32 - 0.5;
        let gy = (y as f32 + 0.5) / tile_height as f32 - 0.5;
        let tx0 = gx.floor().max(0.0) as u32;
        let ty0 = gy.floor().max(0.0) as u32;
        let tx0 = tx0.min(tiles_x - 1);
        let ty0 = ty0.min(tiles_y - 1);
        let tx1 = (tx0 + 1).min(tiles_x - 1);
        let ty1 = (ty0 + 1).min(tiles_y - 1);
        let fx = (gx - tx0 as f32).clamp(0.0, 1.0);
        let fy = (gy - ty0 as f32).clamp(0.0, 1.0);

        let top = lut_at(tx0, ty0)[value] as f32 * (1.0 - fx) + lut_at(tx1, ty0)[value] as f32 * fx;
        let bottom =
            lut_at(tx0, ty1)[value] as f32 * (1.0 - fx) + lut_at(tx1, ty1)[value] as f32 * fx;
        let blended = top * (1.0 - fy) + bottom * fy;

        output.put_pixel(x, y, Luma([blended.round().clamp(0.0, 255.0) as u8]));
    }

    let processing_time = start_time.elapsed();

    tracing::debug!(
        target: "omr_pipeline",
        "CLAHE applied in {}ms: clip_limit={}, tile_grid={}x{}",
        processing_time.as_millis(),
        clip_limit,
        tiles_x,
        tiles_y
    );

    Ok(ClaheImageResult {
        image: output,
        clip_limit,
        tile_grid: (tiles_x, tiles_y),
        processing_time_ms: processing_time.as_millis() as u32,
    })
}

/// Builds the clipped equalization lookup table for one tile.
fn tile_lut(image: &GrayImage, bounds: (u32, u32, u32, u32), clip_limit: f32) -> [u8; 256] {
    let (x0, y0, x1, y1) = bounds;
    let area = ((x1 - x0) * (y1 - y0)).max(1);

    let mut histogram = [0u32; 256];
    for y in y0..y1 {
        for x in x0..x1 {
            histogram[image.get_pixel(x, y)[0] as usize] += 1;
        }
    }

    let clip = ((clip_limit * area as f32 / 256.0) as u32).max(1);
    let mut excess = 0u32;
    for count in histogram.iter_mut() {
        if *count > clip {
            excess += *count - clip;
            *count = clip;
        }
    }

    // Spread the clipped mass evenly, then hand out the remainder with a stride
    let increment = excess / 256;
    let residual = (excess % 256) as usize;
    for count in histogram.iter_mut() {
        *count += increment;
    }
    if residual > 0 {
        let step = (256 / residual).max(1);
        for count in histogram.iter_mut().step_by(step).take(residual) {
            *count += 1;
        }
    }

    let scale = 255.0 / area as f32;
    let mut lut = [0u8; 256];
    let mut cumulative = 0u32;
    for (value, count) in histogram.iter().enumerate() {
        cumulative += count;
        lut[value] = (cumulative as f32 * scale).round().min(255.0) as u8;
    }
    lut
}

/// Unsharp masking: `I + amount * (I - blur(I))`.
///
/// With `amount = 0.5` this is `1.5 * I - 0.5 * blur(I)`.
pub fn sharpen(
    image: &GrayImage,
    sigma: f32,
    amount: f32,
) -> Result<SharpenedImageResult, PreprocessingError> {
    let start_time = std::time::Instant::now();
    ensure_not_empty(image)?;

    if sigma <= 0.0 || sigma > 10.0 {
        return Err(PreprocessingError::InvalidParameter {
            name: "sharpen sigma",
            message: format!("{} must be between 0.0 (exclusive) and 10.0", sigma),
        });
    }
    if amount < 0.0 {
        return Err(PreprocessingError::InvalidParameter {
            name: "sharpen amount",
            message: format!("{} must not be negative", amount),
        });
    }

    let blurred = gaussian_blur_f32(image, sigma);
    let mut output = GrayImage::new(image.width(), image.height());
    for ((orig, blur), out) in image
        .pixels()
        .zip(blurred.pixels())
        .zip(output.pixels_mut())
    {
        let value = (1.0 + amount) * orig[0] as f32 - amount * blur[0] as f32;
        out[0] = value.round().clamp(0.0, 255.0) as u8;
    }

    let processing_time = start_time.elapsed();
    tracing::debug!(
        target: "omr_pipeline",
        "Sharpening completed in {}ms: sigma={}, amount={}",
        processing_time.as_millis(),
        sigma,
        amount
    );

    Ok(SharpenedImageResult {
        image: output,
        sigma,
        amount,
        processing_time_ms: processing_time.as_millis() as u32,
    })
}

/// Morphological closing (dilate then erode) of a binary image with a 3x3
/// square element. Consolidates timing marks broken up by print texture.
pub fn apply_morphological_closing(
    image: &GrayImage,
) -> Result<MorphologicalImageResult, PreprocessingError> {
    let start_time = std::time::Instant::now();
    ensure_not_empty(image)?;

    let closed = morphology::close(image, Norm::LInf, 1);
    let processing_time = start_time.elapsed();

    Ok(MorphologicalImageResult {
        image: closed,
        kernel_size: 3,
        processing_time_ms: processing_time.as_millis() as u32,
    })
}

/// The fixed enhancement chain applied to both template and photo before
/// feature detection: median denoise, CLAHE, unsharp mask.
pub fn enhance_for_matching(
    image: &GrayImage,
    denoise_radius: u32,
    clip_limit: f32,
    tile_grid: (u32, u32),
    sharpen_sigma: f32,
    sharpen_amount: f32,
) -> Result<GrayImage, PreprocessingError> {
    let denoised = reduce_noise(image, denoise_radius)?;
    let contrasted = apply_clahe(&denoised.image, clip_limit, tile_grid)?;
    let sharpened = sharpen(&contrasted.image, sharpen_sigma, sharpen_amount)?;
    Ok(sharpened.image)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gradient_image(width: u32, height: u32) -> GrayImage {
        GrayImage::from_fn(width, height, |x, _| Luma([(100 + (x % 20)) as u8]))
    }

    #[test]
    fn test_reduce_noise_removes_isolated_speck() {
        let mut img = GrayImage::from_pixel(9, 9, Luma([255]));
        img.put_pixel(4, 4, Luma([0]));

        let result = reduce_noise(&img, 1).expect("median filter should succeed");
        assert_eq!(result.radius, 1);
        assert_eq!(result.image.get_pixel(4, 4)[0], 255);
    }

    #[test]
    fn test_reduce_noise_invalid_radius() {
        let img = gradient_image(20, 20);
        assert!(reduce_noise(&img, 0).is_err());
        assert!(reduce_noise(&img, 11).is_err());
    }

    #[test]
    fn test_empty_image_is_rejected() {
        let img = GrayImage::new(0, 10);
        assert_eq!(
            apply_clahe(&img, 2.0, (8, 8)).unwrap_err(),
            PreprocessingError::EmptyImage
        );
    }

    #[test]
    fn test_apply_clahe_stretches_low_contrast() {
        let img = gradient_image(256, 256);
        let result = apply_clahe(&img, 2.0, (8, 8)).expect("CLAHE should succeed");

        assert_eq!(result.image.dimensions(), (256, 256));
        assert_eq!(result.tile_grid, (8, 8));

        let range = |image: &GrayImage| {
            let min = image.pixels().map(|p| p[0]).min().unwrap_or(0);
            let max = image.pixels().map(|p| p[0]).max().unwrap_or(0);
            max - min
        };
        assert!(range(&result.image) > range(&img));
    }

    #[test]
    fn test_apply_clahe_tile_grid_clamped_to_small_images() {
        let img = gradient_image(4, 3);
        let result = apply_clahe(&img, 2.0, (8, 8)).expect("CLAHE should succeed");
        assert_eq!(result.tile_grid, (4, 3));
    }

    #[test]
    fn test_apply_clahe_invalid_parameters() {
        let img = gradient_image(50, 50);
        assert!(apply_clahe(&img, 0.0, (8, 8)).is_err());
        assert!(apply_clahe(&img, 2.0, (0, 8)).is_err());
        assert!(apply_clahe(&img, 2.0, (8, 0)).is_err());
    }

    #[test]
    fn test_sharpen_keeps_flat_regions_and_boosts_edges() {
        let img = GrayImage::from_fn(30, 30, |x, _| Luma([if x < 15 { 60 } else { 200 }]));
        let result = sharpen(&img, 1.0, 0.5).expect("sharpen should succeed");

        assert_eq!(result.image.get_pixel(2, 15)[0], 60);
        assert_eq!(result.image.get_pixel(27, 15)[0], 200);
        // Overshoot on the bright side of the edge
        assert!(result.image.get_pixel(15, 15)[0] > 200);
    }

    #[test]
    fn test_closing_fills_single_pixel_gap() {
        let mut img = GrayImage::new(9, 9);
        for x in 2..7 {
            for y in 2..7 {
                img.put_pixel(x, y, Luma([255]));
            }
        }
        img.put_pixel(4, 4, Luma([0]));

        let result = apply_morphological_closing(&img).expect("closing should succeed");
        assert_eq!(result.kernel_size, 3);
        assert_eq!(result.image.get_pixel(4, 4)[0], 255);
    }

    #[test]
    fn test_enhance_for_matching_preserves_dimensions() {
        let img = gradient_image(80, 60);
        let enhanced =
            enhance_for_matching(&img, 1, 2.0, (8, 8), 0.8, 0.5).expect("chain should succeed");
        assert_eq!(enhanced.dimensions(), (80, 60));
    }
}
