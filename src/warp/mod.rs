//! # Template Registration
//!
//! Aligns a photographed answer sheet with the blank reference template.
//!
//! Both images go through the same denoise → CLAHE → sharpen chain, then
//! oriented binary features are matched template → photo with a ratio test.
//! A RANSAC homography maps photo pixels onto template pixels and the
//! enhanced photo is resampled into the template's dimensions.
//!
//! - `features`: FAST pyramid keypoints and rotated binary descriptors
//! - `matching`: brute-force Hamming matching with ratio filtering
//! - `homography`: normalized DLT and RANSAC

pub mod features;
pub mod homography;
pub mod matching;

use std::sync::Arc;

use image::{GrayImage, Luma};
use imageproc::geometric_transformations::{warp_into, Interpolation, Projection};
use nalgebra::Matrix3;

use crate::config::WarpConfig;
use crate::errors::GradingError;
use crate::preprocessing::{enhance_for_matching, PreprocessingError};

pub use features::{Descriptor, FeatureDetector, FeatureSet, Keypoint};
pub use homography::{HomographyError, RansacConfig};
pub use matching::{match_descriptors, FeatureMatch};

/// Minimum correspondences needed to define a perspective transform
pub const MIN_CORRESPONDENCES: usize = 4;

/// The blank reference sheet and its features, computed once.
#[derive(Debug, Clone)]
pub struct Template {
    image: GrayImage,
    features: FeatureSet,
}

impl Template {
    pub fn image(&self) -> &GrayImage {
        &self.image
    }

    pub fn features(&self) -> &FeatureSet {
        &self.features
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.image.dimensions()
    }
}

/// A photo resampled into template coordinates.
#[derive(Debug, Clone)]
pub struct WarpedSheet {
    /// Enhanced photo with the template's dimensions
    pub image: GrayImage,
    /// Photo → template homography
    pub homography: Matrix3<f64>,
    /// Correspondences that passed the ratio test
    pub matches: usize,
    /// Correspondences consistent with the homography
    pub inliers: usize,
}

/// Warps photos onto a shared [`Template`].
#[derive(Debug, Clone)]
pub struct TemplateWarper {
    template: Arc<Template>,
    detector: FeatureDetector,
    config: WarpConfig,
}

impl TemplateWarper {
    /// Enhances the template and extracts its features.
    pub fn new(template_image: GrayImage, config: &WarpConfig) -> Result<Self, PreprocessingError> {
        let start_time = std::time::Instant::now();
        let detector = FeatureDetector::new(config);
        let enhanced = enhance(&template_image, config)?;
        let features = detector.detect_and_compute(&enhanced);

        tracing::info!(
            keypoints = features.len(),
            width = template_image.width(),
            height = template_image.height(),
            duration_ms = start_time.elapsed().as_millis() as u64,
            "Template initialized"
        );

        Ok(Self {
            template: Arc::new(Template {
                image: template_image,
                features,
            }),
            detector,
            config: config.clone(),
        })
    }

    pub fn template(&self) -> &Arc<Template> {
        &self.template
    }

    /// Aligns `photo` with the template.
    ///
    /// Fails with [`GradingError::Alignment`] when fewer than four ratio-test
    /// survivors remain or when no homography gathers enough inliers.
    pub fn warp(&self, photo: &GrayImage) -> Result<WarpedSheet, GradingError> {
        let start_time = std::time::Instant::now();

        let enhanced = enhance(photo, &self.config)?;
        let photo_features = self.detector.detect_and_compute(&enhanced);

        let matches = match_descriptors(
            &self.template.features.descriptors,
            &photo_features.descriptors,
            self.config.ratio_threshold,
            self.config.max_descriptor_distance,
        );

        tracing::debug!(
            target: "omr_pipeline",
            "Matched {} of {} template keypoints against {} photo keypoints",
            matches.len(),
            self.template.features.len(),
            photo_features.len()
        );

        if matches.len() < MIN_CORRESPONDENCES {
            return Err(GradingError::Alignment {
                found: matches.len(),
                required: MIN_CORRESPONDENCES,
                reason: "not enough matching points for homography".to_string(),
            });
        }

        let (photo_pts, template_pts): (Vec<_>, Vec<_>) = matches
            .iter()
            .map(|m| {
                let t = &self.template.features.keypoints[m.query_idx];
                let p = &photo_features.keypoints[m.train_idx];
                ([p.x as f64, p.y as f64], [t.x as f64, t.y as f64])
            })
            .unzip();

        let ransac_config = RansacConfig::from(&self.config);
        let fit = homography::fit_ransac(&photo_pts, &template_pts, &ransac_config).map_err(
            |e| {
                let found = match &e {
                    HomographyError::InsufficientInliers { found, .. } => *found,
                    _ => 0,
                };
                GradingError::Alignment {
                    found,
                    required: ransac_config.min_inliers,
                    reason: format!("no consistent perspective transform ({})", e),
                }
            },
        )?;

        let h = &fit.h;
        let row_major = [
            h[(0, 0)] as f32,
            h[(0, 1)] as f32,
            h[(0, 2)] as f32,
            h[(1, 0)] as f32,
            h[(1, 1)] as f32,
            h[(1, 2)] as f32,
            h[(2, 0)] as f32,
            h[(2, 1)] as f32,
            h[(2, 2)] as f32,
        ];
        let projection = Projection::from_matrix(row_major).ok_or_else(|| {
            GradingError::Alignment {
                found: fit.n_inliers,
                required: ransac_config.min_inliers,
                reason: "perspective transform is not invertible".to_string(),
            }
        })?;

        let (width, height) = self.template.dimensions();
        let mut warped = GrayImage::from_pixel(width, height, Luma([255]));
        warp_into(
            &enhanced,
            &projection,
            Interpolation::Bilinear,
            Luma([255]),
            &mut warped,
        );

        let duration = start_time.elapsed();
        crate::observability::metrics::record_warp_metrics(
            matches.len(),
            fit.n_inliers,
            duration.as_secs_f64() * 1000.0,
        );
        tracing::debug!(
            target: "omr_pipeline",
            "Warp completed in {}ms: matches={}, inliers={}",
            duration.as_millis(),
            matches.len(),
            fit.n_inliers
        );

        Ok(WarpedSheet {
            image: warped,
            homography: fit.h,
            matches: matches.len(),
            inliers: fit.n_inliers,
        })
    }
}

fn enhance(image: &GrayImage, config: &WarpConfig) -> Result<GrayImage, PreprocessingError> {
    enhance_for_matching(
        image,
        config.denoise_radius,
        config.clahe_clip_limit,
        config.clahe_tile_grid,
        config.sharpen_sigma,
        config.sharpen_amount,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn textured_sheet(width: u32, height: u32, offset: (u32, u32)) -> GrayImage {
        let mut rng = StdRng::seed_from_u64(42);
        let mut img = GrayImage::from_pixel(width, height, Luma([255]));
        for by in (0..200).step_by(10) {
            for bx in (0..280).step_by(10) {
                let value = if rng.random_bool(0.5) { 25 } else { 230 };
                for y in 0..10 {
                    for x in 0..10 {
                        img.put_pixel(40 + offset.0 + bx + x, 40 + offset.1 + by + y, Luma([value]));
                    }
                }
            }
        }
        img
    }

    fn test_config() -> WarpConfig {
        WarpConfig {
            max_features: 1500,
            ..Default::default()
        }
    }

    #[test]
    fn test_translated_photo_is_realigned() {
        let config = test_config();
        let template = textured_sheet(400, 320, (0, 0));
        let photo = textured_sheet(400, 320, (12, 7));

        let warper = TemplateWarper::new(template, &config).expect("template should initialize");
        let sheet = warper.warp(&photo).expect("translated photo should align");

        assert_eq!(sheet.image.dimensions(), (400, 320));
        assert!(sheet.inliers >= config.ransac_min_inliers);
        // Photo → template shifts back by the offset
        assert!((sheet.homography[(0, 2)] + 12.0).abs() < 1.5);
        assert!((sheet.homography[(1, 2)] + 7.0).abs() < 1.5);
    }

    #[test]
    fn test_blank_photo_fails_alignment() {
        let warper = TemplateWarper::new(textured_sheet(400, 320, (0, 0)), &test_config())
            .expect("template should initialize");
        let blank = GrayImage::from_pixel(400, 320, Luma([255]));

        match warper.warp(&blank) {
            Err(GradingError::Alignment { found, required, .. }) => {
                assert_eq!(found, 0);
                assert_eq!(required, MIN_CORRESPONDENCES);
            }
            other => panic!("expected alignment failure, got {:?}", other.map(|s| s.inliers)),
        }
    }
}
