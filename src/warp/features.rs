//! Oriented FAST keypoints with rotated binary descriptors.
//!
//! Corners are detected with FAST-9 on a small image pyramid, ranked by
//! their Harris response, thinned with non-maximum suppression and oriented
//! by their intensity centroid. Ranking uses exact integer sums so the same
//! physical corners survive the per-level budget when the sheet is
//! photographed rotated by a right angle. Each
//! keypoint carries a 256-bit descriptor built from intensity comparisons
//! of a fixed random point-pair pattern rotated to the keypoint orientation.

use image::imageops::{self, FilterType};
use image::GrayImage;
use imageproc::corners::corners_fast9;
use imageproc::filter::gaussian_blur_f32;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::WarpConfig;

/// 256 comparison bits.
pub type Descriptor = [u64; 4];

/// Radius of the orientation patch
const ORIENTATION_RADIUS: i32 = 15;
/// Radius inside which pattern points are drawn
const PATTERN_RADIUS: i32 = 13;
/// Keypoints closer than this to the level border are dropped
const BORDER: u32 = 16;
/// Half-size of the Harris structure tensor window
const HARRIS_RADIUS: i32 = 3;
/// Harris `k` as a reciprocal
const HARRIS_K_INV: i64 = 25;
const PATTERN_SEED: u64 = 0x0b1d_5eed;
const DESCRIPTOR_SMOOTHING: f32 = 2.0;

/// A keypoint in full-resolution image coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Keypoint {
    pub x: f32,
    pub y: f32,
    /// Pyramid level the corner was found on
    pub level: usize,
    /// Orientation in radians
    pub angle: f32,
    /// Harris corner response on its pyramid level
    pub score: f32,
}

/// Keypoints and their descriptors, index-aligned.
#[derive(Debug, Clone, Default)]
pub struct FeatureSet {
    pub keypoints: Vec<Keypoint>,
    pub descriptors: Vec<Descriptor>,
}

impl FeatureSet {
    pub fn len(&self) -> usize {
        self.keypoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keypoints.is_empty()
    }
}

/// Hamming distance between two descriptors.
pub fn hamming(a: &Descriptor, b: &Descriptor) -> u32 {
    a.iter().zip(b.iter()).map(|(x, y)| (x ^ y).count_ones()).sum()
}

/// Detects and describes keypoints. The sampling pattern is generated once
/// from a fixed seed so template and photo descriptors are comparable.
#[derive(Debug, Clone)]
pub struct FeatureDetector {
    pattern: Vec<[i32; 4]>,
    max_features: usize,
    levels: usize,
    scale: f32,
    fast_threshold: u8,
    nms_radius: u32,
}

impl FeatureDetector {
    pub fn new(config: &WarpConfig) -> Self {
        let mut rng = StdRng::seed_from_u64(PATTERN_SEED);
        let mut point = || loop {
            let x = rng.random_range(-PATTERN_RADIUS..=PATTERN_RADIUS);
            let y = rng.random_range(-PATTERN_RADIUS..=PATTERN_RADIUS);
            if x * x + y * y <= PATTERN_RADIUS * PATTERN_RADIUS {
                return (x, y);
            }
        };
        let mut pattern = Vec::with_capacity(256);
        while pattern.len() < 256 {
            let (ax, ay) = point();
            let (bx, by) = point();
            if (ax, ay) != (bx, by) {
                pattern.push([ax, ay, bx, by]);
            }
        }

        Self {
            pattern,
            max_features: config.max_features,
            levels: config.pyramid_levels.max(1),
            scale: config.pyramid_scale,
            fast_threshold: config.fast_threshold,
            nms_radius: config.nms_radius,
        }
    }

    /// Runs detection and description over the whole pyramid.
    pub fn detect_and_compute(&self, image: &GrayImage) -> FeatureSet {
        let start_time = std::time::Instant::now();

        // Per-level budgets proportional to level area
        let weights: Vec<f32> = (0..self.levels)
            .map(|l| self.scale.powi(-2 * l as i32))
            .collect();
        let total_weight: f32 = weights.iter().sum();

        let mut features = FeatureSet::default();
        for (level, weight) in weights.iter().enumerate() {
            let factor = self.scale.powi(level as i32);
            let width = (image.width() as f32 / factor).round() as u32;
            let height = (image.height() as f32 / factor).round() as u32;
            if width <= 2 * BORDER || height <= 2 * BORDER {
                break;
            }

            let level_image = if level == 0 {
                image.clone()
            } else {
                imageops::resize(image, width, height, FilterType::Triangle)
            };
            let budget = ((self.max_features as f32 * weight / total_weight).ceil() as usize).max(1);
            self.describe_level(&level_image, level, factor, budget, &mut features);
        }

        tracing::debug!(
            target: "omr_pipeline",
            "Feature detection completed in {}ms: keypoints={}, dimensions={}x{}",
            start_time.elapsed().as_millis(),
            features.len(),
            image.width(),
            image.height()
        );

        features
    }

    fn describe_level(
        &self,
        level_image: &GrayImage,
        level: usize,
        factor: f32,
        budget: usize,
        out: &mut FeatureSet,
    ) {
        let (width, height) = level_image.dimensions();
        let mut corners: Vec<RankedCorner> = corners_fast9(level_image, self.fast_threshold)
            .into_iter()
            .filter(|c| {
                c.x >= BORDER && c.y >= BORDER && c.x < width - BORDER && c.y < height - BORDER
            })
            .map(|c| {
                let (m10, m01) = intensity_moments(level_image, c.x, c.y);
                RankedCorner {
                    x: c.x,
                    y: c.y,
                    response: harris_response(level_image, c.x, c.y),
                    moment: m10 * m10 + m01 * m01,
                    angle: (m01 as f64).atan2(m10 as f64) as f32,
                }
            })
            .collect();
        // Raster order only decides among corners equal on both keys
        corners.sort_by(|a, b| {
            b.response
                .cmp(&a.response)
                .then(b.moment.cmp(&a.moment))
        });

        // Greedy suppression on an occupancy mask, strongest first
        let radius = self.nms_radius as i64;
        let mut taken = vec![false; (width * height) as usize];
        let mut kept = Vec::with_capacity(budget);
        for corner in corners {
            let idx = (corner.y * width + corner.x) as usize;
            if taken[idx] {
                continue;
            }
            for dy in -radius..=radius {
                for dx in -radius..=radius {
                    let nx = corner.x as i64 + dx;
                    let ny = corner.y as i64 + dy;
                    if nx >= 0 && ny >= 0 && nx < width as i64 && ny < height as i64 {
                        taken[(ny as u32 * width + nx as u32) as usize] = true;
                    }
                }
            }
            kept.push(corner);
            if kept.len() >= budget {
                break;
            }
        }

        let smoothed = gaussian_blur_f32(level_image, DESCRIPTOR_SMOOTHING);
        for corner in kept {
            let descriptor = self.describe(&smoothed, corner.x, corner.y, corner.angle);
            out.keypoints.push(Keypoint {
                x: corner.x as f32 * factor,
                y: corner.y as f32 * factor,
                level,
                angle: corner.angle,
                score: corner.response as f32,
            });
            out.descriptors.push(descriptor);
        }
    }

    fn describe(&self, smoothed: &GrayImage, x: u32, y: u32, angle: f32) -> Descriptor {
        let (sin, cos) = angle.sin_cos();
        let (width, height) = smoothed.dimensions();
        let sample = |px: i32, py: i32| -> u8 {
            let rx = (cos * px as f32 - sin * py as f32).round() as i64 + x as i64;
            let ry = (sin * px as f32 + cos * py as f32).round() as i64 + y as i64;
            let cx = rx.clamp(0, width as i64 - 1) as u32;
            let cy = ry.clamp(0, height as i64 - 1) as u32;
            smoothed.get_pixel(cx, cy)[0]
        };

        let mut descriptor = [0u64; 4];
        for (bit, [ax, ay, bx, by]) in self.pattern.iter().enumerate() {
            if sample(*ax, *ay) < sample(*bx, *by) {
                descriptor[bit / 64] |= 1u64 << (bit % 64);
            }
        }
        descriptor
    }
}

struct RankedCorner {
    x: u32,
    y: u32,
    response: i64,
    moment: i64,
    angle: f32,
}

/// Harris response `det(M) - trace(M)^2 / 25`, multiplied by 25, over the
/// central-difference structure tensor of a square window. The caller keeps
/// the window and its gradient taps inside the image.
fn harris_response(image: &GrayImage, x: u32, y: u32) -> i64 {
    let at = |px: i32, py: i32| image.get_pixel(px as u32, py as u32)[0] as i64;
    let (cx, cy) = (x as i32, y as i32);
    let (mut sxx, mut syy, mut sxy) = (0i64, 0i64, 0i64);
    for dy in -HARRIS_RADIUS..=HARRIS_RADIUS {
        for dx in -HARRIS_RADIUS..=HARRIS_RADIUS {
            let (px, py) = (cx + dx, cy + dy);
            let gx = at(px + 1, py) - at(px - 1, py);
            let gy = at(px, py + 1) - at(px, py - 1);
            sxx += gx * gx;
            syy += gy * gy;
            sxy += gx * gy;
        }
    }
    let trace = sxx + syy;
    HARRIS_K_INV * (sxx * syy - sxy * sxy) - trace * trace
}

/// First-order moments `(m10, m01)` of a circular patch around a pixel.
/// The keypoint orientation is the direction of `(m10, m01)`, pointing at
/// the patch's intensity centroid. Pixels outside the image are skipped.
fn intensity_moments(image: &GrayImage, x: u32, y: u32) -> (i64, i64) {
    let (width, height) = image.dimensions();
    let r2 = ORIENTATION_RADIUS * ORIENTATION_RADIUS;
    let mut m01 = 0i64;
    let mut m10 = 0i64;
    for dy in -ORIENTATION_RADIUS..=ORIENTATION_RADIUS {
        for dx in -ORIENTATION_RADIUS..=ORIENTATION_RADIUS {
            if dx * dx + dy * dy > r2 {
                continue;
            }
            let px = x as i64 + dx as i64;
            let py = y as i64 + dy as i64;
            if px < 0 || py < 0 || px >= width as i64 || py >= height as i64 {
                continue;
            }
            let value = image.get_pixel(px as u32, py as u32)[0] as i64;
            m10 += dx as i64 * value;
            m01 += dy as i64 * value;
        }
    }
    (m10, m01)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    fn textured_image(width: u32, height: u32, seed: u64) -> GrayImage {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut img = GrayImage::from_pixel(width, height, Luma([255]));
        for by in (20..height - 20).step_by(8) {
            for bx in (20..width - 20).step_by(8) {
                let value = if rng.random_bool(0.5) { 20 } else { 235 };
                for y in by..(by + 8).min(height) {
                    for x in bx..(bx + 8).min(width) {
                        img.put_pixel(x, y, Luma([value]));
                    }
                }
            }
        }
        img
    }

    #[test]
    fn test_hamming_distance() {
        let a = [0u64, u64::MAX, 0b1011, 0];
        let b = [0u64, 0, 0b0001, 0];
        assert_eq!(hamming(&a, &b), 64 + 2);
        assert_eq!(hamming(&a, &a), 0);
    }

    #[test]
    fn test_pattern_is_deterministic() {
        let config = WarpConfig::default();
        let a = FeatureDetector::new(&config);
        let b = FeatureDetector::new(&config);
        assert_eq!(a.pattern, b.pattern);
        assert_eq!(a.pattern.len(), 256);
    }

    #[test]
    fn test_flat_image_has_no_features() {
        let detector = FeatureDetector::new(&WarpConfig::default());
        let img = GrayImage::from_pixel(200, 200, Luma([255]));
        assert!(detector.detect_and_compute(&img).is_empty());
    }

    #[test]
    fn test_texture_yields_bounded_features() {
        let config = WarpConfig {
            max_features: 300,
            ..Default::default()
        };
        let detector = FeatureDetector::new(&config);
        let features = detector.detect_and_compute(&textured_image(240, 200, 7));

        assert!(!features.is_empty());
        assert_eq!(features.keypoints.len(), features.descriptors.len());
        // Budgets are rounded up per level
        assert!(features.len() <= 300 + config.pyramid_levels);
        for kp in &features.keypoints {
            assert!(kp.x >= 0.0 && kp.x < 240.0 && kp.y >= 0.0 && kp.y < 200.0);
        }
    }

    #[test]
    fn test_orientation_points_toward_bright_side() {
        let img = GrayImage::from_fn(64, 64, |x, _| Luma([if x > 32 { 250 } else { 10 }]));
        let (m10, m01) = intensity_moments(&img, 32, 32);
        assert!(m10 > 0);
        assert!((m01 as f64).atan2(m10 as f64).abs() < 0.1);
    }

    #[test]
    fn test_harris_prefers_corners_over_edges() {
        let corner = GrayImage::from_fn(40, 40, |x, y| Luma([if x > 20 && y > 20 { 230 } else { 20 }]));
        let edge = GrayImage::from_fn(40, 40, |x, _| Luma([if x > 20 { 230 } else { 20 }]));
        assert!(harris_response(&corner, 20, 20) > 0);
        assert!(harris_response(&edge, 20, 20) < 0);
    }

    #[test]
    fn test_quarter_turn_keeps_the_same_keypoints() {
        let config = WarpConfig {
            max_features: 400,
            pyramid_levels: 1,
            ..Default::default()
        };
        let detector = FeatureDetector::new(&config);
        let upright = textured_image(240, 200, 11);
        let turned = imageops::rotate90(&upright);
        let a = detector.detect_and_compute(&upright);
        let b = detector.detect_and_compute(&turned);
        assert!(!a.is_empty());

        // Clockwise quarter turn: (x, y) -> (h - 1 - y, x), angles advance by pi/2
        let h = upright.height() as f32;
        let mut paired = 0;
        for (kp, desc) in a.keypoints.iter().zip(&a.descriptors) {
            let (tx, ty) = (h - 1.0 - kp.y, kp.x);
            let Some(j) = b.keypoints.iter().position(|k| k.x == tx && k.y == ty) else {
                continue;
            };
            let expected = kp.angle + std::f32::consts::FRAC_PI_2;
            let diff = (b.keypoints[j].angle - expected).rem_euclid(std::f32::consts::TAU);
            assert!(diff.min(std::f32::consts::TAU - diff) < 1e-3);
            if hamming(desc, &b.descriptors[j]) <= 16 {
                paired += 1;
            }
        }
        assert!(paired * 10 >= a.len() * 8, "{paired} of {} keypoints survived", a.len());
    }
}
