//! Perspective transform estimation between matched keypoints.
//!
//! Normalized DLT solved through the eigen-decomposition of `AᵀA`, wrapped in
//! seeded RANSAC with a final refit on the consensus set.

use nalgebra::{DMatrix, Matrix3, SymmetricEigen, Vector3};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// A 2D point in pixel coordinates.
pub type Point = [f64; 2];

#[derive(Debug, Clone, PartialEq)]
pub enum HomographyError {
    TooFewPoints { needed: usize, got: usize },
    Degenerate(String),
    InsufficientInliers { needed: usize, found: usize },
}

impl std::fmt::Display for HomographyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TooFewPoints { needed, got } => {
                write!(f, "too few points: need {}, got {}", needed, got)
            }
            Self::Degenerate(msg) => write!(f, "degenerate configuration: {}", msg),
            Self::InsufficientInliers { needed, found } => {
                write!(f, "insufficient inliers: need {}, found {}", needed, found)
            }
        }
    }
}

impl std::error::Error for HomographyError {}

/// Maps `(x, y)` through `h`. Returns `None` for points at infinity.
pub fn project(h: &Matrix3<f64>, x: f64, y: f64) -> Option<Point> {
    let p = h * Vector3::new(x, y, 1.0);
    if p[2].abs() < 1e-12 {
        return None;
    }
    Some([p[0] / p[2], p[1] / p[2]])
}

fn reprojection_error(h: &Matrix3<f64>, src: &Point, dst: &Point) -> f64 {
    match project(h, src[0], src[1]) {
        Some(p) => ((p[0] - dst[0]).powi(2) + (p[1] - dst[1]).powi(2)).sqrt(),
        None => f64::INFINITY,
    }
}

/// Translate the centroid to the origin and scale the mean distance to √2.
fn normalize_points(pts: &[Point]) -> (Matrix3<f64>, Vec<Point>) {
    let n = pts.len() as f64;
    let cx = pts.iter().map(|p| p[0]).sum::<f64>() / n;
    let cy = pts.iter().map(|p| p[1]).sum::<f64>() / n;
    let mean_dist = pts
        .iter()
        .map(|p| ((p[0] - cx).powi(2) + (p[1] - cy).powi(2)).sqrt())
        .sum::<f64>()
        / n;

    let s = if mean_dist > 1e-12 {
        std::f64::consts::SQRT_2 / mean_dist
    } else {
        1.0
    };
    let t = Matrix3::new(s, 0.0, -s * cx, 0.0, s, -s * cy, 0.0, 0.0, 1.0);
    let normalized = pts
        .iter()
        .map(|p| [s * (p[0] - cx), s * (p[1] - cy)])
        .collect();
    (t, normalized)
}

/// Estimates `H` with `dst ≈ project(H, src)` from at least four pairs.
pub fn estimate_dlt(src: &[Point], dst: &[Point]) -> Result<Matrix3<f64>, HomographyError> {
    if src.len() != dst.len() {
        return Err(HomographyError::Degenerate(format!(
            "{} source points but {} destination points",
            src.len(),
            dst.len()
        )));
    }
    let n = src.len();
    if n < 4 {
        return Err(HomographyError::TooFewPoints { needed: 4, got: n });
    }

    let (t_src, src_n) = normalize_points(src);
    let (t_dst, dst_n) = normalize_points(dst);

    let mut a = DMatrix::<f64>::zeros(2 * n, 9);
    for (i, (s, d)) in src_n.iter().zip(dst_n.iter()).enumerate() {
        let (sx, sy) = (s[0], s[1]);
        let (dx, dy) = (d[0], d[1]);

        a[(2 * i, 3)] = -sx;
        a[(2 * i, 4)] = -sy;
        a[(2 * i, 5)] = -1.0;
        a[(2 * i, 6)] = dy * sx;
        a[(2 * i, 7)] = dy * sy;
        a[(2 * i, 8)] = dy;

        a[(2 * i + 1, 0)] = sx;
        a[(2 * i + 1, 1)] = sy;
        a[(2 * i + 1, 2)] = 1.0;
        a[(2 * i + 1, 6)] = -dx * sx;
        a[(2 * i + 1, 7)] = -dx * sy;
        a[(2 * i + 1, 8)] = -dx;
    }

    // Null vector of A = eigenvector of the smallest eigenvalue of AᵀA
    let eig = SymmetricEigen::new(a.transpose() * &a);
    let min_idx = eig
        .eigenvalues
        .iter()
        .enumerate()
        .min_by(|x, y| x.1.abs().total_cmp(&y.1.abs()))
        .map(|(i, _)| i)
        .unwrap_or(0);
    let v = eig.eigenvectors.column(min_idx);
    let h_norm = Matrix3::new(v[0], v[1], v[2], v[3], v[4], v[5], v[6], v[7], v[8]);

    let t_dst_inv = t_dst
        .try_inverse()
        .ok_or_else(|| HomographyError::Degenerate("destination points coincide".into()))?;
    let h = t_dst_inv * h_norm * t_src;

    let scale = h[(2, 2)];
    if scale.abs() < 1e-12 {
        return Err(HomographyError::Degenerate(
            "homography maps the origin to infinity".into(),
        ));
    }
    let h = h / scale;
    if h.iter().any(|v| !v.is_finite()) {
        return Err(HomographyError::Degenerate("non-finite coefficients".into()));
    }
    Ok(h)
}

/// RANSAC parameters.
#[derive(Debug, Clone)]
pub struct RansacConfig {
    pub max_iters: usize,
    /// Reprojection error in pixels below which a pair is an inlier
    pub inlier_threshold: f64,
    pub min_inliers: usize,
    pub seed: u64,
}

impl Default for RansacConfig {
    fn default() -> Self {
        Self {
            max_iters: 2000,
            inlier_threshold: 5.0,
            min_inliers: 6,
            seed: 0,
        }
    }
}

impl From<&crate::config::WarpConfig> for RansacConfig {
    fn from(config: &crate::config::WarpConfig) -> Self {
        Self {
            max_iters: config.ransac_max_iters,
            inlier_threshold: config.ransac_threshold,
            min_inliers: config.ransac_min_inliers,
            seed: config.ransac_seed,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RansacResult {
    pub h: Matrix3<f64>,
    pub inlier_mask: Vec<bool>,
    pub n_inliers: usize,
}

fn sample_distinct(rng: &mut StdRng, n: usize) -> Option<[usize; 4]> {
    let mut picked = [0usize; 4];
    for slot in 0..4 {
        let mut attempts = 0;
        loop {
            let candidate = rng.random_range(0..n);
            if !picked[..slot].contains(&candidate) {
                picked[slot] = candidate;
                break;
            }
            attempts += 1;
            if attempts > 100 {
                return None;
            }
        }
    }
    Some(picked)
}

fn inliers_of(h: &Matrix3<f64>, src: &[Point], dst: &[Point], threshold: f64) -> Vec<bool> {
    src.iter()
        .zip(dst.iter())
        .map(|(s, d)| reprojection_error(h, s, d) < threshold)
        .collect()
}

/// Fits a homography robust to outlier matches.
pub fn fit_ransac(
    src: &[Point],
    dst: &[Point],
    config: &RansacConfig,
) -> Result<RansacResult, HomographyError> {
    let n = src.len().min(dst.len());
    if n < 4 {
        return Err(HomographyError::TooFewPoints { needed: 4, got: n });
    }

    let mut rng = StdRng::seed_from_u64(config.seed);
    let mut best: Option<(Matrix3<f64>, Vec<bool>, usize)> = None;

    for _ in 0..config.max_iters {
        let Some(indices) = sample_distinct(&mut rng, n) else {
            break;
        };
        let s4: Vec<Point> = indices.iter().map(|&i| src[i]).collect();
        let d4: Vec<Point> = indices.iter().map(|&i| dst[i]).collect();

        let Ok(h) = estimate_dlt(&s4, &d4) else {
            continue;
        };

        let mask = inliers_of(&h, src, dst, config.inlier_threshold);
        let count = mask.iter().filter(|&&m| m).count();
        if best.as_ref().is_none_or(|(_, _, c)| count > *c) {
            let done = count * 10 > n * 9;
            best = Some((h, mask, count));
            if done {
                break;
            }
        }
    }

    let (best_h, best_mask, best_count) = best.ok_or_else(|| {
        HomographyError::Degenerate("every sample was degenerate".into())
    })?;
    if best_count < config.min_inliers {
        return Err(HomographyError::InsufficientInliers {
            needed: config.min_inliers,
            found: best_count,
        });
    }

    let (inlier_src, inlier_dst): (Vec<Point>, Vec<Point>) = src
        .iter()
        .zip(dst.iter())
        .zip(best_mask.iter())
        .filter(|(_, m)| **m)
        .map(|((s, d), _)| (*s, *d))
        .unzip();
    let h = estimate_dlt(&inlier_src, &inlier_dst).unwrap_or(best_h);

    let inlier_mask = inliers_of(&h, src, dst, config.inlier_threshold);
    let n_inliers = inlier_mask.iter().filter(|&&m| m).count();
    if n_inliers < config.min_inliers {
        return Err(HomographyError::InsufficientInliers {
            needed: config.min_inliers,
            found: n_inliers,
        });
    }

    Ok(RansacResult {
        h,
        inlier_mask,
        n_inliers,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_homography() -> Matrix3<f64> {
        Matrix3::new(0.95, 0.08, 12.0, -0.05, 1.02, -7.5, 1e-5, -2e-5, 1.0)
    }

    fn grid_points() -> Vec<Point> {
        let mut pts = Vec::new();
        for i in 0..6 {
            for j in 0..5 {
                pts.push([40.0 + 150.0 * i as f64, 30.0 + 170.0 * j as f64]);
            }
        }
        pts
    }

    #[test]
    fn test_dlt_recovers_exact_homography() {
        let h = sample_homography();
        let src = grid_points();
        let dst: Vec<Point> = src
            .iter()
            .map(|p| project(&h, p[0], p[1]).expect("finite projection"))
            .collect();

        let est = estimate_dlt(&src, &dst).expect("DLT should succeed");
        for (s, d) in src.iter().zip(dst.iter()) {
            assert!(reprojection_error(&est, s, d) < 1e-6);
        }
    }

    #[test]
    fn test_dlt_needs_four_points() {
        let pts = vec![[0.0, 0.0], [1.0, 0.0], [0.0, 1.0]];
        assert_eq!(
            estimate_dlt(&pts, &pts).unwrap_err(),
            HomographyError::TooFewPoints { needed: 4, got: 3 }
        );
    }

    #[test]
    fn test_ransac_ignores_outliers() {
        let h = sample_homography();
        let src = grid_points();
        let mut dst: Vec<Point> = src
            .iter()
            .map(|p| project(&h, p[0], p[1]).expect("finite projection"))
            .collect();
        // Corrupt a fifth of the correspondences
        for (k, d) in dst.iter_mut().enumerate() {
            if k % 5 == 0 {
                d[0] += 180.0;
                d[1] -= 95.0;
            }
        }

        let result = fit_ransac(&src, &dst, &RansacConfig::default()).expect("RANSAC should fit");
        assert_eq!(result.n_inliers, 24);
        for (k, inlier) in result.inlier_mask.iter().enumerate() {
            assert_eq!(*inlier, k % 5 != 0);
        }
        let probe = project(&result.h, 500.0, 400.0).expect("finite projection");
        let truth = project(&h, 500.0, 400.0).expect("finite projection");
        assert!((probe[0] - truth[0]).abs() < 0.5 && (probe[1] - truth[1]).abs() < 0.5);
    }

    #[test]
    fn test_ransac_rejects_incoherent_matches() {
        let src = grid_points();
        let dst: Vec<Point> = src
            .iter()
            .enumerate()
            .map(|(k, p)| {
                [
                    (p[1] * 7.3 + k as f64 * 131.0) % 900.0,
                    (p[0] * 3.1 + k as f64 * 57.0) % 700.0,
                ]
            })
            .collect();

        let config = RansacConfig {
            min_inliers: 12,
            ..Default::default()
        };
        let result = fit_ransac(&src, &dst, &config);
        assert!(matches!(
            result,
            Err(HomographyError::InsufficientInliers { .. })
        ));
    }
}
