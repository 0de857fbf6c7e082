//! Plane-to-plane homography between the template canvas and the photo.
//!
//! - Hartley-normalized DLT from ≥4 correspondences.
//! - Seeded RANSAC wrapper used when a template carries more than four
//!   fiducials.

use nalgebra::{DMatrix, Matrix3, Vector3};
use rand::prelude::*;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum HomographyError {
    #[error("too few correspondences: need {needed}, got {got}")]
    TooFewPoints { needed: usize, got: usize },
    #[error("numerical failure: {0}")]
    Numerical(String),
    #[error("insufficient inliers: need {needed}, found {found}")]
    InsufficientInliers { needed: usize, found: usize },
}

/// Map `[x, y]` through `h`. Returns NaN coordinates for points on the
/// line at infinity.
pub fn project(h: &Matrix3<f64>, xy: [f64; 2]) -> [f64; 2] {
    let p = h * Vector3::new(xy[0], xy[1], 1.0);
    if p[2].abs() < 1e-15 {
        return [f64::NAN, f64::NAN];
    }
    [p[0] / p[2], p[1] / p[2]]
}

/// Euclidean distance between `project(h, src)` and `dst`.
pub fn reprojection_error(h: &Matrix3<f64>, src: [f64; 2], dst: [f64; 2]) -> f64 {
    let p = project(h, src);
    ((p[0] - dst[0]).powi(2) + (p[1] - dst[1]).powi(2)).sqrt()
}

pub fn matrix3_to_array(m: &Matrix3<f64>) -> [[f64; 3]; 3] {
    [
        [m[(0, 0)], m[(0, 1)], m[(0, 2)]],
        [m[(1, 0)], m[(1, 1)], m[(1, 2)]],
        [m[(2, 0)], m[(2, 1)], m[(2, 2)]],
    ]
}

pub fn array_to_matrix3(a: &[[f64; 3]; 3]) -> Matrix3<f64> {
    Matrix3::new(
        a[0][0], a[0][1], a[0][2], a[1][0], a[1][1], a[1][2], a[2][0], a[2][1], a[2][2],
    )
}

/// Translate the centroid to the origin and scale the mean radius to sqrt(2).
fn hartley_normalize(pts: &[[f64; 2]]) -> (Matrix3<f64>, Vec<[f64; 2]>) {
    let n = pts.len() as f64;
    let cx = pts.iter().map(|p| p[0]).sum::<f64>() / n;
    let cy = pts.iter().map(|p| p[1]).sum::<f64>() / n;
    let mean_r = pts
        .iter()
        .map(|p| ((p[0] - cx).powi(2) + (p[1] - cy).powi(2)).sqrt())
        .sum::<f64>()
        / n;
    let s = if mean_r > 1e-15 {
        std::f64::consts::SQRT_2 / mean_r
    } else {
        1.0
    };

    let t = Matrix3::new(s, 0.0, -s * cx, 0.0, s, -s * cy, 0.0, 0.0, 1.0);
    let scaled = pts
        .iter()
        .map(|p| [s * (p[0] - cx), s * (p[1] - cy)])
        .collect();
    (t, scaled)
}

/// Estimate `H` with `dst ≈ project(H, src)` by the direct linear transform.
pub fn estimate_homography_dlt(
    src: &[[f64; 2]],
    dst: &[[f64; 2]],
) -> Result<Matrix3<f64>, HomographyError> {
    if src.len() != dst.len() {
        return Err(HomographyError::Numerical(format!(
            "correspondence length mismatch: {} vs {}",
            src.len(),
            dst.len()
        )));
    }
    let n = src.len();
    if n < 4 {
        return Err(HomographyError::TooFewPoints { needed: 4, got: n });
    }

    let (t_src, src_n) = hartley_normalize(src);
    let (t_dst, dst_n) = hartley_normalize(dst);

    let mut a = DMatrix::<f64>::zeros(2 * n, 9);
    for (i, (s, d)) in src_n.iter().zip(&dst_n).enumerate() {
        let [sx, sy] = *s;
        let [dx, dy] = *d;
        let r0 = 2 * i;
        let r1 = r0 + 1;

        a[(r0, 3)] = -sx;
        a[(r0, 4)] = -sy;
        a[(r0, 5)] = -1.0;
        a[(r0, 6)] = dy * sx;
        a[(r0, 7)] = dy * sy;
        a[(r0, 8)] = dy;

        a[(r1, 0)] = sx;
        a[(r1, 1)] = sy;
        a[(r1, 2)] = 1.0;
        a[(r1, 6)] = -dx * sx;
        a[(r1, 7)] = -dx * sy;
        a[(r1, 8)] = -dx;
    }

    // Null vector of A = eigenvector of AᵀA with the smallest eigenvalue.
    let eig = nalgebra::SymmetricEigen::new(a.transpose() * &a);
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
        .ok_or_else(|| HomographyError::Numerical("normalizer not invertible".into()))?;
    let h = t_dst_inv * h_norm * t_src;
    if !h.iter().all(|x| x.is_finite()) {
        return Err(HomographyError::Numerical("non-finite homography".into()));
    }

    let scale = h[(2, 2)];
    if scale.abs() < 1e-15 {
        Ok(h)
    } else {
        Ok(h / scale)
    }
}

/// RANSAC configuration for homography fitting.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct RansacHomographyConfig {
    pub max_iters: usize,
    /// Inlier threshold (reprojection error in photo pixels).
    pub inlier_threshold: f64,
    pub min_inliers: usize,
    pub seed: u64,
}

impl Default for RansacHomographyConfig {
    fn default() -> Self {
        Self {
            max_iters: 500,
            inlier_threshold: 6.0,
            min_inliers: 4,
            seed: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RansacHomographyResult {
    pub h: Matrix3<f64>,
    pub inlier_mask: Vec<bool>,
    pub n_inliers: usize,
    /// Reprojection error of every correspondence under `h`.
    pub errors: Vec<f64>,
}

fn sample_distinct4(rng: &mut StdRng, n: usize) -> [usize; 4] {
    let mut idx = [0usize; 4];
    let mut filled = 0;
    while filled < 4 {
        let candidate = rng.gen_range(0..n);
        if !idx[..filled].contains(&candidate) {
            idx[filled] = candidate;
            filled += 1;
        }
    }
    idx
}

/// Fit a homography with RANSAC, then refit on all inliers.
pub fn fit_homography_ransac(
    src: &[[f64; 2]],
    dst: &[[f64; 2]],
    config: &RansacHomographyConfig,
) -> Result<RansacHomographyResult, HomographyError> {
    let n = src.len().min(dst.len());
    if n < 4 {
        return Err(HomographyError::TooFewPoints { needed: 4, got: n });
    }

    let mut rng = StdRng::seed_from_u64(config.seed);
    let mut best_count = 0usize;
    let mut best_mask = vec![false; n];
    let mut best_h = Matrix3::identity();

    for _ in 0..config.max_iters {
        let idx = sample_distinct4(&mut rng, n);
        let s4: Vec<[f64; 2]> = idx.iter().map(|&i| src[i]).collect();
        let d4: Vec<[f64; 2]> = idx.iter().map(|&i| dst[i]).collect();
        let Ok(h) = estimate_homography_dlt(&s4, &d4) else {
            continue;
        };

        let mask: Vec<bool> = (0..n)
            .map(|i| reprojection_error(&h, src[i], dst[i]) < config.inlier_threshold)
            .collect();
        let count = mask.iter().filter(|&&m| m).count();
        if count > best_count {
            best_count = count;
            best_mask = mask;
            best_h = h;
            if count == n {
                break;
            }
        }
    }

    if best_count < config.min_inliers.max(4) {
        return Err(HomographyError::InsufficientInliers {
            needed: config.min_inliers.max(4),
            found: best_count,
        });
    }

    let (in_src, in_dst): (Vec<[f64; 2]>, Vec<[f64; 2]>) = (0..n)
        .filter(|&i| best_mask[i])
        .map(|i| (src[i], dst[i]))
        .unzip();
    let h = estimate_homography_dlt(&in_src, &in_dst).unwrap_or(best_h);

    let errors: Vec<f64> = (0..n).map(|i| reprojection_error(&h, src[i], dst[i])).collect();
    let inlier_mask: Vec<bool> = errors.iter().map(|&e| e < config.inlier_threshold).collect();
    let n_inliers = inlier_mask.iter().filter(|&&m| m).count();

    Ok(RansacHomographyResult {
        h,
        inlier_mask,
        n_inliers,
        errors,
    })
}
