//! Fiducial candidates and their assignment to template fiducials.

use image::{GrayImage, Luma};
use imageproc::region_labelling::{connected_components, Connectivity};

use crate::config::AnchorSearchConfig;
use crate::error::{OmrError, OmrResult};
use crate::homography;
use crate::template::{corner_indices, SheetTemplate};

/// One template fiducial located in the photo.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct AnchorMatch {
    /// Index into the template's fiducial list.
    pub fiducial_index: usize,
    pub template_xy: [f32; 2],
    /// Component centroid in photo pixels.
    pub photo_xy: [f64; 2],
    pub area_px: u32,
    /// 1 for a solid square, lower for elongated or hollow blobs.
    pub compactness: f32,
    /// Compactness × size agreement with the other anchors.
    pub confidence: f32,
    pub reprojection_error_px: f64,
}

/// Dark connected component that may be a fiducial.
#[derive(Debug, Clone)]
pub(crate) struct AnchorCandidate {
    pub centroid: [f64; 2],
    pub area: u32,
    pub compactness: f32,
}

#[derive(Debug, Clone)]
pub(crate) struct FiducialMatch {
    pub fiducial_index: usize,
    pub photo_xy: [f64; 2],
    pub area_px: u32,
    pub compactness: f32,
    pub confidence: f32,
}

#[derive(Debug, Clone, Copy)]
struct ComponentStats {
    area: u64,
    x_min: u32,
    y_min: u32,
    x_max: u32,
    y_max: u32,
    sx: f64,
    sy: f64,
    sxx: f64,
    syy: f64,
}

impl ComponentStats {
    fn new(x: u32, y: u32) -> Self {
        Self {
            area: 0,
            x_min: x,
            y_min: y,
            x_max: x,
            y_max: y,
            sx: 0.0,
            sy: 0.0,
            sxx: 0.0,
            syy: 0.0,
        }
    }

    fn add(&mut self, x: u32, y: u32) {
        let (fx, fy) = (x as f64, y as f64);
        self.area += 1;
        self.x_min = self.x_min.min(x);
        self.y_min = self.y_min.min(y);
        self.x_max = self.x_max.max(x);
        self.y_max = self.y_max.max(y);
        self.sx += fx;
        self.sy += fy;
        self.sxx += fx * fx;
        self.syy += fy * fy;
    }
}

/// Rotation-invariant squareness from second central moments.
///
/// For a solid square `(mu20 + mu02) / area = 1/6`, so `ratio = 1`.
fn compactness(s: &ComponentStats) -> f32 {
    let n = s.area as f64;
    let cx = s.sx / n;
    let cy = s.sy / n;
    let mu20 = s.sxx / n - cx * cx;
    let mu02 = s.syy / n - cy * cy;
    let ratio = 6.0 * (mu20 + mu02) / n;
    (1.0 - 2.0 * (ratio - 1.0).abs()).clamp(0.0, 1.0) as f32
}

/// Label dark components of the flattened photo and keep fiducial-like ones.
pub(crate) fn find_candidates(
    flat: &GrayImage,
    config: &AnchorSearchConfig,
) -> Vec<AnchorCandidate> {
    let (w, h) = flat.dimensions();
    if w < 3 || h < 3 {
        return Vec::new();
    }
    let level = imageproc::contrast::otsu_level(flat);
    let binary = GrayImage::from_fn(w, h, |x, y| {
        if flat.get_pixel(x, y)[0] <= level {
            Luma([255u8])
        } else {
            Luma([0u8])
        }
    });
    let labels = connected_components(&binary, Connectivity::Eight, Luma([0u8]));

    let mut stats: Vec<Option<ComponentStats>> = Vec::new();
    for (x, y, label) in labels.enumerate_pixels() {
        let id = label[0] as usize;
        if id == 0 {
            continue;
        }
        if stats.len() <= id {
            stats.resize(id + 1, None);
        }
        stats[id]
            .get_or_insert_with(|| ComponentStats::new(x, y))
            .add(x, y);
    }

    let image_area = w as f64 * h as f64;
    let min_area = (config.min_area_frac as f64 * image_area).max(4.0);
    let max_area = config.max_area_frac as f64 * image_area;

    stats
        .into_iter()
        .flatten()
        .filter(|s| {
            let touches_border = s.x_min == 0 || s.y_min == 0 || s.x_max == w - 1 || s.y_max == h - 1;
            let area = s.area as f64;
            let bw = (s.x_max - s.x_min + 1) as f32;
            let bh = (s.y_max - s.y_min + 1) as f32;
            let aspect = bw.max(bh) / bw.min(bh);
            !touches_border && area >= min_area && area <= max_area && aspect <= config.max_aspect
        })
        .map(|s| AnchorCandidate {
            centroid: [s.sx / s.area as f64, s.sy / s.area as f64],
            area: s.area as u32,
            compactness: compactness(&s),
        })
        .collect()
}

fn median(values: &mut [f64]) -> f64 {
    values.sort_by(f64::total_cmp);
    let n = values.len();
    if n % 2 == 1 {
        values[n / 2]
    } else {
        0.5 * (values[n / 2 - 1] + values[n / 2])
    }
}

/// Assign candidates to template fiducials.
///
/// The four outermost candidates take the four outermost fiducials; every
/// other fiducial is projected through the provisional corner homography
/// and takes the nearest unused candidate inside the gate.
pub(crate) fn match_fiducials(
    candidates: &[AnchorCandidate],
    template: &SheetTemplate,
    config: &AnchorSearchConfig,
) -> OmrResult<Vec<FiducialMatch>> {
    let too_few = |detail: &str| OmrError::AnchorDetection {
        found: candidates.len().min(4),
        needed: 4,
        detail: detail.to_string(),
    };
    if candidates.len() < 4 {
        return Err(too_few("too few fiducial candidates"));
    }
    let template_corners = template
        .corner_fiducials()
        .ok_or_else(|| OmrError::InvalidTemplate("fiducials span no corners".to_string()))?;
    let candidate_corners = corner_indices(
        candidates
            .iter()
            .map(|c| [c.centroid[0] as f32, c.centroid[1] as f32]),
    )
    .ok_or_else(|| too_few("candidates do not span four corners"))?;

    let fiducial_xy = |i: usize| {
        let p = template.fiducials[i].xy_px;
        [p[0] as f64, p[1] as f64]
    };
    let src: Vec<[f64; 2]> = template_corners.iter().map(|&i| fiducial_xy(i)).collect();
    let dst: Vec<[f64; 2]> = candidate_corners
        .iter()
        .map(|&i| candidates[i].centroid)
        .collect();
    let h0 = homography::estimate_homography_dlt(&src, &dst)?;

    let mut pairs: Vec<(usize, usize)> = template_corners
        .iter()
        .copied()
        .zip(candidate_corners.iter().copied())
        .collect();
    let mut used = vec![false; candidates.len()];
    for &ci in &candidate_corners {
        used[ci] = true;
    }

    // Photo pixels per canvas pixel, from the corner fiducials' areas.
    let corner_side_px: f64 = candidate_corners
        .iter()
        .map(|&i| (candidates[i].area as f64).sqrt())
        .sum::<f64>()
        / 4.0;
    let corner_side_canvas: f64 = template_corners
        .iter()
        .map(|&i| template.fiducials[i].size_px as f64)
        .sum::<f64>()
        / 4.0;
    let scale = corner_side_px / corner_side_canvas.max(1e-9);

    for (fi, fiducial) in template.fiducials.iter().enumerate() {
        if template_corners.contains(&fi) {
            continue;
        }
        let predicted = homography::project(&h0, fiducial_xy(fi));
        if !(predicted[0].is_finite() && predicted[1].is_finite()) {
            continue;
        }
        let gate = config.match_gate as f64 * fiducial.size_px as f64 * scale;
        let nearest = candidates
            .iter()
            .enumerate()
            .filter(|(ci, _)| !used[*ci])
            .map(|(ci, c)| {
                let d = ((c.centroid[0] - predicted[0]).powi(2)
                    + (c.centroid[1] - predicted[1]).powi(2))
                .sqrt();
                (ci, d)
            })
            .min_by(|a, b| a.1.total_cmp(&b.1));
        if let Some((ci, d)) = nearest {
            if d <= gate {
                used[ci] = true;
                pairs.push((fi, ci));
            }
        }
    }
    pairs.sort_by_key(|&(fi, _)| fi);

    let mut areas: Vec<f64> = pairs
        .iter()
        .map(|&(_, ci)| candidates[ci].area as f64)
        .collect();
    let median_area = median(&mut areas).max(1.0);

    Ok(pairs
        .into_iter()
        .map(|(fi, ci)| {
            let c = &candidates[ci];
            // Compare areas normalized by the printed fiducial size.
            let rel_size = template.fiducials[fi].size_px as f64 / corner_side_canvas.max(1e-9);
            let expected = median_area * rel_size * rel_size;
            let a = c.area as f64;
            let agreement = (a.min(expected) / a.max(expected)) as f32;
            FiducialMatch {
                fiducial_index: fi,
                photo_xy: c.centroid,
                area_px: c.area,
                compactness: c.compactness,
                confidence: c.compactness * agreement,
            }
        })
        .collect())
}
