//! Geometry normalization: photo → canonical template frame.
//!
//! 1. Illumination flattening (optional Gaussian, local-mean division).
//! 2. Fiducial candidates from Otsu-binarized dark components.
//! 3. Corner assignment, extra-fiducial matching, anchor confidence.
//! 4. Canonical→photo homography (DLT or RANSAC) and inverse warp.

mod anchors;
mod warp;

use image::{DynamicImage, GrayImage};
use nalgebra::Matrix3;

use crate::config::RunConfig;
use crate::error::{OmrError, OmrResult};
use crate::homography::{self, RansacHomographyConfig};
use crate::imaging::normalize_illumination;
use crate::template::SheetTemplate;

pub use anchors::AnchorMatch;

/// Decoded grayscale photo of one answer sheet.
#[derive(Debug, Clone)]
pub struct RawSheetImage {
    gray: GrayImage,
}

impl RawSheetImage {
    /// Decode any format supported by the `image` crate.
    pub fn from_bytes(bytes: &[u8]) -> OmrResult<Self> {
        let decoded = image::load_from_memory(bytes)?;
        Ok(Self::from_dynamic(&decoded))
    }

    pub fn from_dynamic(image: &DynamicImage) -> Self {
        Self {
            gray: image.to_luma8(),
        }
    }

    pub fn from_gray(gray: GrayImage) -> Self {
        Self { gray }
    }

    pub fn as_gray(&self) -> &GrayImage {
        &self.gray
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.gray.dimensions()
    }
}

/// How the photo was registered to the template.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct GeometryReport {
    /// Photo size `[width, height]`.
    pub image_size: [u32; 2],
    /// Dark components that passed the area/aspect/border filters.
    pub n_candidates: usize,
    /// Matched fiducials, in template fiducial order.
    pub anchors: Vec<AnchorMatch>,
    /// Canonical canvas → photo homography (row-major).
    pub homography: [[f64; 3]; 3],
    pub mean_reprojection_error_px: f64,
    pub max_reprojection_error_px: f64,
    /// Template indices of matched fiducials that RANSAC left out of the fit.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rejected_fiducials: Vec<usize>,
}

/// Perspective-corrected sheet in the template's canonical pixel frame.
#[derive(Debug, Clone)]
pub struct NormalizedSheetImage {
    pub image: GrayImage,
    pub report: GeometryReport,
}

impl NormalizedSheetImage {
    pub fn homography(&self) -> Matrix3<f64> {
        homography::array_to_matrix3(&self.report.homography)
    }
}

const MIN_ANCHORS: usize = 4;

/// Register `raw` to `template` and resample it onto the canonical canvas.
pub(crate) fn normalize_sheet(
    raw: &RawSheetImage,
    template: &SheetTemplate,
    config: &RunConfig,
) -> OmrResult<NormalizedSheetImage> {
    let (w, h) = raw.dimensions();
    let flat = normalize_illumination(raw.as_gray(), &config.illumination);

    let candidates = anchors::find_candidates(&flat, &config.anchors);
    tracing::debug!("{} fiducial candidates in {}x{} photo", candidates.len(), w, h);

    let matches = anchors::match_fiducials(&candidates, template, &config.anchors)?;
    let confident: Vec<&anchors::FiducialMatch> = matches
        .iter()
        .filter(|m| m.confidence >= config.anchor_confidence_min)
        .collect();
    if confident.len() < MIN_ANCHORS {
        return Err(OmrError::AnchorDetection {
            found: confident.len(),
            needed: MIN_ANCHORS,
            detail: format!(
                "{} candidates, {} matched, confidence threshold {:.2}",
                candidates.len(),
                matches.len(),
                config.anchor_confidence_min
            ),
        });
    }

    let src: Vec<[f64; 2]> = confident
        .iter()
        .map(|m| {
            let f = &template.fiducials[m.fiducial_index];
            [f.xy_px[0] as f64, f.xy_px[1] as f64]
        })
        .collect();
    let dst: Vec<[f64; 2]> = confident.iter().map(|m| m.photo_xy).collect();
    let (h_mat, inliers) = fit_anchor_homography(&src, &dst, &config.anchors.ransac)?;
    let rejected_fiducials: Vec<usize> = confident
        .iter()
        .zip(&inliers)
        .filter_map(|(m, &inlier)| (!inlier).then_some(m.fiducial_index))
        .collect();
    check_canvas_maps_inside(&h_mat, template.canvas_px)?;

    let anchors: Vec<AnchorMatch> = confident
        .iter()
        .zip(&src)
        .map(|(m, s)| AnchorMatch {
            fiducial_index: m.fiducial_index,
            template_xy: template.fiducials[m.fiducial_index].xy_px,
            photo_xy: m.photo_xy,
            area_px: m.area_px,
            compactness: m.compactness,
            confidence: m.confidence,
            reprojection_error_px: homography::reprojection_error(&h_mat, *s, m.photo_xy),
        })
        .collect();
    let errors: Vec<f64> = anchors.iter().map(|a| a.reprojection_error_px).collect();
    let mean_err = errors.iter().sum::<f64>() / errors.len() as f64;
    let max_err = errors.iter().copied().fold(0.0f64, f64::max);
    tracing::debug!(
        "{} anchors, reprojection error mean={:.2}px max={:.2}px",
        anchors.len(),
        mean_err,
        max_err
    );

    let image = warp::warp_to_canvas(&flat, &h_mat, template.canvas_px);
    Ok(NormalizedSheetImage {
        image,
        report: GeometryReport {
            image_size: [w, h],
            n_candidates: candidates.len(),
            anchors,
            homography: homography::matrix3_to_array(&h_mat),
            mean_reprojection_error_px: mean_err,
            max_reprojection_error_px: max_err,
            rejected_fiducials,
        },
    })
}

/// Homography plus a per-anchor inlier flag.
fn fit_anchor_homography(
    src: &[[f64; 2]],
    dst: &[[f64; 2]],
    ransac: &RansacHomographyConfig,
) -> OmrResult<(Matrix3<f64>, Vec<bool>)> {
    if src.len() == MIN_ANCHORS {
        let h = homography::estimate_homography_dlt(src, dst)?;
        return Ok((h, vec![true; src.len()]));
    }
    let fit = homography::fit_homography_ransac(src, dst, ransac)?;
    tracing::debug!("anchor RANSAC kept {}/{} fiducials", fit.n_inliers, src.len());
    for (i, (&inlier, err)) in fit.inlier_mask.iter().zip(&fit.errors).enumerate() {
        if !inlier {
            tracing::warn!("anchor {} left out of the homography: {:.1}px off", i, err);
        }
    }
    Ok((fit.h, fit.inlier_mask))
}

/// Reject homographies that send a canvas corner to infinity.
fn check_canvas_maps_inside(h: &Matrix3<f64>, canvas_px: [u32; 2]) -> OmrResult<()> {
    let [cw, ch] = canvas_px.map(|v| v as f64);
    let corners = [[0.0, 0.0], [cw, 0.0], [cw, ch], [0.0, ch]];
    let mut signs = corners.iter().map(|&[x, y]| {
        let z = h[(2, 0)] * x + h[(2, 1)] * y + h[(2, 2)];
        z.signum()
    });
    let first = signs.next().unwrap_or(1.0);
    if first == 0.0 || signs.any(|s| s != first) {
        return Err(homography::HomographyError::Numerical(
            "canvas crosses the line at infinity".to_string(),
        )
        .into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::{render_sheet, SheetMarks};
    use crate::test_utils::{photograph, PhotoParams};
    use approx::assert_relative_eq;

    #[test]
    fn perspective_photo_is_registered_to_the_canvas() {
        let template = SheetTemplate::default();
        let canonical = render_sheet(&template, &SheetMarks::default());
        let params = PhotoParams::tilted();
        let photo = photograph(&canonical, &params);

        let normalized =
            normalize_sheet(&RawSheetImage::from_gray(photo), &template, &RunConfig::default())
                .expect("normalize");
        assert_eq!(normalized.report.anchors.len(), 4);
        assert!(normalized.report.max_reprojection_error_px < 1e-6);
        assert!(normalized.report.rejected_fiducials.is_empty());
        assert_eq!(normalized.image.dimensions(), (800, 1000));

        // The recovered mapping agrees with the true one to about a pixel.
        let h = normalized.homography();
        for p in [[110.0, 150.0], [700.0, 900.0], [400.0, 500.0]] {
            let got = homography::project(&h, p);
            let want = homography::project(&params.homography, p);
            assert_relative_eq!(got[0], want[0], epsilon = 1.5);
            assert_relative_eq!(got[1], want[1], epsilon = 1.5);
        }
    }

    #[test]
    fn misplaced_extra_anchor_is_reported_as_rejected() {
        let src = [
            [40.0, 40.0],
            [760.0, 40.0],
            [760.0, 960.0],
            [40.0, 960.0],
            [400.0, 40.0],
        ];
        let mut dst: Vec<[f64; 2]> = src
            .iter()
            .map(|&[x, y]| [x * 1.2 + 15.0, y * 1.2 + 8.0])
            .collect();
        dst[4] = [200.0, 600.0];
        let ransac = RansacHomographyConfig::default();

        let (h, inliers) = fit_anchor_homography(&src, &dst, &ransac).expect("fit");
        assert_eq!(inliers, [true, true, true, true, false]);
        let p = homography::project(&h, [400.0, 500.0]);
        assert_relative_eq!(p[0], 495.0, epsilon = 1e-6);
        assert_relative_eq!(p[1], 608.0, epsilon = 1e-6);

        let (_, four) = fit_anchor_homography(&src[..4], &dst[..4], &ransac).expect("direct fit");
        assert_eq!(four, [true; 4]);
    }

    #[test]
    fn blank_photo_fails_anchor_detection() {
        let template = SheetTemplate::default();
        let blank = GrayImage::from_pixel(900, 1100, image::Luma([220]));
        let err = normalize_sheet(&RawSheetImage::from_gray(blank), &template, &RunConfig::default())
            .expect_err("no anchors");
        assert!(matches!(err, OmrError::AnchorDetection { needed: 4, .. }));
    }

    #[test]
    fn corrupt_bytes_fail_to_decode() {
        let err = RawSheetImage::from_bytes(b"not an image").expect_err("decode");
        assert!(matches!(err, OmrError::ImageDecode(_)));
    }
}
