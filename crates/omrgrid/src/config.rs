//! Per-run configuration: every numeric threshold the pipeline uses.

use std::path::Path;

use crate::error::{OmrError, OmrResult};
use crate::homography::RansacHomographyConfig;

/// Scoring policy for questions resolved as multi-mark or ambiguous.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MultiMarkPolicy {
    /// Zero points; the question still counts toward the maximum.
    ZeroCredit,
    /// Zero points; the question is removed from the maximum.
    Exclude,
    /// Zero points provisionally; the sheet is routed to a human reviewer.
    #[default]
    ManualReview,
}

/// Source of the paper-white level used by the fill-ratio threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackgroundMode {
    /// One paper level per lattice row.
    #[default]
    PerRow,
    /// One paper level for the whole lattice.
    PerSheet,
}

/// Illumination flattening applied before anchor search and warping.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct IlluminationConfig {
    /// Box-filter radius for the local mean, as a fraction of the longest
    /// image side.
    pub background_radius_frac: f32,
    /// Gaussian pre-smoothing sigma (pixels); `0` disables it.
    pub denoise_sigma_px: f32,
}

impl Default for IlluminationConfig {
    fn default() -> Self {
        Self {
            background_radius_frac: 0.05,
            denoise_sigma_px: 0.8,
        }
    }
}

/// Fiducial candidate filtering and matching.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct AnchorSearchConfig {
    /// Minimum component area as a fraction of the image area.
    pub min_area_frac: f32,
    /// Maximum component area as a fraction of the image area.
    pub max_area_frac: f32,
    /// Maximum bounding-box aspect ratio of a candidate.
    pub max_aspect: f32,
    /// Gate for matching extra fiducials, in projected fiducial sizes.
    pub match_gate: f32,
    /// RANSAC used when more than four anchors are matched.
    pub ransac: RansacHomographyConfig,
}

impl Default for AnchorSearchConfig {
    fn default() -> Self {
        Self {
            min_area_frac: 5e-4,
            max_area_frac: 2e-2,
            max_aspect: 2.5,
            match_gate: 1.5,
            ransac: RansacHomographyConfig::default(),
        }
    }
}

/// Row/column offset search.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct GridSearchConfig {
    /// Half-width of the offset search, as a fraction of the pitch.
    pub search_frac: f32,
    /// Minimum mean darkness difference (gray levels per pixel) between the
    /// best and worst window before an offset counts as measured.
    pub min_profile_contrast: f32,
}

impl Default for GridSearchConfig {
    fn default() -> Self {
        Self {
            search_frac: 0.35,
            min_profile_contrast: 3.0,
        }
    }
}

/// Bubble interior sampling.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct FillSamplingConfig {
    /// Sampled disc radius as a fraction of the bubble radius; keeps the
    /// printed outline out of the sample.
    pub interior_ratio: f32,
    /// A pixel is dark when below `paper_level * ink_ratio`.
    pub ink_ratio: f32,
    /// Histogram percentile taken as the paper-white level.
    pub paper_percentile: f32,
    pub background: BackgroundMode,
}

impl Default for FillSamplingConfig {
    fn default() -> Self {
        Self {
            interior_ratio: 0.7,
            ink_ratio: 0.6,
            paper_percentile: 0.9,
            background: BackgroundMode::PerRow,
        }
    }
}

/// Top-level run configuration.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Fill ratio below which a bubble is Empty.
    pub low_threshold: f32,
    /// Fill ratio above which a bubble is Filled.
    pub high_threshold: f32,
    /// Filled bubbles of one question within this fill distance of the
    /// darkest one form a multi-mark.
    pub closeness_tolerance: f32,
    /// Margin by which a single Filled bubble must exceed every Ambiguous
    /// one of its question to resolve as a single answer.
    pub consensus_margin: f32,
    pub multi_mark_policy: MultiMarkPolicy,
    /// Minimum confidence for an anchor to count toward the four required.
    pub anchor_confidence_min: f32,
    /// Maximum relative deviation of measured lattice spacing.
    pub grid_tolerance_ratio: f32,
    /// Flag the whole sheet once this many questions are ambiguous.
    pub ambiguous_flag_threshold: Option<u32>,
    /// Flag the whole sheet when its total is at or below this score.
    pub low_score_flag_threshold: Option<u32>,
    /// Hand the normalized image to the artifact sink as well.
    pub retain_normalized_image: bool,
    pub illumination: IlluminationConfig,
    pub anchors: AnchorSearchConfig,
    pub grid: GridSearchConfig,
    pub sampling: FillSamplingConfig,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            low_threshold: 0.25,
            high_threshold: 0.55,
            closeness_tolerance: 0.15,
            consensus_margin: 0.3,
            multi_mark_policy: MultiMarkPolicy::default(),
            anchor_confidence_min: 0.5,
            grid_tolerance_ratio: 0.25,
            ambiguous_flag_threshold: None,
            low_score_flag_threshold: None,
            retain_normalized_image: false,
            illumination: IlluminationConfig::default(),
            anchors: AnchorSearchConfig::default(),
            grid: GridSearchConfig::default(),
            sampling: FillSamplingConfig::default(),
        }
    }
}

fn unit_interval(v: f32) -> bool {
    v.is_finite() && (0.0..=1.0).contains(&v)
}

impl RunConfig {
    pub fn from_json_file(path: &Path) -> OmrResult<Self> {
        let data = std::fs::read_to_string(path)?;
        Self::from_json_str(&data)
    }

    pub fn from_json_str(data: &str) -> OmrResult<Self> {
        let config: Self = serde_json::from_str(data)?;
        config.validate()?;
        Ok(config)
    }

    /// Check ranges and cross-field ordering.
    pub fn validate(&self) -> OmrResult<()> {
        let fail = |msg: String| Err(OmrError::InvalidConfig(msg));

        for (name, v) in [
            ("low_threshold", self.low_threshold),
            ("high_threshold", self.high_threshold),
            ("closeness_tolerance", self.closeness_tolerance),
            ("consensus_margin", self.consensus_margin),
            ("anchor_confidence_min", self.anchor_confidence_min),
            ("grid_tolerance_ratio", self.grid_tolerance_ratio),
            ("sampling.interior_ratio", self.sampling.interior_ratio),
            ("sampling.ink_ratio", self.sampling.ink_ratio),
            ("sampling.paper_percentile", self.sampling.paper_percentile),
            ("grid.search_frac", self.grid.search_frac),
            ("illumination.background_radius_frac", self.illumination.background_radius_frac),
        ] {
            if !unit_interval(v) {
                return fail(format!("{name} must lie in [0, 1], got {v}"));
            }
        }
        if self.low_threshold > self.high_threshold {
            return fail(format!(
                "low_threshold ({}) must not exceed high_threshold ({})",
                self.low_threshold, self.high_threshold
            ));
        }
        if self.sampling.interior_ratio <= 0.0 {
            return fail("sampling.interior_ratio must be > 0".to_string());
        }
        if !self.illumination.denoise_sigma_px.is_finite() || self.illumination.denoise_sigma_px < 0.0
        {
            return fail("illumination.denoise_sigma_px must be finite and >= 0".to_string());
        }
        let a = &self.anchors;
        if !(a.min_area_frac > 0.0 && a.min_area_frac < a.max_area_frac && a.max_area_frac <= 1.0) {
            return fail("anchors area fractions must satisfy 0 < min < max <= 1".to_string());
        }
        if !(a.max_aspect >= 1.0 && a.match_gate > 0.0) {
            return fail("anchors.max_aspect must be >= 1 and match_gate > 0".to_string());
        }
        if !(self.grid.min_profile_contrast.is_finite() && self.grid.min_profile_contrast >= 0.0) {
            return fail("grid.min_profile_contrast must be finite and >= 0".to_string());
        }
        if self.ambiguous_flag_threshold == Some(0) {
            return fail("ambiguous_flag_threshold must be >= 1".to_string());
        }
        Ok(())
    }
}
