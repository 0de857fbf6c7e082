//! Error taxonomy shared by loaders and pipeline stages.

use thiserror::Error;

use crate::audit::{FailureKind, Stage};
use crate::homography::HomographyError;

/// Lattice axis along which a spacing check failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GridAxis {
    Row,
    Column,
}

impl std::fmt::Display for GridAxis {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Row => f.write_str("row"),
            Self::Column => f.write_str("column"),
        }
    }
}

#[derive(Error, Debug)]
pub enum OmrError {
    #[error("image decode failed: {0}")]
    ImageDecode(#[from] image::ImageError),

    #[error("anchor detection failed: {found} confident anchors, need {needed} ({detail})")]
    AnchorDetection {
        found: usize,
        needed: usize,
        detail: String,
    },

    #[error("anchor homography failed: {0}")]
    Homography(#[from] HomographyError),

    #[error("grid spacing off along {axis} {index}: measured {measured_px:.1}px, expected {expected_px:.1}px")]
    GridSpacing {
        axis: GridAxis,
        index: usize,
        measured_px: f32,
        expected_px: f32,
    },

    #[error("grid location failed: {0}")]
    GridLocation(String),

    #[error("unknown exam set '{0}'")]
    UnknownExamSet(String),

    #[error("invalid template: {0}")]
    InvalidTemplate(String),

    #[error("invalid answer key: {0}")]
    InvalidAnswerKey(String),

    #[error("invalid run config: {0}")]
    InvalidConfig(String),

    #[error("invalid audit record: {0}")]
    InvalidRecord(String),

    #[error("sheet run cancelled before the {stage} stage")]
    Cancelled { stage: Stage },

    #[error("artifact store failed: {0}")]
    Artifact(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl OmrError {
    /// Classify a per-sheet failure for the audit record.
    ///
    /// Returns `None` for loader/configuration errors and cancellation, which
    /// never produce a record.
    pub fn failure_kind(&self) -> Option<(FailureKind, Stage)> {
        match self {
            Self::ImageDecode(_) => Some((FailureKind::ImageDecodeFailure, Stage::Decode)),
            Self::AnchorDetection { .. } | Self::Homography(_) => {
                Some((FailureKind::AnchorDetectionFailure, Stage::Geometry))
            }
            Self::GridSpacing { .. } | Self::GridLocation(_) => {
                Some((FailureKind::GridLocationFailure, Stage::Grid))
            }
            Self::UnknownExamSet(_) => Some((FailureKind::UnknownExamSet, Stage::Score)),
            _ => None,
        }
    }
}

pub type OmrResult<T> = Result<T, OmrError>;
