//! Per-sheet audit trail: the immutable record, failure taxonomy, warnings,
//! the overlay image and the sink that stores image artifacts.

mod overlay;
mod record;

use image::DynamicImage;

use crate::error::OmrResult;

pub use overlay::render_overlay;
pub use record::{AuditRecord, SheetOutcome, ThresholdSnapshot};
pub(crate) use record::AuditRecordBuilder;

/// Pipeline stage, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Decode,
    Geometry,
    Grid,
    Classify,
    Resolve,
    Score,
    Audit,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Decode => "decode",
            Self::Geometry => "geometry",
            Self::Grid => "grid",
            Self::Classify => "classify",
            Self::Resolve => "resolve",
            Self::Score => "score",
            Self::Audit => "audit",
        };
        f.write_str(name)
    }
}

/// Why a sheet could not be scored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    ImageDecodeFailure,
    AnchorDetectionFailure,
    GridLocationFailure,
    UnknownExamSet,
    /// Any other error raised inside a sheet run.
    Internal,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct FailureRecord {
    pub kind: FailureKind,
    pub stage: Stage,
    pub message: String,
}

/// Non-fatal observation attached to a record.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Warning {
    pub stage: Stage,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub question_id: Option<u32>,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    NormalizedSheet,
    Overlay,
}

impl ArtifactKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NormalizedSheet => "normalized",
            Self::Overlay => "overlay",
        }
    }
}

/// Destination for image artifacts.
///
/// Returns an opaque reference (path, URL, key) stored in the audit record.
pub trait ArtifactSink: Send + Sync {
    fn store(&self, sheet_id: &str, kind: ArtifactKind, image: &DynamicImage) -> OmrResult<String>;
}
