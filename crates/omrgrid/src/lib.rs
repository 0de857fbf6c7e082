//! omrgrid: pure-Rust scoring pipeline for photographed OMR answer sheets.
//!
//! A phone photo of a bubble sheet goes in; an immutable, serializable audit
//! record comes out. The pipeline stages are:
//!
//! 1. **Decode** – bytes to grayscale pixels.
//! 2. **Geometry** – illumination flattening, fiducial detection and a
//!    homography that warps the photo onto the template canvas.
//! 3. **Grid** – per-row and per-column offset refinement of the bubble
//!    lattice with a spacing sanity check.
//! 4. **Classify** – fill ratio per bubble against the local paper level,
//!    then Empty / Ambiguous / Filled.
//! 5. **Resolve** – one answer per question: none, single, multi-mark or
//!    ambiguous.
//! 6. **Score** – verdicts against the exam set's key, per-subject and total
//!    scores under the configured multi-mark policy.
//! 7. **Audit** – record assembly plus optional normalized and overlay
//!    images handed to an [`ArtifactSink`].
//!
//! # Public API
//! - [`Evaluator`] as the primary entry point
//! - [`SheetTemplate`], [`AnswerKeySet`] and [`RunConfig`] as its inputs
//! - [`AuditRecord`] and the result structures it carries
//!
//! Stage internals (anchor search, lattice profiles, warping) are not part of
//! the public surface.

mod api;
mod audit;
mod classify;
mod config;
mod error;
mod geometry;
mod grid;
mod homography;
mod imaging;
mod pipeline;
mod render;
mod resolve;
mod scoring;
mod template;

#[cfg(test)]
mod test_utils;

pub use api::Evaluator;
pub use audit::{
    render_overlay, ArtifactKind, ArtifactSink, AuditRecord, FailureKind, FailureRecord,
    SheetOutcome, Stage, ThresholdSnapshot, Warning,
};
pub use classify::{classify_fill_ratio, BubbleCell, BubbleGrid, MarkState};
pub use config::{
    AnchorSearchConfig, BackgroundMode, FillSamplingConfig, GridSearchConfig,
    IlluminationConfig, MultiMarkPolicy, RunConfig,
};
pub use error::{GridAxis, OmrError, OmrResult};
pub use geometry::{AnchorMatch, GeometryReport, NormalizedSheetImage, RawSheetImage};
pub use grid::GridReport;
pub use homography::RansacHomographyConfig;
pub use pipeline::{CancelToken, SheetInput, SheetSource};
pub use render::{render_sheet, SheetMarks};
pub use resolve::{resolve_question, Resolution, ResolvedQuestion};
pub use scoring::{
    score_questions, AnswerKey, AnswerKeySet, FlagReason, QuestionResult, ScoreSummary,
    SheetFlag, SubjectScore, Verdict,
};
pub use template::{Choice, Fiducial, LatticeSpec, SheetTemplate, SubjectRange};
