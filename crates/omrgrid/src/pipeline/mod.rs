//! Per-sheet pipeline glue.
//!
//! This layer wires the stages together and owns stage boundaries:
//! decode → geometry → grid → classify → resolve → score → audit.
//!
//! Algorithmic work lives in `crate::geometry`, `crate::grid`,
//! `crate::classify`, `crate::resolve` and `crate::scoring`; the pipeline
//! decides what a failure at each boundary turns into.

mod run;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::geometry::RawSheetImage;

pub(crate) use run::{run_sheet, RunContext};

/// Sheet pixels, encoded or already decoded.
#[derive(Debug, Clone)]
pub enum SheetSource {
    /// Encoded file contents (PNG, JPEG, ...); decoded inside the run.
    Encoded(Vec<u8>),
    Decoded(RawSheetImage),
}

/// One sheet to evaluate.
#[derive(Debug, Clone)]
pub struct SheetInput {
    pub sheet_id: String,
    pub exam_set_id: String,
    pub source: SheetSource,
}

impl SheetInput {
    pub fn from_bytes(
        sheet_id: impl Into<String>,
        exam_set_id: impl Into<String>,
        bytes: Vec<u8>,
    ) -> Self {
        Self {
            sheet_id: sheet_id.into(),
            exam_set_id: exam_set_id.into(),
            source: SheetSource::Encoded(bytes),
        }
    }

    pub fn from_image(
        sheet_id: impl Into<String>,
        exam_set_id: impl Into<String>,
        image: RawSheetImage,
    ) -> Self {
        Self {
            sheet_id: sheet_id.into(),
            exam_set_id: exam_set_id.into(),
            source: SheetSource::Decoded(image),
        }
    }
}

/// Shared cancellation flag, checked at every stage boundary.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}
