//! Stage orchestration for one sheet.

use std::borrow::Cow;

use image::DynamicImage;

use super::{SheetInput, SheetSource};
use crate::audit::{
    render_overlay, ArtifactKind, ArtifactSink, AuditRecord, AuditRecordBuilder, FailureKind,
    FailureRecord, Stage, Warning,
};
use crate::classify::{classify_grid, BubbleGrid};
use crate::config::RunConfig;
use crate::error::OmrError;
use crate::geometry::{normalize_sheet, NormalizedSheetImage, RawSheetImage};
use crate::grid::locate_grid;
use crate::resolve::resolve_grid;
use crate::scoring::{score_questions, AnswerKeySet, QuestionResult, ScoreSummary};
use crate::template::SheetTemplate;

/// Immutable inputs shared by every sheet of a batch.
pub(crate) struct RunContext<'a> {
    pub template: &'a SheetTemplate,
    pub keys: &'a AnswerKeySet,
    pub config: &'a RunConfig,
    pub sink: Option<&'a dyn ArtifactSink>,
}

/// Why the stage chain stopped early.
enum Halt<E> {
    Cancelled(E),
    Failed(Stage, OmrError),
}

struct Scored {
    grid: BubbleGrid,
    results: Vec<QuestionResult>,
    summary: ScoreSummary,
}

impl<E> From<(Stage, OmrError)> for Halt<E> {
    fn from((stage, err): (Stage, OmrError)) -> Self {
        Halt::Failed(stage, err)
    }
}

trait AtStage<T> {
    fn at(self, stage: Stage) -> Result<T, (Stage, OmrError)>;
}

impl<T> AtStage<T> for Result<T, OmrError> {
    fn at(self, stage: Stage) -> Result<T, (Stage, OmrError)> {
        self.map_err(|e| (stage, e))
    }
}

fn run_stages<E>(
    input: &SheetInput,
    ctx: &RunContext<'_>,
    checkpoint: &mut impl FnMut(Stage) -> Result<(), E>,
    builder: &mut AuditRecordBuilder,
    normalized_slot: &mut Option<NormalizedSheetImage>,
) -> Result<Scored, Halt<E>> {
    checkpoint(Stage::Decode).map_err(Halt::Cancelled)?;
    let raw: Cow<'_, RawSheetImage> = match &input.source {
        SheetSource::Encoded(bytes) => {
            Cow::Owned(RawSheetImage::from_bytes(bytes).at(Stage::Decode)?)
        }
        SheetSource::Decoded(image) => Cow::Borrowed(image),
    };

    checkpoint(Stage::Geometry).map_err(Halt::Cancelled)?;
    let normalized = normalize_sheet(&raw, ctx.template, ctx.config).at(Stage::Geometry)?;
    builder.geometry(normalized.report.clone());
    let normalized = normalized_slot.insert(normalized);

    checkpoint(Stage::Grid).map_err(Halt::Cancelled)?;
    let located = locate_grid(&normalized.image, &ctx.template.lattice, ctx.config)
        .at(Stage::Grid)?;
    builder.grid(located.report.clone());

    checkpoint(Stage::Classify).map_err(Halt::Cancelled)?;
    let (grid, warnings) = classify_grid(
        &normalized.image,
        &located,
        &ctx.template.lattice,
        ctx.config,
    );
    builder.extend_warnings(warnings);

    checkpoint(Stage::Resolve).map_err(Halt::Cancelled)?;
    let resolved = resolve_grid(&grid, ctx.config.consensus_margin);

    checkpoint(Stage::Score).map_err(Halt::Cancelled)?;
    let key = ctx.keys.get(&input.exam_set_id).at(Stage::Score)?;
    let (results, warnings) =
        score_questions(ctx.template, key, &resolved, ctx.config.multi_mark_policy);
    builder.extend_warnings(warnings);
    let summary = ScoreSummary::reduce(&results, &ctx.template.subjects).with_sheet_flag(
        ctx.config.ambiguous_flag_threshold,
        ctx.config.low_score_flag_threshold,
    );
    if let Some(flag) = &summary.sheet_flag {
        tracing::warn!("sheet {} flagged for review: {:?}", input.sheet_id, flag);
    }

    Ok(Scored {
        grid,
        results,
        summary,
    })
}

fn failure_record(stage: Stage, err: &OmrError) -> FailureRecord {
    let (kind, stage) = err
        .failure_kind()
        .unwrap_or((FailureKind::Internal, stage));
    FailureRecord {
        kind,
        stage,
        message: err.to_string(),
    }
}

fn store_artifact(
    sink: &dyn ArtifactSink,
    sheet_id: &str,
    kind: ArtifactKind,
    image: &DynamicImage,
    builder: &mut AuditRecordBuilder,
) -> Option<String> {
    match sink.store(sheet_id, kind, image) {
        Ok(reference) => Some(reference),
        Err(e) => {
            tracing::warn!("sheet {}: storing {} image failed: {}", sheet_id, kind.as_str(), e);
            builder.warn(Warning {
                stage: Stage::Audit,
                question_id: None,
                message: format!("{} image not stored: {e}", kind.as_str()),
            });
            None
        }
    }
}

/// Run every stage for one sheet.
///
/// `checkpoint` is called before each stage; an `Err` from it abandons the
/// sheet without storing artifacts or producing a record. Every other
/// outcome, including fatal stage failures, yields exactly one record.
pub(crate) fn run_sheet<E>(
    input: &SheetInput,
    ctx: &RunContext<'_>,
    mut checkpoint: impl FnMut(Stage) -> Result<(), E>,
) -> Result<AuditRecord, E> {
    tracing::info!(
        "evaluating sheet {} (exam set {})",
        input.sheet_id,
        input.exam_set_id
    );
    let mut builder = AuditRecordBuilder::new(
        &input.sheet_id,
        &input.exam_set_id,
        &ctx.template.name,
        ctx.config,
    );
    let mut normalized = None;
    let outcome = match run_stages(input, ctx, &mut checkpoint, &mut builder, &mut normalized) {
        Ok(scored) => Ok(scored),
        Err(Halt::Failed(stage, err)) => Err((stage, err)),
        Err(Halt::Cancelled(e)) => {
            tracing::info!("sheet {} cancelled", input.sheet_id);
            return Err(e);
        }
    };

    checkpoint(Stage::Audit)?;
    if let (Some(sink), Some(n)) = (ctx.sink, normalized.as_ref()) {
        if ctx.config.retain_normalized_image {
            let image = DynamicImage::ImageLuma8(n.image.clone());
            if let Some(r) = store_artifact(
                sink,
                &input.sheet_id,
                ArtifactKind::NormalizedSheet,
                &image,
                &mut builder,
            ) {
                builder.normalized_image_ref(r);
            }
        }
    }

    match outcome {
        Ok(scored) => {
            if let (Some(sink), Some(n)) = (ctx.sink, normalized.as_ref()) {
                let overlay = render_overlay(&n.image, &scored.grid, &scored.results);
                if let Some(r) = store_artifact(
                    sink,
                    &input.sheet_id,
                    ArtifactKind::Overlay,
                    &DynamicImage::ImageRgb8(overlay),
                    &mut builder,
                ) {
                    builder.overlay_image_ref(r);
                }
            }
            let s = &scored.summary;
            tracing::info!(
                "sheet {} scored {}/{} ({} multi-mark, {} ambiguous{})",
                input.sheet_id,
                s.total,
                s.max_total,
                s.multi_mark_questions,
                s.ambiguous_questions,
                if s.review_required { ", review required" } else { "" }
            );
            Ok(builder.scored(scored.results, scored.summary))
        }
        Err((stage, err)) => {
            tracing::warn!(
                "sheet {} unresolvable at {} stage: {}",
                input.sheet_id,
                stage,
                err
            );
            Ok(builder.unresolvable(failure_record(stage, &err)))
        }
    }
}
