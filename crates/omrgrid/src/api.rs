//! High-level evaluation API.
//!
//! [`Evaluator`] is the primary entry point for scoring answer sheets.
//! It owns one template, the answer keys for every exam set printed on
//! that template, and the run configuration.

use std::convert::Infallible;
use std::sync::Arc;

use rayon::prelude::*;

use crate::audit::{ArtifactSink, AuditRecord};
use crate::config::RunConfig;
use crate::error::{OmrError, OmrResult};
use crate::pipeline::{run_sheet, CancelToken, RunContext, SheetInput};
use crate::scoring::AnswerKeySet;
use crate::template::SheetTemplate;

/// Primary evaluation interface.
///
/// Create once, evaluate many sheets. Every sheet that runs to completion
/// yields exactly one [`AuditRecord`], scored or unresolvable.
///
/// # Examples
///
/// ```no_run
/// use omrgrid::{AnswerKey, AnswerKeySet, Evaluator, SheetInput, SheetTemplate};
///
/// let keys = AnswerKeySet::new()
///     .with_set("SET-A", AnswerKey::from_letters(&"ABCD".repeat(25)).unwrap());
/// let evaluator = Evaluator::new(SheetTemplate::default(), keys).unwrap();
/// let bytes = std::fs::read("sheet-001.png").unwrap();
/// let record = evaluator.evaluate(&SheetInput::from_bytes("sheet-001", "SET-A", bytes));
/// println!("{}", record.to_json_string().unwrap());
/// ```
#[derive(Clone)]
pub struct Evaluator {
    template: Arc<SheetTemplate>,
    keys: Arc<AnswerKeySet>,
    config: RunConfig,
    sink: Option<Arc<dyn ArtifactSink>>,
}

impl std::fmt::Debug for Evaluator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Evaluator")
            .field("template", &self.template.name)
            .field("exam_sets", &self.keys.len())
            .field("config", &self.config)
            .field("sink", &self.sink.is_some())
            .finish()
    }
}

impl Evaluator {
    /// Create an evaluator with the default run configuration.
    pub fn new(template: SheetTemplate, keys: AnswerKeySet) -> OmrResult<Self> {
        Self::with_config(template, keys, RunConfig::default())
    }

    /// Create an evaluator with an explicit run configuration.
    ///
    /// Fails when the template or configuration is invalid, or a key names
    /// a question or choice the template does not have.
    pub fn with_config(
        template: SheetTemplate,
        keys: AnswerKeySet,
        config: RunConfig,
    ) -> OmrResult<Self> {
        Self::from_shared(Arc::new(template), Arc::new(keys), config)
    }

    /// Like [`Evaluator::with_config`], sharing already-loaded inputs.
    pub fn from_shared(
        template: Arc<SheetTemplate>,
        keys: Arc<AnswerKeySet>,
        config: RunConfig,
    ) -> OmrResult<Self> {
        template.validate()?;
        config.validate()?;
        keys.validate_for(&template)?;
        tracing::debug!(
            "evaluator ready: template '{}', {} exam set(s), policy {:?}",
            template.name,
            keys.len(),
            config.multi_mark_policy
        );
        Ok(Self {
            template,
            keys,
            config,
            sink: None,
        })
    }

    /// Store normalized and overlay images through `sink`.
    pub fn with_artifact_sink(mut self, sink: Arc<dyn ArtifactSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Copy of this evaluator with a different key set.
    ///
    /// Sheets already evaluated keep the records they were given.
    pub fn with_answer_keys(&self, keys: AnswerKeySet) -> OmrResult<Self> {
        keys.validate_for(&self.template)?;
        Ok(Self {
            keys: Arc::new(keys),
            ..self.clone()
        })
    }

    pub fn template(&self) -> &SheetTemplate {
        &self.template
    }

    pub fn keys(&self) -> &AnswerKeySet {
        &self.keys
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    fn context(&self) -> RunContext<'_> {
        RunContext {
            template: &self.template,
            keys: &self.keys,
            config: &self.config,
            sink: self.sink.as_deref(),
        }
    }

    /// Evaluate one sheet.
    pub fn evaluate(&self, input: &SheetInput) -> AuditRecord {
        match run_sheet(input, &self.context(), |_| Ok::<(), Infallible>(())) {
            Ok(record) => record,
            Err(never) => match never {},
        }
    }

    /// Evaluate one sheet, abandoning it at the next stage boundary once
    /// `cancel` fires.
    ///
    /// A cancelled sheet stores no artifacts and produces no record.
    pub fn evaluate_cancellable(
        &self,
        input: &SheetInput,
        cancel: &CancelToken,
    ) -> OmrResult<AuditRecord> {
        run_sheet(input, &self.context(), |stage| {
            if cancel.is_cancelled() {
                Err(OmrError::Cancelled { stage })
            } else {
                Ok(())
            }
        })
    }

    /// Evaluate sheets in parallel; records come back in input order.
    pub fn evaluate_batch(&self, inputs: &[SheetInput]) -> Vec<AuditRecord> {
        tracing::info!("evaluating batch of {} sheet(s)", inputs.len());
        inputs.par_iter().map(|input| self.evaluate(input)).collect()
    }

    /// Parallel [`Evaluator::evaluate_cancellable`], in input order.
    pub fn evaluate_batch_cancellable(
        &self,
        inputs: &[SheetInput],
        cancel: &CancelToken,
    ) -> Vec<OmrResult<AuditRecord>> {
        inputs
            .par_iter()
            .map(|input| self.evaluate_cancellable(input, cancel))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use image::DynamicImage;

    use super::*;
    use crate::audit::{ArtifactKind, FailureKind, Stage};
    use crate::config::MultiMarkPolicy;
    use crate::geometry::RawSheetImage;
    use crate::render::{render_sheet, SheetMarks};
    use crate::scoring::{AnswerKey, FlagReason, SheetFlag, Verdict};
    use crate::template::Choice;
    use crate::test_utils::{encode_png, photograph, PhotoParams};

    #[derive(Default)]
    struct MemorySink {
        stored: Mutex<Vec<(String, ArtifactKind, (u32, u32))>>,
    }

    impl ArtifactSink for MemorySink {
        fn store(
            &self,
            sheet_id: &str,
            kind: ArtifactKind,
            image: &DynamicImage,
        ) -> OmrResult<String> {
            let mut stored = self.stored.lock().expect("lock");
            stored.push((sheet_id.to_string(), kind, (image.width(), image.height())));
            Ok(format!("mem://{sheet_id}/{}", kind.as_str()))
        }
    }

    struct FailingSink;

    impl ArtifactSink for FailingSink {
        fn store(&self, _: &str, _: ArtifactKind, _: &DynamicImage) -> OmrResult<String> {
            Err(OmrError::Artifact("disk full".to_string()))
        }
    }

    fn choice(letter: char) -> Choice {
        Choice::from_letter(letter).expect("letter")
    }

    fn keys() -> AnswerKeySet {
        AnswerKeySet::new().with_set(
            "SET-A",
            AnswerKey::from_letters(&"ABCD".repeat(25)).expect("key"),
        )
    }

    fn marked_sheet(template: &SheetTemplate) -> image::GrayImage {
        // Key cycles A, B, C, D: Q1 right, Q2 blank, Q3 double, Q4 right,
        // Q6 wrong.
        let marks = SheetMarks::new()
            .mark(1, choice('A'))
            .mark(3, choice('A'))
            .mark(3, choice('B'))
            .mark(4, choice('D'))
            .mark(6, choice('A'));
        render_sheet(template, &marks)
    }

    fn zero_credit() -> RunConfig {
        RunConfig {
            multi_mark_policy: MultiMarkPolicy::ZeroCredit,
            ..RunConfig::default()
        }
    }

    #[test]
    fn batch_scores_photographed_sheets_and_isolates_failures() {
        let template = SheetTemplate::default();
        let photo = photograph(&marked_sheet(&template), &PhotoParams::tilted());
        let png = encode_png(&photo);
        let evaluator = Evaluator::with_config(template, keys(), zero_credit()).expect("evaluator");

        let inputs = vec![
            SheetInput::from_bytes("s1", "SET-A", png.clone()),
            SheetInput::from_bytes("s2", "SET-Z", png),
            SheetInput::from_bytes("s3", "SET-A", b"not an image".to_vec()),
        ];
        let records = evaluator.evaluate_batch(&inputs);
        assert_eq!(records.len(), 3);
        let ids: Vec<&str> = records.iter().map(|r| r.sheet_id()).collect();
        assert_eq!(ids, ["s1", "s2", "s3"]);

        let scored = &records[0];
        assert!(scored.is_scored(), "{:?}", scored.failure());
        let results = scored.question_results().expect("results");
        assert_eq!(results.len(), 100);
        let q = |id: u32| &results[id as usize - 1];
        assert_eq!(q(1).verdict, Verdict::Correct);
        assert_eq!(q(1).points, 1);
        assert_eq!(q(2).verdict, Verdict::Unattempted);
        assert_eq!(q(3).verdict, Verdict::Flagged);
        assert_eq!(q(3).flag, Some(FlagReason::MultiMark));
        assert_eq!(q(3).points, 0);
        assert!(!q(3).review_required);
        assert_eq!(q(4).verdict, Verdict::Correct);
        assert_eq!(q(6).verdict, Verdict::Incorrect);

        let summary = scored.score_summary().expect("summary");
        assert_eq!(summary.total, 2);
        assert_eq!(summary.max_total, 100);
        assert_eq!(summary.multi_mark_questions, 1);
        assert!(!summary.review_required);
        assert_eq!(
            summary.subjects.iter().map(|s| s.score).sum::<u32>(),
            summary.total
        );
        assert_eq!(summary.subject("Python").map(|s| s.score), Some(2));
        assert!(scored.geometry().is_some());
        assert_eq!(scored.thresholds().multi_mark_policy, MultiMarkPolicy::ZeroCredit);

        let unknown = records[1].failure().expect("failure");
        assert_eq!(unknown.kind, FailureKind::UnknownExamSet);
        assert_eq!(unknown.stage, Stage::Score);
        assert!(records[1].geometry().is_some());

        let corrupt = records[2].failure().expect("failure");
        assert_eq!(corrupt.kind, FailureKind::ImageDecodeFailure);
        assert_eq!(corrupt.stage, Stage::Decode);
        assert!(records[2].geometry().is_none());
    }

    #[test]
    fn manual_review_default_routes_double_marks() {
        let template = SheetTemplate::default();
        let raw = RawSheetImage::from_gray(marked_sheet(&template));
        let evaluator = Evaluator::new(template, keys()).expect("evaluator");
        let record = evaluator.evaluate(&SheetInput::from_image("s1", "SET-A", raw));
        let summary = record.score_summary().expect("scored");
        assert!(summary.review_required);
        assert_eq!(summary.max_total, 100);
        let results = record.question_results().expect("results");
        assert!(results[2].review_required);
        assert_eq!(
            results[2].resolution,
            crate::resolve::Resolution::Multi(vec![choice('A'), choice('B')])
        );
    }

    #[test]
    fn full_mark_with_a_lighter_second_mark_is_not_credited() {
        let template = SheetTemplate::default();
        let marks = SheetMarks::new()
            .mark(1, choice('A'))
            .mark_partial(1, choice('B'), 0.6);
        let raw = RawSheetImage::from_gray(render_sheet(&template, &marks));
        let evaluator = Evaluator::with_config(template, keys(), zero_credit()).expect("evaluator");

        let record = evaluator.evaluate(&SheetInput::from_image("s12", "SET-A", raw));
        let q1 = &record.question_results().expect("scored")[0];
        assert!(q1.fill_ratios[1] > evaluator.config().low_threshold, "{:?}", q1.fill_ratios);
        assert_eq!(q1.resolution, crate::resolve::Resolution::Ambiguous);
        assert_eq!(q1.verdict, Verdict::Flagged);
        assert_eq!(q1.points, 0);
        assert_eq!(record.score_summary().map(|s| s.total), Some(0));
    }

    #[test]
    fn artifacts_go_through_the_sink() {
        let template = SheetTemplate::default();
        let raw = RawSheetImage::from_gray(marked_sheet(&template));
        let config = RunConfig {
            retain_normalized_image: true,
            ..RunConfig::default()
        };
        let sink = Arc::new(MemorySink::default());
        let evaluator = Evaluator::with_config(template, keys(), config)
            .expect("evaluator")
            .with_artifact_sink(sink.clone());

        let record = evaluator.evaluate(&SheetInput::from_image("s7", "SET-A", raw));
        assert!(record.is_scored());
        assert_eq!(record.normalized_image_ref(), Some("mem://s7/normalized"));
        assert_eq!(record.overlay_image_ref(), Some("mem://s7/overlay"));
        let stored = sink.stored.lock().expect("lock");
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[0].1, ArtifactKind::NormalizedSheet);
        assert_eq!(stored[1].1, ArtifactKind::Overlay);
        assert_eq!(stored[1].2, (800, 1000));
    }

    #[test]
    fn sink_failure_becomes_a_warning() {
        let template = SheetTemplate::default();
        let raw = RawSheetImage::from_gray(marked_sheet(&template));
        let evaluator = Evaluator::new(template, keys())
            .expect("evaluator")
            .with_artifact_sink(Arc::new(FailingSink));
        let record = evaluator.evaluate(&SheetInput::from_image("s8", "SET-A", raw));
        assert!(record.is_scored());
        assert_eq!(record.overlay_image_ref(), None);
        let audit_warnings: Vec<_> = record
            .warnings()
            .iter()
            .filter(|w| w.stage == Stage::Audit)
            .collect();
        assert_eq!(audit_warnings.len(), 1);
        assert!(audit_warnings[0].message.contains("disk full"));
    }

    #[test]
    fn cancelled_sheet_yields_no_record_and_no_artifacts() {
        let template = SheetTemplate::default();
        let raw = RawSheetImage::from_gray(marked_sheet(&template));
        let sink = Arc::new(MemorySink::default());
        let evaluator = Evaluator::new(template, keys())
            .expect("evaluator")
            .with_artifact_sink(sink.clone());
        let cancel = CancelToken::new();
        cancel.cancel();

        let input = SheetInput::from_image("s9", "SET-A", raw);
        let err = evaluator
            .evaluate_cancellable(&input, &cancel)
            .expect_err("cancelled");
        assert!(matches!(err, OmrError::Cancelled { stage: Stage::Decode }));
        let batch = evaluator.evaluate_batch_cancellable(&[input.clone(), input], &cancel);
        assert!(batch.iter().all(|r| r.is_err()));
        assert!(sink.stored.lock().expect("lock").is_empty());
    }

    #[test]
    fn uncancelled_token_matches_plain_evaluation() {
        let template = SheetTemplate::default();
        let raw = RawSheetImage::from_gray(marked_sheet(&template));
        let evaluator = Evaluator::new(template, keys()).expect("evaluator");
        let input = SheetInput::from_image("s10", "SET-A", raw);
        let record = evaluator
            .evaluate_cancellable(&input, &CancelToken::new())
            .expect("not cancelled");
        let plain = evaluator.evaluate(&input);
        assert_eq!(record.question_results(), plain.question_results());
    }

    #[test]
    fn answer_keys_can_be_swapped() {
        let template = SheetTemplate::default();
        let raw = RawSheetImage::from_gray(marked_sheet(&template));
        let evaluator = Evaluator::new(template, keys()).expect("evaluator");

        let mut bad = AnswerKey::new();
        bad.insert(101, vec![choice('A')]).expect("insert");
        let err = evaluator
            .with_answer_keys(AnswerKeySet::new().with_set("SET-A", bad))
            .expect_err("question 101 is off the sheet");
        assert!(matches!(err, OmrError::InvalidAnswerKey(_)));

        let swapped = evaluator
            .with_answer_keys(AnswerKeySet::new().with_set(
                "SET-B",
                AnswerKey::from_letters(&"A".repeat(100)).expect("key"),
            ))
            .expect("valid keys");
        let input = SheetInput::from_image("s11", "SET-A", raw);
        assert_eq!(
            swapped.evaluate(&input).failure().map(|f| f.kind),
            Some(FailureKind::UnknownExamSet)
        );
        // The original evaluator is untouched.
        assert!(evaluator.evaluate(&input).is_scored());
    }

    #[test]
    fn invalid_config_is_rejected() {
        let config = RunConfig {
            low_threshold: 0.8,
            high_threshold: 0.2,
            ..RunConfig::default()
        };
        let err = Evaluator::with_config(SheetTemplate::default(), keys(), config)
            .expect_err("inverted thresholds");
        assert!(matches!(err, OmrError::InvalidConfig(_)));
    }

    #[test]
    fn template_edited_in_code_is_validated() {
        let mut template = SheetTemplate::default();
        template.subjects.truncate(2);
        let err = Evaluator::new(template.clone(), keys())
            .expect_err("questions 41..=100 have no subject");
        assert!(matches!(err, OmrError::InvalidTemplate(_)));

        let shared = Evaluator::from_shared(
            Arc::new(template),
            Arc::new(keys()),
            RunConfig::default(),
        );
        let err = shared.expect_err("shared inputs are checked too");
        assert!(matches!(err, OmrError::InvalidTemplate(_)));
    }

    #[test]
    fn low_scoring_sheet_is_flagged_for_review() {
        let template = SheetTemplate::default();
        let raw = RawSheetImage::from_gray(marked_sheet(&template));
        let config = RunConfig {
            ambiguous_flag_threshold: Some(3),
            low_score_flag_threshold: Some(10),
            ..zero_credit()
        };
        let evaluator = Evaluator::with_config(template, keys(), config).expect("evaluator");
        let record = evaluator.evaluate(&SheetInput::from_image("s13", "SET-A", raw));
        let summary = record.score_summary().expect("scored");
        assert_eq!(summary.total, 2);
        assert_eq!(
            summary.sheet_flag,
            Some(SheetFlag::LowScore {
                total: 2,
                threshold: 10
            })
        );
        assert_eq!(record.thresholds().low_score_flag_threshold, Some(10));
        assert_eq!(record.grid().map(|g| g.row_offsets_px.len()), Some(20));
    }

    #[test]
    fn ambiguous_marks_flag_the_sheet_before_its_score() {
        let template = SheetTemplate::default();
        let marks = SheetMarks::new()
            .mark(1, choice('A'))
            .mark_partial(2, choice('B'), 0.4);
        let raw = RawSheetImage::from_gray(render_sheet(&template, &marks));
        let config = RunConfig {
            ambiguous_flag_threshold: Some(1),
            low_score_flag_threshold: Some(10),
            ..RunConfig::default()
        };
        let evaluator = Evaluator::with_config(template, keys(), config).expect("evaluator");
        let record = evaluator.evaluate(&SheetInput::from_image("s14", "SET-A", raw));
        let summary = record.score_summary().expect("scored");
        assert_eq!(summary.ambiguous_questions, 1);
        assert_eq!(
            summary.sheet_flag,
            Some(SheetFlag::TooManyAmbiguous {
                ambiguous_questions: 1,
                threshold: 1
            })
        );
    }
}
