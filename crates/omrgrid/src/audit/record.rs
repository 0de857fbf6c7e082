use chrono::{DateTime, Utc};

use super::{FailureRecord, Warning};
use crate::config::{MultiMarkPolicy, RunConfig};
use crate::error::{OmrError, OmrResult};
use crate::geometry::GeometryReport;
use crate::grid::GridReport;
use crate::scoring::{QuestionResult, ScoreSummary};

const AUDIT_SCHEMA_V1: &str = "omrgrid.audit.v1";

/// Decision thresholds in effect for the run.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ThresholdSnapshot {
    pub low_threshold: f32,
    pub high_threshold: f32,
    pub closeness_tolerance: f32,
    pub consensus_margin: f32,
    pub multi_mark_policy: MultiMarkPolicy,
    pub anchor_confidence_min: f32,
    pub grid_tolerance_ratio: f32,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub ambiguous_flag_threshold: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub low_score_flag_threshold: Option<u32>,
}

impl From<&RunConfig> for ThresholdSnapshot {
    fn from(c: &RunConfig) -> Self {
        Self {
            low_threshold: c.low_threshold,
            high_threshold: c.high_threshold,
            closeness_tolerance: c.closeness_tolerance,
            consensus_margin: c.consensus_margin,
            multi_mark_policy: c.multi_mark_policy,
            anchor_confidence_min: c.anchor_confidence_min,
            grid_tolerance_ratio: c.grid_tolerance_ratio,
            ambiguous_flag_threshold: c.ambiguous_flag_threshold,
            low_score_flag_threshold: c.low_score_flag_threshold,
        }
    }
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SheetOutcome {
    Scored {
        question_results: Vec<QuestionResult>,
        score_summary: ScoreSummary,
    },
    Unresolvable {
        failure: FailureRecord,
    },
}

/// Self-contained evidence of how one sheet was scored.
///
/// Built once at the end of a run; read-only afterwards.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct AuditRecord {
    schema: String,
    sheet_id: String,
    exam_set_id: String,
    template_id: String,
    timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    normalized_image_ref: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    overlay_image_ref: Option<String>,
    outcome: SheetOutcome,
    thresholds: ThresholdSnapshot,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    geometry: Option<GeometryReport>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    grid: Option<GridReport>,
    #[serde(default)]
    warnings: Vec<Warning>,
}

impl AuditRecord {
    pub fn schema(&self) -> &str {
        &self.schema
    }

    pub fn sheet_id(&self) -> &str {
        &self.sheet_id
    }

    pub fn exam_set_id(&self) -> &str {
        &self.exam_set_id
    }

    pub fn template_id(&self) -> &str {
        &self.template_id
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn normalized_image_ref(&self) -> Option<&str> {
        self.normalized_image_ref.as_deref()
    }

    pub fn overlay_image_ref(&self) -> Option<&str> {
        self.overlay_image_ref.as_deref()
    }

    pub fn outcome(&self) -> &SheetOutcome {
        &self.outcome
    }

    pub fn thresholds(&self) -> &ThresholdSnapshot {
        &self.thresholds
    }

    pub fn geometry(&self) -> Option<&GeometryReport> {
        self.geometry.as_ref()
    }

    /// Row and column offsets applied to the lattice.
    pub fn grid(&self) -> Option<&GridReport> {
        self.grid.as_ref()
    }

    pub fn warnings(&self) -> &[Warning] {
        &self.warnings
    }

    pub fn is_scored(&self) -> bool {
        matches!(self.outcome, SheetOutcome::Scored { .. })
    }

    pub fn question_results(&self) -> Option<&[QuestionResult]> {
        match &self.outcome {
            SheetOutcome::Scored {
                question_results, ..
            } => Some(question_results),
            SheetOutcome::Unresolvable { .. } => None,
        }
    }

    pub fn score_summary(&self) -> Option<&ScoreSummary> {
        match &self.outcome {
            SheetOutcome::Scored { score_summary, .. } => Some(score_summary),
            SheetOutcome::Unresolvable { .. } => None,
        }
    }

    pub fn failure(&self) -> Option<&FailureRecord> {
        match &self.outcome {
            SheetOutcome::Unresolvable { failure } => Some(failure),
            SheetOutcome::Scored { .. } => None,
        }
    }

    pub fn to_json_string(&self) -> OmrResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json_str(data: &str) -> OmrResult<Self> {
        let record: Self = serde_json::from_str(data)?;
        if record.schema != AUDIT_SCHEMA_V1 {
            return Err(OmrError::InvalidRecord(format!(
                "unsupported audit schema '{}' (expected '{}')",
                record.schema, AUDIT_SCHEMA_V1
            )));
        }
        Ok(record)
    }
}

/// Accumulates record fields while a sheet moves through the stages.
#[derive(Debug)]
pub(crate) struct AuditRecordBuilder {
    sheet_id: String,
    exam_set_id: String,
    template_id: String,
    timestamp: DateTime<Utc>,
    thresholds: ThresholdSnapshot,
    normalized_image_ref: Option<String>,
    overlay_image_ref: Option<String>,
    geometry: Option<GeometryReport>,
    grid: Option<GridReport>,
    warnings: Vec<Warning>,
}

impl AuditRecordBuilder {
    pub(crate) fn new(
        sheet_id: &str,
        exam_set_id: &str,
        template_id: &str,
        config: &RunConfig,
    ) -> Self {
        Self {
            sheet_id: sheet_id.to_string(),
            exam_set_id: exam_set_id.to_string(),
            template_id: template_id.to_string(),
            timestamp: Utc::now(),
            thresholds: ThresholdSnapshot::from(config),
            normalized_image_ref: None,
            overlay_image_ref: None,
            geometry: None,
            grid: None,
            warnings: Vec::new(),
        }
    }

    #[cfg(test)]
    pub(crate) fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub(crate) fn geometry(&mut self, report: GeometryReport) {
        self.geometry = Some(report);
    }

    pub(crate) fn grid(&mut self, report: GridReport) {
        self.grid = Some(report);
    }

    pub(crate) fn warn(&mut self, warning: Warning) {
        self.warnings.push(warning);
    }

    pub(crate) fn extend_warnings(&mut self, warnings: impl IntoIterator<Item = Warning>) {
        self.warnings.extend(warnings);
    }

    pub(crate) fn normalized_image_ref(&mut self, reference: String) {
        self.normalized_image_ref = Some(reference);
    }

    pub(crate) fn overlay_image_ref(&mut self, reference: String) {
        self.overlay_image_ref = Some(reference);
    }

    fn finish(self, outcome: SheetOutcome) -> AuditRecord {
        AuditRecord {
            schema: AUDIT_SCHEMA_V1.to_string(),
            sheet_id: self.sheet_id,
            exam_set_id: self.exam_set_id,
            template_id: self.template_id,
            timestamp: self.timestamp,
            normalized_image_ref: self.normalized_image_ref,
            overlay_image_ref: self.overlay_image_ref,
            outcome,
            thresholds: self.thresholds,
            geometry: self.geometry,
            grid: self.grid,
            warnings: self.warnings,
        }
    }

    pub(crate) fn scored(
        self,
        question_results: Vec<QuestionResult>,
        score_summary: ScoreSummary,
    ) -> AuditRecord {
        self.finish(SheetOutcome::Scored {
            question_results,
            score_summary,
        })
    }

    pub(crate) fn unresolvable(self, failure: FailureRecord) -> AuditRecord {
        self.finish(SheetOutcome::Unresolvable { failure })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{FailureKind, Stage};
    use crate::resolve::{Resolution, ResolvedQuestion};
    use crate::scoring::{score_questions, AnswerKey};
    use crate::template::{Choice, SheetTemplate};
    use chrono::TimeZone;

    fn fixed_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 14, 9, 30, 0)
            .single()
            .expect("valid time")
    }

    #[test]
    fn scored_record_round_trips_through_json() {
        let t = SheetTemplate::default();
        let key = AnswerKey::from_letters(&"ABCD".repeat(25)).expect("key");
        let resolved: Vec<ResolvedQuestion> = (1..=100)
            .map(|q| ResolvedQuestion {
                question_id: q,
                resolution: match q % 5 {
                    0 => Resolution::None,
                    1 => Resolution::Ambiguous,
                    2 => Resolution::Multi(vec![
                        Choice::new(0).expect("a"),
                        Choice::new(3).expect("d"),
                    ]),
                    _ => Resolution::Single(Choice::new(q as usize % 4).expect("c")),
                },
                fill_ratios: vec![0.05, 0.93, 0.41, 0.0],
            })
            .collect();
        let config = RunConfig::default();
        let (results, warnings) =
            score_questions(&t, &key, &resolved, config.multi_mark_policy);
        let summary = ScoreSummary::reduce(&results, &t.subjects);

        let mut builder = AuditRecordBuilder::new("sheet-001", "SET-A", &t.name, &config)
            .at(fixed_time());
        builder.extend_warnings(warnings);
        builder.warn(Warning {
            stage: Stage::Classify,
            question_id: Some(7),
            message: "demoted".to_string(),
        });
        builder.overlay_image_ref("out/sheet-001.overlay.png".to_string());
        builder.grid(GridReport {
            row_offsets_px: vec![1.5; 20],
            column_offsets_px: vec![-2.0; 20],
            measured_rows: 18,
            measured_columns: 20,
        });
        let record = builder.scored(results.clone(), summary.clone());

        let json = record.to_json_string().expect("ser");
        assert!(json.contains("\"status\": \"scored\""));
        let back = AuditRecord::from_json_str(&json).expect("de");
        assert_eq!(back, record);
        assert_eq!(back.question_results(), Some(results.as_slice()));
        assert_eq!(back.score_summary(), Some(&summary));
        assert_eq!(back.timestamp(), fixed_time());
        assert_eq!(back.overlay_image_ref(), Some("out/sheet-001.overlay.png"));
        assert_eq!(back.normalized_image_ref(), None);
        assert_eq!(back.grid().map(|g| g.measured_rows), Some(18));
    }

    #[test]
    fn unresolvable_record_carries_only_the_failure() {
        let record = AuditRecordBuilder::new("s2", "SET-Z", "tpl", &RunConfig::default())
            .at(fixed_time())
            .unresolvable(FailureRecord {
                kind: FailureKind::UnknownExamSet,
                stage: Stage::Score,
                message: "unknown exam set 'SET-Z'".to_string(),
            });
        assert!(!record.is_scored());
        assert!(record.question_results().is_none());
        assert_eq!(
            record.failure().map(|f| f.kind),
            Some(FailureKind::UnknownExamSet)
        );
        let back = AuditRecord::from_json_str(&record.to_json_string().expect("ser")).expect("de");
        assert_eq!(back, record);
        assert_eq!(back.schema(), AUDIT_SCHEMA_V1);
    }
}
