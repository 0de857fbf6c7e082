//! Answer keys, per-question verdicts and score aggregation.

use std::collections::BTreeMap;
use std::path::Path;

use crate::audit::{Stage, Warning};
use crate::config::MultiMarkPolicy;
use crate::error::{OmrError, OmrResult};
use crate::resolve::{Resolution, ResolvedQuestion};
use crate::template::{Choice, SheetTemplate, SubjectRange};

const KEYS_SCHEMA_V1: &str = "omrgrid.keys.v1";

/// Correct choices per question for one exam set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AnswerKey {
    answers: BTreeMap<u32, Vec<Choice>>,
}

impl AnswerKey {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the correct choices of `question_id`; any of them earns the point.
    pub fn insert(&mut self, question_id: u32, mut choices: Vec<Choice>) -> OmrResult<()> {
        if choices.is_empty() {
            return Err(OmrError::InvalidAnswerKey(format!(
                "question {question_id} has no correct choice"
            )));
        }
        choices.sort();
        choices.dedup();
        self.answers.insert(question_id, choices);
        Ok(())
    }

    /// Build a key from one letter per question, starting at question 1.
    pub fn from_letters(letters: &str) -> OmrResult<Self> {
        let mut key = Self::new();
        for (i, c) in letters.chars().enumerate() {
            let choice = Choice::from_letter(c).ok_or_else(|| {
                OmrError::InvalidAnswerKey(format!("'{c}' is not a choice letter"))
            })?;
            key.insert(i as u32 + 1, vec![choice])?;
        }
        Ok(key)
    }

    pub fn correct_choices(&self, question_id: u32) -> Option<&[Choice]> {
        self.answers.get(&question_id).map(Vec::as_slice)
    }

    pub fn len(&self) -> usize {
        self.answers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.answers.is_empty()
    }
}

/// Answer keys of every exam set that shares one sheet layout.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AnswerKeySet {
    sets: BTreeMap<String, AnswerKey>,
}

#[derive(serde::Serialize, serde::Deserialize)]
#[serde(untagged)]
enum KeyEntry {
    One(Choice),
    Any(Vec<Choice>),
}

#[derive(serde::Serialize, serde::Deserialize)]
#[serde(deny_unknown_fields)]
struct AnswerKeySetSpecV1 {
    schema: String,
    sets: BTreeMap<String, BTreeMap<u32, KeyEntry>>,
}

impl AnswerKeySet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, exam_set_id: impl Into<String>, key: AnswerKey) {
        self.sets.insert(exam_set_id.into(), key);
    }

    pub fn with_set(mut self, exam_set_id: impl Into<String>, key: AnswerKey) -> Self {
        self.insert(exam_set_id, key);
        self
    }

    /// Key of `exam_set_id`; there is no fallback key.
    pub fn get(&self, exam_set_id: &str) -> OmrResult<&AnswerKey> {
        self.sets
            .get(exam_set_id)
            .ok_or_else(|| OmrError::UnknownExamSet(exam_set_id.to_string()))
    }

    pub fn exam_sets(&self) -> impl Iterator<Item = (&str, &AnswerKey)> {
        self.sets.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.sets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }

    pub fn from_json_file(path: &Path) -> OmrResult<Self> {
        let data = std::fs::read_to_string(path)?;
        Self::from_json_str(&data)
    }

    pub fn from_json_str(data: &str) -> OmrResult<Self> {
        let spec: AnswerKeySetSpecV1 = serde_json::from_str(data)?;
        if spec.schema != KEYS_SCHEMA_V1 {
            return Err(OmrError::InvalidAnswerKey(format!(
                "unsupported keys schema '{}' (expected '{}')",
                spec.schema, KEYS_SCHEMA_V1
            )));
        }
        let mut out = Self::new();
        for (set_id, entries) in spec.sets {
            if set_id.trim().is_empty() {
                return Err(OmrError::InvalidAnswerKey(
                    "exam set id must not be empty".to_string(),
                ));
            }
            let mut key = AnswerKey::new();
            for (qid, entry) in entries {
                let choices = match entry {
                    KeyEntry::One(c) => vec![c],
                    KeyEntry::Any(cs) => cs,
                };
                key.insert(qid, choices).map_err(|e| match e {
                    OmrError::InvalidAnswerKey(msg) => {
                        OmrError::InvalidAnswerKey(format!("set '{set_id}': {msg}"))
                    }
                    other => other,
                })?;
            }
            out.insert(set_id, key);
        }
        Ok(out)
    }

    pub fn to_json_string(&self) -> OmrResult<String> {
        let spec = AnswerKeySetSpecV1 {
            schema: KEYS_SCHEMA_V1.to_string(),
            sets: self
                .sets
                .iter()
                .map(|(id, key)| {
                    let entries = key
                        .answers
                        .iter()
                        .map(|(&q, cs)| {
                            let entry = match cs.as_slice() {
                                [one] => KeyEntry::One(*one),
                                _ => KeyEntry::Any(cs.clone()),
                            };
                            (q, entry)
                        })
                        .collect();
                    (id.clone(), entries)
                })
                .collect(),
        };
        Ok(serde_json::to_string_pretty(&spec)?)
    }

    /// Check every question id and choice against the template.
    pub fn validate_for(&self, template: &SheetTemplate) -> OmrResult<()> {
        let max_q = template.question_count() as u32;
        let choices = template.lattice.choices;
        for (set_id, key) in &self.sets {
            for (&qid, cs) in &key.answers {
                if qid == 0 || qid > max_q {
                    return Err(OmrError::InvalidAnswerKey(format!(
                        "set '{set_id}': question {qid} outside 1..={max_q}"
                    )));
                }
                if let Some(c) = cs.iter().find(|c| c.index() >= choices) {
                    return Err(OmrError::InvalidAnswerKey(format!(
                        "set '{set_id}': question {qid} choice {c} beyond {choices} choices"
                    )));
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Correct,
    Incorrect,
    Unattempted,
    Flagged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlagReason {
    MultiMark,
    Ambiguous,
    MissingKey,
}

/// Scored outcome of one question.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct QuestionResult {
    pub question_id: u32,
    pub subject: String,
    pub resolution: Resolution,
    pub correct_choices: Vec<Choice>,
    pub verdict: Verdict,
    pub points: u32,
    /// Whether the question contributes to the maximum score.
    pub counts_toward_max: bool,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub flag: Option<FlagReason>,
    pub review_required: bool,
    pub fill_ratios: Vec<f32>,
}

/// Verdicts for every resolved question of one sheet.
pub fn score_questions(
    template: &SheetTemplate,
    key: &AnswerKey,
    resolved: &[ResolvedQuestion],
    policy: MultiMarkPolicy,
) -> (Vec<QuestionResult>, Vec<Warning>) {
    let mut warnings = Vec::new();
    let results = resolved
        .iter()
        .map(|rq| {
            let subject = template
                .subject_of(rq.question_id)
                .map(|s| s.name.clone())
                .unwrap_or_default();
            let correct = key.correct_choices(rq.question_id);
            let mut result = QuestionResult {
                question_id: rq.question_id,
                subject,
                resolution: rq.resolution.clone(),
                correct_choices: correct.map(<[Choice]>::to_vec).unwrap_or_default(),
                verdict: Verdict::Unattempted,
                points: 0,
                counts_toward_max: true,
                flag: None,
                review_required: false,
                fill_ratios: rq.fill_ratios.clone(),
            };

            let Some(correct) = correct else {
                warnings.push(Warning {
                    stage: Stage::Score,
                    question_id: Some(rq.question_id),
                    message: "question missing from the answer key; excluded from maximum"
                        .to_string(),
                });
                result.verdict = Verdict::Flagged;
                result.flag = Some(FlagReason::MissingKey);
                result.counts_toward_max = false;
                return result;
            };

            match &rq.resolution {
                Resolution::Single(c) if correct.contains(c) => {
                    result.verdict = Verdict::Correct;
                    result.points = 1;
                }
                Resolution::Single(_) => result.verdict = Verdict::Incorrect,
                Resolution::None => result.verdict = Verdict::Unattempted,
                Resolution::Multi(_) | Resolution::Ambiguous => {
                    result.verdict = Verdict::Flagged;
                    result.flag = Some(if matches!(rq.resolution, Resolution::Multi(_)) {
                        FlagReason::MultiMark
                    } else {
                        FlagReason::Ambiguous
                    });
                    match policy {
                        MultiMarkPolicy::ZeroCredit => {}
                        MultiMarkPolicy::Exclude => result.counts_toward_max = false,
                        MultiMarkPolicy::ManualReview => result.review_required = true,
                    }
                }
            }
            result
        })
        .collect();
    (results, warnings)
}

/// Totals for one subject range.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct SubjectScore {
    pub name: String,
    pub first_question: u32,
    pub last_question: u32,
    pub score: u32,
    pub max_score: u32,
    pub correct: u32,
    pub incorrect: u32,
    pub unattempted: u32,
    pub flagged: u32,
}

/// Why the whole sheet was set aside for a human.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum SheetFlag {
    TooManyAmbiguous { ambiguous_questions: u32, threshold: u32 },
    LowScore { total: u32, threshold: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ScoreSummary {
    pub subjects: Vec<SubjectScore>,
    pub total: u32,
    pub max_total: u32,
    pub ambiguous_questions: u32,
    pub multi_mark_questions: u32,
    pub review_required: bool,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub sheet_flag: Option<SheetFlag>,
}

impl ScoreSummary {
    /// Aggregate per subject, then overall. Pure.
    pub fn reduce(results: &[QuestionResult], subjects: &[SubjectRange]) -> Self {
        let subjects: Vec<SubjectScore> = subjects
            .iter()
            .map(|range| {
                let mut s = SubjectScore {
                    name: range.name.clone(),
                    first_question: range.first_question,
                    last_question: range.last_question,
                    score: 0,
                    max_score: 0,
                    correct: 0,
                    incorrect: 0,
                    unattempted: 0,
                    flagged: 0,
                };
                for r in results.iter().filter(|r| range.contains(r.question_id)) {
                    s.score += r.points;
                    s.max_score += u32::from(r.counts_toward_max);
                    match r.verdict {
                        Verdict::Correct => s.correct += 1,
                        Verdict::Incorrect => s.incorrect += 1,
                        Verdict::Unattempted => s.unattempted += 1,
                        Verdict::Flagged => s.flagged += 1,
                    }
                }
                s
            })
            .collect();

        let count = |reason: FlagReason| {
            results.iter().filter(|r| r.flag == Some(reason)).count() as u32
        };
        Self {
            total: subjects.iter().map(|s| s.score).sum(),
            max_total: subjects.iter().map(|s| s.max_score).sum(),
            ambiguous_questions: count(FlagReason::Ambiguous),
            multi_mark_questions: count(FlagReason::MultiMark),
            review_required: results.iter().any(|r| r.review_required),
            sheet_flag: None,
            subjects,
        }
    }

    /// Set `sheet_flag` from the sheet-level thresholds.
    ///
    /// Ambiguity is checked first; the low-score rule applies only to
    /// sheets it did not flag.
    pub fn with_sheet_flag(
        mut self,
        ambiguous_threshold: Option<u32>,
        low_score_threshold: Option<u32>,
    ) -> Self {
        self.sheet_flag = match (ambiguous_threshold, low_score_threshold) {
            (Some(t), _) if self.ambiguous_questions >= t => Some(SheetFlag::TooManyAmbiguous {
                ambiguous_questions: self.ambiguous_questions,
                threshold: t,
            }),
            (_, Some(t)) if self.total <= t => Some(SheetFlag::LowScore {
                total: self.total,
                threshold: t,
            }),
            _ => None,
        };
        self
    }

    pub fn subject(&self, name: &str) -> Option<&SubjectScore> {
        self.subjects.iter().find(|s| s.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn letter(c: char) -> Choice {
        Choice::from_letter(c).expect("letter")
    }

    fn cycle_key() -> AnswerKey {
        let letters: String = (0..100).map(|i| ['A', 'B', 'C', 'D'][i % 4]).collect();
        AnswerKey::from_letters(&letters).expect("key")
    }

    fn resolved(question_id: u32, resolution: Resolution) -> ResolvedQuestion {
        ResolvedQuestion {
            question_id,
            resolution,
            fill_ratios: vec![0.0; 4],
        }
    }

    fn all_blank() -> Vec<ResolvedQuestion> {
        (1..=100).map(|q| resolved(q, Resolution::None)).collect()
    }

    #[test]
    fn verdicts_follow_resolution_and_key() {
        let t = SheetTemplate::default();
        let mut input = all_blank();
        input[0].resolution = Resolution::Single(letter('A'));
        input[1].resolution = Resolution::Single(letter('A'));
        input[2].resolution = Resolution::Multi(vec![letter('A'), letter('B')]);
        input[3].resolution = Resolution::Ambiguous;

        let (results, warnings) =
            score_questions(&t, &cycle_key(), &input, MultiMarkPolicy::ZeroCredit);
        assert!(warnings.is_empty());
        assert_eq!(results[0].verdict, Verdict::Correct);
        assert_eq!(results[0].points, 1);
        assert_eq!(results[1].verdict, Verdict::Incorrect);
        assert_eq!(results[2].verdict, Verdict::Flagged);
        assert_eq!(results[2].flag, Some(FlagReason::MultiMark));
        assert!(results[2].counts_toward_max);
        assert_eq!(results[3].flag, Some(FlagReason::Ambiguous));
        assert_eq!(results[4].verdict, Verdict::Unattempted);
        assert_eq!(results[20].subject, "EDA");

        let summary = ScoreSummary::reduce(&results, &t.subjects);
        assert_eq!(summary.total, 1);
        assert_eq!(summary.max_total, 100);
        assert_eq!(summary.multi_mark_questions, 1);
        assert_eq!(summary.ambiguous_questions, 1);
        assert!(!summary.review_required);
        let python = summary.subject("Python").expect("python");
        assert_eq!((python.correct, python.incorrect, python.flagged), (1, 1, 2));
        assert_eq!(python.unattempted, 16);
    }

    #[test]
    fn policies_change_maximum_and_review_flag() {
        let t = SheetTemplate::default();
        let mut input = all_blank();
        input[10].resolution = Resolution::Multi(vec![letter('A'), letter('C')]);

        let (excluded, _) = score_questions(&t, &cycle_key(), &input, MultiMarkPolicy::Exclude);
        let s = ScoreSummary::reduce(&excluded, &t.subjects);
        assert_eq!(s.max_total, 99);
        assert!(!s.review_required);

        let (review, _) =
            score_questions(&t, &cycle_key(), &input, MultiMarkPolicy::ManualReview);
        let s = ScoreSummary::reduce(&review, &t.subjects);
        assert_eq!(s.max_total, 100);
        assert!(s.review_required);
        assert!(review[10].review_required);
        assert_eq!(review[10].points, 0);
    }

    #[test]
    fn sheet_flag_prefers_ambiguity_over_low_score() {
        let t = SheetTemplate::default();
        let mut input = all_blank();
        for (i, q) in input.iter_mut().enumerate().take(12) {
            q.resolution = Resolution::Single(Choice::new(i % 4).expect("choice"));
        }
        input[50].resolution = Resolution::Ambiguous;
        input[51].resolution = Resolution::Ambiguous;
        let (results, _) =
            score_questions(&t, &cycle_key(), &input, MultiMarkPolicy::ZeroCredit);
        let summary = ScoreSummary::reduce(&results, &t.subjects);
        assert_eq!((summary.total, summary.ambiguous_questions), (12, 2));
        assert_eq!(summary.sheet_flag, None);

        let s = summary.clone().with_sheet_flag(Some(2), Some(20));
        assert_eq!(
            s.sheet_flag,
            Some(SheetFlag::TooManyAmbiguous {
                ambiguous_questions: 2,
                threshold: 2
            })
        );

        let s = summary.clone().with_sheet_flag(Some(3), Some(12));
        assert_eq!(
            s.sheet_flag,
            Some(SheetFlag::LowScore {
                total: 12,
                threshold: 12
            })
        );

        assert_eq!(summary.clone().with_sheet_flag(Some(3), Some(11)).sheet_flag, None);
        assert_eq!(summary.with_sheet_flag(None, None).sheet_flag, None);
    }

    #[test]
    fn any_of_key_accepts_each_listed_choice() {
        let t = SheetTemplate::default();
        let mut key = cycle_key();
        key.insert(1, vec![letter('C'), letter('A')]).expect("insert");
        assert_eq!(key.correct_choices(1), Some(&[letter('A'), letter('C')][..]));

        let mut input = all_blank();
        input[0].resolution = Resolution::Single(letter('C'));
        let (results, _) = score_questions(&t, &key, &input, MultiMarkPolicy::ZeroCredit);
        assert_eq!(results[0].verdict, Verdict::Correct);
    }

    #[test]
    fn missing_key_entry_is_flagged_and_excluded() {
        let t = SheetTemplate::default();
        let key = AnswerKey::from_letters("ABCD").expect("key");
        let (results, warnings) =
            score_questions(&t, &key, &all_blank(), MultiMarkPolicy::ZeroCredit);
        assert_eq!(warnings.len(), 96);
        assert_eq!(results[4].flag, Some(FlagReason::MissingKey));
        let s = ScoreSummary::reduce(&results, &t.subjects);
        assert_eq!(s.max_total, 4);
    }

    #[test]
    fn scoring_is_idempotent_and_subjects_sum_to_total() {
        let t = SheetTemplate::default();
        let input: Vec<ResolvedQuestion> = (1..=100)
            .map(|q| {
                let c = Choice::new((q as usize * 7) % 4).expect("choice");
                resolved(q, Resolution::Single(c))
            })
            .collect();
        let (a, _) = score_questions(&t, &cycle_key(), &input, MultiMarkPolicy::ManualReview);
        let (b, _) = score_questions(&t, &cycle_key(), &input, MultiMarkPolicy::ManualReview);
        assert_eq!(a, b);
        let sa = ScoreSummary::reduce(&a, &t.subjects);
        assert_eq!(sa, ScoreSummary::reduce(&b, &t.subjects));
        assert_eq!(sa.total, sa.subjects.iter().map(|s| s.score).sum::<u32>());
        for s in &sa.subjects {
            let correct = a
                .iter()
                .filter(|r| {
                    (s.first_question..=s.last_question).contains(&r.question_id)
                        && r.verdict == Verdict::Correct
                })
                .count() as u32;
            assert_eq!(s.score, correct);
        }
    }

    #[test]
    fn keys_json_round_trip_and_validation() {
        let json = r#"{
            "schema": "omrgrid.keys.v1",
            "sets": {
                "SET-A": {"1": "A", "2": ["B", "D"], "3": "c"},
                "SET-B": {"1": "D"}
            }
        }"#;
        let keys = AnswerKeySet::from_json_str(json).expect("parse");
        assert_eq!(keys.len(), 2);
        let a = keys.get("SET-A").expect("set a");
        assert_eq!(a.correct_choices(2), Some(&[letter('B'), letter('D')][..]));
        assert_eq!(a.correct_choices(3), Some(&[letter('C')][..]));
        assert!(matches!(keys.get("SET-Z"), Err(OmrError::UnknownExamSet(id)) if id == "SET-Z"));

        let back = AnswerKeySet::from_json_str(&keys.to_json_string().expect("ser")).expect("re");
        assert_eq!(back, keys);

        let t = SheetTemplate::default();
        assert!(keys.validate_for(&t).is_ok());
        let bad = AnswerKeySet::new().with_set("X", AnswerKey::from_letters("ABCDE").expect("k"));
        assert!(bad.validate_for(&t).is_err());

        let empty = r#"{"schema":"omrgrid.keys.v1","sets":{"S":{"1":[]}}}"#;
        assert!(matches!(
            AnswerKeySet::from_json_str(empty),
            Err(OmrError::InvalidAnswerKey(_))
        ));
    }
}
