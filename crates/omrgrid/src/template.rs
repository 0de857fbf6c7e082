//! Registered sheet templates.
//!
//! Template JSON follows a parametric schema (`omrgrid.template.v1`): bubble
//! centers are generated at runtime from the lattice parameters, so a
//! template never lists individual bubbles.

use std::path::Path;

use crate::error::{OmrError, OmrResult};

const TEMPLATE_SCHEMA_V1: &str = "omrgrid.template.v1";
const MAX_CHOICES: usize = 26;

const DEFAULT_NAME: &str = "innomatics_5x20_abcd";
const DEFAULT_CANVAS_PX: [u32; 2] = [800, 1000];
const DEFAULT_FIDUCIAL_SIZE_PX: f32 = 40.0;
const DEFAULT_SUBJECTS: [&str; 5] = ["Python", "EDA", "SQL", "Power BI", "Statistics"];

/// A zero-based answer choice; serialized as its letter (`"A"`, `"B"`, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[derive(serde::Serialize, serde::Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Choice(u8);

impl Choice {
    pub fn new(index: usize) -> Option<Self> {
        (index < MAX_CHOICES).then_some(Self(index as u8))
    }

    pub fn index(self) -> usize {
        self.0 as usize
    }

    pub fn letter(self) -> char {
        (b'A' + self.0) as char
    }

    pub fn from_letter(c: char) -> Option<Self> {
        let upper = c.to_ascii_uppercase();
        upper
            .is_ascii_uppercase()
            .then(|| Self(upper as u8 - b'A'))
    }
}

impl std::fmt::Display for Choice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.letter())
    }
}

impl TryFrom<String> for Choice {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        let mut chars = s.trim().chars();
        match (chars.next(), chars.next()) {
            (Some(c), None) => {
                Choice::from_letter(c).ok_or_else(|| format!("'{s}' is not a choice letter"))
            }
            _ => Err(format!("'{s}' is not a single choice letter")),
        }
    }
}

impl From<Choice> for String {
    fn from(c: Choice) -> Self {
        c.letter().to_string()
    }
}

/// A square fiducial mark printed on the sheet.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Fiducial {
    /// Center in canonical canvas pixels.
    pub xy_px: [f32; 2],
    /// Side length in canonical canvas pixels.
    pub size_px: f32,
}

/// Bubble lattice geometry in canonical canvas pixels.
///
/// Questions are stacked in `blocks` side-by-side columns of `rows`
/// questions each; every question has `choices` bubbles in a row.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LatticeSpec {
    /// Center of the first bubble (question 1, choice A).
    pub origin_px: [f32; 2],
    pub rows: usize,
    pub blocks: usize,
    pub choices: usize,
    /// Horizontal distance between neighbouring choices of one question.
    pub choice_pitch_px: f32,
    /// Vertical distance between consecutive question rows.
    pub row_pitch_px: f32,
    /// Horizontal distance between the first bubbles of adjacent blocks.
    pub block_pitch_px: f32,
    pub bubble_radius_px: f32,
}

impl LatticeSpec {
    /// Number of lattice columns (`blocks * choices`).
    pub fn columns(&self) -> usize {
        self.blocks * self.choices
    }

    pub fn cell_count(&self) -> usize {
        self.rows * self.columns()
    }

    pub fn question_count(&self) -> usize {
        self.rows * self.blocks
    }

    /// Expected x of lattice column `col`.
    pub fn column_x(&self, col: usize) -> f32 {
        let block = col / self.choices;
        let choice = col % self.choices;
        self.origin_px[0] + block as f32 * self.block_pitch_px + choice as f32 * self.choice_pitch_px
    }

    /// Expected y of lattice row `row`.
    pub fn row_y(&self, row: usize) -> f32 {
        self.origin_px[1] + row as f32 * self.row_pitch_px
    }

    /// Question id (1-based) printed at lattice `row` in `block`.
    pub fn question_id(&self, row: usize, block: usize) -> u32 {
        (block * self.rows + row + 1) as u32
    }

    /// Lattice `(row, block)` of a 1-based question id.
    pub fn question_position(&self, question_id: u32) -> Option<(usize, usize)> {
        let idx = (question_id as usize).checked_sub(1)?;
        (idx < self.question_count()).then(|| (idx % self.rows, idx / self.rows))
    }

    /// Expected canonical center of one bubble.
    pub fn bubble_center(&self, question_id: u32, choice: Choice) -> Option<[f32; 2]> {
        let (row, block) = self.question_position(question_id)?;
        if choice.index() >= self.choices {
            return None;
        }
        let col = block * self.choices + choice.index();
        Some([self.column_x(col), self.row_y(row)])
    }
}

/// A contiguous, inclusive range of question ids belonging to one subject.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SubjectRange {
    pub name: String,
    pub first_question: u32,
    pub last_question: u32,
}

impl SubjectRange {
    pub fn contains(&self, question_id: u32) -> bool {
        (self.first_question..=self.last_question).contains(&question_id)
    }

    pub fn len(&self) -> usize {
        (self.last_question + 1 - self.first_question) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.last_question < self.first_question
    }
}

/// Immutable geometric description of one physical answer sheet.
#[derive(Debug, Clone, PartialEq)]
pub struct SheetTemplate {
    pub name: String,
    /// Canonical canvas size `[width, height]` in pixels.
    pub canvas_px: [u32; 2],
    pub fiducials: Vec<Fiducial>,
    pub lattice: LatticeSpec,
    pub subjects: Vec<SubjectRange>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(deny_unknown_fields)]
struct SheetTemplateSpecV1 {
    schema: String,
    name: String,
    canvas_px: [u32; 2],
    fiducials: Vec<Fiducial>,
    lattice: LatticeSpec,
    subjects: Vec<SubjectRange>,
}

impl SheetTemplate {
    /// Load a template from a JSON file.
    pub fn from_json_file(path: &Path) -> OmrResult<Self> {
        let data = std::fs::read_to_string(path)?;
        Self::from_json_str(&data)
    }

    pub fn from_json_str(data: &str) -> OmrResult<Self> {
        let spec: SheetTemplateSpecV1 = serde_json::from_str(data)?;
        Self::from_spec(spec).map_err(OmrError::InvalidTemplate)
    }

    /// Serialize back to the `omrgrid.template.v1` JSON schema.
    pub fn to_json_string(&self) -> OmrResult<String> {
        let spec = SheetTemplateSpecV1 {
            schema: TEMPLATE_SCHEMA_V1.to_string(),
            name: self.name.clone(),
            canvas_px: self.canvas_px,
            fiducials: self.fiducials.clone(),
            lattice: self.lattice.clone(),
            subjects: self.subjects.clone(),
        };
        Ok(serde_json::to_string_pretty(&spec)?)
    }

    fn from_spec(spec: SheetTemplateSpecV1) -> Result<Self, String> {
        if spec.schema != TEMPLATE_SCHEMA_V1 {
            return Err(format!(
                "unsupported template schema '{}' (expected '{}')",
                spec.schema, TEMPLATE_SCHEMA_V1
            ));
        }
        let template = Self {
            name: spec.name,
            canvas_px: spec.canvas_px,
            fiducials: spec.fiducials,
            lattice: spec.lattice,
            subjects: spec.subjects,
        };
        validate_template(&template)?;
        Ok(template)
    }

    /// Check a template built or edited in code.
    ///
    /// Templates loaded from JSON are already validated.
    pub fn validate(&self) -> OmrResult<()> {
        validate_template(self).map_err(OmrError::InvalidTemplate)
    }

    pub fn question_count(&self) -> usize {
        self.lattice.question_count()
    }

    pub fn question_ids(&self) -> impl Iterator<Item = u32> {
        1..=self.question_count() as u32
    }

    /// Subject owning `question_id`, if any.
    pub fn subject_of(&self, question_id: u32) -> Option<&SubjectRange> {
        self.subjects.iter().find(|s| s.contains(question_id))
    }

    /// Indices of the outermost fiducials in the order
    /// top-left, top-right, bottom-right, bottom-left.
    pub fn corner_fiducials(&self) -> Option<[usize; 4]> {
        corner_indices(self.fiducials.iter().map(|f| f.xy_px))
    }
}

/// Pick the extremes of `x + y` and `x - y` as the four corners
/// (TL, TR, BR, BL). Returns `None` when fewer than four distinct points
/// are available.
pub(crate) fn corner_indices(points: impl Iterator<Item = [f32; 2]>) -> Option<[usize; 4]> {
    let mut tl = None::<(usize, f32)>;
    let mut tr = None::<(usize, f32)>;
    let mut br = None::<(usize, f32)>;
    let mut bl = None::<(usize, f32)>;
    for (i, [x, y]) in points.enumerate() {
        let sum = x + y;
        let diff = x - y;
        if tl.map_or(true, |(_, v)| sum < v) {
            tl = Some((i, sum));
        }
        if br.map_or(true, |(_, v)| sum > v) {
            br = Some((i, sum));
        }
        if tr.map_or(true, |(_, v)| diff > v) {
            tr = Some((i, diff));
        }
        if bl.map_or(true, |(_, v)| diff < v) {
            bl = Some((i, diff));
        }
    }
    let corners = [tl?.0, tr?.0, br?.0, bl?.0];
    for i in 0..4 {
        for j in (i + 1)..4 {
            if corners[i] == corners[j] {
                return None;
            }
        }
    }
    Some(corners)
}

impl Default for SheetTemplate {
    fn default() -> Self {
        let [w, h] = DEFAULT_CANVAS_PX;
        let inset = 40.0;
        let fiducials = [
            [inset, inset],
            [w as f32 - inset, inset],
            [w as f32 - inset, h as f32 - inset],
            [inset, h as f32 - inset],
        ]
        .into_iter()
        .map(|xy_px| Fiducial {
            xy_px,
            size_px: DEFAULT_FIDUCIAL_SIZE_PX,
        })
        .collect();

        let lattice = LatticeSpec {
            origin_px: [110.0, 150.0],
            rows: 20,
            blocks: 5,
            choices: 4,
            choice_pitch_px: 28.0,
            row_pitch_px: 38.0,
            block_pitch_px: 135.0,
            bubble_radius_px: 10.0,
        };

        let subjects = DEFAULT_SUBJECTS
            .iter()
            .enumerate()
            .map(|(i, name)| SubjectRange {
                name: name.to_string(),
                first_question: (i * 20 + 1) as u32,
                last_question: ((i + 1) * 20) as u32,
            })
            .collect();

        Self {
            name: DEFAULT_NAME.to_string(),
            canvas_px: DEFAULT_CANVAS_PX,
            fiducials,
            lattice,
            subjects,
        }
    }
}

fn finite_positive(v: f32) -> bool {
    v.is_finite() && v > 0.0
}

fn validate_template(t: &SheetTemplate) -> Result<(), String> {
    if t.name.trim().is_empty() {
        return Err("template name must not be empty".to_string());
    }
    let [cw, ch] = t.canvas_px;
    if cw < 16 || ch < 16 {
        return Err("canvas_px must be at least 16x16".to_string());
    }

    if t.fiducials.len() < 4 {
        return Err(format!(
            "at least 4 fiducials are required, got {}",
            t.fiducials.len()
        ));
    }
    for (i, f) in t.fiducials.iter().enumerate() {
        if !finite_positive(f.size_px) {
            return Err(format!("fiducial {i}: size_px must be finite and > 0"));
        }
        let half = f.size_px * 0.5;
        if f.xy_px[0] - half < 0.0
            || f.xy_px[1] - half < 0.0
            || f.xy_px[0] + half > cw as f32
            || f.xy_px[1] + half > ch as f32
        {
            return Err(format!("fiducial {i} lies outside the canvas"));
        }
    }
    if t.corner_fiducials().is_none() {
        return Err("fiducials must span four distinct corners".to_string());
    }

    let l = &t.lattice;
    if l.rows == 0 || l.blocks == 0 || l.choices == 0 {
        return Err("lattice rows, blocks and choices must be >= 1".to_string());
    }
    if l.choices > MAX_CHOICES {
        return Err(format!("lattice choices must be <= {MAX_CHOICES}"));
    }
    for (name, v) in [
        ("choice_pitch_px", l.choice_pitch_px),
        ("row_pitch_px", l.row_pitch_px),
        ("block_pitch_px", l.block_pitch_px),
    ] {
        if !finite_positive(v) {
            return Err(format!("{name} must be finite and > 0"));
        }
    }
    if !finite_positive(l.bubble_radius_px) || l.bubble_radius_px < 3.0 {
        return Err("bubble_radius_px must be >= 3".to_string());
    }
    let diameter = 2.0 * l.bubble_radius_px;
    if l.choices > 1 && l.choice_pitch_px <= diameter {
        return Err("choice_pitch_px must exceed the bubble diameter".to_string());
    }
    if l.rows > 1 && l.row_pitch_px <= diameter {
        return Err("row_pitch_px must exceed the bubble diameter".to_string());
    }
    let block_span = (l.choices - 1) as f32 * l.choice_pitch_px;
    if l.blocks > 1 && l.block_pitch_px <= block_span + diameter {
        return Err("block_pitch_px must leave a gap between blocks".to_string());
    }
    let r = l.bubble_radius_px;
    let x_max = l.column_x(l.columns() - 1) + r;
    let y_max = l.row_y(l.rows - 1) + r;
    if l.origin_px[0] - r < 0.0 || l.origin_px[1] - r < 0.0 || x_max > cw as f32 || y_max > ch as f32
    {
        return Err("bubble lattice extends outside the canvas".to_string());
    }

    validate_subjects(&t.subjects, l.question_count())
}

fn validate_subjects(subjects: &[SubjectRange], question_count: usize) -> Result<(), String> {
    if subjects.is_empty() {
        return Err("at least one subject is required".to_string());
    }
    let mut next = 1u32;
    for s in subjects {
        if s.name.trim().is_empty() {
            return Err("subject name must not be empty".to_string());
        }
        if s.first_question != next {
            return Err(format!(
                "subject '{}' starts at question {}, expected {} (ranges must be contiguous)",
                s.name, s.first_question, next
            ));
        }
        if s.last_question < s.first_question {
            return Err(format!("subject '{}' has an empty range", s.name));
        }
        next = s.last_question + 1;
    }
    if (next - 1) as usize != question_count {
        return Err(format!(
            "subjects cover questions 1..={}, lattice has {}",
            next - 1,
            question_count
        ));
    }
    Ok(())
}
