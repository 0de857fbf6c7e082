//! Fill-ratio measurement and per-bubble mark state.

use image::GrayImage;

use crate::audit::{Stage, Warning};
use crate::config::{BackgroundMode, FillSamplingConfig, RunConfig};
use crate::grid::{LocatedCell, LocatedGrid};
use crate::imaging::Histogram;
use crate::template::{Choice, LatticeSpec};

/// Classified state of one bubble.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarkState {
    Empty,
    Filled,
    Ambiguous,
}

/// One classified bubble.
#[derive(Debug, Clone, PartialEq)]
pub struct BubbleCell {
    pub question_id: u32,
    pub choice: Choice,
    pub row: usize,
    pub column: usize,
    pub center: [f32; 2],
    pub radius: f32,
    /// Dark fraction of the sampled interior, in [0, 1].
    pub fill_ratio: f32,
    pub state: MarkState,
    /// Filled by the threshold rule, then demoted for being clearly lighter
    /// than the darkest mark of its question.
    pub demoted: bool,
}

/// All classified bubbles, ordered by question then choice.
#[derive(Debug, Clone)]
pub struct BubbleGrid {
    choices: usize,
    cells: Vec<BubbleCell>,
}

impl BubbleGrid {
    pub fn cells(&self) -> &[BubbleCell] {
        &self.cells
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Cells grouped per question, in question order.
    pub fn questions(&self) -> impl Iterator<Item = &[BubbleCell]> {
        self.cells.chunks_exact(self.choices.max(1))
    }

    /// Cells of one question.
    pub fn question(&self, question_id: u32) -> Option<&[BubbleCell]> {
        let idx = (question_id as usize).checked_sub(1)?;
        let start = idx * self.choices;
        self.cells.get(start..start + self.choices)
    }
}

/// Threshold rule; monotonic in `fill_ratio`.
pub fn classify_fill_ratio(fill_ratio: f32, low: f32, high: f32) -> MarkState {
    if fill_ratio < low {
        MarkState::Empty
    } else if fill_ratio > high {
        MarkState::Filled
    } else {
        MarkState::Ambiguous
    }
}

/// Paper-white level per lattice row (or one for the whole lattice).
fn paper_levels(image: &GrayImage, lattice: &LatticeSpec, sampling: &FillSamplingConfig) -> Vec<f32> {
    let r = lattice.bubble_radius_px;
    let x0 = (lattice.column_x(0) - r).floor() as i64;
    let x1 = (lattice.column_x(lattice.columns() - 1) + r).ceil() as i64 + 1;
    let half_band = (0.5 * lattice.row_pitch_px).max(r + 1.0);
    let level_of = |hist: &Histogram| {
        hist.percentile(sampling.paper_percentile)
            .map_or(255.0, |v| v as f32)
    };

    match sampling.background {
        BackgroundMode::PerRow => (0..lattice.rows)
            .map(|row| {
                let y = lattice.row_y(row);
                let mut hist = Histogram::new();
                hist.add_region(
                    image,
                    x0,
                    (y - half_band).floor() as i64,
                    x1,
                    (y + half_band).ceil() as i64 + 1,
                );
                level_of(&hist)
            })
            .collect(),
        BackgroundMode::PerSheet => {
            let y0 = (lattice.row_y(0) - half_band).floor() as i64;
            let y1 = (lattice.row_y(lattice.rows - 1) + half_band).ceil() as i64 + 1;
            let mut hist = Histogram::new();
            hist.add_region(image, x0, y0, x1, y1);
            vec![level_of(&hist); lattice.rows]
        }
    }
}

/// Fraction of interior pixels darker than `dark_below`.
fn fill_ratio(image: &GrayImage, cell: &LocatedCell, interior_ratio: f32, dark_below: f32) -> f32 {
    let (w, h) = image.dimensions();
    let rr = (cell.radius * interior_ratio).max(0.5);
    let [cx, cy] = cell.center;
    let y0 = (cy - rr).floor().max(0.0) as u32;
    let y1 = ((cy + rr).ceil() as u32).min(h.saturating_sub(1));
    let x0 = (cx - rr).floor().max(0.0) as u32;
    let x1 = ((cx + rr).ceil() as u32).min(w.saturating_sub(1));

    let mut sampled = 0u32;
    let mut dark = 0u32;
    for y in y0..=y1 {
        for x in x0..=x1 {
            let dx = x as f32 - cx;
            let dy = y as f32 - cy;
            if dx * dx + dy * dy > rr * rr {
                continue;
            }
            sampled += 1;
            if (image.get_pixel(x, y)[0] as f32) < dark_below {
                dark += 1;
            }
        }
    }
    if sampled == 0 {
        0.0
    } else {
        dark as f32 / sampled as f32
    }
}

/// Measure and classify every located cell.
///
/// Filled cells that fall more than `closeness_tolerance` below the darkest
/// cell of their question are demoted to Ambiguous and reported.
pub(crate) fn classify_grid(
    image: &GrayImage,
    grid: &LocatedGrid,
    lattice: &LatticeSpec,
    config: &RunConfig,
) -> (BubbleGrid, Vec<Warning>) {
    let sampling = &config.sampling;
    let paper = paper_levels(image, lattice, sampling);

    let mut cells: Vec<BubbleCell> = grid
        .cells
        .iter()
        .map(|c| {
            let dark_below = paper[c.row] * sampling.ink_ratio;
            let fill = fill_ratio(image, c, sampling.interior_ratio, dark_below);
            BubbleCell {
                question_id: c.question_id,
                choice: c.choice,
                row: c.row,
                column: c.column,
                center: c.center,
                radius: c.radius,
                fill_ratio: fill,
                state: classify_fill_ratio(fill, config.low_threshold, config.high_threshold),
                demoted: false,
            }
        })
        .collect();

    let mut warnings = Vec::new();
    for question in cells.chunks_exact_mut(lattice.choices.max(1)) {
        let darkest = question
            .iter()
            .filter(|c| c.state == MarkState::Filled)
            .map(|c| c.fill_ratio)
            .fold(f32::NEG_INFINITY, f32::max);
        for cell in question.iter_mut() {
            if cell.state == MarkState::Filled
                && darkest - cell.fill_ratio > config.closeness_tolerance
            {
                cell.state = MarkState::Ambiguous;
                cell.demoted = true;
                tracing::warn!(
                    "question {} choice {} demoted: fill {:.2} vs darkest {:.2}",
                    cell.question_id,
                    cell.choice,
                    cell.fill_ratio,
                    darkest
                );
                warnings.push(Warning {
                    stage: Stage::Classify,
                    question_id: Some(cell.question_id),
                    message: format!(
                        "choice {} demoted to ambiguous: fill {:.2} vs darkest {:.2}",
                        cell.choice, cell.fill_ratio, darkest
                    ),
                });
            }
        }
    }

    let counts = cells.iter().fold([0usize; 3], |mut acc, c| {
        acc[c.state as usize] += 1;
        acc
    });
    tracing::debug!(
        "classified {} bubbles: {} empty, {} filled, {} ambiguous",
        cells.len(),
        counts[0],
        counts[1],
        counts[2]
    );

    (
        BubbleGrid {
            choices: lattice.choices,
            cells,
        },
        warnings,
    )
}
