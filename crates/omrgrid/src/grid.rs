//! Bubble lattice location on the normalized sheet.
//!
//! Every lattice row and column is searched independently: a window one
//! bubble diameter wide slides across the expected position and the offset
//! with the most ink wins. Printed bubble outlines carry enough ink for this
//! to work on blank sheets.

use image::GrayImage;

use crate::config::RunConfig;
use crate::error::{GridAxis, OmrError, OmrResult};
use crate::imaging::darkness;
use crate::template::{Choice, LatticeSpec};

/// Located position of one bubble.
#[derive(Debug, Clone, PartialEq)]
pub struct LocatedCell {
    pub question_id: u32,
    pub choice: Choice,
    /// Lattice row.
    pub row: usize,
    /// Lattice column (`block * choices + choice`).
    pub column: usize,
    /// Center in normalized-image pixels.
    pub center: [f32; 2],
    pub radius: f32,
}

/// How the lattice was fitted to the normalized sheet.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct GridReport {
    /// Applied y offset per lattice row, interpolated where unmeasured.
    pub row_offsets_px: Vec<f32>,
    /// Applied x offset per lattice column, interpolated where unmeasured.
    pub column_offsets_px: Vec<f32>,
    /// Rows whose profile had enough contrast to measure.
    pub measured_rows: usize,
    pub measured_columns: usize,
}

/// Lattice with every cell located, ordered by question then choice.
#[derive(Debug, Clone)]
pub struct LocatedGrid {
    pub cells: Vec<LocatedCell>,
    pub report: GridReport,
}

/// Offsets along one axis. `None` where the profile was too flat.
struct AxisProfile<'a> {
    image: &'a GrayImage,
    axis: GridAxis,
    /// Perpendicular pixel ranges (inclusive) that cover the bubbles.
    spans: Vec<(i64, i64)>,
    radius: i64,
    search: i64,
    min_contrast: f32,
}

impl AxisProfile<'_> {
    /// Total darkness of one image row (Row axis) or column (Column axis),
    /// restricted to the spans.
    fn line_darkness(&self, pos: i64) -> u64 {
        let (w, h) = self.image.dimensions();
        let (len_along, len_across) = match self.axis {
            GridAxis::Row => (h as i64, w as i64),
            GridAxis::Column => (w as i64, h as i64),
        };
        if pos < 0 || pos >= len_along {
            return 0;
        }
        let mut sum = 0u64;
        for &(a, b) in &self.spans {
            for q in a.max(0)..=b.min(len_across - 1) {
                let (x, y) = match self.axis {
                    GridAxis::Row => (q as u32, pos as u32),
                    GridAxis::Column => (pos as u32, q as u32),
                };
                sum += darkness(self.image, x, y) as u64;
            }
        }
        sum
    }

    fn window_pixels(&self) -> f32 {
        let across: i64 = self.spans.iter().map(|(a, b)| b - a + 1).sum();
        ((2 * self.radius + 1) * across) as f32
    }

    /// Best offset of the line expected at `expected`.
    fn measure(&self, expected: f32) -> Option<i64> {
        let center = expected.round() as i64;
        let lo = center - self.search - self.radius;
        let hi = center + self.search + self.radius;
        let lines: Vec<u64> = (lo..=hi).map(|p| self.line_darkness(p)).collect();
        let mut prefix = vec![0u64; lines.len() + 1];
        for (i, v) in lines.iter().enumerate() {
            prefix[i + 1] = prefix[i] + v;
        }
        let window = |d: i64| {
            let start = (d + self.search) as usize;
            let end = start + (2 * self.radius + 1) as usize;
            prefix[end] - prefix[start]
        };

        let mut best = (0i64, window(0));
        let mut worst = best.1;
        for step in 1..=self.search {
            for d in [-step, step] {
                let s = window(d);
                if s > best.1 {
                    best = (d, s);
                }
                worst = worst.min(s);
            }
        }
        let contrast = (best.1 - worst) as f32 / self.window_pixels().max(1.0);
        (contrast >= self.min_contrast).then_some(best.0)
    }
}

/// Fill unmeasured offsets by linear interpolation between measured
/// neighbours; copy the nearest one at the ends; 0 when nothing was measured.
fn interpolate_missing(measured: &[Option<i64>]) -> Vec<f32> {
    let known: Vec<(usize, f32)> = measured
        .iter()
        .enumerate()
        .filter_map(|(i, m)| m.map(|v| (i, v as f32)))
        .collect();
    (0..measured.len())
        .map(|i| {
            if let Some(v) = measured[i] {
                return v as f32;
            }
            let prev = known.iter().rev().find(|(k, _)| *k < i);
            let next = known.iter().find(|(k, _)| *k > i);
            match (prev, next) {
                (Some(&(a, va)), Some(&(b, vb))) => {
                    let t = (i - a) as f32 / (b - a) as f32;
                    va + (vb - va) * t
                }
                (Some(&(_, v)), None) | (None, Some(&(_, v))) => v,
                (None, None) => 0.0,
            }
        })
        .collect()
}

fn check_spacing(
    axis: GridAxis,
    expected: &[f32],
    offsets: &[f32],
    tolerance: f32,
) -> OmrResult<()> {
    for i in 0..expected.len().saturating_sub(1) {
        let expected_px = expected[i + 1] - expected[i];
        let measured_px = (expected[i + 1] + offsets[i + 1]) - (expected[i] + offsets[i]);
        if (measured_px - expected_px).abs() > tolerance * expected_px {
            return Err(OmrError::GridSpacing {
                axis,
                index: i,
                measured_px,
                expected_px,
            });
        }
    }
    Ok(())
}

fn min_gap(positions: &[f32], fallback: f32) -> f32 {
    positions
        .windows(2)
        .map(|p| p[1] - p[0])
        .fold(None, |acc: Option<f32>, g| Some(acc.map_or(g, |a| a.min(g))))
        .unwrap_or(fallback)
}

/// Locate every bubble of `lattice` in the normalized image.
pub(crate) fn locate_grid(
    image: &GrayImage,
    lattice: &LatticeSpec,
    config: &RunConfig,
) -> OmrResult<LocatedGrid> {
    let r = lattice.bubble_radius_px;
    let ri = r.round() as i64;
    let row_y: Vec<f32> = (0..lattice.rows).map(|i| lattice.row_y(i)).collect();
    let col_x: Vec<f32> = (0..lattice.columns()).map(|i| lattice.column_x(i)).collect();
    let span_of = |c: f32| ((c - r).round() as i64, (c + r).round() as i64);

    let search_of = |pitch: f32| ((config.grid.search_frac * pitch).floor() as i64).max(1);

    let rows = AxisProfile {
        image,
        axis: GridAxis::Row,
        spans: col_x.iter().map(|&x| span_of(x)).collect(),
        radius: ri,
        search: search_of(min_gap(&row_y, 2.0 * r)),
        min_contrast: config.grid.min_profile_contrast,
    };
    let cols = AxisProfile {
        image,
        axis: GridAxis::Column,
        spans: row_y.iter().map(|&y| span_of(y)).collect(),
        radius: ri,
        search: search_of(min_gap(&col_x, 2.0 * r)),
        min_contrast: config.grid.min_profile_contrast,
    };

    let row_measured: Vec<Option<i64>> = row_y.iter().map(|&y| rows.measure(y)).collect();
    let col_measured: Vec<Option<i64>> = col_x.iter().map(|&x| cols.measure(x)).collect();
    let measured_rows = row_measured.iter().flatten().count();
    let measured_columns = col_measured.iter().flatten().count();
    tracing::debug!(
        "grid profiles measured: {}/{} rows, {}/{} columns",
        measured_rows,
        row_y.len(),
        measured_columns,
        col_x.len()
    );
    if 2 * measured_rows < row_y.len() || 2 * measured_columns < col_x.len() {
        return Err(OmrError::GridLocation(format!(
            "bubble lattice not visible: {measured_rows}/{} rows and {measured_columns}/{} columns measured",
            row_y.len(),
            col_x.len()
        )));
    }

    let row_offsets_px = interpolate_missing(&row_measured);
    let column_offsets_px = interpolate_missing(&col_measured);
    check_spacing(GridAxis::Row, &row_y, &row_offsets_px, config.grid_tolerance_ratio)?;
    check_spacing(
        GridAxis::Column,
        &col_x,
        &column_offsets_px,
        config.grid_tolerance_ratio,
    )?;

    // Radius follows the locally measured row pitch.
    let radius_of_row = |i: usize| {
        let mut ratios = Vec::with_capacity(2);
        if i > 0 {
            let e = row_y[i] - row_y[i - 1];
            ratios.push((e + row_offsets_px[i] - row_offsets_px[i - 1]) / e);
        }
        if i + 1 < row_y.len() {
            let e = row_y[i + 1] - row_y[i];
            ratios.push((e + row_offsets_px[i + 1] - row_offsets_px[i]) / e);
        }
        if ratios.is_empty() {
            return r;
        }
        let scale = ratios.iter().sum::<f32>() / ratios.len() as f32;
        r * scale.clamp(0.8, 1.2)
    };

    let (w, h) = image.dimensions();
    let mut cells = Vec::with_capacity(lattice.cell_count());
    let positions = (0..lattice.blocks).flat_map(|b| (0..lattice.rows).map(move |r| (b, r)));
    for (block, row) in positions {
        let qid = lattice.question_id(row, block);
        let radius = radius_of_row(row);
        for ci in 0..lattice.choices {
            let column = block * lattice.choices + ci;
            let center = [
                col_x[column] + column_offsets_px[column],
                row_y[row] + row_offsets_px[row],
            ];
            if center[0] - radius < 0.0
                || center[1] - radius < 0.0
                || center[0] + radius > (w as f32 - 1.0)
                || center[1] + radius > (h as f32 - 1.0)
            {
                return Err(OmrError::GridLocation(format!(
                    "question {qid} choice {ci} falls outside the image at ({:.1}, {:.1})",
                    center[0], center[1]
                )));
            }
            let Some(choice) = Choice::new(ci) else {
                continue;
            };
            cells.push(LocatedCell {
                question_id: qid,
                choice,
                row,
                column,
                center,
                radius,
            });
        }
    }
    if cells.len() != lattice.cell_count() {
        return Err(OmrError::GridLocation(format!(
            "located {} cells, template has {}",
            cells.len(),
            lattice.cell_count()
        )));
    }

    Ok(LocatedGrid {
        cells,
        report: GridReport {
            row_offsets_px,
            column_offsets_px,
            measured_rows,
            measured_columns,
        },
    })
}
