//! Synthetic sheet rendering in the canonical template frame.
//!
//! Used by the CLI `render` command to print blank or pre-marked sheets and
//! by the tests as ground truth.

use std::collections::BTreeMap;

use image::{GrayImage, Luma};
use imageproc::drawing::{draw_filled_circle_mut, draw_hollow_circle_mut};

use crate::template::{Choice, SheetTemplate};

const PAPER: u8 = 255;
const FIDUCIAL_INK: u8 = 0;
const OUTLINE_INK: u8 = 60;
const MARK_INK: u8 = 40;
/// Mark disc radius relative to the bubble radius for a full mark.
const FULL_MARK_RATIO: f32 = 0.85;
/// Sampled interior fraction used to size partial marks.
const PARTIAL_REFERENCE_RATIO: f32 = 0.7;

/// Pencil marks to draw: question id → (choice, coverage in (0, 1]).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SheetMarks {
    marks: BTreeMap<u32, Vec<(Choice, f32)>>,
}

impl SheetMarks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fully darken `choice` of `question_id`.
    pub fn mark(mut self, question_id: u32, choice: Choice) -> Self {
        self.marks
            .entry(question_id)
            .or_default()
            .push((choice, 1.0));
        self
    }

    /// Darken roughly `coverage` of the sampled bubble interior.
    pub fn mark_partial(mut self, question_id: u32, choice: Choice, coverage: f32) -> Self {
        self.marks
            .entry(question_id)
            .or_default()
            .push((choice, coverage.clamp(0.0, 1.0)));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.marks.is_empty()
    }

    pub fn len(&self) -> usize {
        self.marks.values().map(Vec::len).sum()
    }
}

/// Draw the template (fiducials and bubble outlines) plus `marks` on a white
/// canvas of the template's canonical size.
pub fn render_sheet(template: &SheetTemplate, marks: &SheetMarks) -> GrayImage {
    let [w, h] = template.canvas_px;
    let mut img = GrayImage::from_pixel(w, h, Luma([PAPER]));

    for f in &template.fiducials {
        // Pixels within half a side of the center, inclusive of pixel centers.
        let half = f.size_px * 0.5 - 0.5;
        let x0 = (f.xy_px[0] - half).ceil().max(0.0) as u32;
        let x1 = (f.xy_px[0] + half).floor().min(w as f32 - 1.0) as u32;
        let y0 = (f.xy_px[1] - half).ceil().max(0.0) as u32;
        let y1 = (f.xy_px[1] + half).floor().min(h as f32 - 1.0) as u32;
        for y in y0..=y1 {
            for x in x0..=x1 {
                img.put_pixel(x, y, Luma([FIDUCIAL_INK]));
            }
        }
    }

    let lattice = &template.lattice;
    let r = lattice.bubble_radius_px;
    let outer = r.round() as i32;
    for qid in template.question_ids() {
        for ci in 0..lattice.choices {
            let Some(choice) = Choice::new(ci) else {
                continue;
            };
            let Some([cx, cy]) = lattice.bubble_center(qid, choice) else {
                continue;
            };
            let center = (cx.round() as i32, cy.round() as i32);
            draw_hollow_circle_mut(&mut img, center, outer, Luma([OUTLINE_INK]));
            draw_hollow_circle_mut(&mut img, center, outer - 1, Luma([OUTLINE_INK]));
        }
    }

    for (&qid, choices) in &marks.marks {
        for &(choice, coverage) in choices {
            let Some([cx, cy]) = lattice.bubble_center(qid, choice) else {
                continue;
            };
            let radius = if coverage >= 1.0 {
                FULL_MARK_RATIO * r
            } else {
                PARTIAL_REFERENCE_RATIO * r * coverage.sqrt()
            };
            let radius = radius.round() as i32;
            if radius <= 0 {
                continue;
            }
            draw_filled_circle_mut(
                &mut img,
                (cx.round() as i32, cy.round() as i32),
                radius,
                Luma([MARK_INK]),
            );
        }
    }
    img
}
