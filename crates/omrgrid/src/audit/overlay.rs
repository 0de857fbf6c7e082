use std::collections::HashMap;

use image::{GrayImage, Rgb, RgbImage};
use imageproc::drawing::draw_hollow_circle_mut;

use crate::classify::{BubbleGrid, MarkState};
use crate::imaging::gray_to_rgb;
use crate::scoring::{QuestionResult, Verdict};

const EMPTY: Rgb<u8> = Rgb([150, 150, 150]);
const CORRECT: Rgb<u8> = Rgb([0, 170, 0]);
const INCORRECT: Rgb<u8> = Rgb([220, 0, 0]);
const FLAGGED: Rgb<u8> = Rgb([255, 140, 0]);
const AMBIGUOUS: Rgb<u8> = Rgb([230, 0, 230]);
const KEY: Rgb<u8> = Rgb([0, 90, 255]);

fn ring(img: &mut RgbImage, center: [f32; 2], radius: f32, width: i32, color: Rgb<u8>) {
    let c = (center[0].round() as i32, center[1].round() as i32);
    let r = radius.round() as i32;
    for k in 0..width.max(1) {
        draw_hollow_circle_mut(img, c, r + k, color);
    }
}

/// Annotate the normalized sheet with per-bubble states and verdicts.
///
/// Filled bubbles take their question's verdict color, ambiguous ones are
/// magenta, and the key's answer is circled in blue wherever the student did
/// not get the question right.
pub fn render_overlay(normalized: &GrayImage, grid: &BubbleGrid, results: &[QuestionResult]) -> RgbImage {
    let mut img = gray_to_rgb(normalized);
    let by_question: HashMap<u32, &QuestionResult> =
        results.iter().map(|r| (r.question_id, r)).collect();

    for cell in grid.cells() {
        let result = by_question.get(&cell.question_id);
        let (color, width) = match cell.state {
            MarkState::Empty => (EMPTY, 1),
            MarkState::Ambiguous => (AMBIGUOUS, 3),
            MarkState::Filled => {
                let color = match result.map(|r| r.verdict) {
                    Some(Verdict::Correct) => CORRECT,
                    Some(Verdict::Incorrect) => INCORRECT,
                    _ => FLAGGED,
                };
                (color, 3)
            }
        };
        ring(&mut img, cell.center, cell.radius + 1.0, width, color);

        if let Some(r) = result {
            if r.verdict != Verdict::Correct && r.correct_choices.contains(&cell.choice) {
                ring(&mut img, cell.center, cell.radius + 5.0, 2, KEY);
            }
        }
    }
    img
}
