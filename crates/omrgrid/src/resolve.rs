//! Per-question answer resolution.

use crate::classify::{BubbleCell, BubbleGrid, MarkState};
use crate::template::Choice;

/// What the student answered for one question.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "kind", content = "choices", rename_all = "snake_case")]
pub enum Resolution {
    /// Every bubble empty.
    None,
    Single(Choice),
    /// Two or more confidently filled bubbles.
    Multi(Vec<Choice>),
    /// At least one bubble could not be decided.
    Ambiguous,
}

/// One question's resolution with the evidence it was derived from.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedQuestion {
    pub question_id: u32,
    pub resolution: Resolution,
    /// Fill ratio per choice, in choice order.
    pub fill_ratios: Vec<f32>,
}

/// Resolve one question from its classified cells.
///
/// A single Filled cell still wins over Ambiguous neighbours when it is at
/// least `consensus_margin` darker than every one of them, unless one of
/// those neighbours was itself a demoted Filled mark.
pub fn resolve_question(cells: &[BubbleCell], consensus_margin: f32) -> Resolution {
    let filled: Vec<&BubbleCell> = cells
        .iter()
        .filter(|c| c.state == MarkState::Filled)
        .collect();
    let max_ambiguous = cells
        .iter()
        .filter(|c| c.state == MarkState::Ambiguous)
        .map(|c| c.fill_ratio)
        .fold(None, |acc: Option<f32>, f| Some(acc.map_or(f, |a| a.max(f))));
    let second_mark = cells.iter().any(|c| c.demoted);

    match (filled.as_slice(), max_ambiguous) {
        ([], None) => Resolution::None,
        ([one], None) => Resolution::Single(one.choice),
        (many, None) => Resolution::Multi(many.iter().map(|c| c.choice).collect()),
        ([one], Some(amb)) if !second_mark && one.fill_ratio - amb >= consensus_margin => {
            Resolution::Single(one.choice)
        }
        _ => Resolution::Ambiguous,
    }
}

pub(crate) fn resolve_grid(grid: &BubbleGrid, consensus_margin: f32) -> Vec<ResolvedQuestion> {
    grid.questions()
        .filter_map(|cells| {
            let first = cells.first()?;
            Some(ResolvedQuestion {
                question_id: first.question_id,
                resolution: resolve_question(cells, consensus_margin),
                fill_ratios: cells.iter().map(|c| c.fill_ratio).collect(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cells(fills: &[(f32, MarkState)]) -> Vec<BubbleCell> {
        fills
            .iter()
            .enumerate()
            .map(|(i, &(fill_ratio, state))| BubbleCell {
                question_id: 9,
                choice: Choice::new(i).expect("choice"),
                row: 8,
                column: i,
                center: [0.0, 0.0],
                radius: 10.0,
                fill_ratio,
                state,
                demoted: false,
            })
            .collect()
    }

    fn letter(c: char) -> Choice {
        Choice::from_letter(c).expect("letter")
    }

    use MarkState::{Ambiguous as A, Empty as E, Filled as F};

    #[test]
    fn resolution_cases() {
        let m = 0.3;
        assert_eq!(
            resolve_question(&cells(&[(0.0, E), (0.02, E), (0.0, E), (0.1, E)]), m),
            Resolution::None
        );
        assert_eq!(
            resolve_question(&cells(&[(0.0, E), (0.9, F), (0.0, E), (0.1, E)]), m),
            Resolution::Single(letter('B'))
        );
        assert_eq!(
            resolve_question(&cells(&[(0.95, F), (0.9, F), (0.0, E), (0.0, E)]), m),
            Resolution::Multi(vec![letter('A'), letter('B')])
        );
        assert_eq!(
            resolve_question(&cells(&[(0.0, E), (0.4, A), (0.0, E), (0.0, E)]), m),
            Resolution::Ambiguous
        );
    }

    #[test]
    fn clear_single_overrides_a_faint_ambiguous_mark() {
        let m = 0.3;
        let clear = cells(&[(0.95, F), (0.0, E), (0.3, A), (0.0, E)]);
        assert_eq!(resolve_question(&clear, m), Resolution::Single(letter('A')));

        let close = cells(&[(0.7, F), (0.0, E), (0.5, A), (0.0, E)]);
        assert_eq!(resolve_question(&close, m), Resolution::Ambiguous);

        let two_filled = cells(&[(0.95, F), (0.9, F), (0.3, A), (0.0, E)]);
        assert_eq!(resolve_question(&two_filled, m), Resolution::Ambiguous);
    }

    #[test]
    fn demoted_second_mark_blocks_the_consensus_override() {
        let mut q = cells(&[(1.0, F), (0.65, A), (0.0, E), (0.0, E)]);
        assert_eq!(resolve_question(&q, 0.3), Resolution::Single(letter('A')));
        q[1].demoted = true;
        assert_eq!(resolve_question(&q, 0.3), Resolution::Ambiguous);
    }

    #[test]
    fn resolver_is_pure() {
        let input = cells(&[(0.95, F), (0.0, E), (0.35, A), (0.0, E)]);
        let snapshot = input.clone();
        let first = resolve_question(&input, 0.3);
        for _ in 0..3 {
            assert_eq!(resolve_question(&input, 0.3), first);
        }
        assert_eq!(input, snapshot);
    }

    #[test]
    fn resolution_serializes_with_kind_tag() {
        let json = serde_json::to_string(&Resolution::Multi(vec![letter('A'), letter('C')]))
            .expect("ser");
        assert_eq!(json, r#"{"kind":"multi","choices":["A","C"]}"#);
        let none = serde_json::to_string(&Resolution::None).expect("ser");
        assert_eq!(none, r#"{"kind":"none"}"#);
        let back: Resolution = serde_json::from_str(r#"{"kind":"single","choices":"B"}"#).expect("de");
        assert_eq!(back, Resolution::Single(letter('B')));
    }
}
