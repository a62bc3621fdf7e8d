//! Winner selection over scored candidates.

use std::cmp::Ordering;

use crate::score::Candidate;

/// Lower scores below this floor are reported instead of materialized.
pub const DEFAULT_CONFIDENCE_FLOOR: f64 = 5.0;

#[derive(Clone, Debug)]
pub enum SelectionResult {
    Selected {
        winner: Candidate,
        runners_up: Vec<Candidate>,
    },
    LowConfidence {
        best: Candidate,
        runners_up: Vec<Candidate>,
        floor: f64,
    },
    NoRootfsFound,
}

impl SelectionResult {
    pub fn winner(&self) -> Option<&Candidate> {
        match self {
            Self::Selected { winner, .. } => Some(winner),
            Self::LowConfidence { best, .. } => Some(best),
            Self::NoRootfsFound => None,
        }
    }

    pub fn runners_up(&self) -> &[Candidate] {
        match self {
            Self::Selected { runners_up, .. } | Self::LowConfidence { runners_up, .. } => runners_up,
            Self::NoRootfsFound => &[],
        }
    }
}

/// Total preference order: higher score, then structured over carving, then
/// the smaller tree, then earlier discovery.
pub fn preference(a: &Candidate, b: &Candidate) -> Ordering {
    b.score
        .total_cmp(&a.score)
        .then_with(|| a.strategy.cmp(&b.strategy))
        .then_with(|| a.file_count.cmp(&b.file_count))
        .then_with(|| a.discovery.cmp(&b.discovery))
}

/// Pick the best candidate. Deterministic for a given candidate set
/// regardless of input order.
pub fn select(mut candidates: Vec<Candidate>, floor: f64) -> SelectionResult {
    candidates.sort_by(preference);
    let mut ranked = candidates.into_iter();
    let Some(best) = ranked.next() else {
        return SelectionResult::NoRootfsFound;
    };
    let runners_up: Vec<Candidate> = ranked.collect();

    if best.score >= floor {
        tracing::info!(
            extractor = %best.extractor,
            path = %best.disk_path.display(),
            score = best.score,
            runners_up = runners_up.len(),
            "rootfs selected"
        );
        SelectionResult::Selected {
            winner: best,
            runners_up,
        }
    } else {
        tracing::warn!(score = best.score, floor, "best candidate is below the confidence floor");
        SelectionResult::LowConfidence {
            best,
            runners_up,
            floor,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use xfs_extract::{NodeId, PassId, Strategy};

    fn candidate(score: f64, strategy: Strategy, files: usize, discovery: usize) -> Candidate {
        Candidate {
            root: NodeId(discovery),
            pass: PassId(0),
            extractor: format!("x{discovery}"),
            strategy,
            relative_path: PathBuf::new(),
            disk_path: PathBuf::from(format!("/s/{discovery}")),
            file_count: files,
            signals: Vec::new(),
            raw_score: score,
            score,
            fingerprint: discovery.to_string(),
            discovery,
            duplicates: Vec::new(),
        }
    }

    #[test]
    fn empty_set_finds_nothing() {
        assert!(matches!(select(Vec::new(), 5.0), SelectionResult::NoRootfsFound));
    }

    #[test]
    fn highest_score_wins() {
        let result = select(
            vec![candidate(6.0, Strategy::Structured, 10, 1), candidate(9.0, Strategy::Carving, 10, 2)],
            5.0,
        );
        let SelectionResult::Selected { winner, runners_up } = result else {
            panic!("expected selection");
        };
        assert_eq!(winner.discovery, 2);
        assert_eq!(runners_up.len(), 1);
        assert_eq!(runners_up[0].discovery, 1);
    }

    #[test]
    fn ties_break_structured_then_smaller_then_earlier() {
        let structured = candidate(8.0, Strategy::Structured, 50, 3);
        let carving = candidate(8.0, Strategy::Carving, 5, 1);
        assert_eq!(preference(&structured, &carving), Ordering::Less);

        let small = candidate(8.0, Strategy::Structured, 5, 9);
        assert_eq!(preference(&small, &structured), Ordering::Less);

        let early = candidate(8.0, Strategy::Structured, 5, 2);
        assert_eq!(preference(&early, &small), Ordering::Less);
    }

    #[test]
    fn selection_ignores_input_order() {
        let set = vec![
            candidate(7.0, Strategy::Carving, 4, 1),
            candidate(7.0, Strategy::Structured, 4, 2),
            candidate(3.0, Strategy::Structured, 4, 3),
        ];
        let mut reversed = set.clone();
        reversed.reverse();
        let a = select(set, 5.0).winner().map(|c| c.discovery);
        let b = select(reversed, 5.0).winner().map(|c| c.discovery);
        assert_eq!(a, Some(2));
        assert_eq!(a, b);
    }

    #[test]
    fn weak_best_is_low_confidence() {
        let result = select(vec![candidate(2.5, Strategy::Structured, 4, 1)], 5.0);
        assert!(matches!(result, SelectionResult::LowConfidence { floor, .. } if floor == 5.0));
    }
}
