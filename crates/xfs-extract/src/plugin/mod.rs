//! Extractor plugins and the results they hand back to the orchestrator.

use std::path::Path;

use serde::Serialize;

use crate::budget::{Bound, PassBudget};
use crate::entry::ProducedEntry;
use crate::error::{Error, Result};
use crate::extract::PassWriter;

mod carve;
mod unpack;

pub use carve::Carve;
pub use unpack::Unpack;

/// How an extractor interprets its input.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Real format logic over a known container.
    Structured,
    /// Signature scanning without trusting global structure.
    Carving,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PassStatus {
    NotApplicable,
    Succeeded,
    PartiallySucceeded,
    Failed,
}

/// Why a pass stopped before reaching the end of its input.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "reason", content = "bound")]
pub enum Interruption {
    Cancelled,
    TimedOut,
    Bound(Bound),
}

#[derive(Clone, Debug, Serialize)]
pub struct ExtractorResult {
    pub status: PassStatus,
    pub entries: Vec<ProducedEntry>,
    pub errors: Vec<String>,
    pub warrants_recursion: bool,
    pub interrupted: Option<Interruption>,
}

impl ExtractorResult {
    pub fn not_applicable() -> Self {
        Self {
            status: PassStatus::NotApplicable,
            entries: Vec::new(),
            errors: Vec::new(),
            warrants_recursion: false,
            interrupted: None,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            status: PassStatus::Failed,
            errors: vec![message.into()],
            ..Self::not_applicable()
        }
    }

    /// Fold the writer's entries and the pass outcome into a result.
    pub fn from_pass(writer: PassWriter<'_>, outcome: Result<()>) -> Self {
        let (entries, mut errors) = writer.finish();
        let interrupted = match &outcome {
            Err(Error::Cancelled) => Some(Interruption::Cancelled),
            Err(Error::TimedOut) => Some(Interruption::TimedOut),
            Err(Error::BoundExceeded(bound)) => Some(Interruption::Bound(*bound)),
            _ => None,
        };
        if let Err(e) = outcome {
            errors.push(e.to_string());
        }

        // A pass cut off by its own deadline leaves a truncated tree behind.
        let status = match (entries.is_empty(), errors.is_empty()) {
            _ if interrupted == Some(Interruption::TimedOut) => PassStatus::Failed,
            (_, true) => PassStatus::Succeeded,
            (false, false) => PassStatus::PartiallySucceeded,
            (true, false) => PassStatus::Failed,
        };
        let warrants_recursion = entries.iter().any(|entry| entry.recurse);
        Self {
            status,
            entries,
            errors,
            warrants_recursion,
            interrupted,
        }
    }

    pub fn is_usable(&self) -> bool {
        matches!(self.status, PassStatus::Succeeded | PassStatus::PartiallySucceeded)
    }
}

/// Read-only view of an artifact handed to plugins.
#[derive(Clone, Copy, Debug)]
pub struct ArtifactView<'a> {
    pub path: &'a Path,
    pub len: u64,
    /// Leading bytes of the artifact for magic sniffing.
    pub head: &'a [u8],
    pub depth: usize,
}

/// An independent extraction strategy.
///
/// `probe` must be cheap and side-effect free. `extract` writes only below
/// `output_dir`, polls `budget` while it works, and reports malformed input
/// through its result instead of failing.
pub trait Extractor: Send + Sync {
    fn name(&self) -> &str;

    fn strategy(&self) -> Strategy;

    fn probe(&self, artifact: &ArtifactView<'_>) -> bool;

    fn extract(&self, artifact: &ArtifactView<'_>, output_dir: &Path, budget: &PassBudget<'_>) -> ExtractorResult;
}

/// All built-in extractors in registration order.
pub fn default_extractors() -> Vec<Box<dyn Extractor>> {
    vec![Box::new(Unpack::new()), Box::new(Carve::new())]
}

pub fn extractor_names() -> Vec<String> {
    default_extractors().iter().map(|e| e.name().to_owned()).collect()
}

/// Built-in extractors restricted to `names`, in registration order.
///
/// Unknown names are returned as the error value.
pub fn select_extractors(names: &[String]) -> std::result::Result<Vec<Box<dyn Extractor>>, Vec<String>> {
    let all = default_extractors();
    let unknown: Vec<String> = names
        .iter()
        .filter(|name| !all.iter().any(|e| e.name() == name.as_str()))
        .cloned()
        .collect();
    if !unknown.is_empty() {
        return Err(unknown);
    }
    Ok(all.into_iter().filter(|e| names.iter().any(|n| n == e.name())).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::budget::{CancelToken, ExtractionBudget};
    use std::time::Duration;
    use tempfile::tempdir;

    #[test]
    fn registry_filters_by_name() {
        let selected = select_extractors(&["carve".to_owned()]).unwrap();
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].strategy(), Strategy::Carving);

        let unknown = select_extractors(&["binwalk".to_owned(), "unpack".to_owned()]).err().unwrap();
        assert_eq!(unknown, vec!["binwalk".to_owned()]);
        assert_eq!(extractor_names(), vec!["unpack".to_owned(), "carve".to_owned()]);
    }

    #[test]
    fn timeout_fails_even_with_entries() {
        let dir = tempdir().unwrap();
        let budget = ExtractionBudget::new(u64::MAX, CancelToken::new());
        let pass = budget.pass(Duration::from_secs(60));
        let mut writer = PassWriter::new(dir.path(), &pass);
        writer.file(Path::new("a"), None, &mut &b"a"[..]).unwrap();

        let result = ExtractorResult::from_pass(writer, Err(Error::TimedOut));
        assert_eq!(result.status, PassStatus::Failed);
        assert_eq!(result.interrupted, Some(Interruption::TimedOut));
        assert_eq!(result.entries.len(), 1);
        assert!(!result.errors.is_empty());
        assert!(!result.is_usable());
    }

    #[test]
    fn bound_interruption_marks_partial() {
        let dir = tempdir().unwrap();
        let budget = ExtractionBudget::new(u64::MAX, CancelToken::new());
        let pass = budget.pass(Duration::from_secs(60));
        let mut writer = PassWriter::new(dir.path(), &pass);
        writer.file(Path::new("a"), None, &mut &b"a"[..]).unwrap();

        let result = ExtractorResult::from_pass(writer, Err(Error::BoundExceeded(Bound::TotalBytes)));
        assert_eq!(result.status, PassStatus::PartiallySucceeded);
        assert!(result.is_usable());
    }

    #[test]
    fn empty_clean_pass_succeeds() {
        let dir = tempdir().unwrap();
        let budget = ExtractionBudget::new(u64::MAX, CancelToken::new());
        let pass = budget.pass(Duration::from_secs(60));
        let writer = PassWriter::new(dir.path(), &pass);

        let result = ExtractorResult::from_pass(writer, Ok(()));
        assert_eq!(result.status, PassStatus::Succeeded);
        assert!(!result.warrants_recursion);
    }

    #[test]
    fn errors_without_entries_fail() {
        let dir = tempdir().unwrap();
        let budget = ExtractionBudget::new(u64::MAX, CancelToken::new());
        let pass = budget.pass(Duration::from_secs(60));
        let writer = PassWriter::new(dir.path(), &pass);

        let result = ExtractorResult::from_pass(writer, Err(Error::Corrupted("bad".into())));
        assert_eq!(result.status, PassStatus::Failed);
        assert_eq!(result.interrupted, None);
    }
}
