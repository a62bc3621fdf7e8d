//! Machine-readable summary of a finished run.

use std::path::{Path, PathBuf};

use serde::Serialize;
use xfs_extract::{DeviceKind, Diagnostic, ExtractionForest, NodeKind, PassRecord, Strategy};

use crate::materialize::OutputArtifactSet;
use crate::score::{Candidate, Signal};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Selected,
    /// The best candidate was below the confidence floor and accepted explicitly.
    LowConfidenceAccepted,
}

/// Output locations, relative to the working directory when they lie below it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ReportedOutputs {
    pub archive: PathBuf,
    pub archive_replaced: bool,
    pub rootfs: Option<PathBuf>,
    pub scratch: Option<PathBuf>,
}

impl ReportedOutputs {
    pub fn new(outputs: &OutputArtifactSet) -> Self {
        Self {
            archive: relative_to_cwd(&outputs.archive.path),
            archive_replaced: outputs.archive.replaced,
            rootfs: outputs.rootfs.as_ref().map(|s| relative_to_cwd(&s.path)),
            scratch: outputs.scratch.as_ref().map(|s| relative_to_cwd(&s.path)),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CandidateSummary {
    pub extractor: String,
    pub strategy: Strategy,
    /// Location inside the scratch workspace.
    pub path: PathBuf,
    pub files: usize,
    pub score: f64,
    pub signals: Vec<Signal>,
    pub duplicates: Vec<PathBuf>,
    pub selected: bool,
}

impl CandidateSummary {
    pub fn new(candidate: &Candidate, scratch: &Path, selected: bool) -> Self {
        let inside = |path: &Path| path.strip_prefix(scratch).unwrap_or(path).to_path_buf();
        Self {
            extractor: candidate.extractor.clone(),
            strategy: candidate.strategy,
            path: inside(candidate.disk_path.as_path()),
            files: candidate.file_count,
            score: candidate.score,
            signals: candidate.signals.clone(),
            duplicates: candidate.duplicates.iter().map(|p| inside(p.as_path())).collect(),
            selected,
        }
    }
}

/// A special file of the selected tree that was recorded but not created.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct DeviceNode {
    pub path: PathBuf,
    pub device: DeviceKind,
}

/// Special files below `candidate`, relative to the candidate root.
pub fn device_nodes(forest: &ExtractionForest, candidate: &Candidate) -> Vec<DeviceNode> {
    forest
        .descendants(candidate.root)
        .filter_map(|node| match node.kind {
            NodeKind::DevicePlaceholder { device } => Some(DeviceNode {
                path: node
                    .path
                    .strip_prefix(&candidate.relative_path)
                    .unwrap_or(&node.path)
                    .to_path_buf(),
                device,
            }),
            _ => None,
        })
        .collect()
}

#[derive(Clone, Debug, Serialize)]
pub struct RunReport {
    pub outcome: Outcome,
    pub firmware: PathBuf,
    pub firmware_sha256: String,
    pub outputs: ReportedOutputs,
    pub winner: CandidateSummary,
    pub candidates: Vec<CandidateSummary>,
    pub extractors: Vec<PassRecord>,
    pub diagnostics: Vec<Diagnostic>,
    pub device_nodes: Vec<DeviceNode>,
    pub extraction_complete: bool,
    pub bytes_extracted: u64,
}

impl RunReport {
    /// Name of the extractor that produced the selected tree.
    pub fn best_extractor(&self) -> &str {
        &self.winner.extractor
    }
}

/// `path` relative to the current directory if it lies below it.
pub fn relative_to_cwd(path: &Path) -> PathBuf {
    let Ok(cwd) = std::env::current_dir() else {
        return path.to_path_buf();
    };
    match path.strip_prefix(&cwd) {
        Ok(relative) if relative.as_os_str().is_empty() => PathBuf::from("."),
        Ok(relative) => relative.to_path_buf(),
        Err(_) => path.to_path_buf(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use xfs_extract::{ArtifactId, ProducedEntry};

    #[test]
    fn relative_paths_below_cwd() {
        let cwd = std::env::current_dir().unwrap();
        assert_eq!(relative_to_cwd(&cwd.join("out/rootfs.tar.gz")), PathBuf::from("out/rootfs.tar.gz"));
        assert_eq!(relative_to_cwd(Path::new("rel/x")), PathBuf::from("rel/x"));
    }

    #[test]
    fn device_nodes_are_relative_to_candidate() {
        let mut forest = ExtractionForest::new("/fw", 1, "00");
        let entries = vec![
            ProducedEntry {
                path: "root/dev/console".into(),
                kind: NodeKind::DevicePlaceholder { device: DeviceKind::Char },
                size: 0,
                mode: 0o600,
                digest: None,
                recurse: false,
            },
            ProducedEntry {
                path: "root/etc/passwd".into(),
                kind: NodeKind::File,
                size: 4,
                mode: 0o644,
                digest: Some("ab".into()),
                recurse: false,
            },
        ];
        let pass = forest.add_pass("unpack", Strategy::Structured, ArtifactId(0), "/s/a", &entries);
        let root = forest
            .descendants(forest.pass(pass).root)
            .find(|n| n.path == Path::new("root"))
            .unwrap()
            .id;
        let candidate = Candidate {
            root,
            pass,
            extractor: "unpack".into(),
            strategy: Strategy::Structured,
            relative_path: "root".into(),
            disk_path: "/s/a/root".into(),
            file_count: 2,
            signals: Vec::new(),
            raw_score: 0.0,
            score: 0.0,
            fingerprint: String::new(),
            discovery: 0,
            duplicates: vec!["/s/b/root".into()],
        };

        let devices = device_nodes(&forest, &candidate);
        assert_eq!(
            devices,
            vec![DeviceNode {
                path: "dev/console".into(),
                device: DeviceKind::Char
            }]
        );
        let summary = CandidateSummary::new(&candidate, Path::new("/s"), true);
        assert_eq!(summary.path, PathBuf::from("a/root"));
        assert_eq!(summary.duplicates, vec![PathBuf::from("b/root")]);
    }
}
