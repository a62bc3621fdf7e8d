//! Candidate discovery over a quiescent extraction forest.
//!
//! Scoring reads only node metadata recorded in the forest, never the disk,
//! so two forests with the same structure score identically wherever their
//! scratch directories live.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::Serialize;
use sha2::{Digest, Sha256};
use xfs_extract::{ExtractionForest, ExtractionNode, NodeId, NodeKind, PassId, Strategy};

/// Top-level directories of a conventional Linux root.
const STANDARD_DIRS: &[&str] = &[
    "bin", "boot", "dev", "etc", "home", "lib", "mnt", "opt", "proc", "root", "run", "sbin", "sys", "tmp", "usr", "var",
];
const CREDENTIAL_PATHS: &[&str] = &["etc/passwd", "etc/shadow"];
const BIN_DIRS: &[&str] = &["bin", "usr/bin"];
const LIB_DIRS: &[&str] = &["lib", "lib64", "usr/lib"];
const SHELL_PATHS: &[&str] = &["bin/sh", "bin/busybox", "usr/bin/sh"];
const INIT_PATHS: &[&str] = &["sbin/init", "init", "linuxrc", "etc/inittab", "etc/init.d", "etc/rc.d"];

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Signal {
    Credentials,
    BinDir,
    LibDir,
    EtcDir,
    Shell,
    Init,
    Executables,
    StandardLayout,
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Credentials => "credentials",
            Self::BinDir => "bin_dir",
            Self::LibDir => "lib_dir",
            Self::EtcDir => "etc_dir",
            Self::Shell => "shell",
            Self::Init => "init",
            Self::Executables => "executables",
            Self::StandardLayout => "standard_layout",
        };
        f.write_str(name)
    }
}

/// Tunable weights and thresholds for candidate scoring.
#[derive(Clone, Debug, PartialEq)]
pub struct ScoringPolicy {
    pub credentials: f64,
    pub bin_dir: f64,
    pub lib_dir: f64,
    pub etc_dir: f64,
    pub shell: f64,
    pub init: f64,
    pub executables: f64,
    pub standard_layout: f64,
    /// Directories with fewer files are never candidates.
    pub min_files: usize,
    pub min_signals: usize,
    /// Share of regular files that must be executable.
    pub executable_ratio: f64,
    /// Standard top-level directories required for `standard_layout`.
    pub standard_dirs_required: usize,
    /// File count at which the size penalty starts to bite.
    pub size_scale: f64,
}

impl Default for ScoringPolicy {
    fn default() -> Self {
        Self {
            credentials: 3.0,
            bin_dir: 2.0,
            lib_dir: 2.0,
            etc_dir: 1.0,
            shell: 1.5,
            init: 2.0,
            executables: 1.0,
            standard_layout: 1.0,
            min_files: 3,
            min_signals: 2,
            executable_ratio: 0.05,
            standard_dirs_required: 4,
            size_scale: 4096.0,
        }
    }
}

impl ScoringPolicy {
    pub fn weight(&self, signal: Signal) -> f64 {
        match signal {
            Signal::Credentials => self.credentials,
            Signal::BinDir => self.bin_dir,
            Signal::LibDir => self.lib_dir,
            Signal::EtcDir => self.etc_dir,
            Signal::Shell => self.shell,
            Signal::Init => self.init,
            Signal::Executables => self.executables,
            Signal::StandardLayout => self.standard_layout,
        }
    }

    /// Divide the raw sum so huge catch-all trees do not win on volume.
    pub fn normalize(&self, raw: f64, files: usize) -> f64 {
        raw / (2.0 + files as f64 / self.size_scale).log2()
    }
}

/// A scored directory hypothesized to be the root filesystem.
#[derive(Clone, Debug, Serialize)]
pub struct Candidate {
    #[serde(skip)]
    pub root: NodeId,
    #[serde(skip)]
    pub pass: PassId,
    pub extractor: String,
    pub strategy: Strategy,
    /// Path inside the pass output directory; empty for the pass root.
    pub relative_path: PathBuf,
    #[serde(skip)]
    pub disk_path: PathBuf,
    pub file_count: usize,
    pub signals: Vec<Signal>,
    pub raw_score: f64,
    pub score: f64,
    /// SHA-256 over the sorted content listing of the subtree.
    pub fingerprint: String,
    /// Position in forest traversal order.
    pub discovery: usize,
    /// Other candidates with the same fingerprint that were folded into this one.
    pub duplicates: Vec<PathBuf>,
}

#[derive(Clone, Copy, Default)]
struct Tally {
    files: usize,
    regular: usize,
    executables: usize,
}

/// Score every directory of every pass and return the surviving candidates.
///
/// Nested candidates below an equal or higher scoring candidate of the same
/// pass are dropped; identical subtrees collapse into the one the selector
/// would prefer.
pub fn score_forest(forest: &ExtractionForest, policy: &ScoringPolicy) -> Vec<Candidate> {
    let mut candidates = Vec::new();
    let mut discovery = 0;

    for pass in forest.passes() {
        let root = forest.node(pass.root);
        let mut nodes: Vec<&ExtractionNode> = vec![root];
        nodes.extend(forest.descendants(pass.root));

        let mut tallies: HashMap<NodeId, Tally> = HashMap::new();
        for node in nodes.iter().rev() {
            let mut tally = tallies.get(&node.id).copied().unwrap_or_default();
            if !node.is_directory() {
                tally.files += 1;
                if node.is_file() {
                    tally.regular += 1;
                    tally.executables += usize::from(node.is_executable());
                }
            }
            tallies.insert(node.id, tally);
            if node.id != pass.root {
                if let Some(parent) = node.parent {
                    let parent_tally = tallies.entry(parent).or_default();
                    parent_tally.files += tally.files;
                    parent_tally.regular += tally.regular;
                    parent_tally.executables += tally.executables;
                }
            }
        }

        let mut pass_candidates: Vec<Candidate> = Vec::new();
        for node in nodes.iter().filter(|n| n.is_directory()) {
            discovery += 1;
            let tally = tallies.get(&node.id).copied().unwrap_or_default();
            if tally.files < policy.min_files {
                continue;
            }
            let signals = detect_signals(forest, node.id, tally, policy);
            if signals.len() < policy.min_signals {
                continue;
            }
            let raw_score: f64 = signals.iter().map(|s| policy.weight(*s)).sum();
            pass_candidates.push(Candidate {
                root: node.id,
                pass: pass.id,
                extractor: pass.extractor.clone(),
                strategy: pass.strategy,
                relative_path: node.path.clone(),
                disk_path: forest.disk_path(node.id),
                file_count: tally.files,
                signals,
                raw_score,
                score: policy.normalize(raw_score, tally.files),
                fingerprint: fingerprint(forest, node),
                discovery,
                duplicates: Vec::new(),
            });
        }
        candidates.extend(drop_nested(pass_candidates));
    }

    let candidates = collapse_duplicates(candidates);
    tracing::debug!(count = candidates.len(), "candidates scored");
    candidates
}

fn detect_signals(forest: &ExtractionForest, dir: NodeId, tally: Tally, policy: &ScoringPolicy) -> Vec<Signal> {
    let exists = |paths: &[&str]| paths.iter().any(|p| lookup(forest, dir, p).is_some());
    let is_dir_like = |paths: &[&str]| {
        paths
            .iter()
            .filter_map(|p| lookup(forest, dir, p))
            .any(|n| n.is_directory() || matches!(n.kind, NodeKind::Symlink { .. }))
    };

    let mut signals = Vec::new();
    if exists(CREDENTIAL_PATHS) {
        signals.push(Signal::Credentials);
    }
    if is_dir_like(BIN_DIRS) {
        signals.push(Signal::BinDir);
    }
    if is_dir_like(LIB_DIRS) {
        signals.push(Signal::LibDir);
    }
    if lookup(forest, dir, "etc").is_some_and(ExtractionNode::is_directory) {
        signals.push(Signal::EtcDir);
    }
    if exists(SHELL_PATHS) {
        signals.push(Signal::Shell);
    }
    if exists(INIT_PATHS) {
        signals.push(Signal::Init);
    }
    if tally.regular > 0 && tally.executables as f64 / tally.regular as f64 >= policy.executable_ratio {
        signals.push(Signal::Executables);
    }
    let standard = STANDARD_DIRS
        .iter()
        .filter(|name| lookup(forest, dir, name).is_some())
        .count();
    if standard >= policy.standard_dirs_required {
        signals.push(Signal::StandardLayout);
    }
    signals
}

/// Resolve `relative` below `dir` by walking child names; symlinks are not followed.
fn lookup<'f>(forest: &'f ExtractionForest, dir: NodeId, relative: &str) -> Option<&'f ExtractionNode> {
    let mut current = forest.node(dir);
    for component in Path::new(relative).components() {
        let name = component.as_os_str();
        current = current
            .children
            .iter()
            .map(|id| forest.node(*id))
            .find(|child| child.pass == current.pass && child.path.file_name() == Some(name))?;
    }
    Some(current)
}

fn fingerprint(forest: &ExtractionForest, dir: &ExtractionNode) -> String {
    let mut hasher = Sha256::new();
    for node in forest.descendants(dir.id) {
        let relative = node.path.strip_prefix(&dir.path).unwrap_or(&node.path);
        hasher.update(relative.to_string_lossy().as_bytes());
        hasher.update([0]);
        hasher.update(node.kind.tag().as_bytes());
        hasher.update([0]);
        hasher.update(node.size.to_le_bytes());
        match (&node.kind, &node.digest) {
            (NodeKind::Symlink { target }, _) => hasher.update(target.to_string_lossy().as_bytes()),
            (_, Some(digest)) => hasher.update(digest.as_bytes()),
            _ => {}
        }
        hasher.update([b'\n']);
    }
    hex::encode(hasher.finalize())
}

fn drop_nested(mut candidates: Vec<Candidate>) -> Vec<Candidate> {
    let snapshot: Vec<(PathBuf, f64)> = candidates
        .iter()
        .map(|c| (c.relative_path.clone(), c.score))
        .collect();
    candidates.retain(|candidate| {
        !snapshot.iter().any(|(path, score)| {
            path != &candidate.relative_path && candidate.relative_path.starts_with(path) && *score >= candidate.score
        })
    });
    candidates
}

fn collapse_duplicates(candidates: Vec<Candidate>) -> Vec<Candidate> {
    let mut groups: Vec<Vec<Candidate>> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();
    for candidate in candidates {
        match index.get(&candidate.fingerprint) {
            Some(&i) => groups[i].push(candidate),
            None => {
                index.insert(candidate.fingerprint.clone(), groups.len());
                groups.push(vec![candidate]);
            }
        }
    }

    groups
        .into_iter()
        .filter_map(|mut group| {
            group.sort_by(crate::select::preference);
            let mut iter = group.into_iter();
            let mut kept = iter.next()?;
            for duplicate in iter {
                tracing::debug!(
                    kept = %kept.relative_path.display(),
                    duplicate = %duplicate.relative_path.display(),
                    extractor = %duplicate.extractor,
                    "identical candidate collapsed"
                );
                kept.duplicates.push(duplicate.disk_path);
            }
            Some(kept)
        })
        .collect()
}
