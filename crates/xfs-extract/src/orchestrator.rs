//! Breadth-first extraction over a bounded work queue.
//!
//! Artifacts of one depth form a wave. Every (extractor, artifact) pair of a
//! wave is assigned its own scratch area up front and then run on the worker
//! pool; results are folded into the forest in submission order so the forest
//! is identical regardless of scheduling.

use std::collections::{BTreeMap, HashMap};
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use rayon::prelude::*;
use serde::Serialize;
use sha2::{Digest, Sha256};
use xfs_fs::{Resource, ScratchWorkspace};

use crate::budget::{Bound, CancelToken, ExtractionBudget};
use crate::error::{Error, Result};
use crate::forest::{ArtifactId, ExtractionForest, NodeId, PassId};
use crate::plugin::{ArtifactView, Extractor, ExtractorResult, Interruption, PassStatus, Strategy};

/// Leading bytes read from every artifact for probing.
const PROBE_LEN: usize = 1024;

#[derive(Clone, Debug)]
pub struct OrchestratorConfig {
    pub depth_limit: usize,
    pub max_artifacts: usize,
    pub max_total_bytes: u64,
    pub extractor_timeout: Duration,
    pub run_deadline: Option<Instant>,
    /// Worker threads; 0 uses every available core.
    pub jobs: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            depth_limit: 8,
            max_artifacts: 512,
            max_total_bytes: 8 * 1024 * 1024 * 1024,
            extractor_timeout: Duration::from_secs(20),
            run_deadline: None,
            jobs: 0,
        }
    }
}

/// Emitted as each (extractor, artifact) pass finishes.
#[derive(Clone, Debug)]
pub struct ExtractionProgress {
    pub artifact: PathBuf,
    pub extractor: String,
    pub completed: usize,
    pub scheduled: usize,
}

impl ExtractionProgress {
    /// Share of the passes scheduled so far that have finished.
    pub fn percent(&self) -> f32 {
        if self.scheduled == 0 {
            return 100.0;
        }
        self.completed as f32 * 100.0 / self.scheduled as f32
    }
}

pub type ProgressCallback = Arc<dyn Fn(ExtractionProgress) + Send + Sync>;

/// Outcome of one probe or extraction attempt, kept for reporting.
#[derive(Clone, Debug, Serialize)]
pub struct PassRecord {
    pub extractor: String,
    pub strategy: Strategy,
    pub artifact: ArtifactId,
    pub artifact_path: PathBuf,
    pub depth: usize,
    #[serde(skip)]
    pub pass: Option<PassId>,
    pub status: PassStatus,
    pub node_count: usize,
    pub errors: Vec<String>,
    pub interrupted: Option<Interruption>,
}

/// Recovered faults surfaced as warnings.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Diagnostic {
    ExtractorCrashed {
        extractor: String,
        artifact: PathBuf,
        message: String,
    },
    ExtractionBoundsExceeded {
        bound: Bound,
        occurrences: usize,
        detail: String,
    },
}

pub struct Extraction {
    pub forest: ExtractionForest,
    pub records: Vec<PassRecord>,
    pub diagnostics: Vec<Diagnostic>,
    /// False when any bound cut extraction short.
    pub complete: bool,
    pub bytes_extracted: u64,
}

pub struct Orchestrator {
    extractors: Vec<Box<dyn Extractor>>,
    config: OrchestratorConfig,
    cancel: CancelToken,
    on_progress: Option<ProgressCallback>,
}

struct Job {
    artifact: ArtifactId,
    extractor: usize,
    path: PathBuf,
    len: u64,
    depth: usize,
    head: Arc<Vec<u8>>,
    output_dir: PathBuf,
}

enum JobOutcome {
    Finished(ExtractorResult),
    Crashed(String),
}

#[derive(Default)]
struct BoundLog {
    hits: BTreeMap<Bound, (usize, String)>,
}

impl BoundLog {
    fn hit(&mut self, bound: Bound, detail: impl FnOnce() -> String) {
        let slot = self.hits.entry(bound).or_insert_with(|| (0, detail()));
        slot.0 += 1;
    }
}

impl Orchestrator {
    pub fn new(extractors: Vec<Box<dyn Extractor>>, config: OrchestratorConfig) -> Self {
        Self {
            extractors,
            config,
            cancel: CancelToken::new(),
            on_progress: None,
        }
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn on_progress(mut self, callback: ProgressCallback) -> Self {
        self.on_progress = Some(callback);
        self
    }

    /// Extract `firmware` recursively into areas of `workspace`.
    ///
    /// Only cancellation, unreadable input and workspace failures are errors;
    /// everything else is folded into records and diagnostics.
    pub fn run(&self, firmware: &Path, workspace: &ScratchWorkspace) -> Result<Extraction> {
        let resource = Resource::new(firmware)?;
        let digest = hex::encode(Sha256::digest(resource.content()?.as_slice()));
        let mut forest = ExtractionForest::new(firmware, resource.len(), digest.clone());
        let mut seen: HashMap<String, ArtifactId> = HashMap::from([(digest, ArtifactId(0))]);

        let budget = ExtractionBudget::new(self.config.max_total_bytes, self.cancel.clone())
            .with_run_deadline(self.config.run_deadline);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.config.jobs)
            .thread_name(|i| format!("xfs-extract-{i}"))
            .build()
            .map_err(|e| Error::WorkerPool(e.to_string()))?;

        let mut records = Vec::new();
        let mut diagnostics = Vec::new();
        let mut bounds = BoundLog::default();
        let completed = AtomicUsize::new(0);
        let mut scheduled = 0;
        let mut wave = vec![ArtifactId(0)];

        while !wave.is_empty() {
            if budget.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let depth = forest.artifact(wave[0]).depth;
            let _span = tracing::info_span!("wave", depth, artifacts = wave.len()).entered();

            let mut jobs = Vec::new();
            for &artifact_id in &wave {
                let artifact = forest.artifact(artifact_id);
                let head = match Resource::new(artifact.path.as_path()).and_then(|r| r.head(PROBE_LEN)) {
                    Ok(head) => Arc::new(head),
                    Err(e) => {
                        tracing::warn!(artifact = %artifact.path.display(), error = %e, "artifact unreadable");
                        continue;
                    }
                };
                let view = ArtifactView {
                    path: &artifact.path,
                    len: artifact.size,
                    head: &head,
                    depth: artifact.depth,
                };

                for (index, extractor) in self.extractors.iter().enumerate() {
                    if !extractor.probe(&view) {
                        records.push(PassRecord {
                            extractor: extractor.name().to_owned(),
                            strategy: extractor.strategy(),
                            artifact: artifact_id,
                            artifact_path: artifact.path.clone(),
                            depth: artifact.depth,
                            pass: None,
                            status: PassStatus::NotApplicable,
                            node_count: 0,
                            errors: Vec::new(),
                            interrupted: None,
                        });
                        continue;
                    }
                    let output_dir = workspace.assign_area(&format!("{:04}-{}", artifact_id.0, extractor.name()))?;
                    jobs.push(Job {
                        artifact: artifact_id,
                        extractor: index,
                        path: artifact.path.clone(),
                        len: artifact.size,
                        depth: artifact.depth,
                        head: Arc::clone(&head),
                        output_dir,
                    });
                }
            }
            scheduled += jobs.len();

            let outcomes: Vec<JobOutcome> = pool.install(|| {
                jobs.par_iter()
                    .map(|job| {
                        let outcome = self.run_job(job, &budget);
                        let done = completed.fetch_add(1, Ordering::SeqCst) + 1;
                        if let Some(callback) = &self.on_progress {
                            callback(ExtractionProgress {
                                artifact: job.path.clone(),
                                extractor: self.extractors[job.extractor].name().to_owned(),
                                completed: done,
                                scheduled,
                            });
                        }
                        outcome
                    })
                    .collect()
            });

            let mut next_wave = Vec::new();
            for (job, outcome) in jobs.iter().zip(outcomes) {
                let extractor = &self.extractors[job.extractor];
                let result = match outcome {
                    JobOutcome::Finished(result) => result,
                    JobOutcome::Crashed(message) => {
                        tracing::warn!(extractor = extractor.name(), artifact = %job.path.display(), %message, "extractor crashed");
                        diagnostics.push(Diagnostic::ExtractorCrashed {
                            extractor: extractor.name().to_owned(),
                            artifact: job.path.clone(),
                            message: message.clone(),
                        });
                        ExtractorResult::failed(format!("extractor crashed: {message}"))
                    }
                };

                match result.interrupted {
                    Some(Interruption::Bound(bound)) => bounds.hit(bound, || format!("{} on {}", extractor.name(), job.path.display())),
                    Some(Interruption::TimedOut) => {
                        tracing::warn!(extractor = extractor.name(), artifact = %job.path.display(), "extractor timed out")
                    }
                    _ => {}
                }

                let pass = result
                    .is_usable()
                    .then(|| forest.add_pass(extractor.name(), extractor.strategy(), job.artifact, &job.output_dir, &result.entries));
                tracing::debug!(
                    extractor = extractor.name(),
                    artifact = %job.path.display(),
                    status = ?result.status,
                    entries = result.entries.len(),
                    errors = result.errors.len(),
                    "pass finished"
                );
                records.push(PassRecord {
                    extractor: extractor.name().to_owned(),
                    strategy: extractor.strategy(),
                    artifact: job.artifact,
                    artifact_path: job.path.clone(),
                    depth: job.depth,
                    pass,
                    status: result.status,
                    node_count: result.entries.len(),
                    errors: result.errors.clone(),
                    interrupted: result.interrupted,
                });

                if let Some(pass) = pass.filter(|_| result.warrants_recursion) {
                    self.enqueue_children(&mut forest, pass, &mut seen, &mut bounds, &budget, &mut next_wave);
                }
            }

            if budget.is_cancelled() {
                return Err(Error::Cancelled);
            }
            wave = next_wave;
        }

        for (bound, (occurrences, detail)) in &bounds.hits {
            tracing::warn!(%bound, occurrences, %detail, "extraction bound exceeded");
            diagnostics.push(Diagnostic::ExtractionBoundsExceeded {
                bound: *bound,
                occurrences: *occurrences,
                detail: detail.clone(),
            });
        }

        tracing::info!(
            artifacts = forest.artifacts().len(),
            passes = forest.passes().len(),
            nodes = forest.nodes().len(),
            bytes = budget.used(),
            "extraction finished"
        );
        Ok(Extraction {
            complete: bounds.hits.is_empty(),
            bytes_extracted: budget.used(),
            forest,
            records,
            diagnostics,
        })
    }

    fn run_job(&self, job: &Job, budget: &ExtractionBudget) -> JobOutcome {
        let extractor = &self.extractors[job.extractor];
        let pass = budget.pass(self.config.extractor_timeout);
        let view = ArtifactView {
            path: &job.path,
            len: job.len,
            head: &job.head,
            depth: job.depth,
        };
        let _span = tracing::debug_span!("pass", extractor = extractor.name(), artifact = %job.path.display()).entered();

        match panic::catch_unwind(AssertUnwindSafe(|| extractor.extract(&view, &job.output_dir, &pass))) {
            Ok(result) => JobOutcome::Finished(result),
            Err(payload) => JobOutcome::Crashed(panic_message(payload.as_ref())),
        }
    }

    /// Queue files of `pass` that warrant recursion, honouring every bound.
    fn enqueue_children(
        &self,
        forest: &mut ExtractionForest,
        pass: PassId,
        seen: &mut HashMap<String, ArtifactId>,
        bounds: &mut BoundLog,
        budget: &ExtractionBudget,
        next_wave: &mut Vec<ArtifactId>,
    ) {
        let parent = forest.pass(pass).artifact;
        let depth = forest.artifact(parent).depth + 1;
        let root = forest.pass(pass).root;
        let recursing: Vec<(NodeId, String, PathBuf)> = forest
            .descendants(root)
            .filter(|node| node.is_file() && node.recurse)
            .filter_map(|node| Some((node.id, node.digest.clone()?, node.path.clone())))
            .collect();

        for (node, digest, path) in recursing {
            if forest.is_ancestor_digest(parent, &digest) {
                bounds.hit(Bound::Cycle, || format!("{} reproduces an ancestor", path.display()));
                continue;
            }
            if seen.contains_key(&digest) {
                tracing::debug!(path = %path.display(), "content already queued");
                continue;
            }
            if depth > self.config.depth_limit {
                bounds.hit(Bound::Depth, || format!("{} at depth {depth}", path.display()));
                continue;
            }
            if forest.artifacts().len() >= self.config.max_artifacts {
                bounds.hit(Bound::ArtifactCount, || format!("{} over {} artifacts", path.display(), self.config.max_artifacts));
                continue;
            }
            if budget.is_exhausted() {
                bounds.hit(Bound::TotalBytes, || format!("{} after {} bytes", path.display(), budget.used()));
                continue;
            }
            let id = forest.add_artifact(node, depth, parent);
            seen.insert(digest, id);
            next_wave.push(id);
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}
