//! One end-to-end extraction run.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use xfs_extract::{
    CancelToken, Extraction, Extractor, ExtractionProgress, Orchestrator, PassStatus, default_extractors,
    select_extractors,
};
use xfs_fs::{OutputTransaction, ScratchWorkspace};

use crate::config::RunConfig;
use crate::error::{Result, RunError};
use crate::materialize::{OutputLayout, materialize};
use crate::progress::{NullSink, ProgressEvent, ProgressSink, RunPhase};
use crate::report::{CandidateSummary, Outcome, ReportedOutputs, RunReport, device_nodes};
use crate::score::{ScoringPolicy, score_forest};
use crate::select::{SelectionResult, select};

/// Extract the root filesystem of `firmware` into `output`.
///
/// # Examples
///
/// ```no_run
/// use xfs_core::{Run, RunConfig};
///
/// let report = Run::new("firmware.bin", "out", RunConfig::default()).execute()?;
/// println!("{}", report.outputs.archive.display());
/// # Ok::<(), xfs_core::RunError>(())
/// ```
pub struct Run {
    firmware: PathBuf,
    output: PathBuf,
    config: RunConfig,
    policy: ScoringPolicy,
    sink: Arc<dyn ProgressSink>,
    cancel: CancelToken,
}

impl Run {
    pub fn new(firmware: impl Into<PathBuf>, output: impl Into<PathBuf>, config: RunConfig) -> Self {
        Self {
            firmware: firmware.into(),
            output: output.into(),
            config,
            policy: ScoringPolicy::default(),
            sink: Arc::new(NullSink),
            cancel: CancelToken::new(),
        }
    }

    /// Receive progress events; only used when `progress` is enabled.
    pub fn with_sink(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Token that stops the run from another thread.
    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_policy(mut self, policy: ScoringPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn execute(self) -> Result<RunReport> {
        let started = Instant::now();
        self.config.validate()?;
        self.emit(ProgressEvent::phase(RunPhase::Preparing));
        check_firmware(&self.firmware)?;

        let layout = OutputLayout::new(&self.output);
        let created_output = self.output.symlink_metadata().is_err();

        let result = self.run_in(&layout, started);
        match &result {
            Ok(report) => {
                tracing::info!(
                    extractor = report.best_extractor(),
                    archive = %report.outputs.archive.display(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "run finished"
                );
                self.emit(ProgressEvent::phase(RunPhase::Finished).with_percent(100.0));
            }
            Err(e) => {
                tracing::debug!(error = %e, "run failed, cleaning up");
                if created_output {
                    // Only succeeds when nothing was left inside.
                    let _ = std::fs::remove_dir(&self.output);
                }
            }
        }
        result
    }

    fn run_in(&self, layout: &OutputLayout, started: Instant) -> Result<RunReport> {
        let tx = layout.begin(self.config.force)?;
        let scratch_parent = self.config.scratch_parent.clone().unwrap_or_else(|| layout.dir.clone());
        let run_id = std::process::id().to_string();
        let workspace = ScratchWorkspace::acquire(&scratch_parent, &run_id).map_err(|source| {
            RunError::WorkspaceAllocationFailed {
                parent: scratch_parent.clone(),
                source,
            }
        })?;

        let extraction = self.extract(&workspace, started)?;
        self.finish(tx, layout, workspace, extraction)
    }

    fn extract(&self, workspace: &ScratchWorkspace, started: Instant) -> Result<Extraction> {
        let extractors: Vec<Box<dyn Extractor>> = match &self.config.extractors {
            Some(names) => select_extractors(names)
                .map_err(|unknown| RunError::Config(format!("unknown extractor(s) {}", unknown.join(", "))))?,
            None => default_extractors(),
        };

        let mut orchestrator =
            Orchestrator::new(extractors, self.config.orchestrator_config(started)).with_cancel(self.cancel.clone());
        if self.config.progress {
            let sink = Arc::clone(&self.sink);
            let scratch = workspace.path().to_path_buf();
            orchestrator = orchestrator.on_progress(Arc::new(move |progress: ExtractionProgress| {
                let artifact = progress.artifact.strip_prefix(&scratch).unwrap_or(&progress.artifact);
                sink.emit(
                    ProgressEvent::phase(RunPhase::Extracting)
                        .with_percent(progress.percent())
                        .with_artifact(format!("{} ({})", artifact.display(), progress.extractor)),
                );
            }));
        }

        self.emit(ProgressEvent::phase(RunPhase::Extracting).with_artifact(self.firmware.display().to_string()));
        let extraction = orchestrator.run(&self.firmware, workspace)?;

        if !extraction.records.iter().any(|r| matches!(r.status, PassStatus::Succeeded | PassStatus::PartiallySucceeded)) {
            tracing::warn!(
                attempts = extraction.records.len(),
                "no extractor produced usable output"
            );
        }
        Ok(extraction)
    }

    fn finish(
        &self,
        tx: OutputTransaction,
        layout: &OutputLayout,
        workspace: ScratchWorkspace,
        extraction: Extraction,
    ) -> Result<RunReport> {
        self.emit(ProgressEvent::phase(RunPhase::Scoring));
        let candidates = score_forest(&extraction.forest, &self.policy);

        self.emit(ProgressEvent::phase(RunPhase::Selecting));
        let (outcome, winner, runners_up) = match select(candidates, self.config.confidence_floor) {
            SelectionResult::NoRootfsFound => return Err(RunError::NoRootfsFound),
            SelectionResult::Selected { winner, runners_up } => (Outcome::Selected, winner, runners_up),
            SelectionResult::LowConfidence {
                best,
                runners_up,
                floor,
            } => {
                if !self.config.accept_low_confidence {
                    return Err(RunError::LowConfidenceRootfs {
                        path: relative_to(&best.disk_path, workspace.path()),
                        extractor: best.extractor,
                        score: best.score,
                        floor,
                    });
                }
                tracing::warn!(score = best.score, floor, "accepting low-confidence rootfs");
                (Outcome::LowConfidenceAccepted, best, runners_up)
            }
        };

        if self.cancel.is_cancelled() {
            return Err(RunError::Cancelled);
        }

        let scratch = workspace.path().to_path_buf();
        let winner_summary = CandidateSummary::new(&winner, &scratch, true);
        let mut candidates = vec![winner_summary.clone()];
        candidates.extend(runners_up.iter().map(|c| CandidateSummary::new(c, &scratch, false)));
        let devices = device_nodes(&extraction.forest, &winner);
        let firmware_sha256 = extraction.forest.firmware().digest.clone();

        self.emit(ProgressEvent::phase(RunPhase::Materializing).with_artifact(winner_summary.path.display().to_string()));
        let outputs = materialize(tx, layout, &winner.disk_path, workspace, &self.config)?;

        Ok(RunReport {
            outcome,
            firmware: self.firmware.clone(),
            firmware_sha256,
            outputs: ReportedOutputs::new(&outputs),
            winner: winner_summary,
            candidates,
            extractors: extraction.records,
            diagnostics: extraction.diagnostics,
            device_nodes: devices,
            extraction_complete: extraction.complete,
            bytes_extracted: extraction.bytes_extracted,
        })
    }

    fn emit(&self, event: ProgressEvent) {
        if self.config.progress {
            self.sink.emit(event);
        }
    }
}

fn check_firmware(path: &Path) -> Result<()> {
    match std::fs::metadata(path) {
        Ok(metadata) if metadata.is_file() => Ok(()),
        Ok(_) => Err(RunError::FirmwareNotAFile(path.to_path_buf())),
        Err(_) => Err(RunError::FirmwareNotFound(path.to_path_buf())),
    }
}

fn relative_to(path: &Path, base: &Path) -> PathBuf {
    path.strip_prefix(base).unwrap_or(path).to_path_buf()
}
