use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use xfs_extract::OrchestratorConfig;

use crate::error::{Result, RunError};

/// Immutable settings for one extraction run.
///
/// Loaded from TOML or built in code; every component receives it explicitly.
///
/// # Examples
///
/// ```
/// use xfs_core::RunConfig;
///
/// let config = RunConfig::default().force(true).copy_rootfs(true);
/// assert!(config.keep_scratch);
/// ```
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RunConfig {
    /// Retain the full scratch workspace as `<output>/xfs-extract`.
    pub keep_scratch: bool,
    /// Copy the selected tree verbatim to `<output>/rootfs`.
    pub copy_rootfs: bool,
    /// Replace existing outputs instead of failing.
    pub force: bool,
    /// Emit progress events to the configured sink.
    pub progress: bool,
    pub recursion_depth_limit: usize,
    pub max_total_extracted_bytes: u64,
    pub max_artifacts: usize,
    /// Per (extractor, artifact) pass, in seconds.
    pub extractor_timeout: u64,
    /// Whole run, in seconds.
    pub run_timeout: Option<u64>,
    /// Worker threads; 0 uses every available core.
    pub jobs: usize,
    /// Restrict extraction to these extractors.
    pub extractors: Option<Vec<String>>,
    pub accept_low_confidence: bool,
    pub confidence_floor: f64,
    /// Where the scratch workspace is created; defaults to the output directory.
    pub scratch_parent: Option<PathBuf>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            keep_scratch: true,
            copy_rootfs: false,
            force: false,
            progress: false,
            recursion_depth_limit: 8,
            max_total_extracted_bytes: 8 * 1024 * 1024 * 1024,
            max_artifacts: 512,
            extractor_timeout: 20,
            run_timeout: None,
            jobs: 0,
            extractors: None,
            accept_low_confidence: false,
            confidence_floor: crate::select::DEFAULT_CONFIDENCE_FLOOR,
            scratch_parent: None,
        }
    }
}

impl RunConfig {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| RunError::Config(e.to_string()))
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| RunError::Config(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&text)
    }

    pub fn keep_scratch(mut self, keep: bool) -> Self {
        self.keep_scratch = keep;
        self
    }

    pub fn copy_rootfs(mut self, copy: bool) -> Self {
        self.copy_rootfs = copy;
        self
    }

    pub fn force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    pub fn progress(mut self, progress: bool) -> Self {
        self.progress = progress;
        self
    }

    pub fn extractors(mut self, names: Vec<String>) -> Self {
        self.extractors = Some(names);
        self
    }

    pub fn accept_low_confidence(mut self, accept: bool) -> Self {
        self.accept_low_confidence = accept;
        self
    }

    pub fn scratch_parent(mut self, parent: impl Into<PathBuf>) -> Self {
        self.scratch_parent = Some(parent.into());
        self
    }

    /// Reject settings that cannot produce a meaningful run.
    pub fn validate(&self) -> Result<()> {
        if let Some(names) = &self.extractors {
            if names.is_empty() {
                return Err(RunError::Config("extractor list is empty".into()));
            }
            xfs_extract::select_extractors(names).map_err(|unknown| {
                RunError::Config(format!(
                    "unknown extractor(s) {}; available: {}",
                    unknown.join(", "),
                    xfs_extract::extractor_names().join(", ")
                ))
            })?;
        }
        if self.extractor_timeout == 0 {
            return Err(RunError::Config("extractor_timeout must be at least one second".into()));
        }
        if self.max_artifacts == 0 {
            return Err(RunError::Config("max_artifacts must be at least 1".into()));
        }
        if !self.confidence_floor.is_finite() {
            return Err(RunError::Config("confidence_floor must be a finite number".into()));
        }
        Ok(())
    }

    pub fn extractor_timeout(&self) -> Duration {
        Duration::from_secs(self.extractor_timeout)
    }

    pub(crate) fn orchestrator_config(&self, started: Instant) -> OrchestratorConfig {
        OrchestratorConfig {
            depth_limit: self.recursion_depth_limit,
            max_artifacts: self.max_artifacts,
            max_total_bytes: self.max_total_extracted_bytes,
            extractor_timeout: self.extractor_timeout(),
            run_deadline: self.run_timeout.map(|secs| started + Duration::from_secs(secs)),
            jobs: self.jobs,
        }
    }
}
