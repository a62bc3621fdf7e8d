use std::io;
use std::path::PathBuf;

use crate::budget::Bound;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("path escapes extraction root: '{entry}'")]
    ZipSlip { entry: PathBuf },

    #[error("refusing to write '{entry}' through symlinked ancestor '{ancestor}'")]
    SymlinkAncestor { entry: PathBuf, ancestor: PathBuf },

    #[error("entry path is empty or invalid")]
    InvalidPath,

    #[error("input is corrupted: {0}")]
    Corrupted(String),

    #[error("extraction bound exceeded: {0}")]
    BoundExceeded(Bound),

    #[error("extraction cancelled")]
    Cancelled,

    #[error("extractor exceeded its time limit")]
    TimedOut,

    #[error("failed to extract '{path}': {source}")]
    ExtractionFailed { path: PathBuf, source: io::Error },

    #[error("worker pool unavailable: {0}")]
    WorkerPool(String),

    #[error(transparent)]
    Fs(#[from] xfs_fs::Error),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    /// Whether the error stops the whole pass rather than a single entry.
    pub fn is_interrupt(&self) -> bool {
        matches!(self, Self::BoundExceeded(_) | Self::Cancelled | Self::TimedOut)
    }

    /// Recover an error smuggled through an `io::Error` by a bounded writer.
    pub(crate) fn lift_io(err: io::Error, path: &std::path::Path) -> Self {
        if err.get_ref().is_some_and(|inner| inner.is::<Error>()) {
            if let Some(Ok(inner)) = err.into_inner().map(|b| b.downcast::<Error>()) {
                return *inner;
            }
            return Self::Corrupted(format!("lost error while writing {}", path.display()));
        }
        Self::ExtractionFailed {
            path: path.to_path_buf(),
            source: err,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
