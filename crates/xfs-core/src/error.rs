use std::path::PathBuf;

/// Run-level failures. Everything per artifact or per plugin is recovered
/// inside extraction and never surfaces here.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("firmware image not found: {0}")]
    FirmwareNotFound(PathBuf),

    #[error("firmware image is not a regular file: {0}")]
    FirmwareNotAFile(PathBuf),

    #[error("no root filesystem found")]
    NoRootfsFound,

    #[error("best root filesystem candidate '{path}' from {extractor} scored {score:.2}, below the confidence floor {floor:.2}")]
    LowConfidenceRootfs {
        path: PathBuf,
        extractor: String,
        score: f64,
        floor: f64,
    },

    #[error("output already exists: {0} (use force to overwrite)")]
    OutputAlreadyExists(PathBuf),

    #[error("failed to allocate scratch workspace under '{parent}': {source}")]
    WorkspaceAllocationFailed {
        parent: PathBuf,
        #[source]
        source: xfs_fs::Error,
    },

    #[error("run cancelled")]
    Cancelled,

    #[error("failed to write outputs: {0}")]
    Materialize(#[source] xfs_fs::Error),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Extraction(xfs_extract::Error),
}

impl From<xfs_extract::Error> for RunError {
    fn from(e: xfs_extract::Error) -> Self {
        match e {
            xfs_extract::Error::Cancelled => Self::Cancelled,
            other => Self::Extraction(other),
        }
    }
}

impl RunError {
    /// Map a failed output transaction, keeping the existing-output case distinct.
    pub(crate) fn from_output(e: xfs_fs::Error) -> Self {
        match e {
            xfs_fs::Error::AlreadyExists(path) => Self::OutputAlreadyExists(path),
            other => Self::Materialize(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, RunError>;
