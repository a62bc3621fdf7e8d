//! Deterministic output of the selected tree.
//!
//! Everything is built inside an [`OutputTransaction`] opened before
//! extraction starts, so a failed run never leaves a partial archive or a
//! half-copied tree behind.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use flate2::{Compression, GzBuilder};
use serde::Serialize;
use walkdir::WalkDir;
use xfs_fs::{OutputTransaction, ScratchWorkspace};

use crate::config::RunConfig;
use crate::error::{Result, RunError};

pub const ARCHIVE_NAME: &str = "rootfs.tar.gz";
pub const ROOTFS_DIR: &str = "rootfs";
pub const SCRATCH_DIR: &str = "xfs-extract";

/// Fixed locations of every output below the output directory.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutputLayout {
    pub dir: PathBuf,
    pub archive: PathBuf,
    pub rootfs: PathBuf,
    pub scratch: PathBuf,
}

impl OutputLayout {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        Self {
            archive: dir.join(ARCHIVE_NAME),
            rootfs: dir.join(ROOTFS_DIR),
            scratch: dir.join(SCRATCH_DIR),
            dir,
        }
    }

    /// Every path the combined existence check covers.
    pub fn targets(&self) -> Vec<PathBuf> {
        vec![self.archive.clone(), self.rootfs.clone(), self.scratch.clone()]
    }

    /// Open the output transaction; fails before anything is written when
    /// an output exists and `force` is off.
    pub fn begin(&self, force: bool) -> Result<OutputTransaction> {
        OutputTransaction::begin(&self.dir, &self.targets(), force).map_err(RunError::from_output)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ArtifactStatus {
    pub path: PathBuf,
    /// A previous output at this path was replaced.
    pub replaced: bool,
}

impl ArtifactStatus {
    fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            replaced: path.symlink_metadata().is_ok(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct OutputArtifactSet {
    pub archive: ArtifactStatus,
    pub rootfs: Option<ArtifactStatus>,
    pub scratch: Option<ArtifactStatus>,
}

/// Build every configured output for `winner` and commit them together.
///
/// The workspace is consumed: it is either moved into place as the retained
/// scratch directory or deleted once the commit is done.
pub fn materialize(
    mut tx: OutputTransaction,
    layout: &OutputLayout,
    winner: &Path,
    workspace: ScratchWorkspace,
    config: &RunConfig,
) -> Result<OutputArtifactSet> {
    let staging = tx.staging_root();
    std::fs::create_dir_all(&staging).map_err(|e| {
        RunError::Materialize(xfs_fs::Error::Write {
            path: staging.clone(),
            source: e,
        })
    })?;

    let archive = tx.stage(&layout.archive);
    let entries = write_archive(winner, &archive).map_err(RunError::Materialize)?;
    tracing::info!(entries, path = %layout.archive.display(), "archive written");

    let mut outputs = OutputArtifactSet {
        archive: ArtifactStatus::new(&layout.archive),
        rootfs: None,
        scratch: None,
    };

    if config.copy_rootfs {
        let staged = tx.stage(&layout.rootfs);
        xfs_fs::copy_dir_all(winner, &staged).map_err(RunError::Materialize)?;
        outputs.rootfs = Some(ArtifactStatus::new(&layout.rootfs));
    }
    if config.keep_scratch {
        tx.adopt(workspace.path(), &layout.scratch);
        outputs.scratch = Some(ArtifactStatus::new(&layout.scratch));
    }

    let placed = tx.commit().map_err(RunError::from_output)?;
    tracing::debug!(count = placed.len(), "outputs committed");

    if !config.keep_scratch {
        if let Err(e) = workspace.release() {
            tracing::warn!(error = %e, "scratch workspace cleanup failed");
        }
    }
    Ok(outputs)
}

/// Write `src` as a gzip-compressed tar with normalized metadata.
///
/// Entries are sorted by name, owned by 0:0 with mtime 0; directories are
/// 0755, symlinks 0777 and files 0755 or 0644 depending on whether any
/// execute bit was set. Returns the number of entries written.
pub fn write_archive(src: &Path, dest: &Path) -> xfs_fs::Result<u64> {
    let write_err = |e: io::Error| xfs_fs::Error::Write {
        path: dest.to_path_buf(),
        source: e,
    };

    let file = File::create(dest).map_err(write_err)?;
    let encoder = GzBuilder::new()
        .mtime(0)
        .write(BufWriter::new(file), Compression::default());
    let mut builder = tar::Builder::new(encoder);

    let mut count = 0;
    for entry in WalkDir::new(src).min_depth(1).follow_links(false).sort_by_file_name() {
        let entry = entry.map_err(|e| xfs_fs::Error::Read {
            path: e.path().unwrap_or(src).to_path_buf(),
            source: e.into(),
        })?;
        let relative = entry.path().strip_prefix(src).unwrap_or(entry.path());
        let file_type = entry.file_type();

        let mut header = tar::Header::new_gnu();
        header.set_uid(0);
        header.set_gid(0);
        header.set_mtime(0);

        if file_type.is_dir() {
            header.set_entry_type(tar::EntryType::Directory);
            header.set_mode(0o755);
            header.set_size(0);
            builder.append_data(&mut header, relative, io::empty()).map_err(write_err)?;
        } else if file_type.is_symlink() {
            let target = std::fs::read_link(entry.path()).map_err(|e| xfs_fs::Error::Read {
                path: entry.path().to_path_buf(),
                source: e,
            })?;
            header.set_entry_type(tar::EntryType::Symlink);
            header.set_mode(0o777);
            header.set_size(0);
            builder.append_link(&mut header, relative, &target).map_err(write_err)?;
        } else if file_type.is_file() {
            let read_err = |e: io::Error| xfs_fs::Error::Read {
                path: entry.path().to_path_buf(),
                source: e,
            };
            let metadata = entry.metadata().map_err(|e| xfs_fs::Error::Read {
                path: entry.path().to_path_buf(),
                source: e.into(),
            })?;
            let data = File::open(entry.path()).map_err(read_err)?;
            header.set_entry_type(tar::EntryType::Regular);
            header.set_mode(if is_executable(&metadata) { 0o755 } else { 0o644 });
            header.set_size(metadata.len());
            builder.append_data(&mut header, relative, data).map_err(write_err)?;
        } else {
            continue;
        }
        count += 1;
    }

    let encoder = builder.into_inner().map_err(write_err)?;
    let mut out = encoder.finish().map_err(write_err)?;
    out.flush().map_err(write_err)?;
    Ok(count)
}

#[cfg(unix)]
fn is_executable(metadata: &std::fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
fn is_executable(_metadata: &std::fs::Metadata) -> bool {
    false
}
