//! Writing extracted entries into an exclusive pass output directory.
//!
//! Every plugin funnels its output through [`PassWriter`], which sanitizes
//! names, refuses symlinked ancestors, charges the shared byte budget and
//! hashes file content while it is written.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::budget::PassBudget;
use crate::entry::{DeviceKind, NodeKind, ProducedEntry};
use crate::error::{Error, Result};
use crate::format;
use crate::sanitize::{ensure_no_symlink_ancestor, sanitize_entry_path};

pub mod cpio;
pub mod squashfs;

/// Bytes kept from the start of every file to decide on re-recursion.
const HEAD_LEN: usize = 512;
/// Smallest file considered for re-recursion.
const MIN_RECURSE_LEN: u64 = 64;
const DEFAULT_FILE_MODE: u32 = 0o644;
const DEFAULT_DIR_MODE: u32 = 0o755;

pub struct PassWriter<'a> {
    root: PathBuf,
    budget: &'a PassBudget<'a>,
    entries: BTreeMap<PathBuf, ProducedEntry>,
    errors: Vec<String>,
}

impl<'a> PassWriter<'a> {
    pub fn new(root: impl Into<PathBuf>, budget: &'a PassBudget<'a>) -> Self {
        Self {
            root: root.into(),
            budget,
            entries: BTreeMap::new(),
            errors: Vec::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn budget(&self) -> &PassBudget<'a> {
        self.budget
    }

    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    /// Write a regular file; re-recursion is decided from its leading bytes.
    pub fn file(&mut self, name: &Path, mode: Option<u32>, reader: &mut dyn Read) -> Result<()> {
        self.write_file(name, mode, reader, false).map(drop)
    }

    /// Write a carved or decoded region that always warrants re-recursion.
    pub fn payload(&mut self, name: &Path, reader: &mut dyn Read) -> Result<()> {
        self.write_file(name, None, reader, true).map(drop)
    }

    pub fn dir(&mut self, name: &Path, mode: Option<u32>) -> Result<()> {
        self.budget.check()?;
        let relative = sanitize_entry_path(name)?;
        ensure_no_symlink_ancestor(&self.root, &relative)?;
        let target = self.root.join(&relative);

        if fs::symlink_metadata(&target).is_ok_and(|meta| !meta.is_dir()) {
            xfs_fs::remove_path(&target)?;
        }
        fs::create_dir_all(&target).map_err(|e| Error::ExtractionFailed {
            path: relative.clone(),
            source: e,
        })?;
        let mode = mode.map_or(DEFAULT_DIR_MODE, |m| m & 0o7777);
        apply_mode(&target, (mode & 0o777) | 0o700)?;

        self.insert(ProducedEntry {
            path: relative,
            kind: NodeKind::Directory,
            size: 0,
            mode,
            digest: None,
            recurse: false,
        });
        Ok(())
    }

    /// Recreate a symlink with its target kept verbatim.
    pub fn symlink(&mut self, name: &Path, target: &Path) -> Result<()> {
        self.budget.check()?;
        let relative = sanitize_entry_path(name)?;
        ensure_no_symlink_ancestor(&self.root, &relative)?;
        let link = self.root.join(&relative);
        self.prepare_leaf(&relative, &link)?;

        xfs_fs::create_symlink(target, &link)?;
        self.insert(ProducedEntry {
            path: relative,
            kind: NodeKind::Symlink {
                target: target.to_path_buf(),
            },
            size: target.as_os_str().len() as u64,
            mode: 0o777,
            digest: None,
            recurse: false,
        });
        Ok(())
    }

    /// Link `name` to an entry already written by this pass.
    pub fn hardlink(&mut self, name: &Path, existing: &Path) -> Result<()> {
        self.budget.check()?;
        let relative = sanitize_entry_path(name)?;
        let source_relative = sanitize_entry_path(existing)?;
        let Some(source_entry) = self.entries.get(&source_relative).filter(|e| e.is_file()).cloned()
        else {
            return Err(Error::Corrupted(format!(
                "hardlink '{}' refers to unknown entry '{}'",
                relative.display(),
                source_relative.display()
            )));
        };
        ensure_no_symlink_ancestor(&self.root, &relative)?;
        let dest = self.root.join(&relative);
        self.prepare_leaf(&relative, &dest)?;

        self.budget.charge(source_entry.size)?;
        xfs_fs::hardlink_or_copy(
            self.root.join(&source_relative),
            &dest,
            xfs_fs::HardlinkOrCopyOptions::new(),
        )?;
        self.insert(ProducedEntry {
            path: relative,
            ..source_entry
        });
        Ok(())
    }

    /// Record a device node without creating anything on disk.
    pub fn device(&mut self, name: &Path, device: DeviceKind, mode: Option<u32>) -> Result<()> {
        self.budget.check()?;
        let relative = sanitize_entry_path(name)?;
        self.insert(ProducedEntry {
            path: relative,
            kind: NodeKind::DevicePlaceholder { device },
            size: 0,
            mode: mode.map_or(0o600, |m| m & 0o7777),
            digest: None,
            recurse: false,
        });
        Ok(())
    }

    /// Record a recoverable per-entry error, passing interruptions through.
    pub fn absorb(&mut self, result: Result<()>) -> Result<()> {
        match result {
            Err(e) if e.is_interrupt() => Err(e),
            Err(e) => {
                tracing::debug!(root = %self.root.display(), error = %e, "entry skipped");
                self.errors.push(e.to_string());
                Ok(())
            }
            Ok(()) => Ok(()),
        }
    }

    pub fn note(&mut self, message: impl Into<String>) {
        self.errors.push(message.into());
    }

    pub fn finish(self) -> (Vec<ProducedEntry>, Vec<String>) {
        (self.entries.into_values().collect(), self.errors)
    }

    fn write_file(
        &mut self,
        name: &Path,
        mode: Option<u32>,
        reader: &mut dyn Read,
        force_recurse: bool,
    ) -> Result<PathBuf> {
        self.budget.check()?;
        let relative = sanitize_entry_path(name)?;
        ensure_no_symlink_ancestor(&self.root, &relative)?;
        let target = self.root.join(&relative);
        self.prepare_leaf(&relative, &target)?;

        let file = File::create(&target).map_err(|e| Error::ExtractionFailed {
            path: relative.clone(),
            source: e,
        })?;
        let mut writer = BoundedWriter::new(file, self.budget);
        if let Err(e) = io::copy(reader, &mut writer).and_then(|_| writer.flush()) {
            drop(writer);
            if let Err(cleanup) = xfs_fs::remove_path(&target) {
                tracing::debug!(path = %target.display(), error = %cleanup, "partial file left behind");
            }
            return Err(Error::lift_io(e, &relative));
        }
        let (size, digest, head) = writer.finish();

        let mode = mode.map_or(DEFAULT_FILE_MODE, |m| m & 0o7777);
        apply_mode(&target, (mode & 0o777) | 0o600)?;

        let recurse = force_recurse || (size >= MIN_RECURSE_LEN && format::warrants_recursion(&head));
        self.insert(ProducedEntry {
            path: relative.clone(),
            kind: NodeKind::File,
            size,
            mode,
            digest: Some(digest),
            recurse,
        });
        Ok(relative)
    }

    /// Create parents and clear a previous non-directory leaf at `target`.
    fn prepare_leaf(&mut self, relative: &Path, target: &Path) -> Result<()> {
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(|e| Error::ExtractionFailed {
                path: relative.to_path_buf(),
                source: e,
            })?;
        }
        match fs::symlink_metadata(target) {
            Ok(meta) if meta.is_dir() => Err(Error::ExtractionFailed {
                path: relative.to_path_buf(),
                source: io::Error::new(io::ErrorKind::AlreadyExists, "a directory occupies this path"),
            }),
            Ok(_) => {
                xfs_fs::remove_path(target)?;
                self.entries.remove(relative);
                Ok(())
            }
            Err(_) => Ok(()),
        }
    }

    fn insert(&mut self, entry: ProducedEntry) {
        self.entries.insert(entry.path.clone(), entry);
    }
}

/// File writer that charges the run budget and hashes content per chunk.
struct BoundedWriter<'a, W: Write> {
    inner: W,
    budget: &'a PassBudget<'a>,
    hasher: Sha256,
    written: u64,
    head: Vec<u8>,
}

impl<'a, W: Write> BoundedWriter<'a, W> {
    fn new(inner: W, budget: &'a PassBudget<'a>) -> Self {
        Self {
            inner,
            budget,
            hasher: Sha256::new(),
            written: 0,
            head: Vec::with_capacity(HEAD_LEN),
        }
    }

    fn finish(self) -> (u64, String, Vec<u8>) {
        (self.written, hex::encode(self.hasher.finalize()), self.head)
    }
}

impl<W: Write> Write for BoundedWriter<'_, W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.budget.charge(buf.len() as u64).map_err(io::Error::other)?;
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        if self.head.len() < HEAD_LEN {
            let take = n.min(HEAD_LEN - self.head.len());
            self.head.extend_from_slice(&buf[..take]);
        }
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

#[cfg(unix)]
fn apply_mode(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode)).map_err(|e| {
        Error::Fs(xfs_fs::Error::Write {
            path: path.to_path_buf(),
            source: e,
        })
    })
}

#[cfg(not(unix))]
fn apply_mode(_path: &Path, _mode: u32) -> Result<()> {
    Ok(())
}
