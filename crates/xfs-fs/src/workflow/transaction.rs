use crate::{Error, Result};
use std::path::{Path, PathBuf};

/// All-or-nothing placement of output artifacts into a directory.
///
/// Outputs are built inside a hidden staging directory next to their final
/// location. [`OutputTransaction::commit`] moves them into place; if any move
/// fails, the ones already placed are moved back and any pre-existing outputs
/// that `force` displaced are restored.
pub struct OutputTransaction {
    staging: tempfile::TempDir,
    targets: Vec<PathBuf>,
    moves: Vec<(PathBuf, PathBuf)>,
    force: bool,
}

impl OutputTransaction {
    /// Check every target at once and open a staging area in `dir`.
    ///
    /// Without `force`, an existing target fails the whole transaction before
    /// anything is written.
    pub fn begin(dir: impl AsRef<Path>, targets: &[PathBuf], force: bool) -> Result<Self> {
        let dir = dir.as_ref();
        if !force {
            ensure_absent(targets)?;
        }

        std::fs::create_dir_all(dir).map_err(|e| Error::Write {
            path: dir.to_path_buf(),
            source: e,
        })?;
        let staging = tempfile::Builder::new()
            .prefix(".xfs-stage-")
            .tempdir_in(dir)
            .map_err(|e| Error::Write {
                path: dir.to_path_buf(),
                source: e,
            })?;

        Ok(Self {
            staging,
            targets: targets.to_vec(),
            moves: Vec::new(),
            force,
        })
    }

    /// Where to build the output destined for `target`.
    pub fn stage(&mut self, target: &Path) -> PathBuf {
        let name = target.file_name().map(|n| n.to_os_string()).unwrap_or_default();
        let staged = self.staging.path().join("new").join(name);
        self.moves.push((staged.clone(), target.to_path_buf()));
        staged
    }

    /// Move an existing tree (outside the staging area) to `target` on commit.
    pub fn adopt(&mut self, src: &Path, target: &Path) {
        self.moves.push((src.to_path_buf(), target.to_path_buf()));
    }

    pub fn staging_root(&self) -> PathBuf {
        self.staging.path().join("new")
    }

    pub fn commit(self) -> Result<Vec<PathBuf>> {
        if !self.force {
            ensure_absent(&self.targets)?;
        }

        let backup_root = self.staging.path().join("old");
        let mut displaced: Vec<(PathBuf, PathBuf)> = Vec::new();
        for (i, target) in self.targets.iter().enumerate() {
            if target.symlink_metadata().is_err() {
                continue;
            }
            std::fs::create_dir_all(&backup_root).map_err(|e| Error::Write {
                path: backup_root.clone(),
                source: e,
            })?;
            let backup = backup_root.join(i.to_string());
            if let Err(e) = std::fs::rename(target, &backup) {
                restore(&displaced);
                return Err(Error::ReplaceDir {
                    path: target.clone(),
                    source: e,
                });
            }
            tracing::debug!(path = %target.display(), "displaced existing output");
            displaced.push((backup, target.clone()));
        }

        let mut placed: Vec<(PathBuf, PathBuf)> = Vec::new();
        for (src, target) in &self.moves {
            if src.symlink_metadata().is_err() {
                continue;
            }
            if let Err(e) = crate::replace_dir(src, target) {
                tracing::warn!(path = %target.display(), error = %e, "output commit failed, rolling back");
                for (src, target) in placed.iter().rev() {
                    let _ = crate::replace_dir(target, src);
                }
                restore(&displaced);
                return Err(e);
            }
            placed.push((src.clone(), target.clone()));
        }

        Ok(placed.into_iter().map(|(_, target)| target).collect())
    }
}

fn ensure_absent(targets: &[PathBuf]) -> Result<()> {
    match targets.iter().find(|t| t.symlink_metadata().is_ok()) {
        Some(existing) => Err(Error::AlreadyExists(existing.clone())),
        None => Ok(()),
    }
}

fn restore(displaced: &[(PathBuf, PathBuf)]) {
    for (backup, target) in displaced.iter().rev() {
        let _ = crate::remove_path(target);
        let _ = std::fs::rename(backup, target);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_commit_places_outputs() {
        let dir = tempdir().unwrap();
        let archive = dir.path().join("rootfs.tar.gz");
        let copy = dir.path().join("rootfs");
        let mut tx = OutputTransaction::begin(dir.path(), &[archive.clone(), copy.clone()], false).unwrap();

        let staged_archive = tx.stage(&archive);
        std::fs::create_dir_all(staged_archive.parent().unwrap()).unwrap();
        std::fs::write(&staged_archive, "tar").unwrap();

        let placed = tx.commit().unwrap();
        assert_eq!(placed, vec![archive.clone()]);
        assert_eq!(std::fs::read(&archive).unwrap(), b"tar");
        assert!(!copy.exists());
    }

    #[test]
    fn test_begin_refuses_existing_without_force() {
        let dir = tempdir().unwrap();
        let archive = dir.path().join("rootfs.tar.gz");
        let scratch = dir.path().join("xfs-extract");
        std::fs::create_dir(&scratch).unwrap();

        let result = OutputTransaction::begin(dir.path(), &[archive.clone(), scratch.clone()], false);
        assert!(matches!(result, Err(Error::AlreadyExists(p)) if p == scratch));
        let leftovers: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(leftovers.len(), 1);
    }

    #[test]
    fn test_force_replaces_files_and_directories() {
        let dir = tempdir().unwrap();
        let archive = dir.path().join("rootfs.tar.gz");
        let copy = dir.path().join("rootfs");
        std::fs::write(&archive, "old").unwrap();
        std::fs::create_dir_all(copy.join("stale")).unwrap();

        let mut tx = OutputTransaction::begin(dir.path(), &[archive.clone(), copy.clone()], true).unwrap();
        let staged = tx.stage(&archive);
        std::fs::create_dir_all(staged.parent().unwrap()).unwrap();
        std::fs::write(&staged, "new").unwrap();
        tx.commit().unwrap();

        assert_eq!(std::fs::read(&archive).unwrap(), b"new");
        assert!(!copy.exists());
        let names: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names, vec![std::ffi::OsString::from("rootfs.tar.gz")]);
    }

    #[test]
    fn test_adopt_moves_external_tree() {
        let dir = tempdir().unwrap();
        let scratch = dir.path().join(".scratch");
        std::fs::create_dir_all(scratch.join("a")).unwrap();
        let target = dir.path().join("xfs-extract");

        let mut tx = OutputTransaction::begin(dir.path(), &[target.clone()], false).unwrap();
        tx.adopt(&scratch, &target);
        tx.commit().unwrap();
        assert!(target.join("a").is_dir());
        assert!(!scratch.exists());
    }

    #[test]
    fn test_dropped_transaction_leaves_nothing() {
        let dir = tempdir().unwrap();
        let archive = dir.path().join("rootfs.tar.gz");
        {
            let mut tx = OutputTransaction::begin(dir.path(), &[archive.clone()], false).unwrap();
            let staged = tx.stage(&archive);
            std::fs::create_dir_all(staged.parent().unwrap()).unwrap();
            std::fs::write(&staged, "partial").unwrap();
        }
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
