use crate::{Error, Result};
use std::path::{Path, PathBuf};

/// A directory exclusively owned by one extraction run.
///
/// The directory is created with a random uniqueness token, so concurrent
/// runs under the same parent never collide. Every exit path that does not
/// explicitly retain the workspace deletes it, including unwinding.
pub struct ScratchWorkspace {
    dir: tempfile::TempDir,
}

impl ScratchWorkspace {
    pub fn acquire(parent: impl AsRef<Path>, run_id: &str) -> Result<Self> {
        let parent = parent.as_ref();
        std::fs::create_dir_all(parent).map_err(|e| Error::Allocate {
            parent: parent.to_path_buf(),
            source: e,
        })?;

        let dir = tempfile::Builder::new()
            .prefix(&format!(".xfs-scratch-{run_id}-"))
            .tempdir_in(parent)
            .map_err(|e| Error::Allocate {
                parent: parent.to_path_buf(),
                source: e,
            })?;
        tracing::debug!(path = %dir.path().display(), run_id, "scratch workspace acquired");

        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Assign an exclusive output directory for one extraction pass.
    ///
    /// Fails if the area was already handed out.
    pub fn assign_area(&self, label: &str) -> Result<PathBuf> {
        let area = self.dir.path().join(label);
        std::fs::create_dir(&area).map_err(|e| {
            if e.kind() == std::io::ErrorKind::AlreadyExists {
                Error::AlreadyExists(area.clone())
            } else {
                Error::Write {
                    path: area.clone(),
                    source: e,
                }
            }
        })?;
        Ok(area)
    }

    /// Delete the workspace, reporting failures that a plain drop would hide.
    ///
    /// Retained workspaces are moved out by the output transaction instead.
    pub fn release(self) -> Result<()> {
        let path = self.dir.path().to_path_buf();
        self.dir.close().map_err(|e| Error::Remove { path, source: e })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_acquire_is_unique_per_call() {
        let dir = tempdir().unwrap();
        let a = ScratchWorkspace::acquire(dir.path(), "run").unwrap();
        let b = ScratchWorkspace::acquire(dir.path(), "run").unwrap();
        assert_ne!(a.path(), b.path());
        assert!(a.path().is_dir());
        assert_eq!(std::fs::read_dir(a.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_assign_area_is_exclusive() {
        let dir = tempdir().unwrap();
        let ws = ScratchWorkspace::acquire(dir.path(), "run").unwrap();
        let area = ws.assign_area("0000-carve").unwrap();
        assert!(area.is_dir());
        assert!(matches!(ws.assign_area("0000-carve"), Err(Error::AlreadyExists(_))));
    }

    #[test]
    fn test_release_deletes() {
        let dir = tempdir().unwrap();
        let ws = ScratchWorkspace::acquire(dir.path(), "run").unwrap();
        let path = ws.path().to_path_buf();
        std::fs::write(path.join("x"), "x").unwrap();
        ws.release().unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn test_name_carries_run_id() {
        let dir = tempdir().unwrap();
        let ws = ScratchWorkspace::acquire(dir.path(), "4242").unwrap();
        let name = ws.path().file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with(".xfs-scratch-4242-"), "{name}");
    }

    #[test]
    fn test_drop_deletes() {
        let dir = tempdir().unwrap();
        let path = {
            let ws = ScratchWorkspace::acquire(dir.path(), "run").unwrap();
            ws.path().to_path_buf()
        };
        assert!(!path.exists());
    }
}
