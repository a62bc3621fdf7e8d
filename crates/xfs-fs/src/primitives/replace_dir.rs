use crate::{Error, Result};
use std::path::Path;

/// Move `src` to `dest`, which must not exist.
///
/// A rename is used when both paths share a filesystem. Across devices the
/// tree is copied next to `dest` first and renamed into place, so `dest`
/// never appears half-written.
pub fn replace_dir(src: impl AsRef<Path>, dest: impl AsRef<Path>) -> Result<()> {
    let src = src.as_ref();
    let dest = dest.as_ref();

    if dest.symlink_metadata().is_ok() {
        return Err(Error::AlreadyExists(dest.to_path_buf()));
    }

    match std::fs::rename(src, dest) {
        Ok(()) => Ok(()),
        Err(e) if e.raw_os_error() == Some(18) || e.kind() == std::io::ErrorKind::CrossesDevices => {
            tracing::debug!(src = %src.display(), dest = %dest.display(), "cross-device move, copying");
            let parent = dest.parent().unwrap_or(Path::new("."));
            let staging = tempfile::Builder::new()
                .prefix(".xfs-move-")
                .tempdir_in(parent)
                .map_err(|e| Error::Write {
                    path: parent.to_path_buf(),
                    source: e,
                })?;
            let staged = staging.path().join("tree");
            if src.is_dir() {
                super::copy_dir_all(src, &staged)?;
            } else {
                std::fs::copy(src, &staged).map_err(|e| Error::Write {
                    path: staged.clone(),
                    source: e,
                })?;
            }
            std::fs::rename(&staged, dest).map_err(|e| Error::ReplaceDir {
                path: dest.to_path_buf(),
                source: e,
            })?;
            super::remove_path(src)?;
            Ok(())
        }
        Err(e) => Err(Error::ReplaceDir {
            path: dest.to_path_buf(),
            source: e,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_replace_dir() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("src");
        let dest = dir.path().join("dest");
        std::fs::create_dir_all(&src).unwrap();
        std::fs::write(src.join("file.txt"), "data").unwrap();

        replace_dir(&src, &dest).unwrap();
        assert!(!src.exists());
        assert!(dest.join("file.txt").exists());
    }

    #[test]
    fn test_replace_dir_refuses_existing_destination() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("src");
        let dest = dir.path().join("dest");
        std::fs::create_dir_all(&src).unwrap();
        std::fs::create_dir_all(&dest).unwrap();

        assert!(matches!(replace_dir(&src, &dest), Err(Error::AlreadyExists(_))));
        assert!(src.exists());
    }
}
