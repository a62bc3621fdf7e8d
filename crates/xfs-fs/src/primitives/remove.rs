use crate::{Error, Result};
use std::path::Path;

/// Remove a file, symlink or directory tree. Missing paths are not an error.
///
/// Returns whether anything was removed.
pub fn remove_path(path: impl AsRef<Path>) -> Result<bool> {
    let path = path.as_ref();
    let metadata = match path.symlink_metadata() {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(e) => {
            return Err(Error::Read {
                path: path.to_path_buf(),
                source: e,
            });
        }
    };

    let result = if metadata.is_dir() {
        std::fs::remove_dir_all(path)
    } else {
        std::fs::remove_file(path)
    };
    result.map_err(|e| Error::Remove {
        path: path.to_path_buf(),
        source: e,
    })?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_remove_file_and_dir() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("a.txt");
        let tree = dir.path().join("tree");
        std::fs::write(&file, "x").unwrap();
        std::fs::create_dir_all(tree.join("nested")).unwrap();

        assert!(remove_path(&file).unwrap());
        assert!(remove_path(&tree).unwrap());
        assert!(!file.exists());
        assert!(!tree.exists());
    }

    #[test]
    fn test_remove_missing_is_noop() {
        let dir = tempdir().unwrap();
        assert!(!remove_path(dir.path().join("missing")).unwrap());
    }
}
