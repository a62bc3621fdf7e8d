use crate::{Error, Result};
use std::fs;
use std::path::Path;

/// Copy a directory tree verbatim.
///
/// Entries are visited in file-name order. Symlinks are recreated with their
/// original target text and never followed; sockets, fifos and device nodes
/// are skipped.
pub fn copy_dir_all(src: impl AsRef<Path>, dest: impl AsRef<Path>) -> Result<()> {
    let src = src.as_ref();
    let dest = dest.as_ref();

    if !dest.exists() {
        fs::create_dir_all(dest).map_err(|e| Error::Write {
            path: dest.to_path_buf(),
            source: e,
        })?;
    }

    let mut entries = fs::read_dir(src)
        .map_err(|e| Error::Read {
            path: src.to_path_buf(),
            source: e,
        })?
        .collect::<std::io::Result<Vec<_>>>()
        .map_err(|e| Error::Read {
            path: src.to_path_buf(),
            source: e,
        })?;
    entries.sort_by_key(|entry| entry.file_name());

    for entry in entries {
        let src_path = entry.path();
        let dest_path = dest.join(entry.file_name());
        let file_type = entry.file_type().map_err(|e| Error::Read {
            path: src_path.clone(),
            source: e,
        })?;

        if file_type.is_dir() {
            copy_dir_all(&src_path, &dest_path)?;
        } else if file_type.is_symlink() {
            let target = fs::read_link(&src_path).map_err(|e| Error::Read {
                path: src_path.clone(),
                source: e,
            })?;
            super::create_symlink(target, &dest_path)?;
        } else if file_type.is_file() {
            fs::copy(&src_path, &dest_path).map_err(|e| Error::Write {
                path: dest_path,
                source: e,
            })?;
        }
    }
    Ok(())
}
