use std::path::{Component, Path, PathBuf};

use crate::error::{Error, Result};

/// Normalize an entry name into a path relative to the pass output root.
///
/// Leading `/` and `.` components are dropped so absolute names land inside the
/// root. A `..` that climbs above the root is rejected.
pub fn sanitize_entry_path(entry: impl AsRef<Path>) -> Result<PathBuf> {
    let entry = entry.as_ref();
    let mut result = PathBuf::new();

    for component in entry.components() {
        match component {
            Component::Normal(part) => result.push(part),
            Component::ParentDir => {
                if !result.pop() {
                    return Err(Error::ZipSlip {
                        entry: entry.to_path_buf(),
                    });
                }
            }
            Component::RootDir | Component::CurDir | Component::Prefix(_) => {}
        }
    }

    if result.as_os_str().is_empty() {
        return Err(Error::InvalidPath);
    }
    Ok(result)
}

/// Refuse to place `relative` under `base` when any existing ancestor is a symlink.
///
/// Symlink entries are recreated verbatim, so a later entry named through one
/// could otherwise land outside the pass output root.
pub fn ensure_no_symlink_ancestor(base: &Path, relative: &Path) -> Result<()> {
    let mut current = base.to_path_buf();
    let Some(parent) = relative.parent() else {
        return Ok(());
    };

    for component in parent.components() {
        current.push(component);
        match std::fs::symlink_metadata(&current) {
            Ok(meta) if meta.file_type().is_symlink() => {
                return Err(Error::SymlinkAncestor {
                    entry: relative.to_path_buf(),
                    ancestor: current.strip_prefix(base).unwrap_or(&current).to_path_buf(),
                });
            }
            Ok(_) => {}
            Err(_) => break,
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn basic_path_sanitization() {
        assert_eq!(sanitize_entry_path("bin/busybox").unwrap(), Path::new("bin/busybox"));
        assert_eq!(sanitize_entry_path("./etc/passwd").unwrap(), Path::new("etc/passwd"));
    }

    #[test]
    fn absolute_names_are_rebased() {
        assert_eq!(sanitize_entry_path("/etc/shadow").unwrap(), Path::new("etc/shadow"));
    }

    #[test]
    fn inner_parent_components_resolve() {
        assert_eq!(sanitize_entry_path("usr/lib/../bin/sh").unwrap(), Path::new("usr/bin/sh"));
    }

    #[test]
    fn zip_slip_protection() {
        let result = sanitize_entry_path("../../etc/passwd");
        assert!(matches!(result, Err(Error::ZipSlip { .. })));

        let result = sanitize_entry_path("lib/../../escape");
        assert!(matches!(result, Err(Error::ZipSlip { .. })));
    }

    #[test]
    fn empty_names_are_invalid() {
        assert!(matches!(sanitize_entry_path("./"), Err(Error::InvalidPath)));
        assert!(matches!(sanitize_entry_path("/"), Err(Error::InvalidPath)));
    }

    #[cfg(unix)]
    #[test]
    fn symlinked_ancestor_is_refused() {
        let dir = tempdir().unwrap();
        let outside = tempdir().unwrap();
        std::os::unix::fs::symlink(outside.path(), dir.path().join("lib")).unwrap();

        let result = ensure_no_symlink_ancestor(dir.path(), Path::new("lib/evil.so"));
        assert!(matches!(result, Err(Error::SymlinkAncestor { ref ancestor, .. }) if ancestor == Path::new("lib")));

        ensure_no_symlink_ancestor(dir.path(), Path::new("etc/passwd")).unwrap();
        ensure_no_symlink_ancestor(dir.path(), Path::new("lib")).unwrap();
    }
}
