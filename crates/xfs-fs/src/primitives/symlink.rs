use crate::{Error, Result};
use std::path::Path;

/// Create `link` pointing at `target`. The target text is stored as-is and
/// never resolved, so absolute targets from a foreign root stay intact.
pub fn create_symlink(target: impl AsRef<Path>, link: impl AsRef<Path>) -> Result<()> {
    let target = target.as_ref();
    let link = link.as_ref();

    #[cfg(unix)]
    {
        std::os::unix::fs::symlink(target, link).map_err(|e| Error::Write {
            path: link.to_path_buf(),
            source: e,
        })
    }

    #[cfg(not(unix))]
    {
        let _ = (target, link);
        Err(Error::SymlinkNotSupported)
    }
}
