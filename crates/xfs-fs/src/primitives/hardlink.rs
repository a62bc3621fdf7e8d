use crate::{Error, Result};
use std::path::Path;

#[derive(Clone, Copy, Debug, Default)]
pub enum FallbackStrategy {
    #[default]
    Copy,
    Error,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct HardlinkOrCopyOptions {
    pub fallback: FallbackStrategy,
}

impl HardlinkOrCopyOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fallback(mut self, fallback: FallbackStrategy) -> Self {
        self.fallback = fallback;
        self
    }
}

/// Hardlink `src` to `dest`, copying instead when the filesystem refuses the link.
pub fn hardlink_or_copy(
    src: impl AsRef<Path>,
    dest: impl AsRef<Path>,
    options: HardlinkOrCopyOptions,
) -> Result<()> {
    let src = src.as_ref();
    let dest = dest.as_ref();

    match std::fs::hard_link(src, dest) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(Error::NotFound(src.to_path_buf())),
        Err(e) => match options.fallback {
            FallbackStrategy::Copy => std::fs::copy(src, dest).map(drop).map_err(|e| Error::Write {
                path: dest.to_path_buf(),
                source: e,
            }),
            FallbackStrategy::Error if e.raw_os_error() == Some(18) => Err(Error::CrossDeviceHardlink),
            FallbackStrategy::Error => Err(Error::Write {
                path: dest.to_path_buf(),
                source: e,
            }),
        },
    }
}
