use crate::{Error, Result};
use std::borrow::Cow;
use std::io::Read;
use std::path::Path;

/// Files at or above this size are memory-mapped instead of read.
pub const DEFAULT_MMAP_THRESHOLD: u64 = 4 * 1024 * 1024;

/// A read-only file whose bytes are inspected in place.
///
/// The file is stat'ed once on construction; [`Resource::content`] refuses to
/// hand out bytes if the file changed since, so a mapping never observes a
/// concurrent rewrite.
pub struct Resource<'a> {
    path: Cow<'a, Path>,
    mmap_threshold: u64,
    len: u64,
    initial_mtime: Option<std::time::SystemTime>,
}

impl<'a> Resource<'a> {
    pub fn new(path: impl Into<Cow<'a, Path>>) -> Result<Self> {
        let path = path.into();
        let metadata = path
            .metadata()
            .map_err(|_| Error::NotFound(path.to_path_buf()))?;

        Ok(Self {
            path,
            mmap_threshold: DEFAULT_MMAP_THRESHOLD,
            len: metadata.len(),
            initial_mtime: metadata.modified().ok(),
        })
    }

    pub fn with_mmap_threshold(mut self, bytes: u64) -> Self {
        self.mmap_threshold = bytes;
        self
    }

    pub fn path(&self) -> &Path {
        self.path.as_ref()
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn ensure_integrity(&self) -> Result<()> {
        let metadata = self.path.metadata().map_err(|e| Error::Read {
            path: self.path.to_path_buf(),
            source: e,
        })?;
        if metadata.len() != self.len || metadata.modified().ok() != self.initial_mtime {
            return Err(Error::Read {
                path: self.path.to_path_buf(),
                source: std::io::Error::other("file modified externally"),
            });
        }
        Ok(())
    }

    /// Read up to `limit` leading bytes.
    pub fn head(&self, limit: usize) -> Result<Vec<u8>> {
        let file = std::fs::File::open(self.path.as_ref()).map_err(|e| Error::Read {
            path: self.path.to_path_buf(),
            source: e,
        })?;
        let mut buf = Vec::with_capacity(limit.min(self.len as usize));
        file.take(limit as u64)
            .read_to_end(&mut buf)
            .map_err(|e| Error::Read {
                path: self.path.to_path_buf(),
                source: e,
            })?;
        Ok(buf)
    }

    pub fn content(&self) -> Result<Content> {
        self.ensure_integrity()?;

        if self.len == 0 || self.len < self.mmap_threshold {
            let data = std::fs::read(self.path.as_ref()).map_err(|e| Error::Read {
                path: self.path.to_path_buf(),
                source: e,
            })?;
            return Ok(Content::Small(data));
        }

        let file = std::fs::File::open(self.path.as_ref()).map_err(|e| Error::Read {
            path: self.path.to_path_buf(),
            source: e,
        })?;
        // SAFETY: artifacts live in the run-exclusive scratch workspace (or are
        // the read-only input image) and are never written while mapped.
        let mmap = unsafe {
            memmap2::MmapOptions::new()
                .map(&file)
                .map_err(|e| Error::Read {
                    path: self.path.to_path_buf(),
                    source: e,
                })?
        };
        Ok(Content::Mmap(mmap))
    }
}

pub enum Content {
    Small(Vec<u8>),
    Mmap(memmap2::Mmap),
}

impl Content {
    pub fn as_slice(&self) -> &[u8] {
        match self {
            Content::Small(data) => data.as_slice(),
            Content::Mmap(mmap) => mmap.as_ref(),
        }
    }
}
