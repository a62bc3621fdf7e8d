use std::path::{Path, PathBuf};

use serde::Serialize;

/// Special file types that are recorded but never created on disk.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    Char,
    Block,
    Fifo,
    Socket,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum NodeKind {
    File,
    Directory,
    Symlink { target: PathBuf },
    DevicePlaceholder { device: DeviceKind },
}

impl NodeKind {
    /// Stable tag used when fingerprinting trees.
    pub fn tag(&self) -> &'static str {
        match self {
            Self::File => "file",
            Self::Directory => "dir",
            Self::Symlink { .. } => "symlink",
            Self::DevicePlaceholder { device: DeviceKind::Char } => "chr",
            Self::DevicePlaceholder { device: DeviceKind::Block } => "blk",
            Self::DevicePlaceholder { device: DeviceKind::Fifo } => "fifo",
            Self::DevicePlaceholder { device: DeviceKind::Socket } => "sock",
        }
    }
}

/// One entry written by an extractor pass, relative to the pass output root.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ProducedEntry {
    pub path: PathBuf,
    pub kind: NodeKind,
    pub size: u64,
    pub mode: u32,
    /// Hex SHA-256 of file content.
    pub digest: Option<String>,
    /// Content looks like another container worth extracting.
    pub recurse: bool,
}

impl ProducedEntry {
    pub fn is_file(&self) -> bool {
        matches!(self.kind, NodeKind::File)
    }

    pub fn is_directory(&self) -> bool {
        matches!(self.kind, NodeKind::Directory)
    }

    pub fn symlink_target(&self) -> Option<&Path> {
        match &self.kind {
            NodeKind::Symlink { target } => Some(target),
            _ => None,
        }
    }

    pub fn is_executable(&self) -> bool {
        self.is_file() && self.mode & 0o111 != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_kind_helpers() {
        let entry = ProducedEntry {
            path: "bin/sh".into(),
            kind: NodeKind::Symlink { target: "busybox".into() },
            size: 7,
            mode: 0o777,
            digest: None,
            recurse: false,
        };
        assert_eq!(entry.symlink_target(), Some(Path::new("busybox")));
        assert!(!entry.is_executable());
        assert!(!entry.is_file());
    }

    #[test]
    fn device_tags_are_distinct() {
        let tags: std::collections::HashSet<_> = [
            DeviceKind::Char,
            DeviceKind::Block,
            DeviceKind::Fifo,
            DeviceKind::Socket,
        ]
        .into_iter()
        .map(|device| NodeKind::DevicePlaceholder { device }.tag())
        .collect();
        assert_eq!(tags.len(), 4);
    }
}
