//! Squashfs 4.0 images, the usual container of an embedded root filesystem.
//!
//! The directory table is read up front by `backhand`; file content is
//! decompressed lazily while [`PassWriter`] copies it, so the byte budget and
//! pass deadline apply per file.

use std::fs::File;
use std::io::BufReader;

use backhand::{FilesystemReader, InnerNode};

use crate::entry::DeviceKind;
use crate::error::{Error, Result};
use crate::extract::PassWriter;

pub fn write_squashfs(reader: BufReader<File>, writer: &mut PassWriter<'_>) -> Result<()> {
    let filesystem = FilesystemReader::from_reader(reader).map_err(|e| Error::Corrupted(format!("squashfs: {e}")))?;

    for node in filesystem.files() {
        writer.budget().check()?;
        let name = node.fullpath.strip_prefix("/").unwrap_or(&node.fullpath);
        if name.as_os_str().is_empty() {
            continue;
        }
        let mode = Some(u32::from(node.header.permissions));

        let result = match &node.inner {
            InnerNode::Dir(_) => writer.dir(name, mode),
            InnerNode::File(file) => {
                let handle = filesystem.file(&file.basic);
                let mut content = handle.reader();
                writer.file(name, mode, &mut content)
            }
            InnerNode::Symlink(symlink) => writer.symlink(name, &symlink.link),
            InnerNode::CharacterDevice(_) => writer.device(name, DeviceKind::Char, mode),
            InnerNode::BlockDevice(_) => writer.device(name, DeviceKind::Block, mode),
            InnerNode::NamedPipe => writer.device(name, DeviceKind::Fifo, mode),
            InnerNode::Socket => writer.device(name, DeviceKind::Socket, mode),
        };
        writer.absorb(result)?;
    }
    tracing::debug!(entries = writer.entry_count(), "squashfs unpacked");
    Ok(())
}

#[cfg(test)]
pub(crate) fn gzip_image(files: &[(&str, u16, &[u8])]) -> Vec<u8> {
    use backhand::compression::Compressor;
    use backhand::{FilesystemCompressor, FilesystemWriter, NodeHeader};
    use std::collections::BTreeSet;
    use std::io::Cursor;

    let mut filesystem = FilesystemWriter::default();
    filesystem.set_compressor(FilesystemCompressor::new(Compressor::Gzip, None).unwrap());

    let dirs: BTreeSet<&str> = files
        .iter()
        .filter_map(|(path, _, _)| path.rsplit_once('/').map(|(dir, _)| dir))
        .collect();
    for dir in dirs {
        filesystem.push_dir(dir, NodeHeader::new(0o755, 0, 0, 0)).unwrap();
    }
    for (path, mode, data) in files {
        filesystem
            .push_file(Cursor::new(data.to_vec()), *path, NodeHeader::new(*mode, 0, 0, 0))
            .unwrap();
    }

    let mut image = Cursor::new(Vec::new());
    filesystem.write(&mut image).unwrap();
    image.into_inner()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::budget::{CancelToken, ExtractionBudget};
    use crate::entry::NodeKind;
    use std::path::Path;
    use std::time::Duration;
    use tempfile::tempdir;

    #[test]
    fn tree_is_written_through_the_pass_writer() {
        let image = gzip_image(&[
            ("etc/passwd", 0o644, &b"root:x:0:0:root:/root:/bin/sh\n"[..]),
            ("bin/busybox", 0o755, &b"\x7fELF-busybox"[..]),
        ]);
        let dir = tempdir().unwrap();
        let input = dir.path().join("rootfs.squashfs");
        std::fs::write(&input, &image).unwrap();
        let out = dir.path().join("out");

        let budget = ExtractionBudget::new(u64::MAX, CancelToken::new());
        let pass = budget.pass(Duration::from_secs(60));
        let mut writer = PassWriter::new(&out, &pass);
        write_squashfs(BufReader::new(File::open(&input).unwrap()), &mut writer).unwrap();
        let (entries, errors) = writer.finish();

        assert!(errors.is_empty(), "{errors:?}");
        let busybox = entries.iter().find(|e| e.path == Path::new("bin/busybox")).unwrap();
        assert_eq!(busybox.kind, NodeKind::File);
        assert!(busybox.is_executable());
        assert!(entries.iter().any(|e| e.path == Path::new("etc") && e.kind == NodeKind::Directory));
        assert_eq!(
            std::fs::read(out.join("etc/passwd")).unwrap(),
            b"root:x:0:0:root:/root:/bin/sh\n"
        );
    }

    #[test]
    fn garbage_superblock_is_corrupt() {
        let mut image = b"hsqs".to_vec();
        image.resize(4096, 0xA5);
        let dir = tempdir().unwrap();
        let input = dir.path().join("broken.squashfs");
        std::fs::write(&input, &image).unwrap();

        let budget = ExtractionBudget::new(u64::MAX, CancelToken::new());
        let pass = budget.pass(Duration::from_secs(60));
        let mut writer = PassWriter::new(dir.path().join("out"), &pass);
        let result = write_squashfs(BufReader::new(File::open(&input).unwrap()), &mut writer);
        assert!(matches!(result, Err(Error::Corrupted(_))));
        assert_eq!(writer.entry_count(), 0);
    }
}
