//! Structured unpacking with real format logic.

use std::fs::File;
use std::io::{BufReader, Cursor, Read};
use std::path::{Path, PathBuf};

use crate::budget::PassBudget;
use crate::entry::DeviceKind;
use crate::error::{Error, Result};
use crate::extract::{PassWriter, cpio, squashfs};
use crate::format::{self, ArchiveFormat, Compression, TAR_BLOCK, UIMAGE_HEADER_LEN};
use crate::plugin::{ArtifactView, Extractor, ExtractorResult, Strategy};

const S_IFMT: u32 = 0o170000;
const S_IFLNK: u32 = 0o120000;
const MAX_SYMLINK_LEN: u64 = 4096;

/// Interprets zip, tar, cpio, squashfs, uImage and compressed streams.
#[derive(Debug, Default)]
pub struct Unpack;

impl Unpack {
    pub fn new() -> Self {
        Self
    }
}

impl Extractor for Unpack {
    fn name(&self) -> &str {
        "unpack"
    }

    fn strategy(&self) -> Strategy {
        Strategy::Structured
    }

    fn probe(&self, artifact: &ArtifactView<'_>) -> bool {
        format::detect_format(artifact.head).is_some()
    }

    fn extract(&self, artifact: &ArtifactView<'_>, output_dir: &Path, budget: &PassBudget<'_>) -> ExtractorResult {
        let Some(format) = format::detect_format(artifact.head) else {
            return ExtractorResult::not_applicable();
        };
        let mut writer = PassWriter::new(output_dir, budget);
        let outcome = unpack(artifact.path, format, &mut writer);
        ExtractorResult::from_pass(writer, outcome)
    }
}

fn unpack(path: &Path, format: ArchiveFormat, writer: &mut PassWriter<'_>) -> Result<()> {
    let file = File::open(path).map_err(|e| Error::ExtractionFailed {
        path: path.to_path_buf(),
        source: e,
    })?;
    let reader = BufReader::new(file);

    match format {
        ArchiveFormat::Zip => unpack_zip(reader, writer),
        ArchiveFormat::Tar => unpack_tar(reader, writer),
        ArchiveFormat::Cpio => cpio::write_cpio(reader, writer, Path::new("")).map(drop),
        ArchiveFormat::UImage => unpack_uimage(reader, writer),
        ArchiveFormat::Compressed(codec) => unpack_stream(reader, codec, &payload_name(path, codec), writer),
        ArchiveFormat::Squashfs => squashfs::write_squashfs(reader, writer),
    }
}

/// Decode a compressed stream and interpret what it contains.
fn unpack_stream<R: Read>(
    reader: BufReader<R>,
    codec: Compression,
    payload: &Path,
    writer: &mut PassWriter<'_>,
) -> Result<()> {
    let mut decoder = codec.decoder(reader)?;
    let mut peek = Vec::with_capacity(TAR_BLOCK);
    (&mut decoder)
        .take(TAR_BLOCK as u64)
        .read_to_end(&mut peek)
        .map_err(|e| Error::Corrupted(format!("{codec:?} stream: {e}")))?;
    let mut chained = Cursor::new(peek.clone()).chain(decoder);

    if format::is_tar_header(&peek) {
        tracing::debug!(?codec, "compressed tar");
        unpack_tar(chained, writer)
    } else if format::is_cpio_header(&peek) {
        tracing::debug!(?codec, "compressed cpio");
        cpio::write_cpio(chained, writer, Path::new("")).map(drop)
    } else {
        writer.payload(payload, &mut chained)
    }
}

fn unpack_tar<R: Read>(reader: R, writer: &mut PassWriter<'_>) -> Result<()> {
    let mut archive = tar::Archive::new(reader);
    let entries = archive
        .entries()
        .map_err(|e| Error::Corrupted(format!("tar: {e}")))?;

    for entry in entries {
        writer.budget().check()?;
        let mut entry = match entry {
            Ok(entry) => entry,
            Err(e) if writer.entry_count() == 0 => return Err(Error::Corrupted(format!("tar: {e}"))),
            Err(e) => {
                writer.note(format!("tar stream ended early: {e}"));
                break;
            }
        };
        let name = match entry.path() {
            Ok(path) => path.into_owned(),
            Err(_) => {
                writer.absorb(Err(Error::InvalidPath))?;
                continue;
            }
        };
        let header = entry.header();
        let mode = header.mode().ok();
        let entry_type = header.entry_type();
        let link = entry.link_name().ok().flatten().map(|l| l.into_owned());

        let result = match entry_type {
            tar::EntryType::Directory => writer.dir(&name, mode),
            tar::EntryType::Symlink => match link {
                Some(target) => writer.symlink(&name, &target),
                None => Err(Error::InvalidPath),
            },
            tar::EntryType::Link => match link {
                Some(existing) => writer.hardlink(&name, &existing),
                None => Err(Error::InvalidPath),
            },
            tar::EntryType::Char => writer.device(&name, DeviceKind::Char, mode),
            tar::EntryType::Block => writer.device(&name, DeviceKind::Block, mode),
            tar::EntryType::Fifo => writer.device(&name, DeviceKind::Fifo, mode),
            t if t.is_file() || t == tar::EntryType::Continuous || t == tar::EntryType::GNUSparse => {
                writer.file(&name, mode, &mut entry)
            }
            other => {
                tracing::trace!(?other, path = %name.display(), "tar entry type skipped");
                Ok(())
            }
        };
        writer.absorb(result)?;
    }
    Ok(())
}

fn unpack_zip<R: Read + std::io::Seek>(reader: R, writer: &mut PassWriter<'_>) -> Result<()> {
    let mut archive = zip::ZipArchive::new(reader).map_err(|e| Error::Corrupted(format!("zip: {e}")))?;

    for index in 0..archive.len() {
        writer.budget().check()?;
        let mut file = match archive.by_index(index) {
            Ok(file) => file,
            Err(e) => {
                writer.absorb(Err(Error::Corrupted(format!("zip member {index}: {e}"))))?;
                continue;
            }
        };
        let name = PathBuf::from(file.name());
        let mode = file.unix_mode();

        let result = if file.is_dir() {
            writer.dir(&name, mode)
        } else if mode.is_some_and(|m| m & S_IFMT == S_IFLNK) {
            read_link(&mut file).and_then(|target| writer.symlink(&name, &target))
        } else {
            writer.file(&name, mode, &mut file)
        };
        writer.absorb(result)?;
    }
    Ok(())
}

/// Strip the legacy U-Boot header and hand the payload on for recursion.
fn unpack_uimage<R: Read>(mut reader: R, writer: &mut PassWriter<'_>) -> Result<()> {
    let mut header = [0u8; UIMAGE_HEADER_LEN];
    reader
        .read_exact(&mut header)
        .map_err(|_| Error::Corrupted("truncated uImage header".into()))?;
    let size = u32::from_be_bytes([header[12], header[13], header[14], header[15]]);
    let name = uimage_name(&header);
    tracing::debug!(image = %name, size, "uImage payload");

    let mut payload = reader.take(u64::from(size));
    writer.payload(Path::new("uimage.payload"), &mut payload)
}

fn uimage_name(header: &[u8; UIMAGE_HEADER_LEN]) -> String {
    let raw = &header[32..64];
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    String::from_utf8_lossy(&raw[..end]).into_owned()
}

fn read_link(file: &mut dyn Read) -> Result<PathBuf> {
    let mut target = Vec::new();
    file.take(MAX_SYMLINK_LEN).read_to_end(&mut target)?;
    if target.is_empty() {
        return Err(Error::InvalidPath);
    }
    Ok(PathBuf::from(String::from_utf8_lossy(&target).into_owned()))
}

/// `rootfs.tar.gz` decodes to `rootfs.tar`; unknown suffixes gain `.decoded`.
fn payload_name(path: &Path, codec: Compression) -> PathBuf {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "payload".to_owned());
    let suffix = format!(".{}", codec.extension());
    match file_name.strip_suffix(&suffix) {
        Some(stem) if !stem.is_empty() => PathBuf::from(stem),
        _ => PathBuf::from(format!("{file_name}.decoded")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::budget::{CancelToken, ExtractionBudget};
    use crate::entry::NodeKind;
    use crate::plugin::PassStatus;
    use flate2::write::GzEncoder;
    use std::io::Write;
    use std::time::Duration;
    use tempfile::tempdir;

    fn minimal_tar() -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        for (path, mode, data) in [
            ("etc/passwd", 0o644, &b"root:x:0:0:root:/root:/bin/sh\n"[..]),
            ("bin/sh", 0o755, &b"\x7fELF-shell"[..]),
            ("lib/libc.so", 0o755, &b"\x7fELF-libc"[..]),
        ] {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(mode);
            header.set_cksum();
            builder.append_data(&mut header, path, data).unwrap();
        }
        builder.into_inner().unwrap()
    }

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    fn run(data: &[u8], file_name: &str) -> (tempfile::TempDir, ExtractorResult) {
        let dir = tempdir().unwrap();
        let input = dir.path().join(file_name);
        std::fs::write(&input, data).unwrap();
        let out = dir.path().join("out");
        std::fs::create_dir(&out).unwrap();

        let budget = ExtractionBudget::new(u64::MAX, CancelToken::new());
        let pass = budget.pass(Duration::from_secs(60));
        let head = &data[..data.len().min(1024)];
        let view = ArtifactView {
            path: &input,
            len: data.len() as u64,
            head,
            depth: 0,
        };
        assert!(Unpack.probe(&view));
        let result = Unpack.extract(&view, &out, &pass);
        (dir, result)
    }

    #[test]
    fn gzipped_tar_is_unpacked() {
        let (dir, result) = run(&gzip(&minimal_tar()), "firmware.bin");
        assert_eq!(result.status, PassStatus::Succeeded, "{:?}", result.errors);

        let files: Vec<_> = result.entries.iter().map(|e| e.path.to_string_lossy().into_owned()).collect();
        assert_eq!(files, vec!["bin/sh", "etc/passwd", "lib/libc.so"]);
        assert!(dir.path().join("out/etc/passwd").is_file());
        assert!(result.entries[0].is_executable());
    }

    #[test]
    fn bare_stream_becomes_payload() {
        let (dir, result) = run(&gzip(&[0x42; 300]), "kernel.gz");
        assert_eq!(result.entries.len(), 1);
        assert_eq!(result.entries[0].path, Path::new("kernel"));
        assert!(result.warrants_recursion);
        assert_eq!(std::fs::read(dir.path().join("out/kernel")).unwrap(), vec![0x42; 300]);
    }

    #[test]
    fn zip_members_and_symlinks() {
        let mut zip = zip::ZipWriter::new(Cursor::new(Vec::new()));
        let options = zip::write::SimpleFileOptions::default().unix_permissions(0o755);
        zip.add_directory("bin/", options).unwrap();
        zip.start_file("bin/busybox", options).unwrap();
        zip.write_all(b"\x7fELF").unwrap();
        zip.add_symlink("bin/sh", "busybox", options).unwrap();
        let data = zip.finish().unwrap().into_inner();

        let (_dir, result) = run(&data, "update.zip");
        assert_eq!(result.status, PassStatus::Succeeded, "{:?}", result.errors);
        let link = result.entries.iter().find(|e| e.path == Path::new("bin/sh")).unwrap();
        assert_eq!(
            link.kind,
            NodeKind::Symlink {
                target: "busybox".into()
            }
        );
    }

    #[test]
    fn zip_slip_entry_is_recorded_not_written() {
        let mut zip = zip::ZipWriter::new(Cursor::new(Vec::new()));
        let options = zip::write::SimpleFileOptions::default();
        zip.start_file("../../evil", options).unwrap();
        zip.write_all(b"boom").unwrap();
        zip.start_file("etc/hostname", options).unwrap();
        zip.write_all(b"box").unwrap();
        let data = zip.finish().unwrap().into_inner();

        let (_dir, result) = run(&data, "evil.zip");
        assert_eq!(result.status, PassStatus::PartiallySucceeded);
        assert_eq!(result.errors.len(), 1);
        assert_eq!(result.entries.len(), 1);
        assert_eq!(result.entries[0].path, Path::new("etc/hostname"));
    }

    #[test]
    fn cpio_inside_gzip() {
        let archive = cpio::newc_archive(&[("init", 0o100755, b"#!/bin/sh\n"), ("etc", 0o040755, b"")]);
        let (_dir, result) = run(&gzip(&archive), "initramfs.cpio.gz");
        assert_eq!(result.status, PassStatus::Succeeded, "{:?}", result.errors);
        assert_eq!(result.entries.len(), 2);
    }

    #[test]
    fn squashfs_rootfs_is_unpacked() {
        let image = squashfs::gzip_image(&[
            ("etc/passwd", 0o644, &b"root:x:0:0:root:/root:/bin/sh\n"[..]),
            ("bin/sh", 0o755, &b"\x7fELF-shell"[..]),
            ("lib/libc.so", 0o755, &b"\x7fELF-libc"[..]),
        ]);
        let (dir, result) = run(&image, "rootfs.squashfs");
        assert_eq!(result.status, PassStatus::Succeeded, "{:?}", result.errors);

        let files: Vec<_> = result
            .entries
            .iter()
            .filter(|e| e.is_file())
            .map(|e| e.path.to_string_lossy().into_owned())
            .collect();
        assert_eq!(files, vec!["bin/sh", "etc/passwd", "lib/libc.so"]);
        assert_eq!(std::fs::read(dir.path().join("out/bin/sh")).unwrap(), b"\x7fELF-shell");
    }

    #[test]
    fn payload_names() {
        assert_eq!(payload_name(Path::new("/x/rootfs.tar.gz"), Compression::Gzip), Path::new("rootfs.tar"));
        assert_eq!(payload_name(Path::new("/x/blob"), Compression::Xz), Path::new("blob.decoded"));
        assert_eq!(payload_name(Path::new("/x/.zst"), Compression::Zstd), Path::new(".zst.decoded"));
    }
}
