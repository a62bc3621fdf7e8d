//! Signature carving: scan raw bytes for known magics and cut regions out.

use std::path::{Path, PathBuf};

use xfs_fs::Resource;

use crate::budget::PassBudget;
use crate::entry::DeviceKind;
use crate::error::{Error, Result};
use crate::extract::{PassWriter, cpio};
use crate::format::{self, Compression, TAR_BLOCK, UIMAGE_HEADER_LEN};
use crate::plugin::{ArtifactView, Extractor, ExtractorResult, Strategy};

const MIN_CARVE_LEN: u64 = 64;
const EOCD_MAGIC: &[u8] = &[0x50, 0x4B, 0x05, 0x06];
const EOCD_LEN: usize = 22;
const SQUASHFS_SUPERBLOCK_LEN: usize = 96;
/// Offsets scanned between budget checks.
const CHECK_INTERVAL: usize = 1 << 20;

/// Scans every offset for container signatures, trusting no global structure.
#[derive(Debug, Default)]
pub struct Carve;

impl Carve {
    pub fn new() -> Self {
        Self
    }
}

impl Extractor for Carve {
    fn name(&self) -> &str {
        "carve"
    }

    fn strategy(&self) -> Strategy {
        Strategy::Carving
    }

    fn probe(&self, artifact: &ArtifactView<'_>) -> bool {
        artifact.len >= MIN_CARVE_LEN
    }

    fn extract(&self, artifact: &ArtifactView<'_>, output_dir: &Path, budget: &PassBudget<'_>) -> ExtractorResult {
        let mut writer = PassWriter::new(output_dir, budget);
        let outcome = Resource::new(artifact.path)
            .and_then(|resource| resource.content())
            .map_err(Error::from)
            .and_then(|content| scan(content.as_slice(), &mut writer));
        ExtractorResult::from_pass(writer, outcome)
    }
}

fn scan(data: &[u8], writer: &mut PassWriter<'_>) -> Result<()> {
    let mut scanner = Scanner::new(data);
    let mut offset = 0;
    let mut next_check = 0;

    while offset < data.len() {
        if offset >= next_check {
            writer.budget().check()?;
            next_check = offset + CHECK_INTERVAL;
        }
        match scanner.carve_at(offset, writer) {
            Ok(Some(consumed)) => offset += consumed.max(1),
            Ok(None) => offset += 1,
            Err(e) if e.is_interrupt() => return Err(e),
            Err(e) => {
                tracing::trace!(offset, error = %e, "signature did not carve");
                offset += 1;
            }
        }
    }
    Ok(())
}

struct Scanner<'d> {
    data: &'d [u8],
    /// Offsets of every end-of-central-directory record, found on first use.
    eocds: Option<Vec<usize>>,
}

impl<'d> Scanner<'d> {
    fn new(data: &'d [u8]) -> Self {
        Self { data, eocds: None }
    }

    /// Try every signature at `offset`; returns the number of bytes carved.
    fn carve_at(&mut self, offset: usize, writer: &mut PassWriter<'_>) -> Result<Option<usize>> {
        let data = self.data;
        let window = &data[offset..];
        let codec = if window.starts_with(format::GZIP_MAGIC) {
            Some(Compression::Gzip)
        } else if window.starts_with(format::XZ_MAGIC) {
            Some(Compression::Xz)
        } else if window.starts_with(format::ZSTD_MAGIC) {
            Some(Compression::Zstd)
        } else {
            None
        };

        if let Some(codec) = codec {
            writer.budget().check()?;
            return carve_stream(window, offset, codec, writer).map(Some);
        }
        if window.starts_with(format::ZIP_MAGIC) {
            writer.budget().check()?;
            let eocd = self.next_eocd(offset);
            return carve_zip(data, offset, eocd, writer);
        }
        if window.starts_with(format::UIMAGE_MAGIC) {
            writer.budget().check()?;
            return carve_uimage(window, offset, writer);
        }
        if window.starts_with(format::SQUASHFS_MAGIC) {
            writer.budget().check()?;
            return carve_squashfs(data, offset, writer);
        }
        if format::is_cpio_header(window) {
            writer.budget().check()?;
            let dir = PathBuf::from(format!("cpio-{offset:08x}"));
            return cpio::write_cpio(window, writer, &dir).map(|consumed| Some(consumed as usize));
        }
        if offset % TAR_BLOCK == 0 && format::is_tar_header(window) {
            writer.budget().check()?;
            return carve_tar(window, offset, writer).map(Some);
        }
        Ok(None)
    }

    /// First end-of-central-directory record at or after `offset`.
    fn next_eocd(&mut self, offset: usize) -> Option<usize> {
        let data = self.data;
        let eocds = self.eocds.get_or_insert_with(|| {
            data.windows(EOCD_MAGIC.len())
                .enumerate()
                .filter(|(_, w)| *w == EOCD_MAGIC)
                .map(|(p, _)| p)
                .collect()
        });
        eocds.get(eocds.partition_point(|&p| p < offset)).copied()
    }
}

fn carve_stream(window: &[u8], offset: usize, codec: Compression, writer: &mut PassWriter<'_>) -> Result<usize> {
    let name = PathBuf::from(format!("{offset:08x}.{}.decoded", codec.extension()));
    let mut input = window;
    {
        let mut decoder = codec.decoder(&mut input)?;
        writer.payload(&name, &mut decoder)?;
    }
    Ok(window.len() - input.len())
}

fn carve_zip(data: &[u8], offset: usize, eocd: Option<usize>, writer: &mut PassWriter<'_>) -> Result<Option<usize>> {
    let Some(eocd) = eocd else {
        return Ok(None);
    };
    if eocd + EOCD_LEN > data.len() {
        return Ok(None);
    }
    let comment_len = usize::from(u16::from_le_bytes([data[eocd + 20], data[eocd + 21]]));
    let end = (eocd + EOCD_LEN + comment_len).min(data.len());
    if offset == 0 && end == data.len() {
        return Ok(Some(end));
    }

    let name = PathBuf::from(format!("{offset:08x}.zip"));
    writer.payload(&name, &mut &data[offset..end])?;
    Ok(Some(end - offset))
}

/// Legacy U-Boot image: 64-byte big-endian header with a CRC32 over itself.
fn carve_uimage(window: &[u8], offset: usize, writer: &mut PassWriter<'_>) -> Result<Option<usize>> {
    if window.len() < UIMAGE_HEADER_LEN {
        return Ok(None);
    }
    let header = &window[..UIMAGE_HEADER_LEN];
    let stored_crc = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);
    let mut zeroed = header.to_vec();
    zeroed[4..8].fill(0);
    let mut crc = flate2::Crc::new();
    crc.update(&zeroed);
    if crc.sum() != stored_crc {
        return Ok(None);
    }

    let size = u32::from_be_bytes([header[12], header[13], header[14], header[15]]) as usize;
    let end = (UIMAGE_HEADER_LEN + size).min(window.len());
    let name = PathBuf::from(format!("{offset:08x}.uimage"));
    writer.payload(&name, &mut &window[UIMAGE_HEADER_LEN..end])?;
    Ok(Some(end))
}

/// Cut a squashfs image out by its superblock size for the unpacker.
fn carve_squashfs(data: &[u8], offset: usize, writer: &mut PassWriter<'_>) -> Result<Option<usize>> {
    let window = &data[offset..];
    if window.len() < SQUASHFS_SUPERBLOCK_LEN {
        return Ok(None);
    }
    let major = u16::from_le_bytes([window[28], window[29]]);
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&window[40..48]);
    let bytes_used = u64::from_le_bytes(raw);
    if major != 4 || bytes_used < SQUASHFS_SUPERBLOCK_LEN as u64 || bytes_used > window.len() as u64 {
        return Ok(None);
    }
    let end = bytes_used as usize;
    if offset == 0 && end == data.len() {
        return Ok(Some(end));
    }

    let name = PathBuf::from(format!("{offset:08x}.squashfs"));
    writer.payload(&name, &mut &window[..end])?;
    Ok(Some(end))
}

/// Walk ustar headers one by one until the first invalid block.
fn carve_tar(window: &[u8], offset: usize, writer: &mut PassWriter<'_>) -> Result<usize> {
    let dir = PathBuf::from(format!("tar-{offset:08x}"));
    let mut pos = 0;
    let mut long_name: Option<PathBuf> = None;
    let mut long_link: Option<PathBuf> = None;

    while pos + TAR_BLOCK <= window.len() {
        writer.budget().check()?;
        let header = &window[pos..pos + TAR_BLOCK];
        if header.iter().all(|&b| b == 0) {
            pos += TAR_BLOCK;
            break;
        }
        if !format::is_tar_header(header) {
            break;
        }
        let Some(size) = format::parse_octal(&header[124..136]) else {
            break;
        };
        let data_start = pos + TAR_BLOCK;
        let Some(data_end) = usize::try_from(size).ok().and_then(|s| data_start.checked_add(s)) else {
            break;
        };
        if data_end > window.len() {
            writer.note(format!("tar member at {:#x} truncated", offset + pos));
            break;
        }
        let content = &window[data_start..data_end];
        let mode = format::parse_octal(&header[100..108]).map(|m| m as u32);
        let typeflag = header[156];

        match typeflag {
            b'L' => long_name = Some(cstr_path(content)),
            b'K' => long_link = Some(cstr_path(content)),
            b'x' | b'g' => {}
            _ => {
                let name = dir.join(long_name.take().unwrap_or_else(|| header_name(header)));
                let link = long_link.take().unwrap_or_else(|| cstr_path(&header[157..257]));
                let result = match typeflag {
                    b'0' | 0 | b'7' => writer.file(&name, mode, &mut &content[..]),
                    b'5' => writer.dir(&name, mode),
                    b'2' => writer.symlink(&name, &link),
                    b'1' => writer.hardlink(&name, &dir.join(&link)),
                    b'3' => writer.device(&name, DeviceKind::Char, mode),
                    b'4' => writer.device(&name, DeviceKind::Block, mode),
                    b'6' => writer.device(&name, DeviceKind::Fifo, mode),
                    other => Err(Error::Corrupted(format!("tar type flag {other:#04x}"))),
                };
                writer.absorb(result)?;
            }
        }
        pos = data_start + size.div_ceil(TAR_BLOCK as u64) as usize * TAR_BLOCK;
    }
    Ok(pos.min(window.len()))
}

fn header_name(header: &[u8]) -> PathBuf {
    let name = cstr_path(&header[0..100]);
    let prefix = cstr_path(&header[345..500]);
    if &header[257..263] == b"ustar\0" && !prefix.as_os_str().is_empty() {
        prefix.join(name)
    } else {
        name
    }
}

fn cstr_path(raw: &[u8]) -> PathBuf {
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    PathBuf::from(String::from_utf8_lossy(&raw[..end]).into_owned())
}
