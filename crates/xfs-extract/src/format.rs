use std::io::{self, BufRead, Read};

use serde::Serialize;

/// Stream compression codecs understood by both extraction strategies.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Compression {
    Gzip,
    Xz,
    Zstd,
}

impl Compression {
    pub fn extension(self) -> &'static str {
        match self {
            Self::Gzip => "gz",
            Self::Xz => "xz",
            Self::Zstd => "zst",
        }
    }

    /// Create a decoder reading exactly one compressed stream from `reader`.
    ///
    /// Decoders take a `BufRead` so callers holding a byte slice can tell how
    /// much compressed input was consumed.
    pub fn decoder<R: BufRead>(self, reader: R) -> io::Result<Decoder<R>> {
        Ok(match self {
            Self::Gzip => Decoder::Gzip(Box::new(flate2::bufread::GzDecoder::new(reader))),
            Self::Xz => Decoder::Xz(Box::new(xz2::bufread::XzDecoder::new(reader))),
            Self::Zstd => {
                let mut decoder = zstd::stream::read::Decoder::with_buffer(reader)?;
                decoder = decoder.single_frame();
                Decoder::Zstd(Box::new(decoder))
            }
        })
    }
}

pub enum Decoder<R: BufRead> {
    Gzip(Box<flate2::bufread::GzDecoder<R>>),
    Xz(Box<xz2::bufread::XzDecoder<R>>),
    Zstd(Box<zstd::stream::read::Decoder<'static, R>>),
}

impl<R: BufRead> Read for Decoder<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Gzip(d) => d.read(buf),
            Self::Xz(d) => d.read(buf),
            Self::Zstd(d) => d.read(buf),
        }
    }
}

/// Container formats recognised by their leading bytes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ArchiveFormat {
    Zip,
    Tar,
    Cpio,
    Compressed(Compression),
    UImage,
    Squashfs,
}

pub const GZIP_MAGIC: &[u8] = &[0x1F, 0x8B, 0x08];
pub const XZ_MAGIC: &[u8] = &[0xFD, 0x37, 0x7A, 0x58, 0x5A, 0x00];
pub const ZSTD_MAGIC: &[u8] = &[0x28, 0xB5, 0x2F, 0xFD];
pub const ZIP_MAGIC: &[u8] = &[0x50, 0x4B, 0x03, 0x04];
pub const UIMAGE_MAGIC: &[u8] = &[0x27, 0x05, 0x19, 0x56];
pub const SQUASHFS_MAGIC: &[u8] = b"hsqs";
pub const CPIO_NEWC_MAGIC: &[u8] = b"070701";
pub const CPIO_CRC_MAGIC: &[u8] = b"070702";

pub const TAR_BLOCK: usize = 512;
pub const UIMAGE_HEADER_LEN: usize = 64;
pub const CPIO_HEADER_LEN: usize = 110;

/// Identify the container starting at the first byte of `data`.
pub fn detect_format(data: &[u8]) -> Option<ArchiveFormat> {
    match data {
        [0x50, 0x4B, 0x03, 0x04, ..] => Some(ArchiveFormat::Zip),
        [0x1F, 0x8B, 0x08, ..] => Some(ArchiveFormat::Compressed(Compression::Gzip)),
        [0x28, 0xB5, 0x2F, 0xFD, ..] => Some(ArchiveFormat::Compressed(Compression::Zstd)),
        [0xFD, 0x37, 0x7A, 0x58, 0x5A, 0x00, ..] => Some(ArchiveFormat::Compressed(Compression::Xz)),
        [0x27, 0x05, 0x19, 0x56, ..] if data.len() >= UIMAGE_HEADER_LEN => Some(ArchiveFormat::UImage),
        [b'h', b's', b'q', b's', ..] if data.len() >= 96 => Some(ArchiveFormat::Squashfs),
        _ if is_cpio_header(data) => Some(ArchiveFormat::Cpio),
        _ if is_tar_header(data) => Some(ArchiveFormat::Tar),
        _ => None,
    }
}

/// Whether a file starting with `head` is worth feeding back into extraction.
pub fn warrants_recursion(head: &[u8]) -> bool {
    detect_format(head).is_some()
}

pub fn is_tar_header(data: &[u8]) -> bool {
    data.len() >= TAR_BLOCK && &data[257..262] == b"ustar" && tar_checksum_ok(&data[..TAR_BLOCK])
}

fn tar_checksum_ok(header: &[u8]) -> bool {
    let Some(stored) = parse_octal(&header[148..156]) else {
        return false;
    };
    let computed: u64 = header
        .iter()
        .enumerate()
        .map(|(i, &b)| if (148..156).contains(&i) { u64::from(b' ') } else { u64::from(b) })
        .sum();
    stored == computed
}

pub fn is_cpio_header(data: &[u8]) -> bool {
    data.len() >= CPIO_HEADER_LEN
        && (data.starts_with(CPIO_NEWC_MAGIC) || data.starts_with(CPIO_CRC_MAGIC))
        && data[6..CPIO_HEADER_LEN].iter().all(u8::is_ascii_hexdigit)
}

/// Parse a NUL/space terminated octal field as used by tar headers.
pub fn parse_octal(field: &[u8]) -> Option<u64> {
    let digits: Vec<u8> = field
        .iter()
        .copied()
        .skip_while(|&b| b == b' ')
        .take_while(|&b| b != 0 && b != b' ')
        .collect();
    if digits.is_empty() {
        return Some(0);
    }
    let text = std::str::from_utf8(&digits).ok()?;
    u64::from_str_radix(text, 8).ok()
}
