//! Streaming reader for the SVR4 "newc" cpio format used by initramfs images.

use std::collections::HashMap;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use crate::entry::DeviceKind;
use crate::error::{Error, Result};
use crate::extract::PassWriter;
use crate::format::{CPIO_CRC_MAGIC, CPIO_HEADER_LEN, CPIO_NEWC_MAGIC};

const TRAILER: &str = "TRAILER!!!";
const MAX_NAME_LEN: u64 = 4096;
const MAX_SYMLINK_LEN: u64 = 4096;

const S_IFMT: u32 = 0o170000;
const S_IFREG: u32 = 0o100000;
const S_IFDIR: u32 = 0o040000;
const S_IFLNK: u32 = 0o120000;
const S_IFCHR: u32 = 0o020000;
const S_IFBLK: u32 = 0o060000;
const S_IFIFO: u32 = 0o010000;
const S_IFSOCK: u32 = 0o140000;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CpioEntry {
    pub name: PathBuf,
    pub ino: u32,
    pub mode: u32,
    pub nlink: u32,
    pub size: u64,
    pub dev: (u32, u32),
}

impl CpioEntry {
    pub fn file_type(&self) -> u32 {
        self.mode & S_IFMT
    }
}

pub struct CpioReader<R: Read> {
    inner: R,
    position: u64,
    remaining: u64,
    padding: u64,
    done: bool,
}

impl<R: Read> CpioReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            position: 0,
            remaining: 0,
            padding: 0,
            done: false,
        }
    }

    /// Bytes consumed from the underlying reader so far.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Advance to the next member header, skipping unread data of the current one.
    ///
    /// Returns `Ok(None)` at the trailer or at a clean end of input.
    pub fn next_entry(&mut self) -> Result<Option<CpioEntry>> {
        if self.done {
            return Ok(None);
        }
        self.skip(self.remaining + self.padding)?;
        self.remaining = 0;
        self.padding = 0;

        let mut header = [0u8; CPIO_HEADER_LEN];
        let read = read_full(&mut self.inner, &mut header)?;
        self.position += read as u64;
        if read == 0 {
            self.done = true;
            return Ok(None);
        }
        if read < CPIO_HEADER_LEN {
            return Err(Error::Corrupted("truncated cpio header".into()));
        }
        if !(header.starts_with(CPIO_NEWC_MAGIC) || header.starts_with(CPIO_CRC_MAGIC)) {
            return Err(Error::Corrupted("bad cpio magic".into()));
        }

        let field = |index: usize| parse_hex(&header[6 + index * 8..14 + index * 8]);
        let ino = field(0)?;
        let mode = field(1)?;
        let nlink = field(4)?;
        let size = u64::from(field(6)?);
        let dev = (field(7)?, field(8)?);
        let namesize = u64::from(field(11)?);
        if namesize == 0 || namesize > MAX_NAME_LEN {
            return Err(Error::Corrupted(format!("cpio name length {namesize}")));
        }

        let mut name = vec![0u8; namesize as usize];
        self.inner
            .read_exact(&mut name)
            .map_err(|_| Error::Corrupted("truncated cpio name".into()))?;
        self.position += namesize;
        self.skip(pad4(CPIO_HEADER_LEN as u64 + namesize))?;

        if let Some(end) = name.iter().position(|&b| b == 0) {
            name.truncate(end);
        }
        let name = String::from_utf8_lossy(&name).into_owned();
        if name == TRAILER {
            self.done = true;
            return Ok(None);
        }

        self.remaining = size;
        self.padding = pad4(size);
        Ok(Some(CpioEntry {
            name: PathBuf::from(name),
            ino,
            mode,
            nlink,
            size,
            dev,
        }))
    }

    /// Reader over the data of the entry returned by the last `next_entry` call.
    pub fn data(&mut self) -> EntryData<'_, R> {
        EntryData { reader: self }
    }

    fn skip(&mut self, count: u64) -> Result<()> {
        if count == 0 {
            return Ok(());
        }
        let skipped = io::copy(&mut (&mut self.inner).take(count), &mut io::sink())?;
        self.position += skipped;
        if skipped < count {
            return Err(Error::Corrupted("truncated cpio member".into()));
        }
        Ok(())
    }
}

pub struct EntryData<'r, R: Read> {
    reader: &'r mut CpioReader<R>,
}

impl<R: Read> Read for EntryData<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let max = buf.len().min(usize::try_from(self.reader.remaining).unwrap_or(usize::MAX));
        if max == 0 {
            return Ok(0);
        }
        let n = self.reader.inner.read(&mut buf[..max])?;
        if n == 0 {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "truncated cpio data"));
        }
        self.reader.remaining -= n as u64;
        self.reader.position += n as u64;
        Ok(n)
    }
}

/// Write every member of a cpio stream below `prefix`; returns bytes consumed.
///
/// Hardlinked members store their data once, on the last link, so earlier
/// zero-length links are resolved after the data arrives.
pub fn write_cpio<R: Read>(reader: R, writer: &mut PassWriter<'_>, prefix: &Path) -> Result<u64> {
    let mut cpio = CpioReader::new(reader);
    let mut pending_links: HashMap<(u32, u32, u32), Vec<PathBuf>> = HashMap::new();
    let mut written_links: HashMap<(u32, u32, u32), PathBuf> = HashMap::new();

    loop {
        writer.budget().check()?;
        let entry = match cpio.next_entry() {
            Ok(Some(entry)) => entry,
            Ok(None) => break,
            Err(e) => {
                if writer.entry_count() == 0 {
                    return Err(e);
                }
                writer.note(format!("cpio stream ended early: {e}"));
                break;
            }
        };
        if entry.name == Path::new(".") {
            continue;
        }
        let name = prefix.join(&entry.name);
        let link_key = (entry.dev.0, entry.dev.1, entry.ino);
        let mode = Some(entry.mode & 0o7777);

        let result = match entry.file_type() {
            S_IFDIR => writer.dir(&name, mode),
            S_IFLNK => read_link_target(&mut cpio, entry.size)
                .and_then(|target| writer.symlink(&name, &target)),
            S_IFREG if entry.nlink > 1 && entry.size == 0 => {
                pending_links.entry(link_key).or_default().push(name);
                Ok(())
            }
            S_IFREG => {
                let result = writer.file(&name, mode, &mut cpio.data());
                if result.is_ok() && entry.nlink > 1 {
                    for link in pending_links.remove(&link_key).unwrap_or_default() {
                        let linked = writer.hardlink(&link, &name);
                        writer.absorb(linked)?;
                    }
                    written_links.insert(link_key, name);
                }
                result
            }
            S_IFCHR => writer.device(&name, DeviceKind::Char, mode),
            S_IFBLK => writer.device(&name, DeviceKind::Block, mode),
            S_IFIFO => writer.device(&name, DeviceKind::Fifo, mode),
            S_IFSOCK => writer.device(&name, DeviceKind::Socket, mode),
            other => Err(Error::Corrupted(format!(
                "unknown cpio file type {other:o} for '{}'",
                entry.name.display()
            ))),
        };
        writer.absorb(result)?;
    }

    for (key, links) in pending_links {
        for link in links {
            let result = match written_links.get(&key) {
                Some(existing) => writer.hardlink(&link, existing),
                None => writer.file(&link, None, &mut io::empty()),
            };
            writer.absorb(result)?;
        }
    }
    Ok(cpio.position())
}

fn read_link_target<R: Read>(cpio: &mut CpioReader<R>, size: u64) -> Result<PathBuf> {
    if size == 0 || size > MAX_SYMLINK_LEN {
        return Err(Error::Corrupted(format!("cpio symlink target length {size}")));
    }
    let mut target = Vec::with_capacity(size as usize);
    cpio.data().read_to_end(&mut target)?;
    if let Some(end) = target.iter().position(|&b| b == 0) {
        target.truncate(end);
    }
    Ok(PathBuf::from(String::from_utf8_lossy(&target).into_owned()))
}

fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(filled)
}

fn parse_hex(field: &[u8]) -> Result<u32> {
    std::str::from_utf8(field)
        .ok()
        .and_then(|text| u32::from_str_radix(text, 16).ok())
        .ok_or_else(|| Error::Corrupted("bad cpio header field".into()))
}

fn pad4(len: u64) -> u64 {
    (4 - len % 4) % 4
}

/// Build a newc archive in memory; used by tests across the crate.
#[cfg(test)]
pub(crate) fn newc_archive(members: &[(&str, u32, &[u8])]) -> Vec<u8> {
    fn push(out: &mut Vec<u8>, ino: u32, name: &str, mode: u32, nlink: u32, data: &[u8]) {
        let header = format!(
            "070701{ino:08X}{mode:08X}{:08X}{:08X}{nlink:08X}{:08X}{:08X}{:08X}{:08X}{:08X}{:08X}{:08X}{:08X}",
            0,
            0,
            0,
            data.len(),
            0,
            0,
            0,
            0,
            name.len() + 1,
            0
        );
        out.extend_from_slice(header.as_bytes());
        out.extend_from_slice(name.as_bytes());
        out.push(0);
        while out.len() % 4 != 0 {
            out.push(0);
        }
        out.extend_from_slice(data);
        while out.len() % 4 != 0 {
            out.push(0);
        }
    }

    let mut out = Vec::new();
    for (index, (name, mode, data)) in members.iter().enumerate() {
        push(&mut out, index as u32 + 1, name, *mode, 1, data);
    }
    push(&mut out, 0, TRAILER, 0, 1, &[]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::budget::{CancelToken, ExtractionBudget};
    use crate::entry::NodeKind;
    use std::time::Duration;
    use tempfile::tempdir;

    #[test]
    fn reads_headers_and_data() {
        let archive = newc_archive(&[
            ("etc", 0o040755, b""),
            ("etc/hostname", 0o100644, b"router\n"),
        ]);
        let mut reader = CpioReader::new(archive.as_slice());

        let dir = reader.next_entry().unwrap().unwrap();
        assert_eq!(dir.name, Path::new("etc"));
        assert_eq!(dir.file_type(), S_IFDIR);

        let file = reader.next_entry().unwrap().unwrap();
        assert_eq!(file.size, 7);
        let mut content = String::new();
        reader.data().read_to_string(&mut content).unwrap();
        assert_eq!(content, "router\n");

        assert!(reader.next_entry().unwrap().is_none());
        assert_eq!(reader.position(), archive.len() as u64);
    }

    #[test]
    fn unread_data_is_skipped() {
        let archive = newc_archive(&[("a", 0o100644, b"12345"), ("b", 0o100644, b"6")]);
        let mut reader = CpioReader::new(archive.as_slice());
        reader.next_entry().unwrap();
        let second = reader.next_entry().unwrap().unwrap();
        assert_eq!(second.name, Path::new("b"));
    }

    #[test]
    fn truncated_header_is_corrupted() {
        let archive = newc_archive(&[("a", 0o100644, b"12345")]);
        let mut reader = CpioReader::new(&archive[..50]);
        assert!(matches!(reader.next_entry(), Err(Error::Corrupted(_))));
    }

    #[test]
    fn write_cpio_maps_file_types() {
        let dir = tempdir().unwrap();
        let budget = ExtractionBudget::new(u64::MAX, CancelToken::new());
        let pass = budget.pass(Duration::from_secs(60));
        let mut writer = PassWriter::new(dir.path(), &pass);

        let archive = newc_archive(&[
            ("bin", 0o040755, b""),
            ("bin/busybox", 0o100755, b"\x7fELF"),
            ("bin/sh", 0o120777, b"busybox"),
            ("dev/console", 0o020600, b""),
        ]);
        let consumed = write_cpio(archive.as_slice(), &mut writer, Path::new("")).unwrap();
        assert_eq!(consumed, archive.len() as u64);

        let (entries, errors) = writer.finish();
        assert!(errors.is_empty(), "{errors:?}");
        let kinds: Vec<_> = entries.iter().map(|e| (e.path.clone(), e.kind.tag())).collect();
        assert_eq!(
            kinds,
            vec![
                (PathBuf::from("bin"), "dir"),
                (PathBuf::from("bin/busybox"), "file"),
                (PathBuf::from("bin/sh"), "symlink"),
                (PathBuf::from("dev/console"), "chr"),
            ]
        );
        assert_eq!(
            entries[2].kind,
            NodeKind::Symlink {
                target: "busybox".into()
            }
        );
    }
}
