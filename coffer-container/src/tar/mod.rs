//! Sequential container support (TAR-style).
//!
//! The source is forward-only: there is no trailing index, every record is
//! a 512-byte header followed by padded content, and two zero blocks close
//! the container. To honor the random-access entry contract anyway, the
//! reader materializes each entry into a temporary spool file at open and
//! serves reads from those spools.
//!
//! The writer owns the opposite problem: the sink is forward-only, so an
//! entry's header (which carries its size) must be complete before its
//! content. Entries with a known size stream straight to the sink; entries
//! without one are spooled and drained in the order their streams were
//! closed, whenever the sink is idle.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::rc::Rc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use filetime::FileTime;
use log::{debug, warn};
use tempfile::NamedTempFile;

use coffer_core::checked::CheckedReader;
use coffer_core::config::DriverConfig;
use coffer_core::entry::{normalize_name, CompressionMethod, Entry, EntryKind};
use coffer_core::error::{CofferError, ErrorChain, Result};

use crate::archive::{EntryStream, EntryWrite, InputArchive, OutputArchive, SourceImage};
use crate::driver::ContainerFormat;

const BLOCK_SIZE: usize = 512;
const NAME_LEN: usize = 100;
const PREFIX_LEN: usize = 155;

const TYPEFLAG_FILE: u8 = b'0';
const TYPEFLAG_DIR: u8 = b'5';

fn parse_octal(field: &[u8]) -> Result<u64> {
    let text = field
        .iter()
        .take_while(|&&b| b != 0)
        .map(|&b| b as char)
        .collect::<String>();
    let text = text.trim();
    if text.is_empty() {
        return Ok(0);
    }
    u64::from_str_radix(text, 8)
        .map_err(|_| CofferError::format(format!("invalid octal field: {text:?}")))
}

fn write_octal(field: &mut [u8], value: u64) -> Result<()> {
    // Width-1 digits plus a terminating NUL, the historic USTAR layout.
    let digits = field.len() - 1;
    if value >> (3 * digits as u32) != 0 {
        return Err(CofferError::format(format!(
            "value {value} does not fit a {digits}-digit octal field"
        )));
    }
    let text = format!("{value:0digits$o}");
    field[..digits].copy_from_slice(text.as_bytes());
    field[digits] = 0;
    Ok(())
}

fn block_checksum(block: &[u8; BLOCK_SIZE]) -> u32 {
    let mut sum = 0u32;
    for (i, &b) in block.iter().enumerate() {
        // The checksum field itself counts as spaces.
        if (148..156).contains(&i) {
            sum += u32::from(b' ');
        } else {
            sum += u32::from(b);
        }
    }
    sum
}

/// One parsed or to-be-written 512-byte record header.
struct TarHeader {
    name: String,
    mode: u32,
    size: u64,
    mtime: u64,
    typeflag: u8,
}

impl TarHeader {
    fn from_entry(entry: &Entry) -> Self {
        let (typeflag, mode) = match entry.kind {
            EntryKind::Directory => (TYPEFLAG_DIR, 0o755),
            EntryKind::File => (TYPEFLAG_FILE, 0o644),
        };
        let mtime = entry
            .modified
            .unwrap_or_else(SystemTime::now)
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        Self {
            name: entry.name.clone(),
            mode,
            size: entry.size.unwrap_or(0),
            mtime,
            typeflag,
        }
    }

    /// Parse a header block. Returns `None` for an all-zero end marker.
    fn from_block(block: &[u8; BLOCK_SIZE], config: &DriverConfig) -> Result<Option<Self>> {
        if block.iter().all(|&b| b == 0) {
            return Ok(None);
        }

        let stored = parse_octal(&block[148..156])? as u32;
        let computed = block_checksum(block);
        if stored != computed {
            return Err(CofferError::format(format!(
                "header checksum mismatch: stored {stored}, computed {computed}"
            )));
        }

        let raw_name: Vec<u8> = block[0..NAME_LEN]
            .iter()
            .take_while(|&&b| b != 0)
            .copied()
            .collect();
        let raw_prefix: Vec<u8> = block[345..345 + PREFIX_LEN]
            .iter()
            .take_while(|&&b| b != 0)
            .copied()
            .collect();

        let mut name = config.decode_name(&raw_name, false);
        if !raw_prefix.is_empty() {
            name = format!("{}/{}", config.decode_name(&raw_prefix, false), name);
        }

        Ok(Some(Self {
            name,
            mode: parse_octal(&block[100..108])? as u32,
            size: parse_octal(&block[124..136])?,
            mtime: parse_octal(&block[136..148])?,
            typeflag: block[156],
        }))
    }

    /// Split a full entry name into USTAR prefix and name fields, failing
    /// when no split fits the fixed field widths.
    fn split_name(name: &str) -> Result<(&str, &str)> {
        let bytes = name.as_bytes();
        if bytes.len() <= NAME_LEN {
            return Ok(("", name));
        }
        for (i, _) in name.match_indices('/') {
            let (prefix, rest) = (&name[..i], &name[i + 1..]);
            if !rest.is_empty() && rest.len() <= NAME_LEN {
                if prefix.len() > PREFIX_LEN {
                    break;
                }
                return Ok((prefix, rest));
            }
        }
        Err(CofferError::format(format!(
            "entry name too long for the header fields: `{name}`"
        )))
    }

    fn to_block(&self) -> Result<[u8; BLOCK_SIZE]> {
        let mut block = [0u8; BLOCK_SIZE];
        let (prefix, name) = Self::split_name(&self.name)?;

        block[0..name.len()].copy_from_slice(name.as_bytes());
        write_octal(&mut block[100..108], u64::from(self.mode))?;
        write_octal(&mut block[108..116], 0)?; // uid
        write_octal(&mut block[116..124], 0)?; // gid
        write_octal(&mut block[124..136], self.size)?;
        write_octal(&mut block[136..148], self.mtime)?;
        block[156] = self.typeflag;
        block[257..263].copy_from_slice(b"ustar\0");
        block[263..265].copy_from_slice(b"00");
        block[345..345 + prefix.len()].copy_from_slice(prefix.as_bytes());

        let sum = block_checksum(&block);
        let chksum = format!("{sum:06o}\0 ");
        block[148..156].copy_from_slice(chksum.as_bytes());
        Ok(block)
    }

    fn is_dir(&self) -> bool {
        self.typeflag == TYPEFLAG_DIR || self.name.ends_with('/')
    }
}

fn padding_for(size: u64) -> usize {
    ((BLOCK_SIZE as u64 - size % BLOCK_SIZE as u64) % BLOCK_SIZE as u64) as usize
}

/// Read one block, distinguishing clean EOF at a block boundary from a
/// truncated container.
fn read_block<R: Read>(reader: &mut R, block: &mut [u8; BLOCK_SIZE]) -> Result<bool> {
    let mut filled = 0;
    while filled < BLOCK_SIZE {
        let n = reader.read(&mut block[filled..])?;
        if n == 0 {
            if filled == 0 {
                return Ok(false);
            }
            return Err(CofferError::format("truncated header block"));
        }
        filled += n;
    }
    Ok(true)
}

/// Sequential container reader.
///
/// The whole source is consumed at open: file entries are copied into
/// temporary spool files (with their modification time applied) and every
/// later read is served from those spools. This trades disk for the full
/// random-access entry contract over a forward-only source.
pub struct TarReader {
    entries: Vec<Entry>,
    spools: Vec<Option<NamedTempFile>>,
    deferred: Vec<PathBuf>,
    closed: bool,
}

impl TarReader {
    /// Consume a sequential source and index its entries.
    ///
    /// Spool files already materialized are removed automatically when a
    /// later record turns out to be malformed and open fails.
    pub fn open<R: Read>(mut reader: R, config: &DriverConfig) -> Result<Self> {
        let mut entries = Vec::new();
        let mut spools: Vec<Option<NamedTempFile>> = Vec::new();
        let mut offset = 0u64;
        let mut block = [0u8; BLOCK_SIZE];

        loop {
            if !read_block(&mut reader, &mut block)? {
                break;
            }
            let Some(header) = TarHeader::from_block(&block, config)? else {
                break;
            };
            let header_offset = offset;
            offset += BLOCK_SIZE as u64;

            let modified = UNIX_EPOCH + Duration::from_secs(header.mtime);
            if header.is_dir() {
                let mut name = normalize_name(&header.name);
                if !name.ends_with('/') {
                    name.push('/');
                }
                let entry = Entry::directory(name)
                    .with_modified(modified);
                entries.push(Entry {
                    offset: header_offset,
                    ..entry
                });
                spools.push(None);
                continue;
            }

            let mut spool = NamedTempFile::new()?;
            let copied = io::copy(&mut (&mut reader).take(header.size), spool.as_file_mut())?;
            if copied != header.size {
                return Err(CofferError::format(format!(
                    "truncated entry data: `{}` declares {} bytes, found {}",
                    header.name, header.size, copied
                )));
            }
            spool.as_file_mut().flush()?;
            if let Err(err) =
                filetime::set_file_mtime(spool.path(), FileTime::from_unix_time(header.mtime as i64, 0))
            {
                warn!("could not apply mtime to spool file: {err}");
            }

            let pad = padding_for(header.size);
            if pad > 0 {
                let mut skip = [0u8; BLOCK_SIZE];
                reader.read_exact(&mut skip[..pad])?;
            }
            offset += header.size + pad as u64;

            let mut entry = Entry::file(normalize_name(&header.name), header.size)
                .with_modified(modified)
                .with_method(CompressionMethod::Stored);
            entry.compressed_size = Some(header.size);
            entry.offset = header_offset;
            entries.push(entry);
            spools.push(Some(spool));
        }

        debug!("opened sequential container: {} entries", entries.len());
        Ok(Self {
            entries,
            spools,
            deferred: Vec::new(),
            closed: false,
        })
    }

    fn position(&self, name: &str) -> Result<usize> {
        if self.closed {
            return Err(CofferError::format("container is closed"));
        }
        let name = normalize_name(name);
        self.entries
            .iter()
            .position(|e| e.name == name)
            .ok_or(CofferError::NotFound { name })
    }

    fn spool_stream(&self, idx: usize) -> Result<Box<dyn Read + '_>> {
        match &self.spools[idx] {
            // Directories have no content.
            None => Ok(Box::new(io::empty())),
            Some(spool) => Ok(Box::new(spool.reopen()?)),
        }
    }
}

impl InputArchive for TarReader {
    fn format(&self) -> ContainerFormat {
        ContainerFormat::Tar
    }

    fn entries(&self) -> &[Entry] {
        &self.entries
    }

    fn open_entry(&mut self, name: &str) -> Result<EntryStream<'_>> {
        let idx = self.position(name)?;
        let stream = self.spool_stream(idx)?;
        // The format records no per-entry checksum to verify against.
        Ok(CheckedReader::new(stream, self.entries[idx].name.clone(), None))
    }

    fn open_entry_raw(&mut self, name: &str) -> Result<Box<dyn Read + '_>> {
        let idx = self.position(name)?;
        self.spool_stream(idx)
    }

    fn source_image(&mut self) -> Result<SourceImage> {
        // Sequential containers carry no comment or preamble/postamble.
        Ok(SourceImage::default())
    }

    fn close(&mut self) -> Result<()> {
        for spool in &mut self.spools {
            if let Some(spool) = spool.take() {
                let path = spool.path().to_path_buf();
                if let Err(err) = spool.close() {
                    warn!("could not remove spool file {}: {err}", path.display());
                    self.deferred.push(path);
                }
            }
        }
        self.closed = true;
        Ok(())
    }

    fn deferred(&self) -> Vec<PathBuf> {
        self.deferred.clone()
    }
}

impl Drop for TarReader {
    fn drop(&mut self) {
        if !self.closed {
            let _ = InputArchive::close(self);
        }
    }
}

struct PendingEntry {
    entry: Entry,
    /// `None` for directory entries, which are header-only.
    spool: Option<NamedTempFile>,
}

struct TarInner<W: Write> {
    sink: W,
    /// Name of the entry currently streaming straight to the sink.
    busy: Option<String>,
    pending: VecDeque<PendingEntry>,
    committed: Vec<Entry>,
    deferred: Vec<PathBuf>,
    finished: bool,
}

impl<W: Write> TarInner<W> {
    fn write_header(&mut self, entry: &Entry) -> Result<()> {
        let block = TarHeader::from_entry(entry).to_block()?;
        self.sink.write_all(&block)?;
        Ok(())
    }

    fn write_padding(&mut self, size: u64) -> Result<()> {
        let pad = padding_for(size);
        if pad > 0 {
            self.sink.write_all(&[0u8; BLOCK_SIZE][..pad])?;
        }
        Ok(())
    }

    fn write_record(&mut self, entry: &Entry, data: &[u8]) -> Result<()> {
        self.write_header(entry)?;
        self.sink.write_all(data)?;
        self.write_padding(data.len() as u64)
    }
}

/// Drain spooled entries to the sink, in the order their streams were
/// closed. A spool read failure loses that entry but the batch keeps
/// going; a sink write failure is fatal and stops the drain so the sink
/// is not corrupted further.
fn drain<W: Write>(inner: &mut TarInner<W>) -> ErrorChain {
    let mut chain = ErrorChain::new();
    while !chain.is_fatal() {
        let Some(mut item) = inner.pending.pop_front() else {
            break;
        };
        let Some(spool) = item.spool.take() else {
            match inner.write_header(&item.entry) {
                Ok(()) => inner.committed.push(item.entry),
                Err(err) => chain.record_fatal(err),
            }
            continue;
        };

        // Read the whole spool before touching the sink, so a bad spool
        // never leaves a half-written record in the destination.
        let mut data = Vec::new();
        let read = spool.reopen().and_then(|mut f| f.read_to_end(&mut data));

        let path = spool.path().to_path_buf();
        if let Err(err) = spool.close() {
            warn!("could not remove spool file {}: {err}", path.display());
            inner.deferred.push(path);
        }

        match read {
            Err(err) => chain.record(CofferError::Io(err)),
            Ok(_) => match inner.write_record(&item.entry, &data) {
                Ok(()) => inner.committed.push(item.entry),
                Err(err) => chain.record_fatal(err),
            },
        }
    }
    chain
}

/// Sequential container writer.
///
/// One entry stream at a time may hold the sink. An entry whose size is
/// known up front streams directly; opening a second sized stream while
/// the sink is held fails with [`CofferError::Busy`]. Entries of unknown
/// size may always be opened: they spool to temporary files and are
/// drained whenever the sink becomes idle.
pub struct TarWriter<W: Write> {
    inner: Rc<RefCell<TarInner<W>>>,
}

impl<W: Write> TarWriter<W> {
    /// Start a sequential container. The chained source image is accepted
    /// for interface symmetry but carries nothing this format can store.
    pub fn create(sink: W, _source: Option<SourceImage>, _config: &DriverConfig) -> Result<Self> {
        Ok(Self {
            inner: Rc::new(RefCell::new(TarInner {
                sink,
                busy: None,
                pending: VecDeque::new(),
                committed: Vec::new(),
                deferred: Vec::new(),
                finished: false,
            })),
        })
    }
}

struct TarDirectStream<W: Write> {
    archive: Rc<RefCell<TarInner<W>>>,
    entry: Option<Entry>,
    declared: u64,
    written: u64,
    finalized: Option<Entry>,
}

impl<W: Write> Write for TarDirectStream<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let inner = &mut *self.archive.borrow_mut();
        if inner.finished {
            return Err(io::Error::new(io::ErrorKind::Other, "writer is closed"));
        }
        if self.written + buf.len() as u64 > self.declared {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "content exceeds the declared entry size",
            ));
        }
        inner.sink.write_all(buf)?;
        self.written += buf.len() as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.archive.borrow_mut().sink.flush()
    }
}

impl<W: Write> EntryWrite for TarDirectStream<W> {
    fn close(&mut self) -> Result<Entry> {
        if let Some(done) = &self.finalized {
            return Ok(done.clone());
        }
        let mut entry = self
            .entry
            .take()
            .ok_or_else(|| CofferError::format("entry stream already closed"))?;
        if self.written != self.declared {
            // The header already promised `declared` bytes; keep the sink
            // marked busy so the mismatch cannot be papered over.
            self.entry = Some(entry);
            return Err(CofferError::format(format!(
                "entry declared {} bytes but received {}",
                self.declared, self.written
            )));
        }

        let inner = &mut *self.archive.borrow_mut();
        inner.write_padding(self.written)?;
        entry.compressed_size = Some(self.written);
        inner.committed.push(entry.clone());
        inner.busy = None;

        let chain = drain(inner);
        self.finalized = Some(entry.clone());
        chain.into_result()?;
        Ok(entry)
    }
}

struct TarSpoolStream<W: Write> {
    archive: Rc<RefCell<TarInner<W>>>,
    entry: Option<Entry>,
    spool: Option<NamedTempFile>,
    written: u64,
    finalized: Option<Entry>,
}

impl<W: Write> Write for TarSpoolStream<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let spool = self
            .spool
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "entry stream already closed"))?;
        spool.as_file_mut().write_all(buf)?;
        self.written += buf.len() as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.spool.as_mut() {
            Some(spool) => spool.as_file_mut().flush(),
            None => Ok(()),
        }
    }
}

impl<W: Write> EntryWrite for TarSpoolStream<W> {
    fn close(&mut self) -> Result<Entry> {
        if let Some(done) = &self.finalized {
            return Ok(done.clone());
        }
        let mut entry = self
            .entry
            .take()
            .ok_or_else(|| CofferError::format("entry stream already closed"))?;
        let mut spool = self
            .spool
            .take()
            .ok_or_else(|| CofferError::format("entry stream already closed"))?;
        spool.as_file_mut().flush()?;

        // Closing fixes the entry's stats even while it is still pending.
        entry.size = Some(self.written);
        entry.compressed_size = Some(self.written);

        let inner = &mut *self.archive.borrow_mut();
        if inner.finished {
            return Err(CofferError::format("writer is closed"));
        }
        inner.pending.push_back(PendingEntry {
            entry: entry.clone(),
            spool: Some(spool),
        });
        self.finalized = Some(entry.clone());

        if inner.busy.is_none() {
            drain(inner).into_result()?;
        }
        Ok(entry)
    }
}

impl<W: Write> OutputArchive for TarWriter<W> {
    fn format(&self) -> ContainerFormat {
        ContainerFormat::Tar
    }

    fn create_entry(
        &self,
        mut entry: Entry,
        _source_hint: Option<&Entry>,
    ) -> Result<Box<dyn EntryWrite + '_>> {
        let inner = &mut *self.inner.borrow_mut();
        if inner.finished {
            return Err(CofferError::format("writer is closed"));
        }
        if entry.is_dir() {
            return Err(CofferError::format(
                "directory entries take no content stream",
            ));
        }
        // Unrepresentable names should fail at open, not at drain time.
        TarHeader::split_name(&entry.name)?;
        entry.method = CompressionMethod::Stored;

        match entry.size {
            Some(declared) => {
                if let Some(name) = &inner.busy {
                    return Err(CofferError::busy(name.clone()));
                }
                inner.write_header(&entry)?;
                inner.busy = Some(entry.name.clone());
                Ok(Box::new(TarDirectStream {
                    archive: Rc::clone(&self.inner),
                    entry: Some(entry),
                    declared,
                    written: 0,
                    finalized: None,
                }))
            }
            None => Ok(Box::new(TarSpoolStream {
                archive: Rc::clone(&self.inner),
                entry: Some(entry),
                spool: Some(NamedTempFile::new()?),
                written: 0,
                finalized: None,
            })),
        }
    }

    fn store_directory(&self, entry: Entry) -> Result<()> {
        let entry = Entry::directory(entry.name)
            .with_modified(entry.modified.unwrap_or_else(SystemTime::now));
        let inner = &mut *self.inner.borrow_mut();
        if inner.finished {
            return Err(CofferError::format("writer is closed"));
        }
        if inner.busy.is_some() {
            inner.pending.push_back(PendingEntry { entry, spool: None });
            return Ok(());
        }
        inner.write_header(&entry)?;
        inner.committed.push(entry);
        Ok(())
    }

    fn entries(&self) -> Vec<Entry> {
        self.inner.borrow().committed.clone()
    }

    fn finish(&mut self) -> Result<()> {
        let inner = &mut *self.inner.borrow_mut();
        if inner.finished {
            return Ok(());
        }
        if let Some(name) = &inner.busy {
            return Err(CofferError::busy(name.clone()));
        }

        let chain = drain(inner);
        if chain.is_fatal() {
            return chain.into_result();
        }

        // Two zero blocks close the container.
        inner.sink.write_all(&[0u8; BLOCK_SIZE * 2])?;
        inner.sink.flush()?;
        inner.finished = true;
        debug!("finished sequential container: {} entries", inner.committed.len());
        chain.into_result()
    }

    fn close(&mut self) -> Result<()> {
        let inner = &mut *self.inner.borrow_mut();
        while let Some(mut item) = inner.pending.pop_front() {
            if let Some(spool) = item.spool.take() {
                let path = spool.path().to_path_buf();
                if let Err(err) = spool.close() {
                    warn!("could not remove spool file {}: {err}", path.display());
                    inner.deferred.push(path);
                }
            }
        }
        inner.busy = None;
        inner.finished = true;
        let _ = inner.sink.flush();
        Ok(())
    }

    fn deferred(&self) -> Vec<PathBuf> {
        self.inner.borrow().deferred.clone()
    }
}

impl<W: Write> Drop for TarWriter<W> {
    fn drop(&mut self) {
        let finished = self.inner.borrow().finished;
        if !finished {
            let _ = OutputArchive::close(self);
        }
    }
}
