//! Random-access container support (ZIP-style).
//!
//! The index lives at the end of the container, so the reader parses it
//! once at open by scanning backward for the closing record. Extra bytes
//! around the index (a self-extractor preamble before the first entry, a
//! postamble after the index) are honored only when the driver
//! configuration allows them and are otherwise a fast failure.
//!
//! Entries are mutually independent: per-entry reads seek straight into
//! the source, and the writer accepts entries in any sequence.

pub mod header;

use std::cell::RefCell;
use std::io::{Read, Seek, SeekFrom, Write};
use std::rc::Rc;
use std::time::SystemTime;

use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;
use log::{debug, warn};

use coffer_core::checked::CheckedReader;
use coffer_core::config::DriverConfig;
use coffer_core::entry::{CompressionMethod, Entry, EntryKind};
use coffer_core::error::{CofferError, Result};

use crate::archive::{is_copy_through, EntryStream, EntryWrite, InputArchive, OutputArchive, SourceImage};
use crate::driver::ContainerFormat;
use header::{
    dos_to_system, system_to_dos, CentralRecord, EndOfCentralDir, LocalHeader, EOCD_LEN,
    FLAG_UTF8_NAME, LOCAL_HEADER_LEN, MAX_COMMENT_LEN,
};

/// Random-access container reader.
pub struct ZipReader<R: Read + Seek> {
    reader: Option<R>,
    entries: Vec<Entry>,
    checked: bool,
    comment: Vec<u8>,
    preamble_len: u64,
    postamble_len: u64,
    container_len: u64,
}

impl<R: Read + Seek> ZipReader<R> {
    /// Open a container and build its entry index from the trailing
    /// central directory.
    pub fn open(mut reader: R, config: &DriverConfig) -> Result<Self> {
        let container_len = reader.seek(SeekFrom::End(0))?;
        if container_len < EOCD_LEN {
            return Err(CofferError::format("container too short for a closing record"));
        }

        // The closing record sits within one maximum comment of the end.
        let tail_start = container_len.saturating_sub(MAX_COMMENT_LEN + EOCD_LEN);
        reader.seek(SeekFrom::Start(tail_start))?;
        let mut tail = vec![0u8; (container_len - tail_start) as usize];
        reader.read_exact(&mut tail)?;

        let rel = EndOfCentralDir::locate(&tail)
            .ok_or_else(|| CofferError::format("no end-of-central-directory record found"))?;
        let eocd_pos = tail_start + rel as u64;
        let eocd = EndOfCentralDir::parse(&tail[rel..])?;

        let postamble_len = container_len - (eocd_pos + eocd.written_len());
        if postamble_len > 0 && !config.allow_postamble {
            return Err(CofferError::format(format!(
                "{postamble_len} unexpected bytes after the index"
            )));
        }

        // A preamble shifts every stored offset uniformly; the difference
        // between where the central directory claims to end and where the
        // closing record actually sits is that shift.
        let declared_end = u64::from(eocd.cd_offset) + u64::from(eocd.cd_size);
        let shift = eocd_pos.checked_sub(declared_end).ok_or_else(|| {
            CofferError::format("central directory overlaps the closing record")
        })?;

        reader.seek(SeekFrom::Start(u64::from(eocd.cd_offset) + shift))?;
        let mut records = Vec::with_capacity(eocd.entry_count as usize);
        for _ in 0..eocd.entry_count {
            records.push(CentralRecord::read(&mut reader)?);
        }

        let mut first_entry = u64::from(eocd.cd_offset) + shift;
        let mut entries = Vec::with_capacity(records.len());
        for record in records {
            let method = CompressionMethod::from_u16(record.method).ok_or_else(|| {
                CofferError::format(format!("unsupported compression method {}", record.method))
            })?;
            let utf8 = record.flags & FLAG_UTF8_NAME != 0;
            let name = coffer_core::entry::normalize_name(&config.decode_name(&record.name_raw, utf8));

            let local_offset = u64::from(record.local_header_offset) + shift;
            first_entry = first_entry.min(local_offset);

            // The local header's variable-length fields may differ from
            // the central record's, so peek at its two length fields.
            reader.seek(SeekFrom::Start(local_offset + 26))?;
            let mut lens = [0u8; 4];
            reader.read_exact(&mut lens)?;
            let name_len = u64::from(u16::from_le_bytes([lens[0], lens[1]]));
            let extra_len = u64::from(u16::from_le_bytes([lens[2], lens[3]]));
            let data_offset = local_offset + LOCAL_HEADER_LEN + name_len + extra_len;

            let kind = if name.ends_with('/') {
                EntryKind::Directory
            } else {
                EntryKind::File
            };

            entries.push(Entry {
                name,
                kind,
                size: Some(u64::from(record.uncompressed_size)),
                compressed_size: Some(u64::from(record.compressed_size)),
                crc32: Some(record.crc32),
                modified: Some(dos_to_system(record.mtime, record.mdate)),
                method,
                offset: data_offset,
                extra: record.extra,
            });
        }

        let preamble_len = first_entry;
        if preamble_len > 0 && !config.allow_preamble {
            return Err(CofferError::format(format!(
                "{preamble_len} unexpected bytes before the first entry"
            )));
        }

        debug!(
            "opened random-access container: {} entries, preamble {}, postamble {}",
            entries.len(),
            preamble_len,
            postamble_len
        );

        Ok(Self {
            reader: Some(reader),
            entries,
            checked: config.checked,
            comment: eocd.comment,
            preamble_len,
            postamble_len,
            container_len,
        })
    }

    /// The container-level comment.
    pub fn comment(&self) -> &[u8] {
        &self.comment
    }

    /// Length of the preamble region in bytes.
    pub fn preamble_len(&self) -> u64 {
        self.preamble_len
    }

    /// Length of the postamble region in bytes.
    pub fn postamble_len(&self) -> u64 {
        self.postamble_len
    }

    fn lookup(&self, name: &str) -> Result<Entry> {
        self.entry(name)
            .cloned()
            .ok_or_else(|| CofferError::not_found(name))
    }

    fn seek_to(&mut self, entry: &Entry) -> Result<(&mut R, u64)> {
        let compressed = entry.compressed_size.unwrap_or(0);
        let offset = entry.offset;
        let reader = self
            .reader
            .as_mut()
            .ok_or_else(|| CofferError::format("container is closed"))?;
        reader.seek(SeekFrom::Start(offset))?;
        Ok((reader, compressed))
    }
}

impl<R: Read + Seek> InputArchive for ZipReader<R> {
    fn format(&self) -> ContainerFormat {
        ContainerFormat::Zip
    }

    fn entries(&self) -> &[Entry] {
        &self.entries
    }

    fn open_entry(&mut self, name: &str) -> Result<EntryStream<'_>> {
        let entry = self.lookup(name)?;
        let expected = if self.checked { entry.crc32 } else { None };
        let (reader, compressed) = self.seek_to(&entry)?;
        let limited = reader.take(compressed);
        let decoded: Box<dyn Read + '_> = match entry.method {
            CompressionMethod::Stored => Box::new(limited),
            CompressionMethod::Deflated => Box::new(DeflateDecoder::new(limited)),
        };
        Ok(CheckedReader::new(decoded, entry.name, expected))
    }

    fn open_entry_raw(&mut self, name: &str) -> Result<Box<dyn Read + '_>> {
        let entry = self.lookup(name)?;
        let (reader, compressed) = self.seek_to(&entry)?;
        Ok(Box::new(reader.take(compressed)))
    }

    fn source_image(&mut self) -> Result<SourceImage> {
        let comment = self.comment.clone();
        let (preamble_len, postamble_len, container_len) =
            (self.preamble_len, self.postamble_len, self.container_len);
        let reader = self
            .reader
            .as_mut()
            .ok_or_else(|| CofferError::format("container is closed"))?;

        let mut preamble = vec![0u8; preamble_len as usize];
        reader.seek(SeekFrom::Start(0))?;
        reader.read_exact(&mut preamble)?;

        let mut postamble = vec![0u8; postamble_len as usize];
        reader.seek(SeekFrom::Start(container_len - postamble_len))?;
        reader.read_exact(&mut postamble)?;

        Ok(SourceImage {
            comment,
            preamble,
            postamble,
            source_len: container_len,
        })
    }

    fn close(&mut self) -> Result<()> {
        self.reader = None;
        Ok(())
    }
}

struct ZipInner<W: Write> {
    sink: W,
    offset: u64,
    central: Vec<CentralRecord>,
    committed: Vec<Entry>,
    source: Option<SourceImage>,
    finished: bool,
}

impl<W: Write> ZipInner<W> {
    fn commit(&mut self, entry: &mut Entry, data: &[u8]) -> Result<()> {
        let name_raw = entry.name.as_bytes().to_vec();
        let flags = if entry.name.is_ascii() { 0 } else { FLAG_UTF8_NAME };
        let (mtime, mdate) =
            system_to_dos(entry.modified.unwrap_or_else(SystemTime::now));

        let compressed = entry.compressed_size.unwrap_or(0);
        let uncompressed = entry.size.unwrap_or(0);
        let local_offset = self.offset;
        if local_offset > u64::from(u32::MAX)
            || compressed > u64::from(u32::MAX)
            || uncompressed > u64::from(u32::MAX)
        {
            return Err(CofferError::format("entry exceeds the 32-bit container limits"));
        }

        let local = LocalHeader {
            flags,
            method: entry.method.to_u16(),
            mtime,
            mdate,
            crc32: entry.crc32.unwrap_or(0),
            compressed_size: compressed as u32,
            uncompressed_size: uncompressed as u32,
            name_raw: name_raw.clone(),
        };
        local.write(&mut self.sink)?;
        self.sink.write_all(data)?;
        self.offset += local.written_len() + data.len() as u64;

        let external_attr = match entry.kind {
            EntryKind::Directory => 0o40755 << 16,
            EntryKind::File => 0o100644 << 16,
        };
        self.central.push(CentralRecord {
            flags,
            method: entry.method.to_u16(),
            mtime,
            mdate,
            crc32: entry.crc32.unwrap_or(0),
            compressed_size: compressed as u32,
            uncompressed_size: uncompressed as u32,
            name_raw,
            extra: Vec::new(),
            comment: Vec::new(),
            external_attr,
            local_header_offset: local_offset as u32,
        });
        self.committed.push(entry.clone());
        Ok(())
    }
}

/// Random-access container writer.
///
/// When chained to a source container the preamble and comment are
/// preserved verbatim, and the postamble is appended by
/// [`finish`](OutputArchive::finish).
pub struct ZipWriter<W: Write> {
    inner: Rc<RefCell<ZipInner<W>>>,
}

impl<W: Write> ZipWriter<W> {
    /// Start a container, copying the chained source's preamble bytes
    /// before any entry is written.
    pub fn create(mut sink: W, source: Option<SourceImage>, _config: &DriverConfig) -> Result<Self> {
        let mut offset = 0u64;
        if let Some(src) = &source {
            sink.write_all(&src.preamble)?;
            offset = src.preamble.len() as u64;
        }
        Ok(Self {
            inner: Rc::new(RefCell::new(ZipInner {
                sink,
                offset,
                central: Vec::new(),
                committed: Vec::new(),
                source,
                finished: false,
            })),
        })
    }
}

enum ZipPayload {
    /// Copy-through: bytes arrive already encoded.
    Raw { buf: Vec<u8>, expected: u64 },
    /// Stored entry: bytes kept as-is, sized and checksummed here.
    Plain { buf: Vec<u8> },
    /// Standard path: deflate at the strongest ratio.
    Deflated { encoder: DeflateEncoder<Vec<u8>> },
}

struct ZipEntryStream<W: Write> {
    archive: Rc<RefCell<ZipInner<W>>>,
    entry: Option<Entry>,
    payload: Option<ZipPayload>,
    hasher: crc32fast::Hasher,
    raw_len: u64,
    finalized: Option<Entry>,
}

impl<W: Write> Write for ZipEntryStream<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self.payload.as_mut() {
            Some(ZipPayload::Raw { buf: out, .. }) => {
                out.extend_from_slice(buf);
            }
            Some(ZipPayload::Plain { buf: out }) => {
                out.extend_from_slice(buf);
                self.hasher.update(buf);
                self.raw_len += buf.len() as u64;
            }
            Some(ZipPayload::Deflated { encoder }) => {
                encoder.write_all(buf)?;
                self.hasher.update(buf);
                self.raw_len += buf.len() as u64;
            }
            None => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "entry stream already closed",
                ))
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl<W: Write> EntryWrite for ZipEntryStream<W> {
    fn close(&mut self) -> Result<Entry> {
        if let Some(done) = &self.finalized {
            return Ok(done.clone());
        }
        let mut entry = self
            .entry
            .take()
            .ok_or_else(|| CofferError::format("entry stream already closed"))?;

        let data = match self.payload.take() {
            Some(ZipPayload::Raw { buf, expected }) => {
                if buf.len() as u64 != expected {
                    return Err(CofferError::format(format!(
                        "copy-through for `{}` delivered {} bytes, expected {}",
                        entry.name,
                        buf.len(),
                        expected
                    )));
                }
                buf
            }
            Some(ZipPayload::Plain { buf }) => {
                entry.crc32 = Some(std::mem::take(&mut self.hasher).finalize());
                entry.size = Some(self.raw_len);
                entry.compressed_size = Some(buf.len() as u64);
                buf
            }
            Some(ZipPayload::Deflated { encoder }) => {
                let buf = encoder.finish()?;
                entry.crc32 = Some(std::mem::take(&mut self.hasher).finalize());
                entry.size = Some(self.raw_len);
                entry.compressed_size = Some(buf.len() as u64);
                buf
            }
            None => return Err(CofferError::format("entry stream already closed")),
        };

        self.archive.borrow_mut().commit(&mut entry, &data)?;
        self.finalized = Some(entry.clone());
        Ok(entry)
    }
}

impl<W: Write> OutputArchive for ZipWriter<W> {
    fn format(&self) -> ContainerFormat {
        ContainerFormat::Zip
    }

    fn create_entry(
        &self,
        mut entry: Entry,
        source_hint: Option<&Entry>,
    ) -> Result<Box<dyn EntryWrite + '_>> {
        if self.inner.borrow().finished {
            return Err(CofferError::format("container is already finished"));
        }
        if entry.is_dir() {
            return Err(CofferError::format(
                "directory entries take no content stream",
            ));
        }

        let payload = match source_hint {
            Some(hint) if is_copy_through(&entry, hint) => {
                // The hint's bytes are reused verbatim, so its method must
                // travel with them.
                entry.method = hint.method;
                ZipPayload::Raw {
                    buf: Vec::new(),
                    expected: entry.compressed_size.unwrap_or(0),
                }
            }
            _ if entry.method.is_stored() => ZipPayload::Plain { buf: Vec::new() },
            _ => {
                entry.method = CompressionMethod::Deflated;
                ZipPayload::Deflated {
                    encoder: DeflateEncoder::new(Vec::new(), Compression::best()),
                }
            }
        };

        Ok(Box::new(ZipEntryStream {
            archive: Rc::clone(&self.inner),
            entry: Some(entry),
            payload: Some(payload),
            hasher: crc32fast::Hasher::new(),
            raw_len: 0,
            finalized: None,
        }))
    }

    fn store_directory(&self, entry: Entry) -> Result<()> {
        let mut entry = Entry::directory(entry.name).with_modified(
            entry.modified.unwrap_or_else(SystemTime::now),
        );
        self.inner.borrow_mut().commit(&mut entry, &[])
    }

    fn entries(&self) -> Vec<Entry> {
        self.inner.borrow().committed.clone()
    }

    fn finish(&mut self) -> Result<()> {
        let inner = &mut *self.inner.borrow_mut();
        if inner.finished {
            return Ok(());
        }

        let cd_offset = inner.offset;
        let cd_size: u64 = inner.central.iter().map(CentralRecord::written_len).sum();
        if inner.central.len() > usize::from(u16::MAX)
            || cd_size > u64::from(u32::MAX)
            || cd_offset > u64::from(u32::MAX)
        {
            return Err(CofferError::format("index exceeds the 32-bit container limits"));
        }
        for record in &inner.central {
            record.write(&mut inner.sink)?;
        }
        inner.offset += cd_size;

        let comment = inner
            .source
            .as_ref()
            .map(|s| s.comment.clone())
            .unwrap_or_default();
        let eocd = EndOfCentralDir {
            entry_count: inner.central.len() as u16,
            cd_size: cd_size as u32,
            cd_offset: cd_offset as u32,
            comment,
        };
        eocd.write(&mut inner.sink)?;
        inner.offset += eocd.written_len();

        if let Some(src) = &inner.source {
            // Historical alignment rule: whenever the rewritten length
            // differs from the source length, pad by `length mod 4` so the
            // postamble keeps its 4-byte alignment relative to start.
            let out_len = inner.offset;
            if out_len != src.source_len {
                let pad = (out_len % 4) as usize;
                if pad > 0 {
                    inner.sink.write_all(&[0u8; 4][..pad])?;
                    inner.offset += pad as u64;
                }
            }
            inner.sink.write_all(&src.postamble)?;
            inner.offset += src.postamble.len() as u64;
        }

        inner.sink.flush()?;
        inner.finished = true;
        debug!("finished random-access container: {} entries", inner.central.len());
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        // Entries already committed form a valid container once the
        // trailer is in place, so closing completes a pending finish.
        self.finish()
    }
}

impl<W: Write> Drop for ZipWriter<W> {
    fn drop(&mut self) {
        if let Err(err) = self.finish() {
            warn!("error finishing container on drop: {err}");
        }
    }
}
