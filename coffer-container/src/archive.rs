//! Container contracts.
//!
//! [`InputArchive`] and [`OutputArchive`] are the uniform entry/stream
//! contracts every container format satisfies. The driver hands out boxed
//! trait objects so callers never depend on a concrete format.

use std::io::{Read, Write};
use std::path::PathBuf;

use coffer_core::checked::CheckedReader;
use coffer_core::entry::{normalize_name, Entry};
use coffer_core::error::Result;

use crate::driver::ContainerFormat;

/// A decoded (and, in checked mode, CRC-verified) entry read stream.
///
/// The caller reads to EOF and then calls
/// [`close`](CheckedReader::close); in checked mode a CRC mismatch is
/// raised there, never at open, so bytes already delivered stay usable.
pub type EntryStream<'a> = CheckedReader<Box<dyn Read + 'a>>;

/// Container-level side data carried by a random-access container and
/// preserved verbatim when an output is chained to it for a rewrite.
/// Sequential containers carry no such data and return the default.
#[derive(Debug, Clone, Default)]
pub struct SourceImage {
    /// Trailing container comment.
    pub comment: Vec<u8>,
    /// Bytes before the first entry (self-extractor launcher code).
    pub preamble: Vec<u8>,
    /// Bytes after the index.
    pub postamble: Vec<u8>,
    /// Total length of the source container in bytes.
    pub source_len: u64,
}

/// Read side of a container.
///
/// The entry index is built once at open time and immutable thereafter,
/// which is what makes [`entries`](InputArchive::entries) restartable.
pub trait InputArchive {
    /// The format family this container belongs to.
    fn format(&self) -> ContainerFormat;

    /// The full entry index, in container order.
    fn entries(&self) -> &[Entry];

    /// Look up an entry by name. The name is normalized before the lookup.
    fn entry(&self, name: &str) -> Option<&Entry> {
        let name = normalize_name(name);
        self.entries().iter().find(|e| e.name == name)
    }

    /// Open a decoded read stream over one entry.
    fn open_entry(&mut self, name: &str) -> Result<EntryStream<'_>>;

    /// Open a stream over the entry's bytes exactly as stored, without
    /// decoding. This is the source side of the copy-through path.
    fn open_entry_raw(&mut self, name: &str) -> Result<Box<dyn Read + '_>>;

    /// Container side data for chaining an output to this source.
    fn source_image(&mut self) -> Result<SourceImage>;

    /// Release the underlying storage and delete any temporary files this
    /// container created. Idempotent.
    fn close(&mut self) -> Result<()>;

    /// Temporary files whose deletion had to be deferred at close.
    fn deferred(&self) -> Vec<PathBuf> {
        Vec::new()
    }
}

/// Write stream for one entry. Closing finalizes the entry: its size and
/// CRC become fixed and it turns visible in the destination's index.
pub trait EntryWrite: Write {
    /// Finalize the entry and return its committed form.
    fn close(&mut self) -> Result<Entry>;
}

/// Write side of a container.
pub trait OutputArchive {
    /// The format family this container belongs to.
    fn format(&self) -> ContainerFormat;

    /// Open a write stream for an entry.
    ///
    /// Copy-through rule: when `source_hint` comes from a container of the
    /// same format family and the entry's crc/size/compressed-size were
    /// carried verbatim from it, the bytes written to the stream are
    /// treated as already encoded and stored without recompression, with
    /// the compression method forced to the hint's. Otherwise the writer
    /// encodes at its strongest ratio.
    ///
    /// Takes `&self` so several entry streams can be alive at once; the
    /// sequential writer relies on this to spool entries while another
    /// stream holds the sink.
    fn create_entry(
        &self,
        entry: Entry,
        source_hint: Option<&Entry>,
    ) -> Result<Box<dyn EntryWrite + '_>>;

    /// Store a directory entry: zero length, zero CRC, `Stored` method,
    /// no content stream required.
    fn store_directory(&self, entry: Entry) -> Result<()>;

    /// Entries committed to this container so far, in commit order.
    fn entries(&self) -> Vec<Entry>;

    /// Write the closing index/trailer record and, when chained to a
    /// source, its postamble bytes.
    fn finish(&mut self) -> Result<()>;

    /// Release the sink and reclaim any temporary resources. Idempotent.
    /// The random-access writer completes a pending
    /// [`finish`](OutputArchive::finish), since its committed entries form
    /// a valid container once the trailer is in place; the sequential
    /// writer instead abandons whatever is still pending and deletes its
    /// spool files.
    fn close(&mut self) -> Result<()>;

    /// Temporary files whose deletion had to be deferred.
    fn deferred(&self) -> Vec<PathBuf> {
        Vec::new()
    }
}

/// True when `entry` carries its metadata verbatim from `hint`, making it
/// eligible for copy-through storage.
pub fn is_copy_through(entry: &Entry, hint: &Entry) -> bool {
    entry.crc32.is_some()
        && entry.crc32 == hint.crc32
        && entry.size.is_some()
        && entry.size == hint.size
        && entry.compressed_size.is_some()
        && entry.compressed_size == hint.compressed_size
}

#[cfg(test)]
mod tests {
    use super::*;
    use coffer_core::entry::CompressionMethod;

    #[test]
    fn test_copy_through_requires_verbatim_metadata() {
        let mut source = Entry::file("a.bin", 100);
        source.compressed_size = Some(40);
        source.crc32 = Some(0xABCD);
        source.method = CompressionMethod::Deflated;

        let copied = Entry::from_blueprint("b.bin", &source);
        assert!(is_copy_through(&copied, &source));

        let mut drafted = Entry::draft("c.bin");
        drafted.crc32 = Some(0xABCD);
        assert!(!is_copy_through(&drafted, &source));
    }
}
