//! Archive entry metadata.
//!
//! This module defines the [`Entry`] struct that represents a file or
//! directory within a container, along with the name normalization every
//! container applies before an entry is indexed or written.

use std::time::SystemTime;

/// Compression method used for an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompressionMethod {
    /// No compression (method 0 in the random-access format).
    #[default]
    Stored,
    /// DEFLATE compression (method 8 in the random-access format).
    Deflated,
}

impl CompressionMethod {
    /// Create from the on-disk method identifier, if supported.
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            0 => Some(Self::Stored),
            8 => Some(Self::Deflated),
            _ => None,
        }
    }

    /// The on-disk method identifier.
    pub fn to_u16(self) -> u16 {
        match self {
            Self::Stored => 0,
            Self::Deflated => 8,
        }
    }

    /// Check if this method is "stored" (no compression).
    pub fn is_stored(self) -> bool {
        matches!(self, Self::Stored)
    }

    /// Get the method name as a string.
    pub fn name(self) -> &'static str {
        match self {
            Self::Stored => "Stored",
            Self::Deflated => "Deflated",
        }
    }
}

impl std::fmt::Display for CompressionMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Entry kind (file or directory).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EntryKind {
    /// Regular file.
    #[default]
    File,
    /// Directory.
    Directory,
}

/// Normalize an entry name to the canonical archive form.
///
/// The raw name is split into segments on `/`, then rebuilt:
///
/// - empty segments (duplicate separators) and `.` are dropped,
/// - `..` pops the previously accepted segment; popping past the root is a
///   no-op, so a name can never escape the archive root,
/// - a trailing separator is preserved (it marks a directory entry),
/// - a leading separator is dropped (names are always relative).
///
/// Equality and index lookups use the normalized name exclusively.
pub fn normalize_name(raw: &str) -> String {
    let wants_trailing = raw.ends_with('/');
    let mut segments: Vec<&str> = Vec::new();

    for segment in raw.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                // Past the root this is a no-op.
                segments.pop();
            }
            s => segments.push(s),
        }
    }

    let mut name = segments.join("/");
    if wants_trailing && !name.is_empty() {
        name.push('/');
    }
    name
}

/// An entry in an archive container.
///
/// The struct is format-agnostic; format-specific side data travels in
/// [`extra`](Entry::extra) and is owned by the container that produced the
/// entry. The `name` field holds the normalized form (see
/// [`normalize_name`]) from the moment the entry is constructed.
///
/// On the write path an entry moves through three states: drafted (name
/// and attributes known, sizes may be `None`), sizing (its data stream is
/// open) and finalized (stream closed, `size` and `crc32` fixed,
/// `compressed_size` committed).
#[derive(Debug, Clone)]
pub struct Entry {
    /// Normalized name of the entry within the container.
    pub name: String,
    /// File or directory.
    pub kind: EntryKind,
    /// Uncompressed size in bytes. `None` while unknown; must be known no
    /// later than the moment the entry's data stream is closed.
    pub size: Option<u64>,
    /// Compressed size in bytes. Only valid after the entry's bytes have
    /// actually been committed to a container.
    pub compressed_size: Option<u64>,
    /// CRC-32 of the uncompressed data, when the format records one.
    pub crc32: Option<u32>,
    /// Last modification time.
    pub modified: Option<SystemTime>,
    /// Compression method.
    pub method: CompressionMethod,
    /// Byte offset of the entry data inside its source container.
    /// Reader-side bookkeeping; never transferred between containers.
    pub offset: u64,
    /// Opaque format-specific side data.
    pub extra: Vec<u8>,
}

impl Entry {
    /// Create a new file entry of known size with a normalized name.
    pub fn file(name: impl AsRef<str>, size: u64) -> Self {
        Self {
            size: Some(size),
            ..Self::draft(name)
        }
    }

    /// Create a drafted file entry whose size is not yet known. The size
    /// is fixed when the entry's data stream is closed.
    pub fn draft(name: impl AsRef<str>) -> Self {
        Self {
            name: normalize_name(name.as_ref()),
            kind: EntryKind::File,
            size: None,
            compressed_size: None,
            crc32: None,
            modified: None,
            method: CompressionMethod::Deflated,
            offset: 0,
            extra: Vec::new(),
        }
    }

    /// Create a directory entry. The stored name always carries the
    /// trailing separator.
    pub fn directory(name: impl AsRef<str>) -> Self {
        let mut name = normalize_name(name.as_ref());
        if !name.ends_with('/') {
            name.push('/');
        }
        Self {
            name,
            kind: EntryKind::Directory,
            size: Some(0),
            compressed_size: Some(0),
            crc32: Some(0),
            modified: None,
            method: CompressionMethod::Stored,
            offset: 0,
            extra: Vec::new(),
        }
    }

    /// Create an entry from a blueprint taken out of another container.
    ///
    /// Size, CRC, method and modification time transfer; the destination
    /// never inherits the blueprint's container-specific identity (offset
    /// and format side data).
    pub fn from_blueprint(name: impl AsRef<str>, blueprint: &Entry) -> Self {
        let mut entry = if blueprint.kind == EntryKind::Directory {
            Self::directory(name)
        } else {
            Self::draft(name)
        };
        entry.size = blueprint.size;
        entry.compressed_size = blueprint.compressed_size;
        entry.crc32 = blueprint.crc32;
        entry.modified = blueprint.modified;
        entry.method = blueprint.method;
        entry
    }

    /// Check if this is a file.
    pub fn is_file(&self) -> bool {
        matches!(self.kind, EntryKind::File)
    }

    /// Check if this is a directory.
    pub fn is_dir(&self) -> bool {
        matches!(self.kind, EntryKind::Directory)
    }

    /// Builder method to set the compression method.
    pub fn with_method(mut self, method: CompressionMethod) -> Self {
        self.method = method;
        self
    }

    /// Builder method to set the modification time.
    pub fn with_modified(mut self, time: SystemTime) -> Self {
        self.modified = Some(time);
        self
    }

    /// Builder method to set the CRC-32.
    pub fn with_crc32(mut self, crc: u32) -> Self {
        self.crc32 = Some(crc);
        self
    }
}

impl Default for Entry {
    fn default() -> Self {
        Self::draft("")
    }
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for Entry {}

impl std::fmt::Display for Entry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind_char = match self.kind {
            EntryKind::Directory => 'd',
            EntryKind::File => '-',
        };
        write!(
            f,
            "{}{:>10} {:>10} {} {}",
            kind_char,
            self.size.unwrap_or(0),
            self.compressed_size.unwrap_or(0),
            self.method,
            self.name
        )
    }
}
