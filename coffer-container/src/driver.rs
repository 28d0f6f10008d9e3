//! Format selection and composition.
//!
//! The [`Driver`] is the front door: it maps a [`ContainerFormat`] tag to
//! the matching reader/writer constructors through a small registry table,
//! threads the shared [`DriverConfig`] into every container it opens, and
//! provides the entry-copy convenience that picks raw copy-through or
//! decode-and-recompress depending on the formats involved.

use std::fmt;
use std::fs::File;
use std::io::{self, BufReader, BufWriter};
use std::path::Path;

use log::debug;

use coffer_core::config::DriverConfig;
use coffer_core::entry::Entry;
use coffer_core::error::{CofferError, Result};

use crate::archive::{InputArchive, OutputArchive, SourceImage};
use crate::tar::{TarReader, TarWriter};
use crate::zip::{ZipReader, ZipWriter};

/// Container format families.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerFormat {
    /// Random-access container with a trailing index.
    Zip,
    /// Sequential container of 512-byte records.
    Tar,
}

impl ContainerFormat {
    /// Infer the format from a locator's extension.
    pub fn from_locator(path: impl AsRef<Path>) -> Option<Self> {
        let ext = path.as_ref().extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "zip" | "jar" | "war" | "ear" => Some(Self::Zip),
            "tar" => Some(Self::Tar),
            _ => None,
        }
    }

    /// Short format tag.
    pub fn name(self) -> &'static str {
        match self {
            Self::Zip => "zip",
            Self::Tar => "tar",
        }
    }
}

impl fmt::Display for ContainerFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

type OpenFn = fn(BufReader<File>, &DriverConfig) -> Result<Box<dyn InputArchive>>;
type CreateFn =
    fn(BufWriter<File>, Option<SourceImage>, &DriverConfig) -> Result<Box<dyn OutputArchive>>;

struct FormatDriver {
    format: ContainerFormat,
    open: OpenFn,
    create: CreateFn,
}

fn open_zip(file: BufReader<File>, config: &DriverConfig) -> Result<Box<dyn InputArchive>> {
    Ok(Box::new(ZipReader::open(file, config)?))
}

fn open_tar(file: BufReader<File>, config: &DriverConfig) -> Result<Box<dyn InputArchive>> {
    Ok(Box::new(TarReader::open(file, config)?))
}

fn create_zip(
    sink: BufWriter<File>,
    source: Option<SourceImage>,
    config: &DriverConfig,
) -> Result<Box<dyn OutputArchive>> {
    Ok(Box::new(ZipWriter::create(sink, source, config)?))
}

fn create_tar(
    sink: BufWriter<File>,
    source: Option<SourceImage>,
    config: &DriverConfig,
) -> Result<Box<dyn OutputArchive>> {
    Ok(Box::new(TarWriter::create(sink, source, config)?))
}

const REGISTRY: &[FormatDriver] = &[
    FormatDriver {
        format: ContainerFormat::Zip,
        open: open_zip,
        create: create_zip,
    },
    FormatDriver {
        format: ContainerFormat::Tar,
        open: open_tar,
        create: create_tar,
    },
];

fn registry_for(format: ContainerFormat) -> &'static FormatDriver {
    REGISTRY
        .iter()
        .find(|d| d.format == format)
        .unwrap_or_else(|| unreachable!("format {format} missing from the registry"))
}

/// Format-dispatching facade over the container implementations.
#[derive(Debug, Clone, Default)]
pub struct Driver {
    config: DriverConfig,
}

impl Driver {
    /// Create a driver with the given configuration.
    pub fn new(config: DriverConfig) -> Self {
        Self { config }
    }

    /// The configuration applied to every container this driver opens.
    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    /// Open an existing container for reading.
    pub fn open_input(
        &self,
        format: ContainerFormat,
        path: impl AsRef<Path>,
    ) -> Result<Box<dyn InputArchive>> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|err| {
            if err.kind() == io::ErrorKind::NotFound {
                CofferError::not_found(path.display().to_string())
            } else {
                CofferError::Io(err)
            }
        })?;
        debug!("opening {format} container at {}", path.display());
        (registry_for(format).open)(BufReader::new(file), &self.config)
    }

    /// Create a container for writing. When `source` is given the new
    /// container is chained to it: the source's comment, preamble and
    /// postamble carry over (for formats that store them).
    pub fn create_output(
        &self,
        format: ContainerFormat,
        path: impl AsRef<Path>,
        source: Option<&mut dyn InputArchive>,
    ) -> Result<Box<dyn OutputArchive>> {
        let source_image = match source {
            Some(src) => Some(src.source_image()?),
            None => None,
        };
        let path = path.as_ref();
        let file = File::create(path)?;
        debug!("creating {format} container at {}", path.display());
        (registry_for(format).create)(BufWriter::new(file), source_image, &self.config)
    }

    /// Draft an entry for a destination container, optionally carrying a
    /// blueprint entry's metadata verbatim.
    pub fn new_entry(&self, name: &str, blueprint: Option<&Entry>) -> Entry {
        match blueprint {
            Some(blueprint) => Entry::from_blueprint(name, blueprint),
            None => Entry::draft(name),
        }
    }

    /// Copy one entry from a source to a destination container.
    ///
    /// Within the same format family the stored bytes move verbatim
    /// (copy-through, no recompression); across families the entry is
    /// decoded, verified and re-encoded by the destination.
    pub fn copy_entry(
        &self,
        source: &mut dyn InputArchive,
        dest: &dyn OutputArchive,
        name: &str,
    ) -> Result<Entry> {
        let hint = source
            .entry(name)
            .cloned()
            .ok_or_else(|| CofferError::not_found(name))?;
        if hint.is_dir() {
            dest.store_directory(hint.clone())?;
            return Ok(hint);
        }

        if source.format() == dest.format() {
            let copied = Entry::from_blueprint(&hint.name, &hint);
            let mut stream = dest.create_entry(copied, Some(&hint))?;
            let mut raw = source.open_entry_raw(name)?;
            io::copy(&mut raw, &mut *stream)?;
            drop(raw);
            return stream.close();
        }

        // Cross-family copy: the stored byte layout does not transfer, so
        // decode (verifying the source checksum) and let the destination
        // re-encode.
        let mut copied = Entry::draft(&hint.name);
        copied.size = hint.size;
        copied.modified = hint.modified;
        let mut stream = dest.create_entry(copied, None)?;
        let mut decoded = source.open_entry(name)?;
        io::copy(&mut decoded, &mut *stream)?;
        decoded.close()?;
        let done = stream.close()?;
        Ok(done)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_from_locator() {
        assert_eq!(
            ContainerFormat::from_locator("backup.zip"),
            Some(ContainerFormat::Zip)
        );
        assert_eq!(
            ContainerFormat::from_locator("lib/app.JAR"),
            Some(ContainerFormat::Zip)
        );
        assert_eq!(
            ContainerFormat::from_locator("dump.tar"),
            Some(ContainerFormat::Tar)
        );
        assert_eq!(ContainerFormat::from_locator("notes.txt"), None);
        assert_eq!(ContainerFormat::from_locator("no_extension"), None);
    }

    #[test]
    fn test_registry_covers_all_formats() {
        for format in [ContainerFormat::Zip, ContainerFormat::Tar] {
            assert_eq!(registry_for(format).format, format);
        }
    }

    #[test]
    fn test_missing_file_is_not_found() {
        let driver = Driver::default();
        let err = driver
            .open_input(ContainerFormat::Zip, "/no/such/container.zip")
            .err()
            .unwrap();
        assert!(matches!(err, CofferError::NotFound { .. }));
    }
}
