//! # Coffer Container
//!
//! Container format support for Coffer.
//!
//! This crate reads and writes two structurally different compressed
//! containers through one uniform entry/stream contract:
//!
//! - **ZIP-style** ([`zip`]): random access, index at the end, optional
//!   preamble/postamble regions and a container-level comment
//! - **TAR-style** ([`tar`]): sequential, one 512-byte header per record,
//!   entries materialized to temporary storage on open
//!
//! The [`driver`] module selects and composes the two per format tag and
//! decides checked-vs-unchecked reading.
//!
//! ## Example
//!
//! ```rust,no_run
//! use coffer_container::driver::{ContainerFormat, Driver};
//! use coffer_core::DriverConfig;
//!
//! let driver = Driver::new(DriverConfig::default());
//! let mut input = driver.open_input(ContainerFormat::Zip, "backup.zip").unwrap();
//! for entry in input.entries() {
//!     println!("{entry}");
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

pub mod archive;
pub mod driver;
pub mod tar;
pub mod zip;

// Re-exports
pub use archive::{EntryStream, EntryWrite, InputArchive, OutputArchive, SourceImage};
pub use driver::{ContainerFormat, Driver};
pub use tar::{TarReader, TarWriter};
pub use zip::{ZipReader, ZipWriter};
