//! # Coffer Core
//!
//! Core components for the Coffer archive container engine.
//!
//! This crate provides the format-agnostic building blocks shared by every
//! container implementation:
//!
//! - [`entry`]: the archive entry value type and path normalization
//! - [`error`]: error taxonomy and the chained batch-failure aggregator
//! - [`checked`]: CRC-verifying read streams
//! - [`config`]: driver configuration (checked mode, preamble/postamble
//!   tolerance, entry-name encoding)
//!
//! ## Architecture
//!
//! Coffer is layered:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │ Driver                                               │
//! │     format dispatch, checked-vs-unchecked reading    │
//! ├──────────────────────────────────────────────────────┤
//! │ Containers                                           │
//! │     random-access (zip-style), sequential (tar-style)│
//! ├──────────────────────────────────────────────────────┤
//! │ Core (this crate)                                    │
//! │     Entry, errors, checked streams, configuration    │
//! └──────────────────────────────────────────────────────┘
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

pub mod checked;
pub mod config;
pub mod entry;
pub mod error;

// Re-exports for convenience
pub use checked::{CheckedReader, VerifyOutcome};
pub use config::DriverConfig;
pub use entry::{normalize_name, CompressionMethod, Entry, EntryKind};
pub use error::{CofferError, ErrorChain, Result};

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::checked::{CheckedReader, VerifyOutcome};
    pub use crate::config::DriverConfig;
    pub use crate::entry::{normalize_name, CompressionMethod, Entry, EntryKind};
    pub use crate::error::{CofferError, ErrorChain, Result};
}
