//! Error types for Coffer operations.
//!
//! This module provides the error taxonomy shared by every container
//! implementation, plus [`ErrorChain`], the aggregator that combines the
//! non-fatal failures collected during a batch operation (such as draining
//! a sequential writer's spooled entries) into one reported result.

use std::io;
use thiserror::Error;

/// The main error type for Coffer operations.
#[derive(Debug, Error)]
pub enum CofferError {
    /// I/O error from the underlying storage transport.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Container unparseable or unsupported.
    #[error("container format error: {message}")]
    Format {
        /// Description of what failed to parse.
        message: String,
    },

    /// Archive or entry missing.
    #[error("not found: {name}")]
    NotFound {
        /// Name of the missing archive or entry.
        name: String,
    },

    /// Checked read detected a CRC-32 mismatch at stream close.
    #[error("CRC mismatch in `{name}`: expected {expected:#010x}, computed {actual:#010x}")]
    ChecksumMismatch {
        /// Name of the affected entry. All other entries stay readable.
        name: String,
        /// CRC recorded in the container.
        expected: u32,
        /// CRC computed over the delivered bytes.
        actual: u32,
    },

    /// A second entry stream was opened on a writer whose format does not
    /// support interleaved entries.
    #[error("entry `{name}` is still open; the sequential writer allows one entry stream at a time")]
    Busy {
        /// Name of the entry whose stream is still open.
        name: String,
    },

    /// Multiple failures from one batch operation, fatal cause first.
    #[error(transparent)]
    Chained(#[from] ErrorChain),
}

/// Result type alias for Coffer operations.
pub type Result<T> = std::result::Result<T, CofferError>;

impl CofferError {
    /// Create a format error.
    pub fn format(message: impl Into<String>) -> Self {
        Self::Format {
            message: message.into(),
        }
    }

    /// Create a not-found error.
    pub fn not_found(name: impl Into<String>) -> Self {
        Self::NotFound { name: name.into() }
    }

    /// Create a checksum mismatch error.
    pub fn checksum_mismatch(name: impl Into<String>, expected: u32, actual: u32) -> Self {
        Self::ChecksumMismatch {
            name: name.into(),
            expected,
            actual,
        }
    }

    /// Create a busy error.
    pub fn busy(name: impl Into<String>) -> Self {
        Self::Busy { name: name.into() }
    }
}

/// Chained failures from one batch operation.
///
/// During a drain of spooled entries a failure reading one spool file is
/// recorded and the batch continues; a failure writing to the destination
/// sink is fatal and aborts the batch. The chain preserves every underlying
/// cause and always reports the fatal cause first.
#[derive(Debug, Default)]
pub struct ErrorChain {
    fatal: Option<Box<CofferError>>,
    recorded: Vec<CofferError>,
}

impl ErrorChain {
    /// Create an empty chain.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a non-fatal failure. The batch keeps going.
    pub fn record(&mut self, err: CofferError) {
        self.recorded.push(err);
    }

    /// Record the fatal failure that aborted the batch. Only the first
    /// fatal cause is kept; later ones are demoted to recorded causes.
    pub fn record_fatal(&mut self, err: CofferError) {
        if self.fatal.is_none() {
            self.fatal = Some(Box::new(err));
        } else {
            self.recorded.push(err);
        }
    }

    /// True if nothing was recorded.
    pub fn is_empty(&self) -> bool {
        self.fatal.is_none() && self.recorded.is_empty()
    }

    /// True if a fatal cause was recorded.
    pub fn is_fatal(&self) -> bool {
        self.fatal.is_some()
    }

    /// Number of recorded causes, fatal included.
    pub fn len(&self) -> usize {
        self.recorded.len() + usize::from(self.fatal.is_some())
    }

    /// Iterate over every cause, fatal first.
    pub fn causes(&self) -> impl Iterator<Item = &CofferError> {
        self.fatal
            .as_deref()
            .into_iter()
            .chain(self.recorded.iter())
    }

    /// Convert the chain into a result: `Ok(())` when empty, otherwise the
    /// chain wrapped in [`CofferError::Chained`].
    pub fn into_result(self) -> Result<()> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(CofferError::Chained(self))
        }
    }
}

impl std::fmt::Display for ErrorChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} failure(s) in batch operation", self.len())?;
        for (i, cause) in self.causes().enumerate() {
            write!(f, "; [{i}] {cause}")?;
        }
        Ok(())
    }
}

impl std::error::Error for ErrorChain {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.causes()
            .next()
            .map(|e| e as &(dyn std::error::Error + 'static))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CofferError::checksum_mismatch("b.txt", 0x12345678, 0xDEADBEEF);
        let text = err.to_string();
        assert!(text.contains("b.txt"));
        assert!(text.contains("0x12345678"));
        assert!(text.contains("0xdeadbeef"));

        let err = CofferError::busy("pending.bin");
        assert!(err.to_string().contains("pending.bin"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = io::Error::new(io::ErrorKind::NotFound, "file not found");
        let err: CofferError = io_err.into();
        assert!(matches!(err, CofferError::Io(_)));
    }

    #[test]
    fn test_empty_chain_is_ok() {
        assert!(ErrorChain::new().into_result().is_ok());
    }

    #[test]
    fn test_chain_orders_fatal_first() {
        let mut chain = ErrorChain::new();
        chain.record(CofferError::not_found("spool-1"));
        chain.record(CofferError::not_found("spool-2"));
        chain.record_fatal(CofferError::format("sink went away"));

        assert!(chain.is_fatal());
        assert_eq!(chain.len(), 3);

        let first = chain.causes().next().unwrap();
        assert!(matches!(first, CofferError::Format { .. }));

        let names: Vec<String> = chain.causes().skip(1).map(|e| e.to_string()).collect();
        assert!(names[0].contains("spool-1"));
        assert!(names[1].contains("spool-2"));
    }

    #[test]
    fn test_chain_keeps_first_fatal() {
        let mut chain = ErrorChain::new();
        chain.record_fatal(CofferError::format("first"));
        chain.record_fatal(CofferError::format("second"));

        let first = chain.causes().next().unwrap();
        assert!(first.to_string().contains("first"));
        assert_eq!(chain.len(), 2);
    }

    #[test]
    fn test_chain_into_error() {
        let mut chain = ErrorChain::new();
        chain.record(CofferError::not_found("x"));
        let err = chain.into_result().unwrap_err();
        assert!(matches!(err, CofferError::Chained(_)));
        assert!(err.to_string().contains("1 failure(s)"));
    }
}
