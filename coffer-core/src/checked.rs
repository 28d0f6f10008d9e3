//! CRC-verifying read streams.
//!
//! A checked stream recomputes CRC-32 over every byte it delivers and
//! compares against the value recorded in the container when the stream is
//! closed. Verification happens at close, never at open, so bytes already
//! delivered to the caller stay valid and usable even when the entry turns
//! out to be corrupt.
//!
//! The stream is an explicit state machine. Closing before the stream was
//! read to EOF cannot verify anything meaningful, so it marks verification
//! as skipped instead of silently succeeding.

use std::io::{self, Read};

use crate::error::{CofferError, Result};

/// Verification lifecycle of a checked stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyOutcome {
    /// Bytes are still being delivered.
    Open,
    /// EOF reached; the computed CRC covers the whole entry.
    Exhausted,
    /// Closed after EOF and the CRC matched.
    Verified,
    /// Closed after EOF and the CRC differed.
    Mismatched,
    /// Closed before EOF, or the container records no CRC for this entry;
    /// verification did not run.
    Skipped,
}

/// Read stream that recomputes CRC-32 over delivered bytes and validates
/// it against the stored value at [`close`](CheckedReader::close).
pub struct CheckedReader<R: Read> {
    inner: R,
    entry_name: String,
    expected: Option<u32>,
    hasher: crc32fast::Hasher,
    state: VerifyOutcome,
}

impl<R: Read> CheckedReader<R> {
    /// Wrap a decoded entry stream. `expected` is the CRC recorded in the
    /// container; `None` turns verification off (unchecked mode, or a
    /// format that records no per-entry CRC).
    pub fn new(inner: R, entry_name: impl Into<String>, expected: Option<u32>) -> Self {
        Self {
            inner,
            entry_name: entry_name.into(),
            expected,
            hasher: crc32fast::Hasher::new(),
            state: VerifyOutcome::Open,
        }
    }

    /// Current verification state.
    pub fn state(&self) -> VerifyOutcome {
        self.state
    }

    /// Close the stream and verify.
    ///
    /// Returns the final outcome, or [`CofferError::ChecksumMismatch`] when
    /// the stream was exhausted and the computed CRC differs from the
    /// stored one. Idempotent: closing an already-closed stream returns the
    /// recorded outcome without re-raising a mismatch.
    pub fn close(&mut self) -> Result<VerifyOutcome> {
        self.state = match self.state {
            VerifyOutcome::Open => VerifyOutcome::Skipped,
            VerifyOutcome::Exhausted => match self.expected {
                None => VerifyOutcome::Skipped,
                Some(expected) => {
                    let actual = self.hasher.clone().finalize();
                    if actual == expected {
                        VerifyOutcome::Verified
                    } else {
                        self.state = VerifyOutcome::Mismatched;
                        return Err(CofferError::checksum_mismatch(
                            self.entry_name.clone(),
                            expected,
                            actual,
                        ));
                    }
                }
            },
            closed => closed,
        };
        Ok(self.state)
    }
}

impl<R: Read> Read for CheckedReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        if n == 0 {
            if !buf.is_empty() && self.state == VerifyOutcome::Open {
                self.state = VerifyOutcome::Exhausted;
            }
        } else {
            self.hasher.update(&buf[..n]);
        }
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn crc(data: &[u8]) -> u32 {
        let mut h = crc32fast::Hasher::new();
        h.update(data);
        h.finalize()
    }

    #[test]
    fn test_verified_after_eof() {
        let data = b"hello checked world";
        let mut reader = CheckedReader::new(Cursor::new(data), "a.txt", Some(crc(data)));

        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert_eq!(out, data);
        assert_eq!(reader.state(), VerifyOutcome::Exhausted);
        assert_eq!(reader.close().unwrap(), VerifyOutcome::Verified);
        // Second close is a no-op.
        assert_eq!(reader.close().unwrap(), VerifyOutcome::Verified);
    }

    #[test]
    fn test_mismatch_detected_at_close() {
        let data = b"payload";
        let mut reader = CheckedReader::new(Cursor::new(data), "b.txt", Some(crc(data) ^ 1));

        let mut out = Vec::new();
        // Delivered bytes stay usable even though the CRC will not match.
        reader.read_to_end(&mut out).unwrap();
        assert_eq!(out, data);

        match reader.close() {
            Err(CofferError::ChecksumMismatch { name, expected, actual }) => {
                assert_eq!(name, "b.txt");
                assert_eq!(expected, crc(data) ^ 1);
                assert_eq!(actual, crc(data));
            }
            other => panic!("expected mismatch, got {other:?}"),
        }
        assert_eq!(reader.state(), VerifyOutcome::Mismatched);
        // Idempotent close after a mismatch does not re-raise.
        assert_eq!(reader.close().unwrap(), VerifyOutcome::Mismatched);
    }

    #[test]
    fn test_early_close_is_skipped() {
        let data = b"a longer payload than we will read";
        let mut reader = CheckedReader::new(Cursor::new(data), "c.txt", Some(crc(data)));

        let mut buf = [0u8; 4];
        reader.read_exact(&mut buf).unwrap();
        assert_eq!(reader.close().unwrap(), VerifyOutcome::Skipped);
    }

    #[test]
    fn test_no_stored_crc_skips() {
        let data = b"tar entries carry no crc";
        let mut reader = CheckedReader::new(Cursor::new(data), "d.txt", None);
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert_eq!(reader.close().unwrap(), VerifyOutcome::Skipped);
    }

    #[test]
    fn test_empty_entry_verifies() {
        let mut reader = CheckedReader::new(Cursor::new(b"" as &[u8]), "e", Some(0));
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert!(out.is_empty());
        assert_eq!(reader.close().unwrap(), VerifyOutcome::Verified);
    }
}
