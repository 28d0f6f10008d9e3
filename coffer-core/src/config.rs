//! Driver configuration.
//!
//! The surrounding application persists these settings; the engine only
//! consumes them. They decide checked-vs-unchecked reading, whether a
//! random-access container may carry extra bytes around its index
//! (self-extractor preambles and postambles), and how non-UTF-8 entry
//! names are decoded.

use encoding_rs::Encoding;

/// Configuration consumed by the container driver.
#[derive(Debug, Clone, Copy)]
pub struct DriverConfig {
    /// Wrap decoded entry streams in CRC verification.
    pub checked: bool,
    /// Tolerate bytes before the first entry of a random-access container.
    pub allow_preamble: bool,
    /// Tolerate bytes after the index of a random-access container.
    pub allow_postamble: bool,
    /// Encoding used for entry names that are not flagged as UTF-8.
    pub encoding: &'static Encoding,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            checked: true,
            allow_preamble: false,
            allow_postamble: false,
            encoding: encoding_rs::UTF_8,
        }
    }
}

impl DriverConfig {
    /// Decode a raw entry name. `utf8_flagged` is set when the container
    /// marks the name as UTF-8 (general purpose bit 11 in the
    /// random-access format); otherwise the configured encoding applies.
    pub fn decode_name(&self, raw: &[u8], utf8_flagged: bool) -> String {
        if utf8_flagged || self.encoding == encoding_rs::UTF_8 {
            String::from_utf8_lossy(raw).into_owned()
        } else {
            let (decoded, _, _) = self.encoding.decode(raw);
            decoded.into_owned()
        }
    }

    /// Builder method to toggle checked reading.
    pub fn with_checked(mut self, checked: bool) -> Self {
        self.checked = checked;
        self
    }

    /// Builder method to tolerate preamble bytes.
    pub fn with_preamble(mut self, allow: bool) -> Self {
        self.allow_preamble = allow;
        self
    }

    /// Builder method to tolerate postamble bytes.
    pub fn with_postamble(mut self, allow: bool) -> Self {
        self.allow_postamble = allow;
        self
    }

    /// Builder method to set the fallback name encoding.
    pub fn with_encoding(mut self, encoding: &'static Encoding) -> Self {
        self.encoding = encoding;
        self
    }
}
