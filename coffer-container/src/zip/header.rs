//! Record layouts of the random-access container.
//!
//! Byte-exact structures from the format's published specification: the
//! local file header, the central directory header and the end-of-central-
//! directory record, plus DOS date/time conversion.

use std::io::{Read, Write};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use coffer_core::error::{CofferError, Result};

/// Local file header signature.
pub const LOCAL_FILE_HEADER_SIG: u32 = 0x04034B50;

/// Central directory header signature.
pub const CENTRAL_DIR_HEADER_SIG: u32 = 0x02014B50;

/// End of central directory signature.
pub const END_OF_CENTRAL_DIR_SIG: u32 = 0x06054B50;

/// General purpose flag bit 11: entry name is UTF-8.
pub const FLAG_UTF8_NAME: u16 = 0x0800;

/// Fixed length of the end-of-central-directory record.
pub const EOCD_LEN: u64 = 22;

/// Fixed length of a local file header.
pub const LOCAL_HEADER_LEN: u64 = 30;

/// Maximum container comment length, which bounds the backward scan for
/// the closing record.
pub const MAX_COMMENT_LEN: u64 = 65535;

/// Version made by: Unix, 3.0. Matches what mainstream tooling emits.
pub const VERSION_MADE_BY: u16 = 0x031E;

/// The variable-length fields carry 16-bit lengths; anything longer would
/// silently truncate and corrupt the record.
fn check_field_len(what: &str, len: usize) -> Result<()> {
    if len > usize::from(u16::MAX) {
        return Err(CofferError::format(format!(
            "{what} of {len} bytes exceeds the 16-bit field limit"
        )));
    }
    Ok(())
}

fn read_u16(buf: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([buf[at], buf[at + 1]])
}

fn read_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

/// Local file header, write side. The read path takes entry metadata from
/// the central directory and only peeks at the local header's
/// variable-length field sizes.
#[derive(Debug, Clone)]
pub struct LocalHeader {
    /// General purpose bit flag.
    pub flags: u16,
    /// On-disk compression method identifier.
    pub method: u16,
    /// DOS modification time.
    pub mtime: u16,
    /// DOS modification date.
    pub mdate: u16,
    /// CRC-32 of the uncompressed data.
    pub crc32: u32,
    /// Compressed size.
    pub compressed_size: u32,
    /// Uncompressed size.
    pub uncompressed_size: u32,
    /// Raw entry name bytes.
    pub name_raw: Vec<u8>,
}

impl LocalHeader {
    /// Minimum version needed to extract for this method.
    pub fn version_needed(&self) -> u16 {
        if self.method == 8 {
            20
        } else {
            10
        }
    }

    /// Serialized length in bytes.
    pub fn written_len(&self) -> u64 {
        LOCAL_HEADER_LEN + self.name_raw.len() as u64
    }

    /// Write the header.
    pub fn write<W: Write>(&self, writer: &mut W) -> Result<()> {
        check_field_len("entry name", self.name_raw.len())?;
        writer.write_all(&LOCAL_FILE_HEADER_SIG.to_le_bytes())?;
        writer.write_all(&self.version_needed().to_le_bytes())?;
        writer.write_all(&self.flags.to_le_bytes())?;
        writer.write_all(&self.method.to_le_bytes())?;
        writer.write_all(&self.mtime.to_le_bytes())?;
        writer.write_all(&self.mdate.to_le_bytes())?;
        writer.write_all(&self.crc32.to_le_bytes())?;
        writer.write_all(&self.compressed_size.to_le_bytes())?;
        writer.write_all(&self.uncompressed_size.to_le_bytes())?;
        writer.write_all(&(self.name_raw.len() as u16).to_le_bytes())?;
        writer.write_all(&0u16.to_le_bytes())?; // extra field length
        writer.write_all(&self.name_raw)?;
        Ok(())
    }
}

/// One central directory header, both read and write side.
#[derive(Debug, Clone)]
pub struct CentralRecord {
    /// General purpose bit flag.
    pub flags: u16,
    /// On-disk compression method identifier.
    pub method: u16,
    /// DOS modification time.
    pub mtime: u16,
    /// DOS modification date.
    pub mdate: u16,
    /// CRC-32 of the uncompressed data.
    pub crc32: u32,
    /// Compressed size.
    pub compressed_size: u32,
    /// Uncompressed size.
    pub uncompressed_size: u32,
    /// Raw entry name bytes.
    pub name_raw: Vec<u8>,
    /// Extra field, carried opaque.
    pub extra: Vec<u8>,
    /// Entry comment, carried opaque.
    pub comment: Vec<u8>,
    /// External file attributes.
    pub external_attr: u32,
    /// Offset of the entry's local header, relative to the offsets the
    /// container itself uses (a preamble shifts them uniformly).
    pub local_header_offset: u32,
}

impl CentralRecord {
    /// Read one record, including its signature.
    pub fn read<R: Read>(reader: &mut R) -> Result<Self> {
        let mut buf = [0u8; 46];
        reader.read_exact(&mut buf)?;

        let signature = read_u32(&buf, 0);
        if signature != CENTRAL_DIR_HEADER_SIG {
            return Err(CofferError::format(format!(
                "bad central directory signature {signature:#010x}"
            )));
        }

        let flags = read_u16(&buf, 8);
        let method = read_u16(&buf, 10);
        let mtime = read_u16(&buf, 12);
        let mdate = read_u16(&buf, 14);
        let crc32 = read_u32(&buf, 16);
        let compressed_size = read_u32(&buf, 20);
        let uncompressed_size = read_u32(&buf, 24);
        let name_len = read_u16(&buf, 28) as usize;
        let extra_len = read_u16(&buf, 30) as usize;
        let comment_len = read_u16(&buf, 32) as usize;
        let external_attr = read_u32(&buf, 38);
        let local_header_offset = read_u32(&buf, 42);

        let mut name_raw = vec![0u8; name_len];
        reader.read_exact(&mut name_raw)?;
        let mut extra = vec![0u8; extra_len];
        reader.read_exact(&mut extra)?;
        let mut comment = vec![0u8; comment_len];
        reader.read_exact(&mut comment)?;

        Ok(Self {
            flags,
            method,
            mtime,
            mdate,
            crc32,
            compressed_size,
            uncompressed_size,
            name_raw,
            extra,
            comment,
            external_attr,
            local_header_offset,
        })
    }

    /// Minimum version needed to extract for this method.
    pub fn version_needed(&self) -> u16 {
        if self.method == 8 {
            20
        } else {
            10
        }
    }

    /// Serialized length in bytes.
    pub fn written_len(&self) -> u64 {
        46 + (self.name_raw.len() + self.extra.len() + self.comment.len()) as u64
    }

    /// Write the record.
    pub fn write<W: Write>(&self, writer: &mut W) -> Result<()> {
        check_field_len("entry name", self.name_raw.len())?;
        check_field_len("extra field", self.extra.len())?;
        check_field_len("entry comment", self.comment.len())?;
        writer.write_all(&CENTRAL_DIR_HEADER_SIG.to_le_bytes())?;
        writer.write_all(&VERSION_MADE_BY.to_le_bytes())?;
        writer.write_all(&self.version_needed().to_le_bytes())?;
        writer.write_all(&self.flags.to_le_bytes())?;
        writer.write_all(&self.method.to_le_bytes())?;
        writer.write_all(&self.mtime.to_le_bytes())?;
        writer.write_all(&self.mdate.to_le_bytes())?;
        writer.write_all(&self.crc32.to_le_bytes())?;
        writer.write_all(&self.compressed_size.to_le_bytes())?;
        writer.write_all(&self.uncompressed_size.to_le_bytes())?;
        writer.write_all(&(self.name_raw.len() as u16).to_le_bytes())?;
        writer.write_all(&(self.extra.len() as u16).to_le_bytes())?;
        writer.write_all(&(self.comment.len() as u16).to_le_bytes())?;
        writer.write_all(&0u16.to_le_bytes())?; // disk number start
        writer.write_all(&0u16.to_le_bytes())?; // internal attributes
        writer.write_all(&self.external_attr.to_le_bytes())?;
        writer.write_all(&self.local_header_offset.to_le_bytes())?;
        writer.write_all(&self.name_raw)?;
        writer.write_all(&self.extra)?;
        writer.write_all(&self.comment)?;
        Ok(())
    }
}

/// Parsed end-of-central-directory record.
#[derive(Debug, Clone)]
pub struct EndOfCentralDir {
    /// Total number of entries.
    pub entry_count: u16,
    /// Size of the central directory in bytes.
    pub cd_size: u32,
    /// Offset of the central directory, in the container's own offsets.
    pub cd_offset: u32,
    /// Container comment.
    pub comment: Vec<u8>,
}

impl EndOfCentralDir {
    /// Locate the closing record inside the container's tail bytes.
    /// Returns the position of the last signature occurrence, which is the
    /// one a comment or postamble cannot fake.
    pub fn locate(tail: &[u8]) -> Option<usize> {
        let sig = END_OF_CENTRAL_DIR_SIG.to_le_bytes();
        tail.windows(4).rposition(|w| w == sig)
    }

    /// Parse the record from a buffer starting at its signature.
    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < EOCD_LEN as usize {
            return Err(CofferError::format("end of central directory too short"));
        }
        let entry_count = read_u16(buf, 10);
        let cd_size = read_u32(buf, 12);
        let cd_offset = read_u32(buf, 16);
        let comment_len = read_u16(buf, 20) as usize;

        let comment_start = EOCD_LEN as usize;
        if buf.len() < comment_start + comment_len {
            return Err(CofferError::format("container comment truncated"));
        }
        let comment = buf[comment_start..comment_start + comment_len].to_vec();

        Ok(Self {
            entry_count,
            cd_size,
            cd_offset,
            comment,
        })
    }

    /// Serialized length in bytes.
    pub fn written_len(&self) -> u64 {
        EOCD_LEN + self.comment.len() as u64
    }

    /// Write the record.
    pub fn write<W: Write>(&self, writer: &mut W) -> Result<()> {
        check_field_len("container comment", self.comment.len())?;
        writer.write_all(&END_OF_CENTRAL_DIR_SIG.to_le_bytes())?;
        writer.write_all(&0u16.to_le_bytes())?; // disk number
        writer.write_all(&0u16.to_le_bytes())?; // disk with central directory
        writer.write_all(&self.entry_count.to_le_bytes())?;
        writer.write_all(&self.entry_count.to_le_bytes())?;
        writer.write_all(&self.cd_size.to_le_bytes())?;
        writer.write_all(&self.cd_offset.to_le_bytes())?;
        writer.write_all(&(self.comment.len() as u16).to_le_bytes())?;
        writer.write_all(&self.comment)?;
        Ok(())
    }
}

// Civil-date conversion (Gregorian, proleptic) for DOS timestamps.

fn days_from_civil(year: i64, month: u32, day: u32) -> i64 {
    let y = if month <= 2 { year - 1 } else { year };
    let era = y.div_euclid(400);
    let yoe = (y - era * 400) as u64;
    let mp = if month > 2 { month - 3 } else { month + 9 } as u64;
    let doy = (153 * mp + 2) / 5 + day as u64 - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    era * 146097 + doe as i64 - 719468
}

fn civil_from_days(z: i64) -> (i64, u32, u32) {
    let z = z + 719468;
    let era = z.div_euclid(146097);
    let doe = (z - era * 146097) as u64;
    let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let month = if mp < 10 { mp + 3 } else { mp - 9 } as u32;
    let year = era * 400 + yoe as i64 + i64::from(month <= 2);
    (year, month, day)
}

/// Convert a system time to the DOS `(time, date)` pair. Times before the
/// DOS epoch (1980) clamp to it; seconds round down to the 2-second grid.
pub fn system_to_dos(time: SystemTime) -> (u16, u16) {
    let secs = time
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs() as i64;

    let days = secs.div_euclid(86400);
    let tod = secs.rem_euclid(86400) as u32;
    let (year, month, day) = civil_from_days(days);

    if year < 1980 {
        return (0, 0x21); // 1980-01-01 00:00:00
    }

    let hours = (tod / 3600) as u16;
    let minutes = ((tod % 3600) / 60) as u16;
    let two_secs = ((tod % 60) / 2) as u16;
    let dos_time = (hours << 11) | (minutes << 5) | two_secs;
    let dos_date = (((year - 1980) as u16) << 9) | ((month as u16) << 5) | day as u16;
    (dos_time, dos_date)
}

/// Convert a DOS `(time, date)` pair back to a system time.
pub fn dos_to_system(dos_time: u16, dos_date: u16) -> SystemTime {
    let seconds = u64::from(dos_time & 0x1F) * 2;
    let minutes = u64::from((dos_time >> 5) & 0x3F);
    let hours = u64::from((dos_time >> 11) & 0x1F);
    let day = (dos_date & 0x1F).max(1) as u32;
    let month = (((dos_date >> 5) & 0x0F).max(1) as u32).min(12);
    let year = i64::from((dos_date >> 9) & 0x7F) + 1980;

    let days = days_from_civil(year, month, day);
    UNIX_EPOCH + Duration::from_secs(days as u64 * 86400 + hours * 3600 + minutes * 60 + seconds)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dos_time_roundtrip() {
        // 2021-06-15 12:34:56 UTC
        let time = UNIX_EPOCH + Duration::from_secs(1_623_760_496);
        let (dt, dd) = system_to_dos(time);
        let back = dos_to_system(dt, dd);
        let delta = time.duration_since(back).unwrap_or(Duration::ZERO);
        // DOS stores seconds on a 2-second grid.
        assert!(delta <= Duration::from_secs(2), "delta {delta:?}");
    }

    #[test]
    fn test_pre_dos_epoch_clamps() {
        let (dt, dd) = system_to_dos(UNIX_EPOCH);
        assert_eq!((dt, dd), (0, 0x21));
        let back = dos_to_system(dt, dd);
        // 1980-01-01
        assert_eq!(
            back.duration_since(UNIX_EPOCH).unwrap().as_secs() % 86400,
            0
        );
    }

    #[test]
    fn test_eocd_roundtrip() {
        let eocd = EndOfCentralDir {
            entry_count: 3,
            cd_size: 150,
            cd_offset: 1024,
            comment: b"rewritten archive".to_vec(),
        };
        let mut buf = Vec::new();
        eocd.write(&mut buf).unwrap();
        assert_eq!(buf.len() as u64, eocd.written_len());

        let pos = EndOfCentralDir::locate(&buf).unwrap();
        assert_eq!(pos, 0);
        let parsed = EndOfCentralDir::parse(&buf).unwrap();
        assert_eq!(parsed.entry_count, 3);
        assert_eq!(parsed.cd_size, 150);
        assert_eq!(parsed.cd_offset, 1024);
        assert_eq!(parsed.comment, b"rewritten archive");
    }

    #[test]
    fn test_central_record_roundtrip() {
        let record = CentralRecord {
            flags: FLAG_UTF8_NAME,
            method: 8,
            mtime: 0x6123,
            mdate: 0x5234,
            crc32: 0xCAFEBABE,
            compressed_size: 99,
            uncompressed_size: 240,
            name_raw: b"dir/na\xC3\xAFve.txt".to_vec(),
            extra: vec![1, 2, 3, 4],
            comment: b"entry comment".to_vec(),
            external_attr: 0o100644 << 16,
            local_header_offset: 4096,
        };
        let mut buf = Vec::new();
        record.write(&mut buf).unwrap();
        assert_eq!(buf.len() as u64, record.written_len());

        let parsed = CentralRecord::read(&mut buf.as_slice()).unwrap();
        assert_eq!(parsed.method, 8);
        assert_eq!(parsed.crc32, 0xCAFEBABE);
        assert_eq!(parsed.name_raw, record.name_raw);
        assert_eq!(parsed.extra, record.extra);
        assert_eq!(parsed.comment, record.comment);
        assert_eq!(parsed.local_header_offset, 4096);
        assert_eq!(parsed.version_needed(), 20);
    }

    #[test]
    fn test_overlong_variable_fields_refused() {
        let local = LocalHeader {
            flags: 0,
            method: 0,
            mtime: 0,
            mdate: 0,
            crc32: 0,
            compressed_size: 0,
            uncompressed_size: 0,
            name_raw: vec![b'n'; 70_008],
        };
        let mut buf = Vec::new();
        assert!(local.write(&mut buf).is_err());
        // Nothing was written before the refusal.
        assert!(buf.is_empty());

        let eocd = EndOfCentralDir {
            entry_count: 0,
            cd_size: 0,
            cd_offset: 0,
            comment: vec![b'c'; 70_000],
        };
        assert!(eocd.write(&mut Vec::new()).is_err());
    }

    #[test]
    fn test_locate_finds_last_signature() {
        // A comment that happens to contain the signature bytes must not
        // shadow the real record.
        let mut buf = Vec::new();
        buf.extend_from_slice(&END_OF_CENTRAL_DIR_SIG.to_le_bytes());
        buf.extend_from_slice(&[0u8; 30]);
        let real = EndOfCentralDir {
            entry_count: 0,
            cd_size: 0,
            cd_offset: 0,
            comment: Vec::new(),
        };
        let pos = buf.len();
        real.write(&mut buf).unwrap();
        assert_eq!(EndOfCentralDir::locate(&buf), Some(pos));
    }
}
