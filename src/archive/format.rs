//! ZIP wire format: header layouts and DOS timestamp conversion.
//!
//! Only the records the container needs are implemented: local file
//! headers, central directory entries, and the end-of-central-directory
//! record. ZIP64 extensions are not supported; the container rejects
//! archives that would exceed the 32-bit field limits.

use super::member::{ArchiveMember, CompressionMethod};
use chrono::{DateTime, Datelike, NaiveDate, TimeZone, Timelike, Utc};

pub(crate) const LOCAL_HEADER_SIG: u32 = 0x0403_4b50;
pub(crate) const CENTRAL_HEADER_SIG: u32 = 0x0201_4b50;
pub(crate) const EOCD_SIG: u32 = 0x0605_4b50;

pub(crate) const LOCAL_HEADER_LEN: usize = 30;
pub(crate) const CENTRAL_HEADER_LEN: usize = 46;
pub(crate) const EOCD_LEN: usize = 22;

/// General-purpose flag bit 11: the member name is UTF-8.
pub(crate) const FLAG_UTF8: u16 = 0x0800;

/// ZIP version 2.0 (DEFLATE support).
const VERSION_NEEDED: u16 = 20;

/// "Made by Unix" with version 2.0 semantics.
const VERSION_MADE_BY: u16 = (3 << 8) | 20;

/// Unix regular-file marker for the external-attributes field.
const UNIX_REGULAR_FILE: u32 = 0o100_000;

/// Parsed end-of-central-directory record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct EndOfCentralDirectory {
    pub(crate) entries: u16,
    pub(crate) directory_size: u32,
    pub(crate) directory_offset: u32,
}

fn put_u16(buf: &mut Vec<u8>, value: u16) {
    buf.extend_from_slice(&value.to_le_bytes());
}

fn put_u32(buf: &mut Vec<u8>, value: u32) {
    buf.extend_from_slice(&value.to_le_bytes());
}

pub(crate) fn read_u16(buf: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([buf[at], buf[at + 1]])
}

pub(crate) fn read_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

/// Encode a timestamp as DOS (time, date) words, clamped to the
/// representable 1980..=2107 range.
pub(crate) fn to_dos_datetime(when: DateTime<Utc>) -> (u16, u16) {
    let year = when.year().clamp(1980, 2107);
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let date = (((year - 1980) as u16) << 9) | ((when.month() as u16) << 5) | when.day() as u16;
    #[allow(clippy::cast_possible_truncation)]
    let time = ((when.hour() as u16) << 11)
        | ((when.minute() as u16) << 5)
        | (when.second() as u16 / 2);
    (time, date)
}

/// Decode DOS (time, date) words; malformed fields fall back to the DOS
/// epoch (1980-01-01).
pub(crate) fn from_dos_datetime(time: u16, date: u16) -> DateTime<Utc> {
    let year = i32::from(date >> 9) + 1980;
    let month = u32::from((date >> 5) & 0x0f);
    let day = u32::from(date & 0x1f);
    let hour = u32::from(time >> 11);
    let minute = u32::from((time >> 5) & 0x3f);
    let second = u32::from(time & 0x1f) * 2;
    NaiveDate::from_ymd_opt(year, month, day)
        .and_then(|d| d.and_hms_opt(hour, minute, second))
        .map_or_else(
            || Utc.with_ymd_and_hms(1980, 1, 1, 0, 0, 0).single().unwrap_or_default(),
            |naive| Utc.from_utc_datetime(&naive),
        )
}

/// External-attributes word: POSIX mode plus the Unix regular-file marker
/// in the high 16 bits.
pub(crate) fn external_attributes(mode: u32) -> u32 {
    (UNIX_REGULAR_FILE | (mode & 0xffff)) << 16
}

/// Recover the POSIX permission bits from an external-attributes word.
pub(crate) fn mode_from_attributes(attributes: u32) -> u32 {
    (attributes >> 16) & 0o7777
}

/// Serialize a member's local file header (name included, no extra field).
pub(crate) fn local_header(member: &ArchiveMember) -> Vec<u8> {
    let (time, date) = to_dos_datetime(member.modified);
    let mut buf = Vec::with_capacity(LOCAL_HEADER_LEN + member.name.len());
    put_u32(&mut buf, LOCAL_HEADER_SIG);
    put_u16(&mut buf, VERSION_NEEDED);
    put_u16(&mut buf, FLAG_UTF8);
    put_u16(&mut buf, member.method.code());
    put_u16(&mut buf, time);
    put_u16(&mut buf, date);
    put_u32(&mut buf, member.crc32);
    #[allow(clippy::cast_possible_truncation)]
    {
        put_u32(&mut buf, member.compressed_size as u32);
        put_u32(&mut buf, member.uncompressed_size as u32);
    }
    #[allow(clippy::cast_possible_truncation)]
    put_u16(&mut buf, member.name.len() as u16);
    put_u16(&mut buf, 0); // extra field length
    buf.extend_from_slice(member.name.as_bytes());
    buf
}

/// Serialize a member's central directory entry.
pub(crate) fn central_header(member: &ArchiveMember) -> Vec<u8> {
    let (time, date) = to_dos_datetime(member.modified);
    let mut buf = Vec::with_capacity(CENTRAL_HEADER_LEN + member.name.len());
    put_u32(&mut buf, CENTRAL_HEADER_SIG);
    put_u16(&mut buf, VERSION_MADE_BY);
    put_u16(&mut buf, VERSION_NEEDED);
    put_u16(&mut buf, FLAG_UTF8);
    put_u16(&mut buf, member.method.code());
    put_u16(&mut buf, time);
    put_u16(&mut buf, date);
    put_u32(&mut buf, member.crc32);
    #[allow(clippy::cast_possible_truncation)]
    {
        put_u32(&mut buf, member.compressed_size as u32);
        put_u32(&mut buf, member.uncompressed_size as u32);
    }
    #[allow(clippy::cast_possible_truncation)]
    put_u16(&mut buf, member.name.len() as u16);
    put_u16(&mut buf, 0); // extra field length
    put_u16(&mut buf, 0); // comment length
    put_u16(&mut buf, 0); // disk number start
    put_u16(&mut buf, 0); // internal attributes
    put_u32(&mut buf, external_attributes(member.mode));
    #[allow(clippy::cast_possible_truncation)]
    put_u32(&mut buf, member.header_offset as u32);
    buf.extend_from_slice(member.name.as_bytes());
    buf
}

/// Serialize the end-of-central-directory record.
pub(crate) fn end_of_central_directory(record: EndOfCentralDirectory) -> Vec<u8> {
    let mut buf = Vec::with_capacity(EOCD_LEN);
    put_u32(&mut buf, EOCD_SIG);
    put_u16(&mut buf, 0); // this disk
    put_u16(&mut buf, 0); // directory start disk
    put_u16(&mut buf, record.entries);
    put_u16(&mut buf, record.entries);
    put_u32(&mut buf, record.directory_size);
    put_u32(&mut buf, record.directory_offset);
    put_u16(&mut buf, 0); // comment length
    buf
}

/// One entry parsed out of the central directory.
pub(crate) struct ParsedEntry {
    pub(crate) member: ArchiveMember,
    /// Bytes the entry occupied, including name, extra, and comment fields.
    pub(crate) consumed: usize,
}

/// Parse the central directory entry starting at `at`.
///
/// The member's `entry_size` is left at zero; the container computes the
/// physical span from the offsets of its neighbours.
pub(crate) fn parse_central_entry(buf: &[u8], at: usize) -> Result<ParsedEntry, String> {
    if buf.len() < at + CENTRAL_HEADER_LEN {
        return Err("truncated central directory".to_owned());
    }
    if read_u32(buf, at) != CENTRAL_HEADER_SIG {
        return Err("bad central directory signature".to_owned());
    }
    let method_code = read_u16(buf, at + 10);
    let method = CompressionMethod::from_code(method_code)
        .ok_or_else(|| format!("unsupported compression method {method_code}"))?;
    let time = read_u16(buf, at + 12);
    let date = read_u16(buf, at + 14);
    let name_len = usize::from(read_u16(buf, at + 28));
    let extra_len = usize::from(read_u16(buf, at + 30));
    let comment_len = usize::from(read_u16(buf, at + 32));
    let name_start = at + CENTRAL_HEADER_LEN;
    if buf.len() < name_start + name_len {
        return Err("truncated central directory entry name".to_owned());
    }
    let name = std::str::from_utf8(&buf[name_start..name_start + name_len])
        .map_err(|_| "member name is not valid UTF-8".to_owned())?
        .to_owned();
    let member = ArchiveMember {
        name,
        mode: mode_from_attributes(read_u32(buf, at + 38)),
        method,
        modified: from_dos_datetime(time, date),
        crc32: read_u32(buf, at + 16),
        compressed_size: u64::from(read_u32(buf, at + 20)),
        uncompressed_size: u64::from(read_u32(buf, at + 24)),
        header_offset: u64::from(read_u32(buf, at + 42)),
        entry_size: 0,
    };
    Ok(ParsedEntry {
        member,
        consumed: CENTRAL_HEADER_LEN + name_len + extra_len + comment_len,
    })
}

/// Locate and parse the end-of-central-directory record in `tail`, the
/// final bytes of the storage. Returns `None` when no record is present.
pub(crate) fn find_end_of_central_directory(tail: &[u8]) -> Option<EndOfCentralDirectory> {
    if tail.len() < EOCD_LEN {
        return None;
    }
    let mut at = tail.len() - EOCD_LEN;
    loop {
        if read_u32(tail, at) == EOCD_SIG {
            return Some(EndOfCentralDirectory {
                entries: read_u16(tail, at + 10),
                directory_size: read_u32(tail, at + 12),
                directory_offset: read_u32(tail, at + 16),
            });
        }
        if at == 0 {
            return None;
        }
        at -= 1;
    }
}
