//! Per-member metadata for archive containers.

use chrono::{DateTime, Utc};

/// How a member's payload is stored on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompressionMethod {
    /// Payload bytes stored verbatim.
    Stored,
    /// DEFLATE-compressed payload.
    Deflated,
}

impl CompressionMethod {
    /// The ZIP method code for this variant.
    #[must_use]
    pub fn code(self) -> u16 {
        match self {
            Self::Stored => 0,
            Self::Deflated => 8,
        }
    }

    /// Map a ZIP method code back to a variant.
    #[must_use]
    pub fn from_code(code: u16) -> Option<Self> {
        match code {
            0 => Some(Self::Stored),
            8 => Some(Self::Deflated),
            _ => None,
        }
    }
}

/// One named entry inside an archive container.
///
/// Listing order is directory order and need not match the physical byte
/// order in the file; `header_offset` is the only authority on physical
/// placement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveMember {
    pub(crate) name: String,
    pub(crate) mode: u32,
    pub(crate) method: CompressionMethod,
    pub(crate) modified: DateTime<Utc>,
    pub(crate) crc32: u32,
    pub(crate) compressed_size: u64,
    pub(crate) uncompressed_size: u64,
    /// Physical byte position of the member's local header.
    pub(crate) header_offset: u64,
    /// Total on-disk length of the entry (header, name, and payload).
    pub(crate) entry_size: u64,
}

impl ArchiveMember {
    /// The member's unique path-like name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// POSIX permission bits recorded for the member.
    #[must_use]
    pub fn mode(&self) -> u32 {
        self.mode
    }

    /// The member's compression method.
    #[must_use]
    pub fn method(&self) -> CompressionMethod {
        self.method
    }

    /// Modification timestamp (DOS-time precision: two seconds).
    #[must_use]
    pub fn modified(&self) -> DateTime<Utc> {
        self.modified
    }

    /// CRC-32 of the uncompressed payload.
    #[must_use]
    pub fn crc32(&self) -> u32 {
        self.crc32
    }

    /// Compressed payload length in bytes.
    #[must_use]
    pub fn compressed_size(&self) -> u64 {
        self.compressed_size
    }

    /// Uncompressed payload length in bytes.
    #[must_use]
    pub fn uncompressed_size(&self) -> u64 {
        self.uncompressed_size
    }

    /// Physical byte position of the member's local header.
    #[must_use]
    pub fn header_offset(&self) -> u64 {
        self.header_offset
    }

    /// Total on-disk length of the entry.
    #[must_use]
    pub fn entry_size(&self) -> u64 {
        self.entry_size
    }
}
