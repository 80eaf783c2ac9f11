//! The archive container state machine.
//!
//! A container is opened over exclusively-owned backing storage in either
//! read or append mode, mutated (append mode only), and closed exactly
//! once. Closing writes the central directory at its current (possibly
//! reduced) start offset and truncates the storage, which is mandatory:
//! removal only shifts bytes backward, and the stale tail would corrupt
//! the archive if left in place.

use super::format::{self, EndOfCentralDirectory};
use super::member::{ArchiveMember, CompressionMethod};
use chrono::{DateTime, Utc};
use flate2::Compression;
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use std::collections::HashMap;
use std::fs::File;
use std::io::{Cursor, Read, Seek, SeekFrom, Write};

/// Errors from container operations.
#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    /// The container is in the wrong state or the bytes are not a ZIP
    /// archive this engine can handle.
    #[error("archive format error: {reason}")]
    Format {
        /// Description of the violation.
        reason: String,
    },

    /// An exact-name removal target is absent.
    #[error("member not found: {name}")]
    NotFound {
        /// The name that was requested.
        name: String,
    },

    /// An I/O operation on the backing storage failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias using [`ArchiveError`].
pub type Result<T> = std::result::Result<T, ArchiveError>;

fn format_err(reason: impl Into<String>) -> ArchiveError {
    ArchiveError::Format {
        reason: reason.into(),
    }
}

/// Backing storage for a container.
///
/// Truncation is part of the contract: a backing that cannot shrink would
/// silently leave a corrupt archive after removals, so the engine fails
/// closed by requiring it up front.
pub trait Storage: Read + Write + Seek {
    /// Shrink the storage to exactly `len` bytes.
    ///
    /// # Errors
    ///
    /// Returns any I/O error from the underlying storage.
    fn truncate(&mut self, len: u64) -> std::io::Result<()>;
}

impl Storage for File {
    fn truncate(&mut self, len: u64) -> std::io::Result<()> {
        self.set_len(len)
    }
}

impl Storage for Cursor<Vec<u8>> {
    fn truncate(&mut self, len: u64) -> std::io::Result<()> {
        #[allow(clippy::cast_possible_truncation)]
        self.get_mut().truncate(len as usize);
        Ok(())
    }
}

impl Storage for Box<dyn Storage> {
    fn truncate(&mut self, len: u64) -> std::io::Result<()> {
        (**self).truncate(len)
    }
}

/// The mode a container was opened in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Members may be read but not mutated.
    Read,
    /// Members may be added, removed, and read.
    Append,
}

/// A ZIP container over exclusively-owned backing storage.
///
/// Mutations apply to the storage immediately; the central directory and
/// final truncation are deferred to [`ArchiveContainer::close`].
#[derive(Debug)]
pub struct ArchiveContainer<S: Storage> {
    storage: S,
    mode: OpenMode,
    closed: bool,
    members: Vec<ArchiveMember>,
    index: HashMap<String, usize>,
    /// Physical offset where the central directory begins; equivalently,
    /// the end of the member data region.
    directory_start: u64,
}

impl ArchiveContainer<Cursor<Vec<u8>>> {
    /// Open an empty in-memory container for append.
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            storage: Cursor::new(Vec::new()),
            mode: OpenMode::Append,
            closed: false,
            members: Vec::new(),
            index: HashMap::new(),
            directory_start: 0,
        }
    }
}

impl<S: Storage> ArchiveContainer<S> {
    /// Open a container over `storage`.
    ///
    /// Zero-length storage opens as a new, empty archive (append mode
    /// only). Anything else must carry a parseable central directory.
    ///
    /// # Errors
    ///
    /// Returns [`ArchiveError::Format`] when the storage is empty in read
    /// mode or does not parse as a ZIP archive, and [`ArchiveError::Io`]
    /// on storage failures.
    pub fn open(mut storage: S, mode: OpenMode) -> Result<Self> {
        let len = storage.seek(SeekFrom::End(0))?;
        if len == 0 {
            if mode == OpenMode::Read {
                return Err(format_err("cannot read an empty archive"));
            }
            return Ok(Self {
                storage,
                mode,
                closed: false,
                members: Vec::new(),
                index: HashMap::new(),
                directory_start: 0,
            });
        }

        let record = read_end_record(&mut storage, len)?;
        let members = read_directory(&mut storage, record)?;
        let index = build_index(&members)?;
        let mut container = Self {
            storage,
            mode,
            closed: false,
            members,
            index,
            directory_start: u64::from(record.directory_offset),
        };
        container.recompute_entry_sizes();
        Ok(container)
    }

    /// The mode this container was opened in.
    #[must_use]
    pub fn mode(&self) -> OpenMode {
        self.mode
    }

    /// Whether [`ArchiveContainer::close`] has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// The members in listing order.
    #[must_use]
    pub fn members(&self) -> &[ArchiveMember] {
        &self.members
    }

    /// Whether a member with `name` exists.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// Physical offset where the central directory begins.
    #[must_use]
    pub fn directory_start(&self) -> u64 {
        self.directory_start
    }

    /// Consume the container and hand back its storage.
    #[must_use]
    pub fn into_storage(self) -> S {
        self.storage
    }

    /// Add a member, compressing the payload with DEFLATE at maximum
    /// compression and recording `mode_bits` as Unix permissions.
    ///
    /// Re-adding an existing name replaces the old member, keeping names
    /// unique within the container.
    ///
    /// # Errors
    ///
    /// Returns [`ArchiveError::Format`] unless the container is open for
    /// append, and [`ArchiveError::Io`] on storage failures.
    pub fn add(
        &mut self,
        name: &str,
        payload: &[u8],
        mode_bits: u32,
        modified: DateTime<Utc>,
    ) -> Result<()> {
        self.ensure_append("add")?;
        if self.index.contains_key(name) {
            self.remove_exact(name)?;
        }

        let crc32 = crc32fast::hash(payload);
        let compressed = deflate(payload)?;
        let mut member = ArchiveMember {
            name: name.to_owned(),
            mode: mode_bits & 0xffff,
            method: CompressionMethod::Deflated,
            modified,
            crc32,
            compressed_size: compressed.len() as u64,
            uncompressed_size: payload.len() as u64,
            header_offset: self.directory_start,
            entry_size: 0,
        };
        let header = format::local_header(&member);
        member.entry_size = header.len() as u64 + compressed.len() as u64;

        self.storage.seek(SeekFrom::Start(member.header_offset))?;
        self.storage.write_all(&header)?;
        self.storage.write_all(&compressed)?;

        log::debug!("added member {name} at offset {}", member.header_offset);
        self.directory_start += member.entry_size;
        self.index.insert(member.name.clone(), self.members.len());
        self.members.push(member);
        Ok(())
    }

    /// Remove members matching `pattern`.
    ///
    /// An exact name (no `*` or `?`) must exist; a glob removes every
    /// match and matching nothing is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`ArchiveError::NotFound`] for an absent exact name,
    /// [`ArchiveError::Format`] for a malformed glob or a container not
    /// open for append, and [`ArchiveError::Io`] on storage failures.
    pub fn remove(&mut self, pattern: &str) -> Result<()> {
        self.ensure_append("remove")?;
        if !pattern.contains(['*', '?']) {
            if !self.index.contains_key(pattern) {
                return Err(ArchiveError::NotFound {
                    name: pattern.to_owned(),
                });
            }
            return self.remove_exact(pattern);
        }

        let glob = glob::Pattern::new(pattern)
            .map_err(|e| format_err(format!("bad removal pattern {pattern:?}: {e}")))?;
        let matches: Vec<String> = self
            .members
            .iter()
            .filter(|member| glob.matches(&member.name))
            .map(|member| member.name.clone())
            .collect();
        for name in matches {
            self.remove_exact(&name)?;
        }
        Ok(())
    }

    /// Read and decompress the payload of the member named `name`.
    ///
    /// # Errors
    ///
    /// Returns [`ArchiveError::NotFound`] for an unknown name,
    /// [`ArchiveError::Format`] when the container is closed or the entry
    /// bytes are inconsistent (bad signature or checksum), and
    /// [`ArchiveError::Io`] on storage failures.
    pub fn read(&mut self, name: &str) -> Result<Vec<u8>> {
        if self.closed {
            return Err(format_err("container is closed"));
        }
        let member = self
            .index
            .get(name)
            .map(|&at| self.members[at].clone())
            .ok_or_else(|| ArchiveError::NotFound {
                name: name.to_owned(),
            })?;

        self.storage.seek(SeekFrom::Start(member.header_offset))?;
        let mut header = [0u8; format::LOCAL_HEADER_LEN];
        self.storage.read_exact(&mut header)?;
        if format::read_u32(&header, 0) != format::LOCAL_HEADER_SIG {
            return Err(format_err(format!("bad local header signature for {name}")));
        }
        let name_len = i64::from(format::read_u16(&header, 26));
        let extra_len = i64::from(format::read_u16(&header, 28));
        self.storage.seek(SeekFrom::Current(name_len + extra_len))?;

        let mut compressed = vec![0u8; usize::try_from(member.compressed_size).map_err(
            |_| format_err(format!("member {name} is too large for this platform")),
        )?];
        self.storage.read_exact(&mut compressed)?;

        let payload = match member.method {
            CompressionMethod::Stored => compressed,
            CompressionMethod::Deflated => inflate(&compressed, member.uncompressed_size)?,
        };
        if crc32fast::hash(&payload) != member.crc32 {
            return Err(format_err(format!("checksum mismatch for {name}")));
        }
        Ok(payload)
    }

    /// Write the central directory and end record, truncate the storage
    /// to the final length, and mark the container closed.
    ///
    /// # Errors
    ///
    /// Returns [`ArchiveError::Format`] when already closed or when the
    /// archive exceeds the 32-bit ZIP field limits, and
    /// [`ArchiveError::Io`] on storage failures.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Err(format_err("container already closed"));
        }
        self.closed = true;
        if self.mode == OpenMode::Read {
            return Ok(());
        }

        let entries = u16::try_from(self.members.len())
            .map_err(|_| format_err("too many members for a ZIP directory"))?;
        let directory_offset = u32::try_from(self.directory_start)
            .map_err(|_| format_err("archive exceeds the 4 GiB ZIP limit"))?;

        self.storage.seek(SeekFrom::Start(self.directory_start))?;
        let mut directory_size = 0u32;
        for member in &self.members {
            if member.header_offset > u64::from(u32::MAX) {
                return Err(format_err("archive exceeds the 4 GiB ZIP limit"));
            }
            let entry = format::central_header(member);
            directory_size += entry.len() as u32;
            self.storage.write_all(&entry)?;
        }
        let record = EndOfCentralDirectory {
            entries,
            directory_size,
            directory_offset,
        };
        self.storage
            .write_all(&format::end_of_central_directory(record))?;
        self.storage.flush()?;

        let end = self.storage.stream_position()?;
        self.storage.truncate(end)?;
        log::debug!("closed archive: {entries} member(s), {end} bytes");
        Ok(())
    }

    /// Remove one member by exact name, compacting the physical layout.
    fn remove_exact(&mut self, name: &str) -> Result<()> {
        let target = *self
            .index
            .get(name)
            .ok_or_else(|| ArchiveError::NotFound {
                name: name.to_owned(),
            })?;

        // Sort by physical offset; the listing order is no authority on
        // where the bytes live.
        let mut physical: Vec<usize> = (0..self.members.len()).collect();
        physical.sort_by_key(|&at| self.members[at].header_offset);
        let position = physical
            .iter()
            .position(|&at| at == target)
            .ok_or_else(|| format_err("member list and index out of sync"))?;

        let span_start = self.members[target].header_offset;
        let span_end = physical
            .get(position + 1)
            .map_or(self.directory_start, |&at| self.members[at].header_offset);
        let span = span_end - span_start;

        // Shift every member physically after the span backward by its
        // size, updating each stored offset as the bytes move.
        for &at in &physical[position + 1..] {
            let old_offset = self.members[at].header_offset;
            let size = usize::try_from(self.members[at].entry_size).map_err(|_| {
                format_err("entry too large for this platform")
            })?;
            let mut bytes = vec![0u8; size];
            self.storage.seek(SeekFrom::Start(old_offset))?;
            self.storage.read_exact(&mut bytes)?;

            let new_offset = old_offset - span;
            self.members[at].header_offset = new_offset;
            self.storage.seek(SeekFrom::Start(new_offset))?;
            self.storage.write_all(&bytes)?;
        }
        self.storage.flush()?;

        self.directory_start -= span;
        self.members.remove(target);
        self.index = rebuild_index(&self.members);
        log::debug!("removed member {name} ({span} bytes reclaimed)");
        Ok(())
    }

    fn ensure_append(&self, operation: &str) -> Result<()> {
        if self.closed {
            return Err(format_err(format!("{operation} on a closed container")));
        }
        if self.mode != OpenMode::Append {
            return Err(format_err(format!("{operation} requires append mode")));
        }
        Ok(())
    }

    /// Fill in each member's on-disk entry size from the gap to its
    /// physical successor (the last member runs to the directory start).
    fn recompute_entry_sizes(&mut self) {
        let mut physical: Vec<usize> = (0..self.members.len()).collect();
        physical.sort_by_key(|&at| self.members[at].header_offset);
        for (rank, &at) in physical.iter().enumerate() {
            let end = physical
                .get(rank + 1)
                .map_or(self.directory_start, |&next| {
                    self.members[next].header_offset
                });
            self.members[at].entry_size = end - self.members[at].header_offset;
        }
    }
}

/// Locate the end-of-central-directory record near the end of storage.
fn read_end_record<S: Storage>(storage: &mut S, len: u64) -> Result<EndOfCentralDirectory> {
    // The record is 22 bytes plus an up-to-64 KiB comment.
    let tail_len = len.min(format::EOCD_LEN as u64 + 0xffff);
    storage.seek(SeekFrom::End(-i64::try_from(tail_len).map_err(|_| {
        format_err("storage too large to scan")
    })?))?;
    let mut tail = vec![0u8; usize::try_from(tail_len).map_err(|_| {
        format_err("storage too large to scan")
    })?];
    storage.read_exact(&mut tail)?;
    format::find_end_of_central_directory(&tail)
        .ok_or_else(|| format_err("no end-of-central-directory record"))
}

/// Parse the central directory into the member list, in directory order.
fn read_directory<S: Storage>(
    storage: &mut S,
    record: EndOfCentralDirectory,
) -> Result<Vec<ArchiveMember>> {
    storage.seek(SeekFrom::Start(u64::from(record.directory_offset)))?;
    let mut directory = vec![0u8; record.directory_size as usize];
    storage.read_exact(&mut directory)?;

    let mut members = Vec::with_capacity(usize::from(record.entries));
    let mut at = 0usize;
    for _ in 0..record.entries {
        let parsed = format::parse_central_entry(&directory, at).map_err(format_err)?;
        at += parsed.consumed;
        members.push(parsed.member);
    }
    Ok(members)
}

fn build_index(members: &[ArchiveMember]) -> Result<HashMap<String, usize>> {
    let mut index = HashMap::with_capacity(members.len());
    for (at, member) in members.iter().enumerate() {
        if index.insert(member.name.clone(), at).is_some() {
            return Err(format_err(format!("duplicate member name {}", member.name)));
        }
    }
    Ok(index)
}

fn rebuild_index(members: &[ArchiveMember]) -> HashMap<String, usize> {
    members
        .iter()
        .enumerate()
        .map(|(at, member)| (member.name.clone(), at))
        .collect()
}

fn deflate(payload: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = DeflateEncoder::new(Vec::new(), Compression::best());
    encoder.write_all(payload)?;
    Ok(encoder.finish()?)
}

fn inflate(compressed: &[u8], expected_len: u64) -> Result<Vec<u8>> {
    let mut decoder = DeflateDecoder::new(compressed);
    let mut payload =
        Vec::with_capacity(usize::try_from(expected_len).unwrap_or_default());
    decoder.read_to_end(&mut payload)?;
    Ok(payload)
}

#[cfg(test)]
#[path = "container_tests.rs"]
mod tests;
