//! In-place ZIP container mutation.
//!
//! Implements the three operations the bundler and updater need (add a
//! member, remove members by exact name or glob, and finalize) without
//! rewriting the whole file. Removal compacts the physical byte layout by
//! shifting later members backward, and finalization rewrites the central
//! directory and truncates the backing storage to the new length.
//!
//! # Sub-modules
//!
//! - [`container`] - The [`container::ArchiveContainer`] state machine and
//!   its backing [`container::Storage`] contract.
//! - [`member`] - Per-member metadata ([`member::ArchiveMember`]).

pub mod container;
mod format;
pub mod member;

pub use container::{ArchiveContainer, ArchiveError, OpenMode, Storage};
pub use member::{ArchiveMember, CompressionMethod};
