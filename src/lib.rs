//! seampack library.
//!
//! This crate packages an application into a single self-contained
//! executable (a ZIP-format artifact) and gives that artifact the ability
//! to update itself in place. It is used by the `seampack` CLI binary and
//! can be consumed programmatically for testing or custom packaging
//! workflows.
//!
//! # Modules
//!
//! - [`archive`] - In-place ZIP container mutation (add, remove, finalize)
//! - [`bundler`] - Build-time packaging of files into an artifact
//! - [`cli`] - Command-line argument definitions
//! - [`clock`] - Injectable time source for deterministic receipt dates
//! - [`digest`] - Streaming hash computation with algorithm dispatch
//! - [`output`] - User-facing stderr helpers
//! - [`receipt`] - Validated build metadata records
//! - [`transport`] - HTTP fetch contract with conditional and hashing fetches
//! - [`updater`] - Self-update coordination

pub mod archive;
pub mod bundler;
pub mod cli;
pub mod clock;
pub mod digest;
pub mod output;
pub mod receipt;
pub mod transport;
pub mod updater;
