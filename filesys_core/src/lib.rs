//! A hierarchical, sector-addressable filesystem core: disk inodes with
//! two-level indirection, directories stored as files of fixed-size
//! entries, and path resolution across both.

#![deny(missing_docs)]

/// Directories and path resolution.
pub mod directory;
/// Error type shared across this crate.
pub mod error;
/// Top-level facade: format, create, open, remove, change directory.
pub mod filesys;
/// Per-task file-descriptor table.
pub mod handle;
/// In-memory inodes and the open-inode registry.
pub mod inode;
/// Per-task current-directory state.
pub mod task;
