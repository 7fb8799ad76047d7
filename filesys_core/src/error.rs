//! Error type for the inode/directory/filesystem layers.

use fs_api::error::ApiError;
use thiserror::Error;

/// Error type threaded through the inode, directory and filesystem-facade
/// layers. Wraps [`ApiError`] for failures bubbling up from the device and
/// free-map, and adds the error kinds specific to path resolution, inode
/// bookkeeping and the file-handle table.
#[derive(Error, Debug)]
pub enum FsError {
    /// A failure in the sector device or free-map layer below this crate.
    #[error("error in the device layer")]
    Api(#[from] ApiError),

    /// (De)serialization of a directory entry failed.
    #[error("serialization error")]
    Serialize(#[from] bincode::Error),

    /// A sector didn't carry the inode magic number on open.
    #[error("sector {0} does not hold a valid inode")]
    NotAnInode(u64),

    /// A path component, or an argument derived from one, was invalid.
    #[error("invalid path: {0}")]
    InvalidPath(&'static str),

    /// A path component wasn't found while resolving a path.
    #[error("no such file or directory: {0}")]
    NotFound(String),

    /// A path that was expected to name a file named a directory, or
    /// vice versa.
    #[error("wrong entry type for {0}")]
    WrongType(&'static str),

    /// Tried to create an entry under a name that's already in use.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Tried to remove a directory that still has entries besides `.`/`..`.
    #[error("directory not empty: {0}")]
    NotEmpty(String),

    /// Tried to remove a directory that's open somewhere else.
    #[error("directory is open elsewhere: {0}")]
    Busy(String),

    /// Denied an operation forbidden while the inode is write-denied, or
    /// a write-deny request on an inode that doesn't support it.
    #[error("invalid write-deny state: {0}")]
    Invalid(&'static str),

    /// The file-handle table has no more free descriptors.
    #[error("file-handle table exhausted")]
    HandleTableFull,

    /// Used a file handle that doesn't (or no longer) maps to an open file.
    #[error("invalid file handle: {0}")]
    BadHandle(u64),
}

/// Generic alias for a `Result` with the error type [`FsError`].
pub type Result<T> = std::result::Result<T, FsError>;
