//! Error type shared by the block device, free-map and (de)serialization
//! helpers in this crate.
//!
//! Read up on error handling in Rust using the
//! [`error::Error`](https://doc.rust-lang.org/std/error/trait.Error.html)
//! trait if you haven't already. We lean on [`thiserror`] to avoid writing
//! `Display`/`Error` boilerplate by hand, and keep one catch-all `Other`
//! variant (via [`anyhow`]) for foreign errors that don't deserve their own
//! variant.

use std::io;
use thiserror::Error;

/// Error type used by the sector-device and free-map layers.
///
/// The `#[error]` tag generates the `Display` impl; `#[from]` generates a
/// `From` impl so `?` can convert `io::Error`/`bincode::Error` values
/// directly into an `ApiError`.
#[derive(Error, Debug)]
pub enum ApiError {
    /// I/O failure underneath the memory-mapped device file.
    #[error("I/O error in the device layer")]
    Io(#[from] io::Error),
    /// (De)serialization of an on-disk struct failed.
    #[error("serialization error")]
    Serialize(#[from] bincode::Error),
    /// Invalid input to the device layer (bad path, bad size, ...).
    #[error("invalid device input: {0}")]
    DeviceInput(&'static str),
    /// Invalid input to a sector-level read/write.
    #[error("invalid sector input: {0}")]
    SectorInput(&'static str),
    /// The free-map has no more sectors to hand out.
    #[error("free-map exhausted: {0}")]
    NoSpace(&'static str),
    /// Invalid input to the free-map layer.
    #[error("invalid free-map input: {0}")]
    FreeMapInput(&'static str),

    /// *Escape hatch*: wraps any other error implementing `std::error::Error`.
    /// Avoid producing this from code in this crate directly; it exists so
    /// callers gluing this crate to something else have somewhere to put
    /// foreign errors without inventing a variant for each one.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Generic alias for a `Result` with the error type [`ApiError`].
pub type Result<T> = std::result::Result<T, ApiError>;
