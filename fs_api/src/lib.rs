//! Sector-device primitives underlying the filesystem core: a memory-mapped
//! block device, the on-disk struct layouts stamped into its sectors, the
//! free-sector bitmap, and the error type threaded through all three.

#![deny(missing_docs)]

/// Memory-mapped sector device.
pub mod controller;
/// Shared error type.
pub mod error;
/// Free-sector bitmap.
pub mod freemap;
/// On-disk struct layouts and raw buffer/block types.
pub mod types;
