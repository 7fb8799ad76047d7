//! On-disk types shared between the device layer and `filesys_core`.
//!
//! `Buffer`/`Block` wrap a sector's worth of bytes and provide raw and typed
//! (de)serializing read/write. `DiskInode`, `IndirectionBlock` and `DirEntry`
//! are the fixed-layout structs that get stamped directly into sectors.

use super::error::{ApiError, Result};
use lazy_static::lazy_static;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::io::prelude::*;
use std::io::{Cursor, SeekFrom};

/// Fixed size, in bytes, of every sector on the device.
pub const SECTOR_SIZE: u64 = 512;

/// Maximum length, in bytes, of a single path component's name.
pub const NAME_MAX: usize = 14;

/// Number of indirection-block slots a disk inode carries.
///
/// Chosen, together with the other fixed-width fields, so that
/// `size_of::<DiskInode>()` (once serialized) fits in exactly one sector.
pub const NUM_TABLES: usize = 16;

/// Sentinel value stamped into every disk inode's `magic` field, checked on
/// open to catch reads of sectors that were never initialized as inodes.
pub const INODE_MAGIC: u32 = 0x494e4f44; // "INOD"

/// Sector number of the free-map's own on-disk storage.
pub const FREE_MAP_SECTOR: u64 = 0;

/// Sector number of the root directory's inode.
pub const ROOT_DIR_SECTOR: u64 = 1;

/// Buffer abstraction representing some data on the heap. Buffers back
/// `Block`s, and are also used as read/write scratch space by higher layers.
#[derive(Debug, PartialEq, Eq)]
pub struct Buffer {
    contents: Box<[u8]>,
}

impl Buffer {
    /// Create a new buffer with the given contents.
    pub fn new(data: Box<[u8]>) -> Buffer {
        Buffer { contents: data }
    }

    /// Create an all-zero buffer of length `len`.
    pub fn new_zero(len: u64) -> Buffer {
        Buffer {
            contents: vec![0; len as usize].into_boxed_slice(),
        }
    }

    /// Size of the underlying data, in bytes.
    pub fn len(&self) -> u64 {
        self.contents.len() as u64
    }

    /// True if this buffer holds no bytes.
    pub fn is_empty(&self) -> bool {
        self.contents.is_empty()
    }

    /// Borrow the buffer's contents.
    pub fn contents_as_ref(&self) -> &[u8] {
        &self.contents
    }

    /// Read `data.len()` bytes out of this buffer starting at `offset`.
    pub fn read_data(&self, data: &mut [u8], offset: u64) -> Result<()> {
        if offset + data.len() as u64 > self.len() {
            return Err(ApiError::SectorInput(
                "trying to read beyond the bounds of the sector",
            ));
        }
        let mut c = Cursor::new(&self.contents);
        c.seek(SeekFrom::Start(offset))?;
        c.read_exact(data).map_err(|e| e.into())
    }

    /// Write `data` into this buffer starting at `offset`.
    pub fn write_data(&mut self, data: &[u8], offset: u64) -> Result<()> {
        if offset + data.len() as u64 > self.len() {
            return Err(ApiError::SectorInput(
                "trying to write beyond the bounds of the sector",
            ));
        }
        let mut c = Cursor::new(&mut self.contents[..]);
        c.seek(SeekFrom::Start(offset))?;
        c.write_all(data).map_err(|e| e.into())
    }

    /// Deserialize a `DeserializeOwned` struct starting at `offset`.
    pub fn deserialize_from<S>(&self, offset: u64) -> Result<S>
    where
        S: DeserializeOwned,
    {
        let mut c = Cursor::new(&self.contents);
        c.seek(SeekFrom::Start(offset))?;
        Ok(bincode::deserialize_from(c)?)
    }

    /// Serialize `stru` into this buffer at `offset`, going through
    /// `write_data` so out-of-bounds writes still produce a proper error.
    pub fn serialize_into<S>(&mut self, stru: &S, offset: u64) -> Result<()>
    where
        S: Serialize,
    {
        let bytes = bincode::serialize(stru)?;
        self.write_data(&bytes, offset)
    }
}

/// A single sector's worth of data, tagged with the sector number it came
/// from (or is destined for).
#[derive(Debug, PartialEq, Eq)]
pub struct Block {
    /// Sector index on the device this block belongs to.
    pub sector_no: u64,
    buf: Buffer,
}

impl Block {
    /// Wrap `data` as the contents of sector `sector_no`.
    pub fn new(sector_no: u64, data: Box<[u8]>) -> Block {
        Block {
            sector_no,
            buf: Buffer::new(data),
        }
    }

    /// An all-zero block for sector `sector_no`.
    pub fn new_zero(sector_no: u64, len: u64) -> Block {
        Block {
            sector_no,
            buf: Buffer::new_zero(len),
        }
    }

    /// Size of this block's data, in bytes.
    pub fn len(&self) -> u64 {
        self.buf.len()
    }

    /// True if the block is empty (only meaningful for malformed blocks).
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Borrow this block's raw contents.
    pub fn contents_as_ref(&self) -> &[u8] {
        self.buf.contents_as_ref()
    }

    /// Read raw bytes out of this block.
    pub fn read_data(&self, data: &mut [u8], offset: u64) -> Result<()> {
        self.buf.read_data(data, offset)
    }

    /// Write raw bytes into this block.
    pub fn write_data(&mut self, data: &[u8], offset: u64) -> Result<()> {
        self.buf.write_data(data, offset)
    }

    /// Deserialize a struct out of this block.
    pub fn deserialize_from<S>(&self, offset: u64) -> Result<S>
    where
        S: DeserializeOwned,
    {
        self.buf.deserialize_from(offset)
    }

    /// Serialize a struct into this block.
    pub fn serialize_into<S>(&mut self, stru: &S, offset: u64) -> Result<()>
    where
        S: Serialize,
    {
        self.buf.serialize_into(stru, offset)
    }
}

/// On-disk inode: occupies exactly one sector.
///
/// Layout mirrors `struct inode_disk` in the original Pintos source
/// (`indirection[]` replacing direct block pointers): `length`, `magic`,
/// `is_dir`, `parent_directory`, then the indirection table.
#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq, Eq)]
pub struct DiskInode {
    /// File length in bytes (for directories: total bytes of entry slots).
    pub length: u64,
    /// Sentinel for sanity-checking that a sector really holds an inode.
    pub magic: u32,
    /// Distinguishes directories from regular files.
    pub is_dir: bool,
    /// Sector number of the parent directory's inode (root points to itself).
    pub parent_directory: u64,
    /// Sector numbers of this inode's indirection blocks (0 = unallocated).
    pub indirection: [u64; NUM_TABLES],
}

lazy_static! {
    /// Serialized size of a [`DiskInode`], computed once at runtime.
    pub static ref DISK_INODE_SIZE: u64 =
        bincode::serialize(&DiskInode::default()).unwrap().len() as u64;
}

/// Number of sector-number slots an indirection block can hold.
pub const TABLE_SIZE: usize = 60;

/// One sector holding a length-prefixed array of data-sector numbers: the
/// second level of the address-translation tree.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct IndirectionBlock {
    /// Number of currently-allocated entries in `sectors`.
    pub length: u64,
    /// Sector numbers this indirection block points to (0 = unallocated).
    pub sectors: Vec<u64>,
}

impl Default for IndirectionBlock {
    fn default() -> Self {
        IndirectionBlock {
            length: 0,
            sectors: vec![0; TABLE_SIZE],
        }
    }
}

lazy_static! {
    /// Serialized size of an [`IndirectionBlock`], computed at runtime.
    pub static ref INDIRECTION_BLOCK_SIZE: u64 =
        bincode::serialize(&IndirectionBlock::default()).unwrap().len() as u64;
}

/// A single, fixed-size directory entry.
#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq, Eq)]
pub struct DirEntry {
    /// Sector of the inode this entry names. 0 for an unused slot.
    pub inode_sector: u64,
    /// Null-padded name, at most [`NAME_MAX`] bytes.
    pub name: [u8; NAME_MAX],
    /// Whether this slot currently holds a live entry.
    pub in_use: bool,
}

lazy_static! {
    /// Serialized size of a [`DirEntry`], computed at runtime.
    pub static ref DIR_ENTRY_SIZE: u64 =
        bincode::serialize(&DirEntry::default()).unwrap().len() as u64;
}

impl DirEntry {
    /// Build an entry for `name` pointing at `inode_sector`. Returns `None`
    /// if `name` is empty or longer than [`NAME_MAX`] bytes.
    pub fn new(inode_sector: u64, name: &str) -> Option<DirEntry> {
        if name.is_empty() || name.as_bytes().len() > NAME_MAX {
            return None;
        }
        let mut buf = [0u8; NAME_MAX];
        buf[..name.len()].copy_from_slice(name.as_bytes());
        Some(DirEntry {
            inode_sector,
            name: buf,
            in_use: true,
        })
    }

    /// Recover this entry's name as a `String`, stopping at the first `\0`
    /// (or the end of the array if the name fills it completely).
    pub fn name_str(&self) -> String {
        let end = self.name.iter().position(|&b| b == 0).unwrap_or(self.name.len());
        String::from_utf8_lossy(&self.name[..end]).into_owned()
    }
}

#[cfg(test)]
mod block_tests {
    use super::*;

    const TEST_SECTOR_SIZE: u64 = 1000;

    #[test]
    fn raw_rw_test() {
        let n1 = 12;
        let mut b1 = Block::new_zero(n1, TEST_SECTOR_SIZE);
        assert_eq!(b1.contents_as_ref(), vec![0; TEST_SECTOR_SIZE as usize]);

        let raw_data = vec![5; 5];
        b1.write_data(&raw_data, 10).unwrap();
        let mut readback = vec![0; 5];
        b1.read_data(&mut readback, 8).unwrap();
        assert_eq!(readback, vec!(0, 0, 5, 5, 5));

        let emp: Vec<u8> = vec![];
        assert!(b1.write_data(&emp, TEST_SECTOR_SIZE).is_ok());
        assert!(b1.write_data(&emp, TEST_SECTOR_SIZE + 1).is_err());
        let mut emp_read: Vec<u8> = vec![];
        assert!(b1.read_data(&mut emp_read, TEST_SECTOR_SIZE + 1).is_err());
        let mut one = vec![1];
        assert!(b1.write_data(&one, TEST_SECTOR_SIZE).is_err());
        assert!(b1.read_data(&mut one, TEST_SECTOR_SIZE).is_err());
    }

    #[test]
    fn serialization_test() {
        let in1 = DiskInode::default();
        let mut in2 = DiskInode {
            magic: INODE_MAGIC,
            is_dir: true,
            length: 142,
            parent_directory: 1,
            ..DiskInode::default()
        };
        in2.indirection[0] = 7;

        assert_eq!(
            bincode::serialize(&in1).unwrap().len(),
            *DISK_INODE_SIZE as usize
        );
        assert_eq!(
            bincode::serialize(&in1).unwrap().len(),
            bincode::serialize(&in2).unwrap().len()
        );

        let mut b1 = Block::new_zero(0, TEST_SECTOR_SIZE);
        b1.serialize_into(&in1, 0).unwrap();
        b1.serialize_into(&in2, *DISK_INODE_SIZE).unwrap();
        assert_eq!(b1.deserialize_from::<DiskInode>(0).unwrap(), in1);
        assert_eq!(
            b1.deserialize_from::<DiskInode>(*DISK_INODE_SIZE).unwrap(),
            in2
        );
    }

    #[test]
    fn dir_entry_name_roundtrip() {
        let de = DirEntry::new(5, "hello").unwrap();
        assert_eq!(de.name_str(), "hello");
        assert!(de.in_use);
        assert!(DirEntry::new(3, "").is_none());
        assert!(DirEntry::new(3, "this_name_is_way_too_long").is_none());
    }
}
