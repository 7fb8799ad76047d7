//! Free-sector bitmap.
//!
//! The free-map tracks which sectors of the device are in use, packed one
//! bit per sector into a single [`crate::types::FREE_MAP_SECTOR`]. Bits are
//! read "right to left" within each byte — bit `i` of sector capacity lives
//! at byte `i / 8`, bit position `i % 8` — matching the convention the
//! teacher's device layer uses for its own scratch bitmaps.
//!
//! Capacity is therefore bounded to `SECTOR_SIZE * 8` bits: one sector's
//! worth of bitmap, no multi-sector extension. Sector 0 itself, and any
//! sector reserved below `base`, are marked in-use from the start so they
//! are never handed out by `allocate`.

use super::controller::Device;
use super::error::{ApiError, Result};
use super::types::{Block, FREE_MAP_SECTOR, SECTOR_SIZE};
use std::sync::Mutex;

/// Total number of sectors a single free-map sector can track.
pub const FREE_MAP_CAPACITY: u64 = SECTOR_SIZE * 8;

#[derive(Debug)]
struct Bitmap {
    bits: Vec<bool>,
}

impl Bitmap {
    fn from_bytes(bytes: &[u8]) -> Bitmap {
        let mut bits = Vec::with_capacity(bytes.len() * 8);
        for byte in bytes {
            for i in 0..8 {
                bits.push(byte & (1 << i) != 0);
            }
        }
        Bitmap { bits }
    }

    fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = vec![0u8; (self.bits.len() + 7) / 8];
        for (i, &bit) in self.bits.iter().enumerate() {
            if bit {
                bytes[i / 8] |= 1 << (i % 8);
            }
        }
        bytes
    }

    /// Find `count` consecutive unset bits and set them, returning the
    /// index of the first one. `None` if no such run exists.
    fn scan_and_flip(&mut self, count: u64) -> Option<u64> {
        let count = count as usize;
        if count == 0 {
            return None;
        }
        let mut run_start = None;
        let mut run_len = 0usize;
        for (i, &bit) in self.bits.iter().enumerate() {
            if !bit {
                if run_start.is_none() {
                    run_start = Some(i);
                }
                run_len += 1;
                if run_len == count {
                    let start = run_start.unwrap();
                    for b in self.bits.iter_mut().skip(start).take(count) {
                        *b = true;
                    }
                    return Some(start as u64);
                }
            } else {
                run_start = None;
                run_len = 0;
            }
        }
        None
    }

    fn set_used(&mut self, start: u64, count: u64, used: bool) {
        for b in self
            .bits
            .iter_mut()
            .skip(start as usize)
            .take(count as usize)
        {
            *b = used;
        }
    }

    fn all_used(&self, start: u64, count: u64) -> bool {
        self.bits
            .iter()
            .skip(start as usize)
            .take(count as usize)
            .all(|&b| b)
    }
}

/// In-memory free-sector bitmap, write-through to the device on every
/// mutation (no caching, no deferred flush).
#[derive(Debug)]
pub struct FreeMap<'a> {
    device: &'a Device,
    base: u64,
    bitmap: Mutex<Bitmap>,
}

impl<'a> FreeMap<'a> {
    /// Initialize a fresh, empty free-map on `device`. Sectors `0..base`
    /// (the free-map's own sector plus anything else reserved at format
    /// time, e.g. the root directory's inode sector) are marked in-use.
    pub fn create(device: &'a Device, base: u64) -> Result<FreeMap<'a>> {
        if device.nsectors > FREE_MAP_CAPACITY {
            return Err(ApiError::FreeMapInput(
                "device has more sectors than a single free-map sector can track",
            ));
        }
        let mut bitmap = Bitmap::from_bytes(&vec![0u8; SECTOR_SIZE as usize]);
        bitmap.set_used(0, base, true);
        let fm = FreeMap {
            device,
            base,
            bitmap: Mutex::new(bitmap),
        };
        fm.flush()?;
        Ok(fm)
    }

    /// Load an existing free-map off `device`.
    pub fn open(device: &'a Device, base: u64) -> Result<FreeMap<'a>> {
        let block = device.read_sector(FREE_MAP_SECTOR)?;
        let bitmap = Bitmap::from_bytes(block.contents_as_ref());
        Ok(FreeMap {
            device,
            base,
            bitmap: Mutex::new(bitmap),
        })
    }

    /// Persist the free-map's current state to its sector.
    pub fn flush(&self) -> Result<()> {
        let bytes = self.bitmap.lock().unwrap().to_bytes();
        let block = Block::new(FREE_MAP_SECTOR, bytes.into_boxed_slice());
        self.device.write_sector(&block)
    }

    /// Allocate `count` consecutive free sectors, returning the first
    /// sector number. Errors with [`ApiError::NoSpace`] if no run of that
    /// length is free.
    pub fn allocate(&self, count: u64) -> Result<u64> {
        let start = {
            let mut bitmap = self.bitmap.lock().unwrap();
            bitmap
                .scan_and_flip(count)
                .ok_or(ApiError::NoSpace("no free run of that length"))?
        };
        if let Err(e) = self.flush() {
            self.bitmap.lock().unwrap().set_used(start, count, false);
            return Err(e);
        }
        Ok(start)
    }

    /// Release `count` sectors starting at `first` back to the free-map.
    /// Errors if any of them weren't actually marked used.
    pub fn release(&self, first: u64, count: u64) -> Result<()> {
        {
            let mut bitmap = self.bitmap.lock().unwrap();
            if !bitmap.all_used(first, count) {
                return Err(ApiError::FreeMapInput(
                    "trying to release sectors that aren't all in use",
                ));
            }
            bitmap.set_used(first, count, false);
        }
        self.flush()
    }

    /// True if sector `idx` is currently marked in use.
    pub fn is_used(&self, idx: u64) -> bool {
        self.bitmap.lock().unwrap().bits[idx as usize]
    }
}
