//! Implementation of a physical disk and a very simple device controller for
//! it. The device and its contents are represented by a file on the host
//! file system, memory-mapped and wrapped in a [`Device`]. The device is
//! either created fresh at a non-existing path, or loaded from an existing
//! one whose size is checked against the expected sector count.
//!
//! Provides a sector read/write interface; this is the "block device
//! adapter" component — fixed-size sector read/write and nothing more. No
//! caching. Reads and writes take `&self`: the mmap'd contents live behind
//! an internal lock, so a `Device` can be shared (e.g. via `Arc`) across
//! threads, each serialized through that lock.

use super::error::{ApiError, Result};
use super::types::Block;
use memmap::MmapMut;
use std::sync::Mutex;
use std::{
    fs::{remove_file, OpenOptions},
    path::{Path, PathBuf},
};

/// State of a disk backed by a memory-mapped file, addressed sector by
/// sector.
#[derive(Debug)]
pub struct Device {
    /// Size of a sector, in bytes.
    pub sector_size: u64,
    /// Total number of sectors on this device.
    pub nsectors: u64,
    path: PathBuf,
    contents: Mutex<MmapMut>,
}

/// Whether we expect to create a brand new device image or load an existing
/// one.
#[derive(PartialEq, Eq, Copy, Clone)]
pub enum DiskState {
    /// Creating a new disk image.
    New,
    /// Loading an existing disk image.
    Load,
}

use self::DiskState::*;
impl DiskState {
    /// Convert a boolean (does the path already exist?) to a `DiskState`.
    pub fn new(exists: bool) -> DiskState {
        if exists {
            Load
        } else {
            New
        }
    }
}

impl Drop for Device {
    /// Persist any unwritten mmap'd pages before releasing the device.
    fn drop(&mut self) {
        if self.path.exists() {
            self.contents.lock().unwrap().flush().unwrap();
        }
    }
}

impl Device {
    fn create_device<P: AsRef<Path>>(
        path: P,
        sector_size: u64,
        nsectors: u64,
        ds: DiskState,
    ) -> Result<Device> {
        let path_buf = path.as_ref().to_path_buf();
        let mmapf = mmap_path(path, sector_size * nsectors, ds)?;
        Ok(Device {
            sector_size,
            nsectors,
            path: path_buf,
            contents: Mutex::new(mmapf),
        })
    }

    /// Create a *new* device, backed by `path`, with `nsectors` sectors of
    /// `sector_size` bytes each, all initialized to zero. Errors if `path`
    /// already exists.
    pub fn new<P: AsRef<Path>>(path: P, sector_size: u64, nsectors: u64) -> Result<Device> {
        Device::create_device(path, sector_size, nsectors, New)
    }

    /// Load an *existing* device at `path`. Errors if the path doesn't
    /// exist, or if its size doesn't match `sector_size * nsectors`.
    pub fn load<P: AsRef<Path>>(path: P, sector_size: u64, nsectors: u64) -> Result<Device> {
        Device::create_device(path, sector_size, nsectors, Load)
    }

    /// Tear down this device and remove the file backing it. Panics if
    /// removing the file fails.
    pub fn destruct(self) {
        remove_file(&self.path).unwrap();
    }

    /// Total size of this device, in bytes.
    pub fn device_size(&self) -> u64 {
        self.sector_size * self.nsectors
    }

    /// Path of the file backing this device.
    pub fn device_path(&self) -> &Path {
        &self.path
    }

    fn sector_to_addr(&self, idx: u64) -> u64 {
        self.sector_size * idx
    }

    /// Read sector `idx` off the device.
    pub fn read_sector(&self, idx: u64) -> Result<Block> {
        if idx >= self.nsectors {
            return Err(ApiError::DeviceInput("sector index out of range"));
        }
        let addr = self.sector_to_addr(idx) as usize;
        let end = addr + self.sector_size as usize;
        let guard = self.contents.lock().unwrap();
        let data: Box<[u8]> = guard[addr..end].into();
        Ok(Block::new(idx, data))
    }

    /// Write `b` to its sector on the device. Errors if `b` isn't exactly
    /// sector-sized, or if its sector number is out of range.
    pub fn write_sector(&self, b: &Block) -> Result<()> {
        if b.len() != self.sector_size {
            return Err(ApiError::DeviceInput(
                "trying to write a non-sector-sized block",
            ));
        }
        if b.sector_no >= self.nsectors {
            return Err(ApiError::DeviceInput("sector index out of range"));
        }
        let addr = self.sector_to_addr(b.sector_no) as usize;
        let end = addr + self.sector_size as usize;
        let mut guard = self.contents.lock().unwrap();
        guard[addr..end].copy_from_slice(b.contents_as_ref());
        Ok(())
    }
}

fn mmap_path<P: AsRef<Path>>(path: P, dsize: u64, ex: DiskState) -> Result<MmapMut> {
    let exists = DiskState::new(path.as_ref().exists());
    if exists != ex {
        return match ex {
            Load => Err(ApiError::DeviceInput("tried to load a non-existing path")),
            New => Err(ApiError::DeviceInput("tried to create a pre-existing path")),
        };
    }

    let f = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .open(path)?;

    if ex == Load {
        if f.metadata()?.len() != dsize {
            return Err(ApiError::DeviceInput(
                "device size does not match the expected size",
            ));
        }
    } else {
        f.set_len(dsize)?;
    }

    let data = unsafe { memmap::MmapOptions::new().map_mut(&f)? };
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::Device;
    use crate::types::Block;
    use std::fs::{create_dir_all, remove_dir, remove_file};
    use std::path::{Path, PathBuf};

    const SECTOR_SIZE: u64 = 10;
    const NSECTORS: u64 = 10;

    fn disk_prep_path(name: &str) -> PathBuf {
        let mut path = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
        path.push("fs-images-controller-".to_string() + name);
        path.push("img");

        if path.exists() {
            remove_file(&path).unwrap();
        }
        {
            let prefix = path.parent().unwrap();
            create_dir_all(prefix).unwrap();
        }
        path
    }

    fn disk_setup(path: &Path) -> Device {
        Device::new(path, SECTOR_SIZE, NSECTORS).unwrap()
    }

    fn disk_open(path: &Path) -> Device {
        Device::load(path, SECTOR_SIZE, NSECTORS).unwrap()
    }

    fn disk_destruct(dev: Device) {
        let path = dev.path.to_owned();
        dev.destruct();
        remove_dir(path.parent().unwrap()).unwrap();
    }

    #[test]
    fn create_disk_test() {
        let path = disk_prep_path("create");
        let dev = disk_setup(&path);

        let i1 = 3;
        let i2 = 9;
        let zero_block = |i| Block::new_zero(i, SECTOR_SIZE);
        assert_eq!(dev.read_sector(i1).unwrap(), zero_block(i1));
        assert_eq!(dev.read_sector(i2).unwrap(), zero_block(i2));

        assert!(dev.read_sector(NSECTORS).is_err());
        assert!(dev.write_sector(&zero_block(NSECTORS)).is_err());

        let sized_block = |s: u64| Block::new_zero(i1, s);
        assert!(dev.write_sector(&sized_block(SECTOR_SIZE + 1)).is_err());
        assert!(dev.write_sector(&sized_block(SECTOR_SIZE - 1)).is_err());

        let block_data = (0..10).collect();
        let bw = Block::new(i1, block_data);
        dev.write_sector(&bw).unwrap();
        assert_eq!(dev.read_sector(i1).unwrap(), bw);

        disk_destruct(dev);
        assert!(!path.exists());
    }

    #[test]
    fn load_existing_disk_test() {
        let path = disk_prep_path("load");
        let dev = disk_setup(&path);

        let i1 = 0;
        let i2 = 8;
        let bw1 = Block::new(i1, (0..10).collect());
        let bw2 = Block::new(i2, (0..10).rev().collect());
        dev.write_sector(&bw1).unwrap();
        dev.write_sector(&bw2).unwrap();

        drop(dev);

        let dev = disk_open(&path);
        assert_eq!(dev.read_sector(i1).unwrap(), bw1);
        assert_eq!(dev.read_sector(i2).unwrap(), bw2);

        disk_destruct(dev);
        assert!(!path.exists());
    }
}
