//! In-memory inodes: the address-translation layer between byte offsets and
//! sectors, plus the open-inode registry that deduplicates concurrent opens
//! of the same sector.
//!
//! A [`DiskInode`] carries [`NUM_TABLES`] indirection-block pointers; each
//! indirection block in turn names up to `TABLE_SIZE` data sectors. Every
//! inode, even an empty one, owns at least its first indirection block —
//! allocated up front by [`create`] — which keeps the growth arithmetic
//! below from ever having to special-case a completely unallocated inode.

use fs_api::controller::Device;
use fs_api::freemap::FreeMap;
use fs_api::types::{
    Block, DiskInode, IndirectionBlock, INODE_MAGIC, NUM_TABLES, SECTOR_SIZE, TABLE_SIZE,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use crate::error::{FsError, Result};

const TABLE_SPAN: u64 = TABLE_SIZE as u64 * SECTOR_SIZE;

fn bytes_to_sectors(size: u64) -> u64 {
    (size + SECTOR_SIZE - 1) / SECTOR_SIZE
}

fn byte_to_i_block(pos: u64) -> usize {
    (pos / TABLE_SPAN) as usize
}

fn write_disk_inode(device: &Device, sector: u64, disk: &DiskInode) -> Result<()> {
    let mut block = Block::new_zero(sector, SECTOR_SIZE);
    block.serialize_into(disk, 0)?;
    device.write_sector(&block)?;
    Ok(())
}

fn init_indirection_block(device: &Device, sector: u64) -> Result<()> {
    let mut block = Block::new_zero(sector, SECTOR_SIZE);
    block.serialize_into(&IndirectionBlock::default(), 0)?;
    device.write_sector(&block)?;
    Ok(())
}

/// Claim one more data sector for the indirection block at `ind_sector`,
/// zeroing its contents. Errors if the indirection block is already full.
fn add_sector(device: &Device, free_map: &FreeMap, ind_sector: u64) -> Result<()> {
    let block = device.read_sector(ind_sector)?;
    let mut table: IndirectionBlock = block.deserialize_from(0)?;
    if table.length as usize >= TABLE_SIZE {
        return Err(FsError::Invalid("indirection block has no free slots"));
    }
    let new_sector = free_map.allocate(1)?;
    table.sectors[table.length as usize] = new_sector;
    table.length += 1;

    let mut out = Block::new_zero(ind_sector, SECTOR_SIZE);
    out.serialize_into(&table, 0)?;
    device.write_sector(&out)?;
    device.write_sector(&Block::new_zero(new_sector, SECTOR_SIZE))?;
    Ok(())
}

fn fill_indirection_block(device: &Device, free_map: &FreeMap, ind_sector: u64) -> Result<()> {
    for _ in 0..TABLE_SIZE {
        add_sector(device, free_map, ind_sector)?;
    }
    Ok(())
}

fn explode_indirection_block(device: &Device, free_map: &FreeMap, ind_sector: u64) -> Result<()> {
    let block = device.read_sector(ind_sector)?;
    let table: IndirectionBlock = block.deserialize_from(0)?;
    for &sector in table.sectors.iter().take(table.length as usize) {
        free_map.release(sector, 1)?;
    }
    free_map.release(ind_sector, 1)?;
    Ok(())
}

/// An open inode: the cached on-disk header plus the bookkeeping needed to
/// serve concurrent readers/writers and to know when it's safe to free its
/// sectors.
#[derive(Debug)]
pub struct Inode<'a> {
    device: &'a Device,
    free_map: &'a FreeMap<'a>,
    /// Sector holding this inode's on-disk header.
    pub sector: u64,
    open_cnt: Mutex<u64>,
    deny_write_cnt: Mutex<u64>,
    removed: Mutex<bool>,
    /// Cached on-disk header (length, indirection table). Held across a
    /// single grow-and-flush, not across an entire read/write call.
    content: RwLock<DiskInode>,
    /// Coarser lock bracketing directory-entry lookups and mutations —
    /// the counterpart of acquiring/releasing a directory's reader-writer
    /// lock before scanning or rewriting its entry list.
    pub(crate) dir_lock: RwLock<()>,
}

impl<'a> Inode<'a> {
    fn load(device: &'a Device, free_map: &'a FreeMap<'a>, sector: u64) -> Result<Inode<'a>> {
        let block = device.read_sector(sector)?;
        let disk: DiskInode = block.deserialize_from(0)?;
        if disk.magic != INODE_MAGIC {
            return Err(FsError::NotAnInode(sector));
        }
        Ok(Inode {
            device,
            free_map,
            sector,
            open_cnt: Mutex::new(1),
            deny_write_cnt: Mutex::new(0),
            removed: Mutex::new(false),
            content: RwLock::new(disk),
            dir_lock: RwLock::new(()),
        })
    }

    /// Stamp a brand-new inode of `length` bytes into `sector`, allocating
    /// however many indirection blocks and data sectors it needs.
    fn create(
        device: &Device,
        free_map: &FreeMap,
        sector: u64,
        length: u64,
        is_dir: bool,
    ) -> Result<()> {
        let sectors = bytes_to_sectors(length);
        let num_tables = (sectors / TABLE_SIZE as u64) as usize;
        if num_tables >= NUM_TABLES {
            return Err(FsError::Invalid(
                "requested length exceeds what this inode layout can address",
            ));
        }

        let mut disk = DiskInode {
            length,
            magic: INODE_MAGIC,
            is_dir,
            parent_directory: sector,
            indirection: [0; NUM_TABLES],
        };

        for slot in disk.indirection.iter_mut().take(num_tables) {
            let ind_sector = free_map.allocate(1)?;
            *slot = ind_sector;
            init_indirection_block(device, ind_sector)?;
            fill_indirection_block(device, free_map, ind_sector)?;
        }

        // Every inode owns at least one indirection block, even an empty one.
        let last_sector = free_map.allocate(1)?;
        disk.indirection[num_tables] = last_sector;
        init_indirection_block(device, last_sector)?;
        let sectors_left = sectors - (num_tables as u64 * TABLE_SIZE as u64);
        for _ in 0..sectors_left {
            add_sector(device, free_map, last_sector)?;
        }

        write_disk_inode(device, sector, &disk)
    }

    /// Whether this inode represents a directory.
    pub fn is_dir(&self) -> bool {
        self.content.read().unwrap().is_dir
    }

    /// Current length in bytes.
    pub fn length(&self) -> u64 {
        self.content.read().unwrap().length
    }

    /// Sector of this inode's parent directory (the root is its own parent).
    pub fn parent_sector(&self) -> u64 {
        self.content.read().unwrap().parent_directory
    }

    /// Update this inode's recorded parent directory.
    pub fn set_parent_sector(&self, parent: u64) -> Result<()> {
        let mut disk = self.content.write().unwrap();
        disk.parent_directory = parent;
        write_disk_inode(self.device, self.sector, &disk)
    }

    fn byte_to_sector(&self, pos: u64) -> Result<Option<u64>> {
        let disk = self.content.read().unwrap();
        if pos >= disk.length {
            return Ok(None);
        }
        let ind_sector = disk.indirection[byte_to_i_block(pos)];
        drop(disk);
        let block = self.device.read_sector(ind_sector)?;
        let table: IndirectionBlock = block.deserialize_from(0)?;
        let idx = ((pos / SECTOR_SIZE) % TABLE_SIZE as u64) as usize;
        Ok(Some(table.sectors[idx]))
    }

    /// Grow this inode by `growth` bytes. At most one sector's worth of
    /// growth is supported per call — callers loop as needed.
    fn grow(&self, growth: u64) -> Result<()> {
        if growth > SECTOR_SIZE {
            return Err(FsError::Invalid(
                "cannot grow an inode by more than one sector per call",
            ));
        }
        let mut disk = self.content.write().unwrap();
        let old_len = disk.length;
        let new_len = old_len + growth;

        if bytes_to_sectors(old_len) == bytes_to_sectors(new_len) {
            disk.length = new_len;
            return write_disk_inode(self.device, self.sector, &disk);
        }

        let old_block = byte_to_i_block(old_len.saturating_sub(1));
        let new_block = byte_to_i_block(new_len - 1);

        if old_block == new_block {
            let ind_sector = disk.indirection[new_block];
            add_sector(self.device, self.free_map, ind_sector)?;
        } else {
            if new_block >= NUM_TABLES {
                return Err(FsError::Invalid(
                    "inode has reached its maximum addressable size",
                ));
            }
            let ind_sector = self.free_map.allocate(1)?;
            disk.indirection[new_block] = ind_sector;
            init_indirection_block(self.device, ind_sector)?;
            add_sector(self.device, self.free_map, ind_sector)?;
        }

        disk.length = new_len;
        write_disk_inode(self.device, self.sector, &disk)
    }

    /// Read up to `buf.len()` bytes starting at `offset`, returning the
    /// number of bytes actually read (short if `offset` runs past EOF).
    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<u64> {
        let mut bytes_read = 0u64;
        let mut pos = offset;
        while (bytes_read as usize) < buf.len() {
            let sector = match self.byte_to_sector(pos)? {
                Some(s) => s,
                None => break,
            };
            let sector_ofs = pos % SECTOR_SIZE;
            let inode_left = self.length().saturating_sub(pos);
            let sector_left = SECTOR_SIZE - sector_ofs;
            let remaining = buf.len() as u64 - bytes_read;
            let chunk = remaining.min(inode_left).min(sector_left);
            if chunk == 0 {
                break;
            }
            let block = self.device.read_sector(sector)?;
            let dst = &mut buf[bytes_read as usize..(bytes_read + chunk) as usize];
            block.read_data(dst, sector_ofs)?;
            pos += chunk;
            bytes_read += chunk;
        }
        Ok(bytes_read)
    }

    /// Write `data` starting at `offset`, growing the inode one sector at a
    /// time as needed. Returns 0 without writing anything if writes are
    /// currently denied.
    pub fn write_at(&self, data: &[u8], offset: u64) -> Result<u64> {
        if self.write_denied() {
            return Ok(0);
        }

        while offset + data.len() as u64 > self.length() {
            let deficit = offset + data.len() as u64 - self.length();
            if self.grow(deficit.min(SECTOR_SIZE)).is_err() {
                // Allocation failed partway through growth: report the bytes
                // actually written so far (none yet, growth runs before any
                // write lands) rather than failing the whole call.
                return Ok(0);
            }
        }

        let mut bytes_written = 0u64;
        let mut pos = offset;
        while (bytes_written as usize) < data.len() {
            let sector_ofs = pos % SECTOR_SIZE;
            let sector_left = SECTOR_SIZE - sector_ofs;
            let remaining = data.len() as u64 - bytes_written;
            let chunk = remaining.min(sector_left);
            if chunk == 0 {
                break;
            }
            let sector = self
                .byte_to_sector(pos)?
                .ok_or(FsError::Invalid("write target sector is not allocated"))?;
            let mut block = if sector_ofs > 0 || chunk < SECTOR_SIZE {
                self.device.read_sector(sector)?
            } else {
                Block::new_zero(sector, SECTOR_SIZE)
            };
            let src = &data[bytes_written as usize..(bytes_written + chunk) as usize];
            block.write_data(src, sector_ofs)?;
            self.device.write_sector(&block)?;
            pos += chunk;
            bytes_written += chunk;
        }
        Ok(bytes_written)
    }

    /// Forbid writes to this inode. Errors on a directory: a directory's
    /// write-deny state has nothing to guard (executables are the only
    /// thing this brackets), so silently accepting it would be misleading.
    pub fn deny_write(&self) -> Result<()> {
        if self.is_dir() {
            return Err(FsError::Invalid("cannot deny writes on a directory"));
        }
        *self.deny_write_cnt.lock().unwrap() += 1;
        Ok(())
    }

    /// Undo one `deny_write`. A no-op on directories, matching `deny_write`
    /// never having taken effect on one.
    pub fn allow_write(&self) {
        if self.is_dir() {
            return;
        }
        let mut cnt = self.deny_write_cnt.lock().unwrap();
        *cnt = cnt.saturating_sub(1);
    }

    /// True if at least one opener currently denies writes to this inode.
    pub fn write_denied(&self) -> bool {
        *self.deny_write_cnt.lock().unwrap() > 0
    }

    /// Number of live openers of this inode.
    pub fn open_count(&self) -> u64 {
        *self.open_cnt.lock().unwrap()
    }

    fn free_all_sectors(&self) -> Result<()> {
        let disk = self.content.read().unwrap();
        for &ind_sector in disk.indirection.iter().filter(|&&s| s != 0) {
            explode_indirection_block(self.device, self.free_map, ind_sector)?;
        }
        Ok(())
    }
}

/// Registry of currently-open inodes, keyed by sector, so that opening the
/// same sector twice hands back the same in-memory inode instead of two
/// independent caches of the same data.
#[derive(Debug)]
pub struct InodeTable<'a> {
    device: &'a Device,
    free_map: &'a FreeMap<'a>,
    open_inodes: Mutex<HashMap<u64, Arc<Inode<'a>>>>,
}

impl<'a> InodeTable<'a> {
    /// Build an empty registry over `device`/`free_map`.
    pub fn new(device: &'a Device, free_map: &'a FreeMap<'a>) -> InodeTable<'a> {
        InodeTable {
            device,
            free_map,
            open_inodes: Mutex::new(HashMap::new()),
        }
    }

    /// Stamp a new inode into `sector`. Does not open it.
    pub fn create(&self, sector: u64, length: u64, is_dir: bool) -> Result<()> {
        Inode::create(self.device, self.free_map, sector, length, is_dir)
    }

    /// Open the inode at `sector`, reusing the shared in-memory copy (and
    /// bumping its open count) if it's already open.
    pub fn open(&self, sector: u64) -> Result<Arc<Inode<'a>>> {
        let mut table = self.open_inodes.lock().unwrap();
        if let Some(existing) = table.get(&sector) {
            *existing.open_cnt.lock().unwrap() += 1;
            return Ok(Arc::clone(existing));
        }
        let inode = Arc::new(Inode::load(self.device, self.free_map, sector)?);
        table.insert(sector, Arc::clone(&inode));
        Ok(inode)
    }

    /// Release one opener's hold on `inode`. Once the last opener closes
    /// it, it's dropped from the registry; if it was also marked removed,
    /// its sectors are freed.
    pub fn close(&self, inode: Arc<Inode<'a>>) -> Result<()> {
        let mut table = self.open_inodes.lock().unwrap();
        let remaining = {
            let mut cnt = inode.open_cnt.lock().unwrap();
            *cnt -= 1;
            *cnt
        };
        if remaining == 0 {
            table.remove(&inode.sector);
            drop(table);
            if *inode.removed.lock().unwrap() {
                inode.free_all_sectors()?;
                self.free_map.release(inode.sector, 1)?;
            }
        }
        Ok(())
    }

    /// Mark `inode` for deletion once its last opener closes it.
    pub fn mark_removed(&self, inode: &Inode<'a>) {
        *inode.removed.lock().unwrap() = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fs_api::types::ROOT_DIR_SECTOR;
    use std::fs::{create_dir_all, remove_dir, remove_file};
    use std::path::PathBuf;

    fn disk_prep_path(name: &str) -> PathBuf {
        let mut path = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
        path.push("fs-images-inode-".to_string() + name);
        path.push("img");
        if path.exists() {
            remove_file(&path).unwrap();
        }
        create_dir_all(path.parent().unwrap()).unwrap();
        path
    }

    fn teardown(path: &PathBuf) {
        if path.exists() {
            remove_file(path).unwrap();
        }
        let _ = remove_dir(path.parent().unwrap());
    }

    #[test]
    fn create_open_read_write_roundtrip() {
        let path = disk_prep_path("rw");
        let device = Device::new(&path, SECTOR_SIZE, 64).unwrap();
        let free_map = FreeMap::create(&device, 2).unwrap();
        let table = InodeTable::new(&device, &free_map);

        table.create(ROOT_DIR_SECTOR, 0, false).unwrap();
        let inode = table.open(ROOT_DIR_SECTOR).unwrap();
        assert_eq!(inode.length(), 0);

        let data = b"hello, filesystem";
        let written = inode.write_at(data, 0).unwrap();
        assert_eq!(written as usize, data.len());
        assert_eq!(inode.length(), data.len() as u64);

        let mut readback = vec![0u8; data.len()];
        let read = inode.read_at(&mut readback, 0).unwrap();
        assert_eq!(read as usize, data.len());
        assert_eq!(&readback, data);

        table.close(inode).unwrap();
        teardown(&path);
    }

    #[test]
    fn growth_crosses_into_second_indirection_block() {
        let path = disk_prep_path("grow");
        let device = Device::new(&path, SECTOR_SIZE, (TABLE_SIZE as u64) * 3 + 16).unwrap();
        let free_map = FreeMap::create(&device, 2).unwrap();
        let table = InodeTable::new(&device, &free_map);

        table.create(ROOT_DIR_SECTOR, 0, false).unwrap();
        let inode = table.open(ROOT_DIR_SECTOR).unwrap();

        let big_len = TABLE_SPAN + SECTOR_SIZE * 3;
        let chunk = vec![7u8; SECTOR_SIZE as usize];
        let mut offset = 0u64;
        while offset < big_len {
            inode.write_at(&chunk, offset).unwrap();
            offset += SECTOR_SIZE;
        }
        assert_eq!(inode.length(), big_len);

        let mut readback = vec![0u8; SECTOR_SIZE as usize];
        inode.read_at(&mut readback, big_len - SECTOR_SIZE).unwrap();
        assert_eq!(readback, chunk);

        table.close(inode).unwrap();
        teardown(&path);
    }

    #[test]
    fn deny_write_blocks_writes() {
        let path = disk_prep_path("deny");
        let device = Device::new(&path, SECTOR_SIZE, 16).unwrap();
        let free_map = FreeMap::create(&device, 2).unwrap();
        let table = InodeTable::new(&device, &free_map);

        table.create(ROOT_DIR_SECTOR, 0, false).unwrap();
        let inode = table.open(ROOT_DIR_SECTOR).unwrap();
        inode.deny_write().unwrap();
        assert_eq!(inode.write_at(b"nope", 0).unwrap(), 0);
        inode.allow_write();
        assert_eq!(inode.write_at(b"ok", 0).unwrap() as usize, 2);

        table.close(inode).unwrap();
        teardown(&path);
    }

    #[test]
    fn write_returns_zero_rather_than_erroring_when_growth_runs_out_of_space() {
        let path = disk_prep_path("grow-nospace");
        // Sector 0 is the free-map, sector 1 the inode, sector 2 its one
        // indirection block: the free-map is already exhausted once
        // `create` returns, so any write that needs to grow has nowhere
        // left to allocate from.
        let device = Device::new(&path, SECTOR_SIZE, 3).unwrap();
        let free_map = FreeMap::create(&device, 2).unwrap();
        let table = InodeTable::new(&device, &free_map);

        table.create(ROOT_DIR_SECTOR, 0, false).unwrap();
        let inode = table.open(ROOT_DIR_SECTOR).unwrap();

        let written = inode.write_at(b"no room", 0).unwrap();
        assert_eq!(written, 0, "growth failure should short-circuit to Ok(0), not Err");
        assert_eq!(inode.length(), 0, "a failed growth must not record a new length");

        table.close(inode).unwrap();
        teardown(&path);
    }

    #[test]
    fn remove_frees_sectors_only_after_last_close() {
        let path = disk_prep_path("remove");
        let device = Device::new(&path, SECTOR_SIZE, 16).unwrap();
        let free_map = FreeMap::create(&device, 2).unwrap();
        let table = InodeTable::new(&device, &free_map);

        table.create(ROOT_DIR_SECTOR, 0, false).unwrap();
        let first = table.open(ROOT_DIR_SECTOR).unwrap();
        let second = table.open(ROOT_DIR_SECTOR).unwrap();
        table.mark_removed(&first);

        table.close(first).unwrap();
        assert!(free_map.is_used(ROOT_DIR_SECTOR));

        table.close(second).unwrap();
        assert!(!free_map.is_used(ROOT_DIR_SECTOR));

        teardown(&path);
    }
}
