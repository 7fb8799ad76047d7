//! Per-task file-descriptor table.
//!
//! Descriptors below [`RESERVED_FDS`] are reserved (conventionally for
//! stdin/stdout) and never handed out; the lowest free slot at or above
//! that is allocated on each `insert`, mirroring a fixed `open_files[]`
//! array scanned from its first non-reserved index.

use std::sync::{Arc, Mutex};

use crate::directory;
use crate::error::{FsError, Result};
use crate::inode::Inode;

/// Lowest descriptor number ever handed out by [`FileTable::insert`].
pub const RESERVED_FDS: u64 = 2;

/// Maximum number of non-reserved descriptors a single task's table holds.
pub const MAX_FILES: u64 = 128;

/// A single open file-or-directory handle: the inode it names, whether
/// that inode is a directory, and an independent byte/entry cursor.
#[derive(Debug)]
pub struct FileHandle<'a> {
    /// The inode this handle was opened against.
    pub inode: Arc<Inode<'a>>,
    /// Cached at open time so callers can dispatch file vs. directory
    /// operations without re-reading the inode header.
    pub is_dir: bool,
    /// Byte offset (files) or entry count (directories) read/write cursor.
    pub pos: Mutex<u64>,
}

/// Fixed-slot table of open file handles, indexed by file descriptor.
#[derive(Debug)]
pub struct FileTable<'a> {
    slots: Mutex<Vec<Option<FileHandle<'a>>>>,
}

impl<'a> FileTable<'a> {
    /// An empty file table.
    pub fn new() -> FileTable<'a> {
        FileTable {
            slots: Mutex::new(Vec::new()),
        }
    }

    /// Install `inode` as a newly opened handle, returning its descriptor.
    /// Errors with [`FsError::HandleTableFull`] once [`MAX_FILES`]
    /// descriptors are already in use.
    pub fn insert(&self, inode: Arc<Inode<'a>>) -> Result<u64> {
        let is_dir = inode.is_dir();
        let handle = FileHandle {
            inode,
            is_dir,
            pos: Mutex::new(0),
        };
        let mut slots = self.slots.lock().unwrap();
        for (i, slot) in slots.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(handle);
                return Ok(i as u64 + RESERVED_FDS);
            }
        }
        if slots.len() as u64 >= MAX_FILES {
            return Err(FsError::HandleTableFull);
        }
        slots.push(Some(handle));
        Ok((slots.len() - 1) as u64 + RESERVED_FDS)
    }

    fn index_of(fd: u64) -> Result<usize> {
        fd.checked_sub(RESERVED_FDS)
            .map(|i| i as usize)
            .ok_or(FsError::BadHandle(fd))
    }

    /// Remove and return the handle at `fd`, freeing its descriptor for
    /// reuse. The caller is responsible for closing the returned handle's
    /// inode.
    pub fn take(&self, fd: u64) -> Result<FileHandle<'a>> {
        let idx = Self::index_of(fd)?;
        let mut slots = self.slots.lock().unwrap();
        slots
            .get_mut(idx)
            .and_then(Option::take)
            .ok_or(FsError::BadHandle(fd))
    }

    /// Run `f` against the handle at `fd` while holding the table lock.
    pub fn with_handle<T>(&self, fd: u64, f: impl FnOnce(&FileHandle<'a>) -> Result<T>) -> Result<T> {
        let idx = Self::index_of(fd)?;
        let slots = self.slots.lock().unwrap();
        let handle = slots
            .get(idx)
            .and_then(Option::as_ref)
            .ok_or(FsError::BadHandle(fd))?;
        f(handle)
    }

    /// Advance the directory cursor of the handle at `fd` and return the
    /// next live entry's name, or `None` once exhausted. Fails with
    /// [`FsError::WrongType`] if `fd` doesn't name a directory.
    pub fn read_dir(&self, fd: u64) -> Result<Option<String>> {
        self.with_handle(fd, |handle| {
            if !handle.is_dir {
                return Err(FsError::WrongType("fd does not name a directory"));
            }
            directory::read_dir(&handle.inode, &handle.pos)
        })
    }

    /// Remove every still-open handle, freeing all descriptors at once.
    /// Used when a task exits, so its remaining handles can be closed
    /// through the inode registry.
    pub fn drain(&self) -> Vec<FileHandle<'a>> {
        let mut slots = self.slots.lock().unwrap();
        slots.iter_mut().filter_map(Option::take).collect()
    }
}

impl<'a> Default for FileTable<'a> {
    fn default() -> Self {
        FileTable::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filesys::Filesystem;
    use fs_api::controller::Device;
    use fs_api::freemap::FreeMap;
    use fs_api::types::SECTOR_SIZE;
    use std::fs::{create_dir_all, remove_dir, remove_file};
    use std::path::PathBuf;

    fn disk_prep_path(name: &str) -> PathBuf {
        let mut path = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
        path.push("fs-images-handle-".to_string() + name);
        path.push("img");
        if path.exists() {
            remove_file(&path).unwrap();
        }
        create_dir_all(path.parent().unwrap()).unwrap();
        path
    }

    #[test]
    fn fd_allocation_reuses_lowest_free_slot() {
        let path = disk_prep_path("fds");
        let device = Device::new(&path, SECTOR_SIZE, 64).unwrap();
        let free_map = FreeMap::create(&device, 2).unwrap();
        let fs = Filesystem::format(&device, &free_map).unwrap();
        let root = fs.root().unwrap();

        fs.create(&root, "a.txt", 0).unwrap();
        fs.create(&root, "b.txt", 0).unwrap();

        let table = FileTable::new();
        let fd_a = table.insert(fs.open(&root, "a.txt").unwrap()).unwrap();
        let fd_b = table.insert(fs.open(&root, "b.txt").unwrap()).unwrap();
        assert_eq!(fd_a, RESERVED_FDS);
        assert_eq!(fd_b, RESERVED_FDS + 1);

        let handle_a = table.take(fd_a).unwrap();
        fs.inodes().close(handle_a.inode).unwrap();

        let fd_c = table.insert(fs.open(&root, "a.txt").unwrap()).unwrap();
        assert_eq!(fd_c, fd_a, "freed slot should be reused before growing the table");

        let handle_b = table.take(fd_b).unwrap();
        fs.inodes().close(handle_b.inode).unwrap();
        let handle_c = table.take(fd_c).unwrap();
        fs.inodes().close(handle_c.inode).unwrap();

        root.close(fs.inodes()).unwrap();
        if path.exists() {
            remove_file(&path).unwrap();
        }
        let _ = remove_dir(path.parent().unwrap());
    }
}
