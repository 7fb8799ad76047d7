//! Directories: fixed-size arrays of [`DirEntry`] slots stored in an
//! inode's data, plus the path resolver built on top of them.
//!
//! `.` and `..` are never stored as entries. Looking either up instead
//! reads straight through to the inode's recorded parent (and
//! grandparent), matching how `struct dir_entry` never reserves slots for
//! them — the root directory's parent points back to itself, so `..` at
//! the root resolves to the root.

use fs_api::types::{DirEntry, DIR_ENTRY_SIZE, ROOT_DIR_SECTOR};
use relative_path::{Component, RelativePath};
use std::sync::{Arc, Mutex};

use crate::error::{FsError, Result};
use crate::inode::{Inode, InodeTable};

/// An open directory: a handle onto a directory inode, used to walk and
/// mutate its entry list. Sequential [`read_dir`] scanning is driven by a
/// cursor owned by whatever handle table the caller opened this directory
/// through (see [`crate::handle::FileHandle::pos`]), not by this struct —
/// two independent `Directory` values onto the same inode share no state
/// beyond the inode itself.
#[derive(Debug)]
pub struct Directory<'a> {
    /// The underlying directory inode.
    pub inode: Arc<Inode<'a>>,
}

impl<'a> Directory<'a> {
    /// Wrap an already-open inode as a directory handle.
    pub fn new(inode: Arc<Inode<'a>>) -> Directory<'a> {
        Directory { inode }
    }

    fn borrow(inode: &Arc<Inode<'a>>) -> Directory<'a> {
        Directory::new(Arc::clone(inode))
    }

    /// Close this directory's underlying inode.
    pub fn close(self, table: &InodeTable<'a>) -> Result<()> {
        table.close(self.inode)
    }
}

fn read_entry(inode: &Inode, ofs: u64) -> Result<Option<DirEntry>> {
    let entry_size = *DIR_ENTRY_SIZE as usize;
    let mut buf = vec![0u8; entry_size];
    let n = inode.read_at(&mut buf, ofs)?;
    if n as usize != entry_size {
        return Ok(None);
    }
    Ok(Some(bincode::deserialize(&buf)?))
}

fn write_entry(inode: &Inode, ofs: u64, entry: &DirEntry) -> Result<()> {
    let bytes = bincode::serialize(entry)?;
    let n = inode.write_at(&bytes, ofs)?;
    if n as usize != bytes.len() {
        return Err(FsError::Invalid("short directory-entry write"));
    }
    Ok(())
}

fn scan(inode: &Inode, mut matches: impl FnMut(&DirEntry) -> bool) -> Result<Option<(DirEntry, u64)>> {
    let entry_size = *DIR_ENTRY_SIZE;
    let mut ofs = 0u64;
    loop {
        match read_entry(inode, ofs)? {
            None => return Ok(None),
            Some(e) => {
                if e.in_use && matches(&e) {
                    return Ok(Some((e, ofs)));
                }
            }
        }
        ofs += entry_size;
    }
}

fn has_any_entry(inode: &Inode) -> Result<bool> {
    Ok(scan(inode, |_| true)?.is_some())
}

/// Look up `name` within `dir`, without taking `dir`'s directory lock —
/// callers bracket the call themselves so lookup-then-mutate sequences can
/// hold a single lock across both steps.
fn raw_lookup<'a>(
    table: &InodeTable<'a>,
    dir: &Directory<'a>,
    name: &str,
) -> Result<Option<(DirEntry, u64)>> {
    if name.is_empty() || name == "." {
        let parent = table.open(dir.inode.parent_sector())?;
        let target_sector = dir.inode.sector;
        let result = scan(&parent, |e| e.inode_sector == target_sector)?;
        table.close(parent)?;
        return Ok(result);
    }
    if name == ".." {
        let parent = table.open(dir.inode.parent_sector())?;
        let grandparent = table.open(parent.parent_sector())?;
        let parent_sector = parent.sector;
        let result = scan(&grandparent, |e| e.inode_sector == parent_sector)?;
        table.close(parent)?;
        table.close(grandparent)?;
        return Ok(result);
    }
    scan(&dir.inode, |e| e.name_str() == name)
}

/// Look up a single path component, same as [`raw_lookup`], but bracketed
/// by `dir`'s reader lock — the normal way to call it.
fn lookup<'a>(
    table: &InodeTable<'a>,
    dir: &Directory<'a>,
    name: &str,
) -> Result<Option<(DirEntry, u64)>> {
    let _guard = dir.inode.dir_lock.read().unwrap();
    raw_lookup(table, dir, name)
}

/// Stamp a fresh, empty directory (space for `entry_cnt` entries) into
/// `sector`.
pub fn create<'a>(table: &InodeTable<'a>, sector: u64, entry_cnt: u64) -> Result<()> {
    table.create(sector, entry_cnt * (*DIR_ENTRY_SIZE), true)
}

/// Open the root directory.
pub fn open_root<'a>(table: &InodeTable<'a>) -> Result<Directory<'a>> {
    Ok(Directory::new(table.open(ROOT_DIR_SECTOR)?))
}

/// Resolve a `/`-separated path starting from `start`, returning the open
/// inode it names. The caller owns the returned inode and must eventually
/// close it through `table`.
pub fn resolve_path<'a>(
    table: &InodeTable<'a>,
    start: &Directory<'a>,
    path: &str,
) -> Result<Arc<Inode<'a>>> {
    let mut current = table.open(start.inode.sector)?;
    for component in RelativePath::new(path).components() {
        let token = match component {
            Component::CurDir => ".",
            Component::ParentDir => "..",
            Component::Normal(name) => name,
        };
        let current_dir = Directory::borrow(&current);
        match lookup(table, &current_dir, token)? {
            Some((entry, _)) => {
                let next = table.open(entry.inode_sector)?;
                table.close(current)?;
                current = next;
            }
            None => {
                table.close(current)?;
                return Err(FsError::NotFound(token.to_string()));
            }
        }
    }
    Ok(current)
}

/// Add a `name -> inode_sector` entry to `dir`. Fails if `name` is already
/// in use, empty, or too long.
pub fn add<'a>(table: &InodeTable<'a>, dir: &Directory<'a>, name: &str, inode_sector: u64) -> Result<()> {
    let record =
        DirEntry::new(inode_sector, name).ok_or(FsError::InvalidPath("name is empty or too long"))?;

    {
        let _r = dir.inode.dir_lock.read().unwrap();
        if raw_lookup(table, dir, name)?.is_some() {
            return Err(FsError::AlreadyExists(name.to_string()));
        }
    }

    let _w = dir.inode.dir_lock.write().unwrap();
    let entry_size = *DIR_ENTRY_SIZE;
    let mut ofs = 0u64;
    let slot = loop {
        match read_entry(&dir.inode, ofs)? {
            Some(e) if !e.in_use => break ofs,
            Some(_) => ofs += entry_size,
            None => break ofs,
        }
    };
    write_entry(&dir.inode, slot, &record)?;

    let child = table.open(inode_sector)?;
    let set_result = child.set_parent_sector(dir.inode.sector);
    table.close(child)?;
    set_result
}

/// Remove the entry named `name` from `dir`. Fails if it doesn't exist, or
/// (for a directory entry) if the target is still open elsewhere or still
/// has entries of its own.
pub fn remove<'a>(table: &InodeTable<'a>, dir: &Directory<'a>, name: &str) -> Result<()> {
    let (entry, ofs) = {
        let _r = dir.inode.dir_lock.read().unwrap();
        raw_lookup(table, dir, name)?.ok_or_else(|| FsError::NotFound(name.to_string()))?
    };

    let target = table.open(entry.inode_sector)?;
    let outcome = (|| -> Result<()> {
        let _w = target.dir_lock.write().unwrap();
        if target.is_dir() {
            if target.open_count() > 1 {
                return Err(FsError::Busy(name.to_string()));
            }
            if has_any_entry(&target)? {
                return Err(FsError::NotEmpty(name.to_string()));
            }
        }

        let mut gone = entry.clone();
        gone.in_use = false;
        write_entry(&dir.inode, ofs, &gone)?;
        table.mark_removed(&target);
        Ok(())
    })();
    table.close(target)?;
    outcome
}

/// Advance `cursor` over `inode`'s entries and return the next live entry's
/// name, or `None` once the directory is exhausted. `cursor` is whatever
/// byte-offset cursor the caller's handle carries (see
/// [`crate::handle::FileTable::read_dir`]) — not restartable except by
/// resetting it to 0.
pub fn read_dir(inode: &Inode, cursor: &Mutex<u64>) -> Result<Option<String>> {
    let entry_size = *DIR_ENTRY_SIZE;
    let mut pos = cursor.lock().unwrap();
    loop {
        match read_entry(inode, *pos)? {
            None => return Ok(None),
            Some(e) => {
                *pos += entry_size;
                if e.in_use {
                    return Ok(Some(e.name_str()));
                }
            }
        }
    }
}
