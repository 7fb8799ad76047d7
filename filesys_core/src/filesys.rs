//! Top-level filesystem facade: formatting, and the `create`/`open`/
//! `remove`/`change_dir` operations that resolve a path against either the
//! root (absolute paths) or a caller-supplied current directory (relative
//! paths) before delegating to the directory layer.

use fs_api::controller::Device;
use fs_api::freemap::FreeMap;
use fs_api::types::ROOT_DIR_SECTOR;
use std::sync::Arc;

use crate::directory::{self, Directory};
use crate::error::{FsError, Result};
use crate::inode::{Inode, InodeTable};

/// Split a path into its parent path and final component, the way
/// `a/b/c` becomes (`a/b`, `c`) and `name` (no separator) becomes
/// (``, `name`).
fn split_path(path: &str) -> (String, String) {
    let bytes = path.as_bytes();
    let mut prev = 0usize;
    for (i, &b) in bytes.iter().enumerate() {
        if b == b'/' {
            prev = i;
        }
    }
    let leaf = if bytes.get(prev) == Some(&b'/') {
        path[prev + 1..].to_string()
    } else {
        path[prev..].to_string()
    };
    let mut parent = path.to_string();
    parent.truncate(prev);
    (parent, leaf)
}

/// The filesystem core: a sector device, its free-sector map, and the
/// open-inode registry built on top of them.
pub struct Filesystem<'a> {
    free_map: &'a FreeMap<'a>,
    inodes: InodeTable<'a>,
}

impl<'a> Filesystem<'a> {
    /// Mount an already-formatted device.
    pub fn new(device: &'a Device, free_map: &'a FreeMap<'a>) -> Filesystem<'a> {
        Filesystem {
            free_map,
            inodes: InodeTable::new(device, free_map),
        }
    }

    /// Format `device`: lay down a fresh free-map and an empty root
    /// directory. Reserves sectors 0 (free-map) and 1 (root directory).
    pub fn format(device: &'a Device, free_map: &'a FreeMap<'a>) -> Result<Filesystem<'a>> {
        let inodes = InodeTable::new(device, free_map);
        directory::create(&inodes, ROOT_DIR_SECTOR, 16)?;
        let root = inodes.open(ROOT_DIR_SECTOR)?;
        root.set_parent_sector(ROOT_DIR_SECTOR)?;
        inodes.close(root)?;
        free_map.flush()?;
        Ok(Filesystem { free_map, inodes })
    }

    /// The open-inode registry backing this filesystem.
    pub fn inodes(&self) -> &InodeTable<'a> {
        &self.inodes
    }

    /// Open the root directory.
    pub fn root(&self) -> Result<Directory<'a>> {
        directory::open_root(&self.inodes)
    }

    fn start_dir(&self, cwd: &Directory<'a>, path: &str) -> Result<Directory<'a>> {
        let sector = if path.starts_with('/') {
            ROOT_DIR_SECTOR
        } else {
            cwd.inode.sector
        };
        Ok(Directory::new(self.inodes.open(sector)?))
    }

    /// Resolve `parent_path` (relative to whichever of root/cwd `start`
    /// already is) into the directory a new entry should be added to or
    /// removed from, consuming `start`.
    fn resolve_parent(&self, start: Directory<'a>, parent_path: &str) -> Result<Directory<'a>> {
        if parent_path.is_empty() {
            return Ok(start);
        }
        let inode = directory::resolve_path(&self.inodes, &start, parent_path)?;
        self.inodes.close(start.inode)?;
        if !inode.is_dir() {
            self.inodes.close(inode)?;
            return Err(FsError::WrongType("path component is not a directory"));
        }
        Ok(Directory::new(inode))
    }

    /// Create a new, empty regular file named by `path`.
    pub fn create(&self, cwd: &Directory<'a>, path: &str, initial_size: u64) -> Result<()> {
        let (parent_path, leaf) = split_path(path);
        if leaf.is_empty() {
            return Err(FsError::InvalidPath("missing file name"));
        }
        let start = self.start_dir(cwd, path)?;
        let parent_dir = self.resolve_parent(start, &parent_path)?;

        let sector = self.free_map.allocate(1)?;
        let result = self
            .inodes
            .create(sector, initial_size, false)
            .and_then(|_| directory::add(&self.inodes, &parent_dir, &leaf, sector));
        if result.is_err() {
            let _ = self.free_map.release(sector, 1);
        }
        self.inodes.close(parent_dir.inode)?;
        result
    }

    /// Create a new, empty directory named by `path`.
    pub fn mkdir(&self, cwd: &Directory<'a>, path: &str) -> Result<()> {
        let (parent_path, leaf) = split_path(path);
        if leaf.is_empty() {
            return Err(FsError::InvalidPath("missing directory name"));
        }
        let start = self.start_dir(cwd, path)?;
        let parent_dir = self.resolve_parent(start, &parent_path)?;

        let sector = self.free_map.allocate(1)?;
        let result = directory::create(&self.inodes, sector, 16)
            .and_then(|_| directory::add(&self.inodes, &parent_dir, &leaf, sector));
        if result.is_err() {
            let _ = self.free_map.release(sector, 1);
        }
        self.inodes.close(parent_dir.inode)?;
        result
    }

    /// Resolve `path` (relative to `cwd` unless absolute) to its open
    /// inode. The caller owns the returned inode.
    pub fn open(&self, cwd: &Directory<'a>, path: &str) -> Result<Arc<Inode<'a>>> {
        if path.is_empty() {
            return Err(FsError::InvalidPath("empty path"));
        }
        let start = self.start_dir(cwd, path)?;
        let inode = directory::resolve_path(&self.inodes, &start, path)?;
        self.inodes.close(start.inode)?;
        Ok(inode)
    }

    /// Remove the entry named by `path`.
    pub fn remove(&self, cwd: &Directory<'a>, path: &str) -> Result<()> {
        let (parent_path, leaf) = split_path(path);
        if leaf.is_empty() {
            return Err(FsError::InvalidPath("missing name"));
        }
        let start = self.start_dir(cwd, path)?;
        let parent_dir = self.resolve_parent(start, &parent_path)?;
        let result = directory::remove(&self.inodes, &parent_dir, &leaf);
        self.inodes.close(parent_dir.inode)?;
        result
    }

    /// Resolve `path` to a directory and hand back a fresh handle onto it.
    /// The caller is responsible for closing its old current directory and
    /// swapping this one in (see [`crate::task::Task::change_dir`]).
    pub fn change_dir(&self, cwd: &Directory<'a>, path: &str) -> Result<Directory<'a>> {
        if path.is_empty() {
            return Err(FsError::InvalidPath("empty path"));
        }
        let start = self.start_dir(cwd, path)?;
        let inode = directory::resolve_path(&self.inodes, &start, path)?;
        self.inodes.close(start.inode)?;
        if !inode.is_dir() {
            self.inodes.close(inode)?;
            return Err(FsError::WrongType("not a directory"));
        }
        Ok(Directory::new(inode))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fs_api::types::SECTOR_SIZE;
    use std::fs::{create_dir_all, remove_dir, remove_file};
    use std::path::PathBuf;

    fn disk_prep_path(name: &str) -> PathBuf {
        let mut path = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
        path.push("fs-images-filesys-".to_string() + name);
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
    fn split_path_cases() {
        assert_eq!(split_path("foo.txt"), ("".to_string(), "foo.txt".to_string()));
        assert_eq!(split_path("/foo.txt"), ("".to_string(), "foo.txt".to_string()));
        assert_eq!(split_path("a/b/c"), ("a/b".to_string(), "c".to_string()));
    }

    #[test]
    fn format_create_write_read() {
        let path = disk_prep_path("basic");
        let device = Device::new(&path, SECTOR_SIZE, 128).unwrap();
        let free_map = FreeMap::create(&device, 2).unwrap();
        let fs = Filesystem::format(&device, &free_map).unwrap();

        let root = fs.root().unwrap();
        fs.create(&root, "greeting.txt", 0).unwrap();
        let inode = fs.open(&root, "greeting.txt").unwrap();
        inode.write_at(b"hi", 0).unwrap();
        let mut buf = [0u8; 2];
        inode.read_at(&mut buf, 0).unwrap();
        assert_eq!(&buf, b"hi");
        fs.inodes().close(inode).unwrap();

        root.close(fs.inodes()).unwrap();
        teardown(&path);
    }

    #[test]
    fn mkdir_chdir_and_remove() {
        let path = disk_prep_path("dirs");
        let device = Device::new(&path, SECTOR_SIZE, 128).unwrap();
        let free_map = FreeMap::create(&device, 2).unwrap();
        let fs = Filesystem::format(&device, &free_map).unwrap();

        let root = fs.root().unwrap();
        fs.mkdir(&root, "sub").unwrap();
        let sub = fs.change_dir(&root, "sub").unwrap();

        fs.create(&sub, "inside.txt", 0).unwrap();
        assert!(fs.open(&sub, "inside.txt").is_ok());

        // removing a non-empty directory must fail
        assert!(fs.remove(&root, "sub").is_err());

        fs.remove(&sub, "inside.txt").unwrap();
        sub.close(fs.inodes()).unwrap();
        fs.remove(&root, "sub").unwrap();

        root.close(fs.inodes()).unwrap();
        teardown(&path);
    }
}
