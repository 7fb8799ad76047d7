//! Per-task state: the current working directory and open-file table a
//! caller of this crate threads through its own notion of a process.

use std::sync::Mutex;

use crate::directory::Directory;
use crate::error::Result;
use crate::filesys::Filesystem;
use crate::handle::FileTable;

/// Holds one task's current directory and file descriptors. A `Task`
/// owns its current-directory handle for as long as it lives; dropping it
/// without closing first leaks that directory's open count, so callers
/// should go through [`Task::close`].
pub struct Task<'a> {
    cwd: Mutex<Directory<'a>>,
    /// This task's open file-and-directory handles.
    pub files: FileTable<'a>,
}

impl<'a> Task<'a> {
    /// Start a task with `cwd` (often the root directory) as its current
    /// directory.
    pub fn new(cwd: Directory<'a>) -> Task<'a> {
        Task {
            cwd: Mutex::new(cwd),
            files: FileTable::new(),
        }
    }

    /// Change this task's current directory to the one named by `path`,
    /// closing the old one. Leaves the current directory untouched on
    /// error.
    pub fn change_dir(&self, fs: &Filesystem<'a>, path: &str) -> Result<()> {
        let mut cwd = self.cwd.lock().unwrap();
        let new_dir = fs.change_dir(&cwd, path)?;
        let old = std::mem::replace(&mut *cwd, new_dir);
        old.close(fs.inodes())
    }

    /// Run `f` with a reference to the current directory.
    pub fn with_cwd<T>(&self, f: impl FnOnce(&Directory<'a>) -> T) -> T {
        let cwd = self.cwd.lock().unwrap();
        f(&cwd)
    }

    /// Tear down this task: close its current directory and every handle
    /// still open in its file table.
    pub fn close(self, fs: &Filesystem<'a>) -> Result<()> {
        for handle in self.files.drain() {
            fs.inodes().close(handle.inode)?;
        }
        self.cwd.into_inner().unwrap().close(fs.inodes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fs_api::controller::Device;
    use fs_api::freemap::FreeMap;
    use fs_api::types::SECTOR_SIZE;
    use std::fs::{create_dir_all, remove_dir, remove_file};
    use std::path::PathBuf;

    fn disk_prep_path(name: &str) -> PathBuf {
        let mut path = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
        path.push("fs-images-task-".to_string() + name);
        path.push("img");
        if path.exists() {
            remove_file(&path).unwrap();
        }
        create_dir_all(path.parent().unwrap()).unwrap();
        path
    }

    #[test]
    fn change_dir_swaps_and_closes_old_cwd() {
        let path = disk_prep_path("cd");
        let device = Device::new(&path, SECTOR_SIZE, 64).unwrap();
        let free_map = FreeMap::create(&device, 2).unwrap();
        let fs = Filesystem::format(&device, &free_map).unwrap();

        let root = fs.root().unwrap();
        fs.mkdir(&root, "sub").unwrap();
        let task = Task::new(root);

        task.change_dir(&fs, "sub").unwrap();
        task.with_cwd(|cwd| {
            fs.create(cwd, "inside.txt", 0).unwrap();
        });
        let inode = task.with_cwd(|cwd| fs.open(cwd, "inside.txt")).unwrap();
        fs.inodes().close(inode).unwrap();

        task.close(&fs).unwrap();
        if path.exists() {
            remove_file(&path).unwrap();
        }
        let _ = remove_dir(path.parent().unwrap());
    }
}
