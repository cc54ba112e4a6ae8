//! Top-level facade.
//!
//! `Mount` is the `init`/`done`-scoped object holding all mutable file
//! system state: the open-inodes table and the buffer cache are confined
//! here and threaded explicitly, rather than living behind hidden globals
//! or `static`s. `Cwd` plays the role of a task's current directory without
//! requiring a process table — this crate has none, so callers hold their
//! own `Cwd` and pass it into every path-taking call.

use std::sync::Arc;

use crate::cache::{BufferCache, WriteBackTask};
use crate::device::{BitmapFreeMap, BlockDevice, FreeMap, Sector};
use crate::dir::Directory;
use crate::error::{FsError, FsResult};
use crate::inode::{Inode, InodeTable};
use crate::path;
use crate::{FREE_MAP_SECTOR, ROOT_DIR_SECTOR};

/// Number of directory entries a freshly created directory is pre-sized
/// for at format time.
const DEFAULT_DIR_ENTRIES: u32 = 16;

/// A task's current working directory. `None` means "no cwd" (paths are
/// always resolved from the root, as in a task that hasn't chdir'd yet).
pub struct Cwd(Option<Directory>);

impl Cwd {
    pub fn none() -> Self {
        Cwd(None)
    }

    pub fn at(dir: Directory) -> Self {
        Cwd(Some(dir))
    }

    fn as_dir(&self) -> Option<&Directory> {
        self.0.as_ref()
    }
}

impl Default for Cwd {
    fn default() -> Self {
        Cwd::none()
    }
}

/// A seekable open file: an inode handle plus a private byte offset.
pub struct FileHandle {
    inode: Inode,
    pos: std::sync::Mutex<u32>,
}

impl FileHandle {
    fn new(inode: Inode) -> Self {
        Self {
            inode,
            pos: std::sync::Mutex::new(0),
        }
    }

    pub fn seek(&self, offset: u32) {
        *self.pos.lock().unwrap() = offset;
    }

    pub fn tell(&self) -> u32 {
        *self.pos.lock().unwrap()
    }

    pub fn filesize(&self) -> u32 {
        self.inode.length()
    }

    pub fn read(&self, buf: &mut [u8]) -> usize {
        let mut pos = self.pos.lock().unwrap();
        let n = self.inode.read_at(buf, *pos);
        *pos += n as u32;
        n
    }

    pub fn write(&self, buf: &[u8]) -> FsResult<usize> {
        let mut pos = self.pos.lock().unwrap();
        let n = self.inode.write_at(buf, *pos)?;
        *pos += n as u32;
        Ok(n)
    }

    pub fn deny_write(&self) {
        self.inode.deny_write();
    }

    pub fn allow_write(&self) {
        self.inode.allow_write();
    }

    pub fn inumber(&self) -> u32 {
        self.inode.inumber()
    }
}

/// A handle returned by `open`, tagged by kind, so a syscall surface built
/// above this crate can reject e.g. `read` on a directory without
/// downcasting.
pub enum OpenEntry {
    File(FileHandle),
    Dir(Directory),
}

impl OpenEntry {
    pub fn is_dir(&self) -> bool {
        matches!(self, OpenEntry::Dir(_))
    }

    pub fn inumber(&self) -> u32 {
        match self {
            OpenEntry::File(f) => f.inumber(),
            OpenEntry::Dir(d) => d.inumber(),
        }
    }

    pub fn as_file(&self) -> FsResult<&FileHandle> {
        match self {
            OpenEntry::File(f) => Ok(f),
            OpenEntry::Dir(_) => Err(FsError::IsADirectory),
        }
    }

    pub fn as_dir(&self) -> FsResult<&Directory> {
        match self {
            OpenEntry::Dir(d) => Ok(d),
            OpenEntry::File(_) => Err(FsError::NotADirectory),
        }
    }
}

/// The mounted file system: owns the cache, the free map, and the table of
/// open inodes for the lifetime between `init` and `done`.
pub struct Mount {
    device: Arc<dyn BlockDevice>,
    cache: Arc<BufferCache>,
    free_map: Arc<BitmapFreeMap>,
    table: Arc<InodeTable>,
    write_back: Option<WriteBackTask>,
}

impl Mount {
    /// Initializes the file system over `device`. If `format`, lays down a
    /// fresh free map and an empty root directory; otherwise loads the
    /// free map persisted by a prior `done()`.
    ///
    /// `device.len()` must report the device's sector count; the free map
    /// bitmap is packed into a single sector, so devices are limited to at
    /// most 4096 sectors (512 bytes × 8 bits/byte).
    pub fn init(device: Arc<dyn BlockDevice>, format: bool) -> FsResult<Mount> {
        Self::init_with_cache_capacity(device, format, crate::cache::CACHE_CAPACITY)
    }

    /// Like `init`, but with a non-default buffer cache capacity. Exists so
    /// tests can exercise eviction without touching 64 distinct sectors.
    pub fn init_with_cache_capacity(
        device: Arc<dyn BlockDevice>,
        format: bool,
        cache_capacity: usize,
    ) -> FsResult<Mount> {
        let sector_count = device
            .len()
            .expect("block device must report its sector count to mount");
        if BitmapFreeMap::sectors_needed(sector_count) > 1 {
            return Err(FsError::OutOfDisk);
        }

        let cache = BufferCache::with_capacity(Arc::clone(&device), cache_capacity);
        let free_map = if format {
            log::info!("formatting file system ({sector_count} sectors)");
            let fm = BitmapFreeMap::new(sector_count);
            fm.mark_allocated(FREE_MAP_SECTOR);
            fm.mark_allocated(ROOT_DIR_SECTOR);
            Arc::new(fm)
        } else {
            Arc::new(BitmapFreeMap::load(device.as_ref(), FREE_MAP_SECTOR, sector_count))
        };
        let table = InodeTable::new(Arc::clone(&cache), Arc::clone(&free_map) as Arc<dyn FreeMap>);

        if format {
            Directory::format(&table, ROOT_DIR_SECTOR, DEFAULT_DIR_ENTRIES)?;
            table.open(ROOT_DIR_SECTOR)?.set_parent(ROOT_DIR_SECTOR);
        }

        let write_back = Some(WriteBackTask::spawn(Arc::clone(&cache)));
        Ok(Mount {
            device,
            cache,
            free_map,
            table,
            write_back,
        })
    }

    /// Flushes and drains the cache, persists the free map, and stops the
    /// write-back task. Consumes the mount: nothing may use it afterward.
    pub fn done(mut self) {
        if let Some(task) = self.write_back.take() {
            task.shutdown();
        }
        self.cache.flush_all(true);
        self.free_map.persist(self.device.as_ref(), FREE_MAP_SECTOR);
        log::info!("file system unmounted cleanly");
    }

    pub fn root(&self) -> FsResult<Directory> {
        Directory::open(Arc::clone(&self.table), self.table.open(ROOT_DIR_SECTOR)?)
    }

    fn resolve(&self, cwd: &Cwd, path: &str) -> FsResult<path::Resolved> {
        if path.is_empty() {
            return Err(FsError::EmptyPath);
        }
        path::resolve(&self.table, ROOT_DIR_SECTOR, cwd.as_dir(), path)
    }

    /// Resolves the inode a (non-terminal-position) path component names,
    /// handling `.`, `..`, and the empty/self component the same way for
    /// both `open` and `chdir`.
    fn resolve_component(&self, resolved: &path::Resolved) -> FsResult<Sector> {
        match resolved.name.as_str() {
            ".." => Ok(resolved.dir.get_parent()),
            "" | "." => Ok(resolved.dir.inode().sector()),
            name => resolved.dir.lookup(name).ok_or(FsError::NotFound),
        }
    }

    pub fn create(&self, cwd: &Cwd, path: &str, initial_size: u32, isdir: bool) -> FsResult<()> {
        let mut resolved = self.resolve(cwd, path)?;
        if resolved.name.is_empty() || resolved.name == "." || resolved.name == ".." {
            return Err(FsError::AlreadyExists);
        }
        let sector = self.free_map.allocate(1).ok_or(FsError::OutOfDisk)?;
        if let Err(err) = self.table.create(sector, initial_size, isdir) {
            self.free_map.release(sector, 1);
            return Err(err);
        }
        if let Err(err) = resolved.dir.add(&resolved.name, sector) {
            // The inode (and whatever data sectors it allocated) already
            // landed on disk; opening it and marking it removed lets the
            // usual close-time teardown release everything, including
            // `sector` itself, instead of just the one sector we hold here.
            match self.table.open(sector) {
                Ok(inode) => inode.mark_removed(),
                Err(_) => self.free_map.release(sector, 1),
            }
            return Err(err);
        }
        Ok(())
    }

    pub fn mkdir(&self, cwd: &Cwd, path: &str) -> FsResult<()> {
        self.create(cwd, path, 0, true)
    }

    pub fn open(&self, cwd: &Cwd, path: &str) -> FsResult<OpenEntry> {
        let resolved = self.resolve(cwd, path)?;
        let sector = self.resolve_component(&resolved)?;
        let inode = self.table.open(sector)?;
        if inode.is_dir() {
            Ok(OpenEntry::Dir(Directory::open(Arc::clone(&self.table), inode)?))
        } else {
            Ok(OpenEntry::File(FileHandle::new(inode)))
        }
    }

    /// `chdir`: resolves `path` and, on success, points `cwd` at the
    /// resulting directory.
    pub fn chdir(&self, cwd: &mut Cwd, path: &str) -> FsResult<()> {
        let resolved = self.resolve(cwd, path)?;
        let sector = self.resolve_component(&resolved)?;
        let inode = self.table.open(sector)?;
        let dir = Directory::open(Arc::clone(&self.table), inode)?;
        *cwd = Cwd::at(dir);
        Ok(())
    }

    /// Removes the entry at `path`. Refuses a non-empty directory and, as
    /// a tractable instance of "is the cwd of any task" (this core tracks
    /// no task table), refuses removing the directory `cwd` itself points
    /// at.
    pub fn remove(&self, cwd: &Cwd, path: &str) -> FsResult<()> {
        let mut resolved = self.resolve(cwd, path)?;
        if let (Some(cwd_dir), Some(target)) = (cwd.as_dir(), resolved.dir.lookup(&resolved.name)) {
            if target == cwd_dir.inode().sector() {
                return Err(FsError::DirectoryNotEmpty);
            }
        }
        resolved.dir.remove(&resolved.name)
    }

    pub fn readdir(&self, dir: &Directory) -> Option<String> {
        dir.readdir()
    }

    pub fn isdir(&self, entry: &OpenEntry) -> bool {
        entry.is_dir()
    }

    pub fn inumber(&self, entry: &OpenEntry) -> u32 {
        entry.inumber()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemBlockDevice;

    fn mounted() -> Mount {
        let device: Arc<dyn BlockDevice> = Arc::new(MemBlockDevice::new(4096));
        Mount::init(device, true).unwrap()
    }

    #[test]
    fn create_and_read_back() {
        let mount = mounted();
        let cwd = Cwd::none();
        mount.create(&cwd, "/a", 2048, false).unwrap();
        let entry = mount.open(&cwd, "/a").unwrap();
        let file = entry.as_file().unwrap();
        let payload = vec![b'A'; 2048];
        assert_eq!(file.write(&payload).unwrap(), 2048);
        drop(entry);

        let entry = mount.open(&cwd, "/a").unwrap();
        let file = entry.as_file().unwrap();
        let mut out = vec![0u8; 2048];
        assert_eq!(file.read(&mut out), 2048);
        assert!(out.iter().all(|&b| b == b'A'));
    }

    #[test]
    fn nested_directories_and_readdir() {
        let mount = mounted();
        let mut cwd = Cwd::none();
        mount.mkdir(&cwd, "/x").unwrap();
        mount.mkdir(&cwd, "/x/y").unwrap();
        mount.chdir(&mut cwd, "/x/y").unwrap();
        mount.create(&cwd, "z", 1, false).unwrap();
        mount.chdir(&mut cwd, "..").unwrap();

        let mut names = Vec::new();
        let dir = mount.open(&cwd, ".").unwrap();
        while let Some(n) = mount.readdir(dir.as_dir().unwrap()) {
            names.push(n);
        }
        assert_eq!(names, vec!["y"]);

        mount.chdir(&mut cwd, "/").unwrap();
        let mut names = Vec::new();
        let dir = mount.open(&cwd, ".").unwrap();
        while let Some(n) = mount.readdir(dir.as_dir().unwrap()) {
            names.push(n);
        }
        assert_eq!(names, vec!["x"]);

        assert!(mount.remove(&cwd, "/x").is_err());
        mount.remove(&cwd, "/x/y/z").unwrap();
        mount.remove(&cwd, "/x/y").unwrap();
        mount.remove(&cwd, "/x").unwrap();
    }

    #[test]
    fn small_cache_capacity_still_round_trips() {
        let device: Arc<dyn BlockDevice> = Arc::new(MemBlockDevice::new(4096));
        let mount = Mount::init_with_cache_capacity(device, true, 4).unwrap();
        let cwd = Cwd::none();
        mount.create(&cwd, "/a", 4096, false).unwrap();
        let entry = mount.open(&cwd, "/a").unwrap();
        let file = entry.as_file().unwrap();
        assert_eq!(file.write(&vec![b'z'; 4096]).unwrap(), 4096);
        file.seek(0);
        let mut out = vec![0u8; 4096];
        assert_eq!(file.read(&mut out), 4096);
        assert!(out.iter().all(|&b| b == b'z'));
    }

    #[test]
    fn deny_write_blocks_second_opener() {
        let mount = mounted();
        let cwd = Cwd::none();
        mount.create(&cwd, "/a", 8, false).unwrap();
        let opener1 = mount.open(&cwd, "/a").unwrap();
        let opener2 = mount.open(&cwd, "/a").unwrap();
        opener1.as_file().unwrap().deny_write();
        assert_eq!(opener2.as_file().unwrap().write(b"no").unwrap(), 0);
        opener1.as_file().unwrap().allow_write();
        assert_eq!(opener2.as_file().unwrap().write(b"ok").unwrap(), 2);
    }
}
