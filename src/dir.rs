//! Directories.
//!
//! A directory is an inode with `isdir` set whose data is a packed array of
//! fixed-size entries, each an `{in_use, name[NAME_MAX+1], inode_sector}`
//! record. `.` and `..` are never stored entries; `.` is the directory's
//! own sector and `..` is its `parent` field.

use std::sync::{Arc, Mutex};

use zerocopy::{AsBytes, FromBytes};

use crate::device::Sector;
use crate::error::{FsError, FsResult};
use crate::inode::{Inode, InodeTable};

/// Longest supported entry name.
pub const NAME_MAX: usize = 14;

const NAME_FIELD: usize = 16;

#[repr(C)]
#[derive(Clone, Copy, AsBytes, FromBytes)]
struct RawEntry {
    in_use: u32,
    inode_sector: u32,
    // First `NAME_MAX + 1` bytes hold the name; the final byte is always
    // zero, both as a length sentinel and to keep the struct's size a
    // multiple of 4 without `zerocopy` rejecting implicit padding.
    name: [u8; NAME_FIELD],
}

const ENTRY_SIZE: usize = std::mem::size_of::<RawEntry>();

impl RawEntry {
    fn new(sector: Sector, name: &str) -> Self {
        let mut buf = [0u8; NAME_FIELD];
        buf[..name.len()].copy_from_slice(name.as_bytes());
        Self {
            in_use: 1,
            inode_sector: sector.raw(),
            name: buf,
        }
    }

    fn name_str(&self) -> &str {
        let end = self.name.iter().position(|&b| b == 0).unwrap_or(self.name.len());
        std::str::from_utf8(&self.name[..end]).unwrap_or("")
    }
}

fn validate_name(name: &str) -> FsResult<()> {
    if name.is_empty() || name.len() > NAME_MAX || name.contains('/') {
        return Err(FsError::InvalidName);
    }
    Ok(())
}

/// An open directory: an inode handle plus a read cursor for `readdir`.
pub struct Directory {
    inode: Inode,
    table: Arc<InodeTable>,
    pos: Mutex<u32>,
}

impl Directory {
    /// Builds a fresh on-disk directory inode at `sector`, sized to hold
    /// `initial_entries` entries without needing to grow immediately.
    pub fn format(table: &InodeTable, sector: Sector, initial_entries: u32) -> FsResult<()> {
        table.create(sector, initial_entries * ENTRY_SIZE as u32, true)
    }

    /// Wraps an already-open inode as a directory. Fails if the inode is
    /// not actually a directory.
    pub fn open(table: Arc<InodeTable>, inode: Inode) -> FsResult<Directory> {
        if !inode.is_dir() {
            return Err(FsError::NotADirectory);
        }
        Ok(Directory {
            inode,
            table,
            pos: Mutex::new(0),
        })
    }

    pub fn reopen(&self) -> Directory {
        Directory {
            inode: self.inode.reopen(),
            table: Arc::clone(&self.table),
            pos: Mutex::new(0),
        }
    }

    pub fn inode(&self) -> &Inode {
        &self.inode
    }

    pub fn into_inode(self) -> Inode {
        self.inode
    }

    pub fn is_root(&self) -> bool {
        self.inode.sector() == crate::ROOT_DIR_SECTOR
    }

    pub fn inumber(&self) -> u32 {
        self.inode.inumber()
    }

    pub fn get_parent(&self) -> Sector {
        self.inode.parent()
    }

    fn read_entry(&self, offset: u32) -> Option<(RawEntry, u32)> {
        let mut raw = [0u8; ENTRY_SIZE];
        let read = self.inode.read_at(&mut raw, offset);
        if read < ENTRY_SIZE {
            return None;
        }
        RawEntry::read_from(&raw[..]).map(|e| (e, offset))
    }

    fn write_entry(&self, offset: u32, entry: &RawEntry) -> FsResult<()> {
        self.inode.write_at(entry.as_bytes(), offset)?;
        Ok(())
    }

    fn find_slot(&self, name: &str) -> Option<(RawEntry, u32)> {
        let mut offset = 0u32;
        while let Some((entry, off)) = self.read_entry(offset) {
            if entry.in_use != 0 && entry.name_str() == name {
                return Some((entry, off));
            }
            offset += ENTRY_SIZE as u32;
        }
        None
    }

    fn first_free_slot(&self) -> u32 {
        let mut offset = 0u32;
        while let Some((entry, off)) = self.read_entry(offset) {
            if entry.in_use == 0 {
                return off;
            }
            offset += ENTRY_SIZE as u32;
        }
        offset
    }

    /// Resolves `name` to a sector. `.` and `..` are answered from the
    /// inode itself rather than a stored entry.
    pub fn lookup(&self, name: &str) -> Option<Sector> {
        match name {
            "." => Some(self.inode.sector()),
            ".." => Some(self.inode.parent()),
            _ => self.find_slot(name).map(|(e, _)| Sector::new(e.inode_sector)),
        }
    }

    /// Adds a name, reusing the first free slot if the directory has a
    /// tombstoned entry or appending otherwise. Fails on a duplicate name,
    /// an invalid name, or (for `.`/`..`) the reserved names. If the new
    /// entry's inode is itself a directory, its `parent` is set to this
    /// directory's sector.
    ///
    /// Takes `&mut self`: directory mutation is never handed out for
    /// concurrent unsynchronized access through one `Directory` value.
    pub fn add(&mut self, name: &str, sector: Sector) -> FsResult<()> {
        validate_name(name)?;
        if name == "." || name == ".." {
            return Err(FsError::AlreadyExists);
        }
        if self.lookup(name).is_some() {
            return Err(FsError::AlreadyExists);
        }
        let offset = self.first_free_slot();
        self.write_entry(offset, &RawEntry::new(sector, name))?;
        let child = self.table.open(sector)?;
        if child.is_dir() {
            child.set_parent(self.inode.sector());
        }
        Ok(())
    }

    /// True if any entry besides the implicit `.`/`..` is in use.
    pub fn has_entries(&self) -> bool {
        let mut offset = 0u32;
        while let Some((entry, off)) = self.read_entry(offset) {
            if entry.in_use != 0 {
                return true;
            }
            offset = off + ENTRY_SIZE as u32;
        }
        false
    }

    /// Removes `name`. Fails if it names a non-empty directory, or doesn't
    /// exist. Tears down the target inode's on-disk state once its last
    /// opener closes.
    pub fn remove(&mut self, name: &str) -> FsResult<()> {
        if name == "." || name == ".." {
            return Err(FsError::InvalidName);
        }
        let (entry, offset) = self.find_slot(name).ok_or(FsError::NotFound)?;
        let target = self.table.open(Sector::new(entry.inode_sector))?;
        if target.is_dir() {
            let subdir = Directory::open(Arc::clone(&self.table), target.reopen())?;
            if subdir.has_entries() {
                return Err(FsError::DirectoryNotEmpty);
            }
        }
        let mut cleared = entry;
        cleared.in_use = 0;
        self.write_entry(offset, &cleared)?;
        target.mark_removed();
        Ok(())
    }

    /// Advances the read cursor past tombstoned entries and returns the
    /// next live name, or `None` at end of directory.
    pub fn readdir(&self) -> Option<String> {
        let mut pos = self.pos.lock().unwrap();
        loop {
            let (entry, offset) = self.read_entry(*pos)?;
            *pos = offset + ENTRY_SIZE as u32;
            if entry.in_use != 0 {
                return Some(entry.name_str().to_string());
            }
        }
    }
}
