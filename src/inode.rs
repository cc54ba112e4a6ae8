//! Inodes.
//!
//! An inode describes a single file or directory's metadata and the tree of
//! pointers reaching its data: a fixed split of direct, single-indirect, and
//! double-indirect block pointers. The in-memory arena keeps one object per
//! open sector, ref-counted and torn down on last close. `Arc` is the
//! handle: `Arc::strong_count` doubles as the open count, so there is no
//! separate counter to keep in sync with the number of live handles.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex, Weak};

use zerocopy::{AsBytes, FromBytes};

use crate::cache::BufferCache;
use crate::device::{FreeMap, Sector, SectorData, SECTOR_SIZE};
use crate::error::{FsError, FsResult};

const INODE_MAGIC: u32 = 0x494e_4f44;

const DIRECT_BLOCKS: usize = 4;
const INDIRECT_BLOCKS: usize = 9;
const DOUBLE_INDIRECT_BLOCKS: usize = 1;

const DIRECT_INDEX: usize = 0;
const INDIRECT_INDEX: usize = DIRECT_INDEX + DIRECT_BLOCKS;
const DOUBLE_INDIRECT_INDEX: usize = INDIRECT_INDEX + INDIRECT_BLOCKS;

const PTRS_PER_BLOCK: usize = SECTOR_SIZE / 4;
const INODE_BLOCK_PTRS: usize = DIRECT_BLOCKS + INDIRECT_BLOCKS + DOUBLE_INDIRECT_BLOCKS;

/// File size limit reachable with 4 direct, 9 single-indirect, and 1
/// double-indirect block pointer.
pub const MAX_FILE_SIZE: u32 = 8_980_480;

/// On-disk inode, exactly one sector. `isdir` is stored as a `u32` (0/1)
/// rather than `bool` so the struct stays free of the implicit padding
/// `zerocopy`'s derive would otherwise reject.
#[repr(C)]
#[derive(Clone, Copy, AsBytes, FromBytes)]
pub struct Dinode {
    length: u32,
    magic: u32,
    direct_index: u32,
    indirect_index: u32,
    double_indirect_index: u32,
    isdir: u32,
    parent: u32,
    unused: [u32; 107],
    ptr: [u32; INODE_BLOCK_PTRS],
}

const _: () = assert!(std::mem::size_of::<Dinode>() == SECTOR_SIZE);

/// In-memory inode state. Does not track open-handle bookkeeping; `Arc`
/// already gives us that for free.
struct InodeState {
    length: u32,
    read_length: u32,
    direct_index: u32,
    indirect_index: u32,
    double_indirect_index: u32,
    isdir: bool,
    parent: Sector,
    ptr: [u32; INODE_BLOCK_PTRS],
    deny_write_cnt: u32,
    removed: bool,
}

impl InodeState {
    fn to_dinode(&self) -> Dinode {
        Dinode {
            length: self.length,
            magic: INODE_MAGIC,
            direct_index: self.direct_index,
            indirect_index: self.indirect_index,
            double_indirect_index: self.double_indirect_index,
            isdir: self.isdir as u32,
            parent: self.parent.raw(),
            unused: [0; 107],
            ptr: self.ptr,
        }
    }

    fn from_dinode(d: &Dinode) -> Self {
        Self {
            length: d.length,
            read_length: d.length,
            direct_index: d.direct_index,
            indirect_index: d.indirect_index,
            double_indirect_index: d.double_indirect_index,
            isdir: d.isdir != 0,
            parent: Sector::new(d.parent),
            ptr: d.ptr,
            deny_write_cnt: 0,
            removed: false,
        }
    }
}

/// The shared, per-sector inode object. Dropped exactly when the last
/// `Inode` handle referencing it goes away, at which point its on-disk
/// state is flushed, or torn down entirely if it was marked removed.
struct InodeCell {
    sector: Sector,
    cache: Arc<BufferCache>,
    free_map: Arc<dyn FreeMap>,
    state: Mutex<InodeState>,
    /// Serializes the grow phase of `write_at` for *file* inodes only.
    /// Directory growth is serialized by callers already holding the
    /// containing directory exclusively, so directories never take this.
    ///
    /// This is a flag rather than a plain `Mutex` guard held across the
    /// grow: `expand` acquires the buffer cache's own lock internally, and
    /// the cache lock must never nest inside an inode-level lock. Flipping
    /// the flag under `grow_lock` and releasing it immediately keeps the
    /// cache's lock acquisitions outside of any inode-level critical
    /// section, however long the grow itself takes.
    grow_lock: Mutex<bool>,
    grow_cond: Condvar,
}

impl InodeCell {
    /// Blocks until no other writer is growing this inode, then claims the
    /// right to grow. Held only long enough to flip the flag — never
    /// across the cache work `grow_to` goes on to do.
    fn begin_grow(&self) {
        let mut growing = self.grow_lock.lock().unwrap();
        while *growing {
            growing = self.grow_cond.wait(growing).unwrap();
        }
        *growing = true;
    }

    fn end_grow(&self) {
        let mut growing = self.grow_lock.lock().unwrap();
        *growing = false;
        self.grow_cond.notify_all();
    }
}

impl Drop for InodeCell {
    fn drop(&mut self) {
        let state = self.state.get_mut().expect("inode lock poisoned");
        if state.removed {
            log::debug!("tearing down removed inode at {}", self.sector);
            dealloc(state, &self.cache, &self.free_map);
            self.free_map.release(self.sector, 1);
        } else {
            let dinode = state.to_dinode();
            write_dinode(&self.cache, self.sector, &dinode);
        }
    }
}

/// A handle to an open inode. Two `open()` calls on the same sector return
/// handles backed by the same `InodeCell`; `Arc::strong_count` is the
/// open count.
pub struct Inode(Arc<InodeCell>);

impl Inode {
    pub fn reopen(&self) -> Inode {
        Inode(Arc::clone(&self.0))
    }

    pub fn sector(&self) -> Sector {
        self.0.sector
    }

    pub fn inumber(&self) -> u32 {
        self.0.sector.raw()
    }

    pub fn is_dir(&self) -> bool {
        self.0.state.lock().unwrap().isdir
    }

    pub fn length(&self) -> u32 {
        self.0.state.lock().unwrap().length
    }

    pub fn parent(&self) -> Sector {
        self.0.state.lock().unwrap().parent
    }

    pub fn set_parent(&self, parent: Sector) {
        self.0.state.lock().unwrap().parent = parent;
    }

    pub fn open_count(&self) -> usize {
        Arc::strong_count(&self.0)
    }

    pub fn mark_removed(&self) {
        self.0.state.lock().unwrap().removed = true;
    }

    pub fn is_removed(&self) -> bool {
        self.0.state.lock().unwrap().removed
    }

    /// Disables writes. May be called once per opener; matched by
    /// `allow_write`.
    pub fn deny_write(&self) {
        let mut state = self.0.state.lock().unwrap();
        state.deny_write_cnt += 1;
        debug_assert!(state.deny_write_cnt as usize <= self.open_count());
    }

    pub fn allow_write(&self) {
        let mut state = self.0.state.lock().unwrap();
        assert!(state.deny_write_cnt > 0, "allow_write without deny_write");
        state.deny_write_cnt -= 1;
    }

    fn writes_denied(&self) -> bool {
        self.0.state.lock().unwrap().deny_write_cnt > 0
    }

    /// Reads up to `buf.len()` bytes starting at `offset`. Returns `0` if
    /// `offset >= read_length`. Takes no inode-level lock: `read_length`
    /// and the pointer tree are snapshotted once, then the chunked copy
    /// proceeds against that snapshot.
    pub fn read_at(&self, buf: &mut [u8], offset: u32) -> usize {
        let (read_length, ptr) = {
            let state = self.0.state.lock().unwrap();
            (state.read_length, state.ptr)
        };
        if offset >= read_length {
            return 0;
        }
        let mut total = 0usize;
        let mut off = offset;
        let want = buf.len() as u32;
        while (total as u32) < want {
            let remaining_in_file = read_length - off;
            let remaining_in_sector = SECTOR_SIZE as u32 - off % SECTOR_SIZE as u32;
            let chunk = (want - total as u32)
                .min(remaining_in_file)
                .min(remaining_in_sector);
            if chunk == 0 {
                break;
            }
            let sector = byte_to_sector(&self.0.cache, &ptr, off);
            let handle = self.0.cache.get(sector, false);
            let mut block = [0u8; SECTOR_SIZE];
            handle.read(&mut block);
            handle.release(false);
            let sector_off = (off % SECTOR_SIZE as u32) as usize;
            buf[total..total + chunk as usize]
                .copy_from_slice(&block[sector_off..sector_off + chunk as usize]);
            total += chunk as usize;
            off += chunk;
        }
        total
    }

    /// Writes `buf` at `offset`, growing the file if the write extends past
    /// the current length. Returns `0` (not an error) if writes are
    /// currently denied.
    pub fn write_at(&self, buf: &[u8], offset: u32) -> FsResult<usize> {
        if self.writes_denied() {
            return Ok(0);
        }
        let end = offset
            .checked_add(buf.len() as u32)
            .ok_or(FsError::OutOfDisk)?;

        let (is_dir, current_length) = {
            let state = self.0.state.lock().unwrap();
            (state.isdir, state.length)
        };
        if end > current_length {
            if !is_dir {
                self.0.begin_grow();
            }
            self.grow_to(end.min(MAX_FILE_SIZE));
            if !is_dir {
                self.0.end_grow();
            }
        }

        let mut total = 0usize;
        let mut off = offset;
        let want = buf.len() as u32;
        while (total as u32) < want {
            let (length, ptr) = {
                let state = self.0.state.lock().unwrap();
                (state.length, state.ptr)
            };
            if off >= length {
                break;
            }
            let remaining_in_file = length - off;
            let remaining_in_sector = SECTOR_SIZE as u32 - off % SECTOR_SIZE as u32;
            let chunk = (want - total as u32)
                .min(remaining_in_file)
                .min(remaining_in_sector);
            if chunk == 0 {
                break;
            }
            let sector = byte_to_sector(&self.0.cache, &ptr, off);
            let handle = self.0.cache.get(sector, true);
            let mut block = [0u8; SECTOR_SIZE];
            handle.read(&mut block);
            let sector_off = (off % SECTOR_SIZE as u32) as usize;
            block[sector_off..sector_off + chunk as usize]
                .copy_from_slice(&buf[total..total + chunk as usize]);
            handle.write(&block);
            handle.release(true);
            total += chunk as usize;
            off += chunk;
        }

        {
            let mut state = self.0.state.lock().unwrap();
            state.read_length = state.length;
        }
        Ok(total)
    }

    /// Grows the inode to `target_length`. Snapshots the cursor fields
    /// `expand` needs out of `state`, runs `expand` (which acquires the
    /// cache's lock itself, sector by sector) against that local copy with
    /// no inode-level lock held, then merges the result back under a
    /// second, short-lived lock.
    fn grow_to(&self, target_length: u32) {
        let mut scratch = {
            let state = self.0.state.lock().unwrap();
            InodeState {
                length: state.length,
                read_length: state.read_length,
                direct_index: state.direct_index,
                indirect_index: state.indirect_index,
                double_indirect_index: state.double_indirect_index,
                isdir: state.isdir,
                parent: state.parent,
                ptr: state.ptr,
                deny_write_cnt: state.deny_write_cnt,
                removed: state.removed,
            }
        };
        let new_length = expand(&mut scratch, target_length, &self.0.cache, &self.0.free_map);
        let mut state = self.0.state.lock().unwrap();
        state.length = new_length;
        state.direct_index = scratch.direct_index;
        state.indirect_index = scratch.indirect_index;
        state.double_indirect_index = scratch.double_indirect_index;
        state.ptr = scratch.ptr;
    }
}

fn zero_sector(cache: &Arc<BufferCache>, sector: Sector) {
    let handle = cache.get(sector, true);
    handle.write(&[0u8; SECTOR_SIZE]);
    handle.release(true);
}

fn read_indirect(cache: &Arc<BufferCache>, sector: Sector) -> [u32; PTRS_PER_BLOCK] {
    let handle = cache.get(sector, false);
    let mut raw = [0u8; SECTOR_SIZE];
    handle.read(&mut raw);
    handle.release(false);
    <[u32; PTRS_PER_BLOCK]>::read_from(&raw[..]).expect("sector-sized buffer")
}

fn write_indirect(cache: &Arc<BufferCache>, sector: Sector, block: &[u32; PTRS_PER_BLOCK]) {
    let handle = cache.get(sector, true);
    let mut raw = [0u8; SECTOR_SIZE];
    raw.copy_from_slice(block.as_bytes());
    handle.write(&raw);
    handle.release(true);
}

/// Maps a byte offset within a file to the sector holding it. Caller must
/// have already verified `pos` is within the file's allocated range.
fn byte_to_sector(cache: &Arc<BufferCache>, ptr: &[u32; INODE_BLOCK_PTRS], pos: u32) -> Sector {
    let sector_size = SECTOR_SIZE as u32;
    if pos < (DIRECT_BLOCKS as u32) * sector_size {
        return Sector::new(ptr[(pos / sector_size) as usize]);
    }
    if pos < ((DIRECT_BLOCKS + INDIRECT_BLOCKS * PTRS_PER_BLOCK) as u32) * sector_size {
        let pos = pos - (DIRECT_BLOCKS as u32) * sector_size;
        let idx = (pos / (PTRS_PER_BLOCK as u32 * sector_size)) as usize + DIRECT_BLOCKS;
        let block = read_indirect(cache, Sector::new(ptr[idx]));
        let pos = pos % (PTRS_PER_BLOCK as u32 * sector_size);
        return Sector::new(block[(pos / sector_size) as usize]);
    }
    let outer = read_indirect(cache, Sector::new(ptr[DOUBLE_INDIRECT_INDEX]));
    let pos = pos - ((DIRECT_BLOCKS + INDIRECT_BLOCKS * PTRS_PER_BLOCK) as u32) * sector_size;
    let outer_idx = (pos / (PTRS_PER_BLOCK as u32 * sector_size)) as usize;
    let inner = read_indirect(cache, Sector::new(outer[outer_idx]));
    let pos = pos % (PTRS_PER_BLOCK as u32 * sector_size);
    Sector::new(inner[(pos / sector_size) as usize])
}

fn bytes_to_data_sectors(size: u32) -> u32 {
    (size + SECTOR_SIZE as u32 - 1) / SECTOR_SIZE as u32
}

fn bytes_to_indirect_sectors(size: u32) -> u32 {
    let direct_bytes = (DIRECT_BLOCKS * SECTOR_SIZE) as u32;
    if size <= direct_bytes {
        return 0;
    }
    let size = size - direct_bytes;
    let indirect_bytes = (PTRS_PER_BLOCK * SECTOR_SIZE) as u32;
    (size + indirect_bytes - 1) / indirect_bytes
}

fn bytes_to_double_indirect_sector(size: u32) -> u32 {
    let boundary = ((DIRECT_BLOCKS + INDIRECT_BLOCKS * PTRS_PER_BLOCK) * SECTOR_SIZE) as u32;
    if size <= boundary {
        0
    } else {
        1
    }
}

/// Grows the file described by `state` to (at most) `new_length`, allocating
/// and zero-filling new data/indirect sectors as needed. Returns the length
/// actually achieved: equal to `new_length` unless the free map ran dry, in
/// which case it is `new_length` truncated by whatever could not be
/// allocated. Idempotent on retry since the cursors only advance.
fn expand(
    state: &mut InodeState,
    new_length: u32,
    cache: &Arc<BufferCache>,
    free_map: &Arc<dyn FreeMap>,
) -> u32 {
    let mut remaining =
        bytes_to_data_sectors(new_length).saturating_sub(bytes_to_data_sectors(state.length));
    if remaining == 0 {
        return new_length;
    }

    while (state.direct_index as usize) < INDIRECT_INDEX && remaining > 0 {
        let sector = match free_map.allocate(1) {
            Some(s) => s,
            None => return new_length - remaining * SECTOR_SIZE as u32,
        };
        zero_sector(cache, sector);
        state.ptr[state.direct_index as usize] = sector.raw();
        state.direct_index += 1;
        remaining -= 1;
    }
    if remaining == 0 {
        return new_length;
    }

    while (state.direct_index as usize) < DOUBLE_INDIRECT_INDEX && remaining > 0 {
        let (rem, exhausted) = expand_indirect_block(state, remaining, cache, free_map);
        remaining = rem;
        if exhausted {
            return new_length - remaining * SECTOR_SIZE as u32;
        }
    }
    if remaining == 0 {
        return new_length;
    }

    if state.direct_index as usize == DOUBLE_INDIRECT_INDEX && remaining > 0 {
        let (rem, _exhausted) = expand_double_indirect_block(state, remaining, cache, free_map);
        remaining = rem;
    }
    new_length - remaining * SECTOR_SIZE as u32
}

fn expand_indirect_block(
    state: &mut InodeState,
    mut remaining: u32,
    cache: &Arc<BufferCache>,
    free_map: &Arc<dyn FreeMap>,
) -> (u32, bool) {
    let idx = state.direct_index as usize;
    let block_sector = if state.indirect_index == 0 {
        match free_map.allocate(1) {
            Some(s) => {
                state.ptr[idx] = s.raw();
                s
            }
            None => return (remaining, true),
        }
    } else {
        Sector::new(state.ptr[idx])
    };

    let mut block = read_indirect(cache, block_sector);
    let mut exhausted = false;
    while (state.indirect_index as usize) < PTRS_PER_BLOCK && remaining > 0 {
        match free_map.allocate(1) {
            Some(sector) => {
                zero_sector(cache, sector);
                block[state.indirect_index as usize] = sector.raw();
                state.indirect_index += 1;
                remaining -= 1;
            }
            None => {
                exhausted = true;
                break;
            }
        }
    }
    write_indirect(cache, block_sector, &block);

    if state.indirect_index as usize == PTRS_PER_BLOCK {
        state.indirect_index = 0;
        state.direct_index += 1;
    }
    (remaining, exhausted)
}

fn expand_double_indirect_block(
    state: &mut InodeState,
    mut remaining: u32,
    cache: &Arc<BufferCache>,
    free_map: &Arc<dyn FreeMap>,
) -> (u32, bool) {
    let idx = DOUBLE_INDIRECT_INDEX;
    let outer_sector = if state.double_indirect_index == 0 && state.indirect_index == 0 {
        match free_map.allocate(1) {
            Some(s) => {
                state.ptr[idx] = s.raw();
                s
            }
            None => return (remaining, true),
        }
    } else {
        Sector::new(state.ptr[idx])
    };

    let mut outer = read_indirect(cache, outer_sector);
    let mut exhausted = false;
    while (state.indirect_index as usize) < PTRS_PER_BLOCK && remaining > 0 {
        let (rem, ex) =
            expand_double_indirect_inner(state, remaining, cache, free_map, &mut outer);
        remaining = rem;
        if ex {
            exhausted = true;
            break;
        }
    }
    write_indirect(cache, outer_sector, &outer);
    (remaining, exhausted)
}

fn expand_double_indirect_inner(
    state: &mut InodeState,
    mut remaining: u32,
    cache: &Arc<BufferCache>,
    free_map: &Arc<dyn FreeMap>,
    outer: &mut [u32; PTRS_PER_BLOCK],
) -> (u32, bool) {
    let outer_idx = state.indirect_index as usize;
    let inner_sector = if state.double_indirect_index == 0 {
        match free_map.allocate(1) {
            Some(s) => {
                outer[outer_idx] = s.raw();
                s
            }
            None => return (remaining, true),
        }
    } else {
        Sector::new(outer[outer_idx])
    };

    let mut inner = read_indirect(cache, inner_sector);
    let mut exhausted = false;
    while (state.double_indirect_index as usize) < PTRS_PER_BLOCK && remaining > 0 {
        match free_map.allocate(1) {
            Some(sector) => {
                zero_sector(cache, sector);
                inner[state.double_indirect_index as usize] = sector.raw();
                state.double_indirect_index += 1;
                remaining -= 1;
            }
            None => {
                exhausted = true;
                break;
            }
        }
    }
    write_indirect(cache, inner_sector, &inner);

    if state.double_indirect_index as usize == PTRS_PER_BLOCK {
        state.double_indirect_index = 0;
        state.indirect_index += 1;
    }
    (remaining, exhausted)
}

/// Releases every data/indirect/double-indirect sector reachable from
/// `state`, in reverse of how `expand` allocated them. Does not release the
/// inode's own sector; that is the caller's job, once it decides to tear
/// the inode down.
fn dealloc(state: &InodeState, cache: &Arc<BufferCache>, free_map: &Arc<dyn FreeMap>) {
    let mut data_sectors = bytes_to_data_sectors(state.length);
    let mut indirect_sectors = bytes_to_indirect_sectors(state.length);
    let double_indirect_sector = bytes_to_double_indirect_sector(state.length);

    let mut idx = 0usize;
    while data_sectors > 0 && idx < INDIRECT_INDEX {
        free_map.release(Sector::new(state.ptr[idx]), 1);
        data_sectors -= 1;
        idx += 1;
    }
    while indirect_sectors > 0 && idx < DOUBLE_INDIRECT_INDEX {
        let data_ptrs = data_sectors.min(PTRS_PER_BLOCK as u32);
        dealloc_indirect_block(Sector::new(state.ptr[idx]), data_ptrs, cache, free_map);
        data_sectors -= data_ptrs;
        indirect_sectors -= 1;
        idx += 1;
    }
    if double_indirect_sector > 0 {
        dealloc_double_indirect_block(
            Sector::new(state.ptr[idx]),
            indirect_sectors,
            data_sectors,
            cache,
            free_map,
        );
    }
}

fn dealloc_indirect_block(
    sector: Sector,
    data_ptrs: u32,
    cache: &Arc<BufferCache>,
    free_map: &Arc<dyn FreeMap>,
) {
    let block = read_indirect(cache, sector);
    for ptr in block.iter().take(data_ptrs as usize) {
        free_map.release(Sector::new(*ptr), 1);
    }
    free_map.release(sector, 1);
}

fn dealloc_double_indirect_block(
    sector: Sector,
    indirect_ptrs: u32,
    mut data_ptrs: u32,
    cache: &Arc<BufferCache>,
    free_map: &Arc<dyn FreeMap>,
) {
    let block = read_indirect(cache, sector);
    for ptr in block.iter().take(indirect_ptrs as usize) {
        let per_block = data_ptrs.min(PTRS_PER_BLOCK as u32);
        dealloc_indirect_block(Sector::new(*ptr), per_block, cache, free_map);
        data_ptrs -= per_block;
    }
    free_map.release(sector, 1);
}

fn read_dinode(cache: &Arc<BufferCache>, sector: Sector) -> Dinode {
    let handle = cache.get(sector, false);
    let mut raw = [0u8; SECTOR_SIZE];
    handle.read(&mut raw);
    handle.release(false);
    Dinode::read_from(&raw[..]).expect("sector-sized buffer")
}

fn write_dinode(cache: &Arc<BufferCache>, sector: Sector, dinode: &Dinode) {
    let handle = cache.get(sector, true);
    let mut raw: SectorData = [0u8; SECTOR_SIZE];
    raw.copy_from_slice(dinode.as_bytes());
    handle.write(&raw);
    handle.release(true);
}

/// The table of currently-open inodes, keyed by sector: two `open()` calls
/// on the same sector return handles to the same object. Entries are
/// `Weak` — the `Inode` handles themselves, via `Arc`, are the real
/// reference count; a stale (expired) entry is simply replaced.
pub struct InodeTable {
    cache: Arc<BufferCache>,
    free_map: Arc<dyn FreeMap>,
    open: Mutex<HashMap<Sector, Weak<InodeCell>>>,
}

impl InodeTable {
    pub fn new(cache: Arc<BufferCache>, free_map: Arc<dyn FreeMap>) -> Arc<Self> {
        Arc::new(Self {
            cache,
            free_map,
            open: Mutex::new(HashMap::new()),
        })
    }

    /// Builds a fresh on-disk inode at `sector`, pre-allocating enough data
    /// sectors to cover `length`. `parent` is set by the caller afterward
    /// via `Inode::set_parent` once the directory entry is linked.
    pub fn create(&self, sector: Sector, length: u32, isdir: bool) -> FsResult<()> {
        let length = length.min(MAX_FILE_SIZE);
        let mut state = InodeState {
            length: 0,
            read_length: 0,
            direct_index: 0,
            indirect_index: 0,
            double_indirect_index: 0,
            isdir,
            parent: crate::ROOT_DIR_SECTOR,
            ptr: [0; INODE_BLOCK_PTRS],
            deny_write_cnt: 0,
            removed: false,
        };
        let achieved = expand(&mut state, length, &self.cache, &self.free_map);
        if achieved < length {
            // Roll back whatever was allocated; a partial file cannot be
            // created successfully.
            state.length = achieved;
            dealloc(&state, &self.cache, &self.free_map);
            return Err(FsError::OutOfDisk);
        }
        state.length = achieved;
        let dinode = state.to_dinode();
        write_dinode(&self.cache, sector, &dinode);
        Ok(())
    }

    /// Returns the unique open handle for `sector`, reading it from disk on
    /// first open. Fails if the on-disk inode's magic does not match.
    pub fn open(&self, sector: Sector) -> FsResult<Inode> {
        let mut open = self.open.lock().unwrap();
        if let Some(weak) = open.get(&sector) {
            if let Some(cell) = weak.upgrade() {
                return Ok(Inode(cell));
            }
        }
        let dinode = read_dinode(&self.cache, sector);
        if dinode.magic != INODE_MAGIC {
            return Err(FsError::CorruptInode);
        }
        let cell = Arc::new(InodeCell {
            sector,
            cache: Arc::clone(&self.cache),
            free_map: Arc::clone(&self.free_map),
            state: Mutex::new(InodeState::from_dinode(&dinode)),
            grow_lock: Mutex::new(false),
            grow_cond: Condvar::new(),
        });
        open.insert(sector, Arc::downgrade(&cell));
        Ok(Inode(cell))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{BitmapFreeMap, MemBlockDevice};

    fn fixture() -> (Arc<BufferCache>, Arc<dyn FreeMap>, Arc<InodeTable>) {
        let device = Arc::new(MemBlockDevice::new(4096));
        let cache = BufferCache::new(device);
        let free_map: Arc<dyn FreeMap> = Arc::new(BitmapFreeMap::new(4096));
        let table = InodeTable::new(Arc::clone(&cache), Arc::clone(&free_map));
        (cache, free_map, table)
    }

    #[test]
    fn create_then_open_round_trips_bytes() {
        let (_cache, _free_map, table) = fixture();
        let sector = Sector::new(10);
        table.create(sector, 2048, false).unwrap();
        let inode = table.open(sector).unwrap();
        let data = vec![b'A'; 2048];
        assert_eq!(inode.write_at(&data, 0).unwrap(), 2048);
        drop(inode);

        let inode = table.open(sector).unwrap();
        let mut out = vec![0u8; 2048];
        assert_eq!(inode.read_at(&mut out, 0), 2048);
        assert!(out.iter().all(|&b| b == b'A'));
    }

    #[test]
    fn open_twice_returns_same_handle() {
        let (_cache, _free_map, table) = fixture();
        let sector = Sector::new(11);
        table.create(sector, 0, false).unwrap();
        let a = table.open(sector).unwrap();
        let b = table.open(sector).unwrap();
        assert_eq!(a.open_count(), 2);
        assert_eq!(b.open_count(), 2);
    }

    #[test]
    fn grow_across_indirect_boundary() {
        let (_cache, _free_map, table) = fixture();
        let sector = Sector::new(12);
        table.create(sector, 0, false).unwrap();
        let inode = table.open(sector).unwrap();
        let payload = vec![b'x'; 4 * SECTOR_SIZE];
        let offset = 4 * SECTOR_SIZE as u32;
        inode.write_at(&payload, offset).unwrap();
        assert_eq!(inode.length(), 8 * SECTOR_SIZE as u32);

        let mut head = vec![0u8; 4 * SECTOR_SIZE];
        assert_eq!(inode.read_at(&mut head, 0), 4 * SECTOR_SIZE);
        assert!(head.iter().all(|&b| b == 0));

        let mut tail = vec![0u8; 4 * SECTOR_SIZE];
        assert_eq!(inode.read_at(&mut tail, offset), 4 * SECTOR_SIZE);
        assert!(tail.iter().all(|&b| b == b'x'));
    }

    #[test]
    fn dealloc_returns_sectors_to_free_map() {
        let (_cache, free_map, table) = fixture();
        let baseline = free_map.allocated_count();
        let sector = free_map.allocate(1).unwrap();
        table.create(sector, 64 * 1024, false).unwrap();
        let inode = table.open(sector).unwrap();
        inode.mark_removed();
        drop(inode);
        assert_eq!(free_map.allocated_count(), baseline);
    }

    #[test]
    fn deny_write_blocks_writers() {
        let (_cache, _free_map, table) = fixture();
        let sector = Sector::new(13);
        table.create(sector, 8, false).unwrap();
        let opener1 = table.open(sector).unwrap();
        let opener2 = table.open(sector).unwrap();
        opener1.deny_write();
        assert_eq!(opener2.write_at(b"no", 0).unwrap(), 0);
        opener1.allow_write();
        assert_eq!(opener2.write_at(b"ok", 0).unwrap(), 2);
    }
}
