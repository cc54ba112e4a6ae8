//! Buffer cache.
//!
//! The buffer cache mediates all block I/O: callers never touch the
//! `BlockDevice` directly once the cache is up. A fixed-size table is
//! shared by every reader and writer; eviction uses a clock sweep over a
//! per-entry `accessed` bit. The locking and guard shape is a single
//! table-wide lock plus an RAII handle that unpins on drop.

use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::device::{BlockDevice, Sector, SectorData, SECTOR_SIZE};

/// Default cache capacity, in sectors.
pub const CACHE_CAPACITY: usize = 64;

/// How often the write-back thread wakes to flush dirty entries.
pub const WRITE_BACK_INTERVAL: Duration = Duration::from_millis(500);

struct Entry {
    sector: Sector,
    data: SectorData,
    dirty: bool,
    accessed: bool,
    pin_count: u32,
}

impl Entry {
    fn empty() -> Self {
        Self {
            sector: Sector::new(0),
            data: [0u8; SECTOR_SIZE],
            dirty: false,
            accessed: false,
            pin_count: 0,
        }
    }
}

struct State {
    entries: Vec<Entry>,
    by_sector: std::collections::HashMap<Sector, usize>,
    clock_hand: usize,
    capacity: usize,
    shutdown: bool,
}

/// The buffer cache. Owns no thread by itself; `WriteBackTask::spawn` and
/// `read_ahead` start the background write-back and read-ahead work.
pub struct BufferCache {
    device: Arc<dyn BlockDevice>,
    state: Mutex<State>,
    /// Signalled whenever an entry is released, so the write-back thread
    /// (and tests) can wait on cache activity instead of busy-polling.
    activity: Condvar,
}

pub struct CacheStats {
    pub entries: usize,
    pub dirty: usize,
}

impl BufferCache {
    pub fn new(device: Arc<dyn BlockDevice>) -> Arc<Self> {
        Self::with_capacity(device, CACHE_CAPACITY)
    }

    /// Construct with a non-default capacity; used by tests that want to
    /// exercise eviction without touching 64 distinct sectors.
    pub fn with_capacity(device: Arc<dyn BlockDevice>, capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            device,
            state: Mutex::new(State {
                entries: Vec::with_capacity(capacity),
                by_sector: std::collections::HashMap::new(),
                clock_hand: 0,
                capacity,
                shutdown: false,
            }),
            activity: Condvar::new(),
        })
    }

    /// Pin the entry holding `sector`, reading it from the device on a
    /// miss. If `dirty_hint` is set the entry is marked dirty immediately.
    pub fn get(self: &Arc<Self>, sector: Sector, dirty_hint: bool) -> CacheHandle {
        let mut state = self.state.lock().unwrap();
        if let Some(&idx) = state.by_sector.get(&sector) {
            let entry = &mut state.entries[idx];
            entry.pin_count += 1;
            entry.accessed = true;
            entry.dirty |= dirty_hint;
            log::trace!("cache hit {sector}");
            return CacheHandle {
                cache: Arc::clone(self),
                index: idx,
                released: false,
            };
        }
        let idx = self.admit_or_evict(&mut state, sector, dirty_hint);
        CacheHandle {
            cache: Arc::clone(self),
            index: idx,
            released: false,
        }
    }

    /// Load `sector` into a fresh or recycled slot. Caller holds `state`.
    fn admit_or_evict(&self, state: &mut State, sector: Sector, dirty_hint: bool) -> usize {
        let idx = if state.entries.len() < state.capacity {
            state.entries.push(Entry::empty());
            state.entries.len() - 1
        } else {
            let idx = self.clock_evict(state);
            state.by_sector.remove(&state.entries[idx].sector);
            idx
        };

        let mut buf = [0u8; SECTOR_SIZE];
        self.device
            .read(sector, &mut buf)
            .expect("block device read failed");
        log::debug!("cache fill {sector} -> slot {idx}");

        let entry = &mut state.entries[idx];
        entry.sector = sector;
        entry.data = buf;
        entry.dirty = dirty_hint;
        entry.accessed = true;
        entry.pin_count = 1;
        state.by_sector.insert(sector, idx);
        idx
    }

    /// Clock sweep: skip pinned entries, clear and skip accessed entries,
    /// evict (writing back if dirty) the first unaccessed unpinned entry.
    /// Terminates because callers never pin more entries than the cache
    /// has slots for, so at least one entry is always unpinned.
    fn clock_evict(&self, state: &mut State) -> usize {
        let n = state.entries.len();
        let mut scanned = 0;
        loop {
            if scanned > 2 * n + 1 {
                // Every entry pinned; callers are expected never to do this.
                panic!("buffer cache: no evictable entry (out of memory)");
            }
            let idx = state.clock_hand;
            state.clock_hand = (state.clock_hand + 1) % n;
            scanned += 1;

            let entry = &mut state.entries[idx];
            if entry.pin_count > 0 {
                continue;
            }
            if entry.accessed {
                entry.accessed = false;
                continue;
            }
            if entry.dirty {
                log::trace!("evicting dirty {} from slot {idx}", entry.sector);
                self.device
                    .write(entry.sector, &entry.data)
                    .expect("block device write failed");
                entry.dirty = false;
            }
            return idx;
        }
    }

    /// Unpin an entry. `extra_dirty` additionally marks it dirty, so a
    /// caller that only read can release without dirtying it.
    fn release(&self, index: usize, extra_dirty: bool) {
        let mut state = self.state.lock().unwrap();
        let entry = &mut state.entries[index];
        entry.dirty |= extra_dirty;
        assert!(entry.pin_count > 0, "release of unpinned cache entry");
        entry.pin_count -= 1;
        self.activity.notify_all();
    }

    /// Write back every dirty entry. If `drain`, also empty the cache
    /// (used at shutdown).
    pub fn flush_all(&self, drain: bool) {
        let mut state = self.state.lock().unwrap();
        for entry in state.entries.iter_mut() {
            if entry.dirty {
                self.device
                    .write(entry.sector, &entry.data)
                    .expect("block device write failed");
                entry.dirty = false;
            }
        }
        if drain {
            log::debug!("draining buffer cache ({} entries)", state.entries.len());
            state.entries.clear();
            state.by_sector.clear();
            state.clock_hand = 0;
        }
    }

    /// Hint that `sector.next()` may soon be needed. Best-effort and
    /// asynchronous: spawns a short-lived thread that primes the cache.
    pub fn read_ahead(self: &Arc<Self>, sector: Sector) {
        let cache = Arc::clone(self);
        std::thread::spawn(move || {
            let next = sector.next();
            {
                let state = cache.state.lock().unwrap();
                if state.by_sector.contains_key(&next) {
                    return;
                }
            }
            let handle = cache.get(next, false);
            drop(handle);
        });
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.state.lock().unwrap();
        CacheStats {
            entries: state.entries.len(),
            dirty: state.entries.iter().filter(|e| e.dirty).count(),
        }
    }

    fn request_shutdown(&self) {
        let mut state = self.state.lock().unwrap();
        state.shutdown = true;
        self.activity.notify_all();
    }
}

/// A pinned, possibly-dirtying view onto one sector's bytes.
pub struct CacheHandle {
    cache: Arc<BufferCache>,
    index: usize,
    released: bool,
}

impl CacheHandle {
    pub fn sector(&self) -> Sector {
        self.cache.state.lock().unwrap().entries[self.index].sector
    }

    pub fn read(&self, out: &mut SectorData) {
        let state = self.cache.state.lock().unwrap();
        out.copy_from_slice(&state.entries[self.index].data);
    }

    /// Copy `data` into the cached sector and mark the entry dirty.
    pub fn write(&self, data: &SectorData) {
        let mut state = self.cache.state.lock().unwrap();
        let entry = &mut state.entries[self.index];
        entry.data = *data;
        entry.dirty = true;
        entry.accessed = true;
    }

    /// Release the handle, optionally marking the entry dirty beyond
    /// whatever `get`/`write` already set.
    pub fn release(mut self, dirty: bool) {
        self.cache.release(self.index, dirty);
        self.released = true;
    }
}

impl Drop for CacheHandle {
    fn drop(&mut self) {
        if !self.released {
            self.cache.release(self.index, false);
        }
    }
}

/// Handle to the background write-back thread, joined on `Mount::done`.
pub struct WriteBackTask {
    cache: Arc<BufferCache>,
    handle: Option<JoinHandle<()>>,
}

impl WriteBackTask {
    pub fn spawn(cache: Arc<BufferCache>) -> Self {
        let worker_cache = Arc::clone(&cache);
        let handle = std::thread::spawn(move || {
            let mut guard = worker_cache.state.lock().unwrap();
            loop {
                let (g, _) = worker_cache
                    .activity
                    .wait_timeout(guard, WRITE_BACK_INTERVAL)
                    .unwrap();
                guard = g;
                if guard.shutdown {
                    return;
                }
                drop(guard);
                worker_cache.flush_all(false);
                guard = worker_cache.state.lock().unwrap();
            }
        });
        Self {
            cache,
            handle: Some(handle),
        }
    }

    pub fn shutdown(mut self) {
        self.cache.request_shutdown();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for WriteBackTask {
    fn drop(&mut self) {
        if self.handle.is_some() {
            self.cache.request_shutdown();
            if let Some(handle) = self.handle.take() {
                let _ = handle.join();
            }
        }
    }
}
