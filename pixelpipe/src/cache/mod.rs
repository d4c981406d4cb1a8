//! Content-addressed pixel cache.
//!
//! Entries are keyed by the cumulative hash of everything upstream of the
//! buffer they hold. The cache mutex only guards the maps and the counters;
//! buffer access goes through each entry's reader/writer lock. Never take the
//! cache mutex while holding an entry lock: inside the mutex, entry locks are
//! only ever *tried*, except on entries that were just created.

mod aging;
mod entry;
#[cfg(test)]
mod tests;

pub use aging::AgingTimer;
pub use entry::{CacheEntry, EntryData, EntryReadGuard, EntryWriteGuard, SidecarKey};

use std::cell::RefCell;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::{Duration, Instant};

use common::Djb2Hasher;
use hashbrown::HashMap;
use parking_lot::Mutex;

use crate::arena::{self, ArenaStats, PooledBlock, SharedArena};
use crate::buffer::{BufferDesc, HostPtr};
use crate::config::CacheConfig;
use crate::device::DeviceId;
use crate::error::{ArenaError, PipeError, PipeResult};

/// Pipe id matching every pipeline in [`PixelCache::flush_pipe`].
pub const ANY_PIPE: i32 = -1;

const MIB: usize = 1024 * 1024;

thread_local! {
    static CURRENT_MODULE: RefCell<Option<String>> = const { RefCell::new(None) };
}

/// Names the module being processed on this thread, for cache-full reports.
pub struct ModuleScope {
    previous: Option<String>,
}

impl ModuleScope {
    pub fn enter(module: &str) -> Self {
        let previous = CURRENT_MODULE.with(|cell| cell.replace(Some(module.to_string())));
        Self { previous }
    }
}

impl Drop for ModuleScope {
    fn drop(&mut self) {
        let previous = self.previous.take();
        CURRENT_MODULE.with(|cell| *cell.borrow_mut() = previous);
    }
}

pub fn current_module() -> Option<String> {
    CURRENT_MODULE.with(|cell| cell.borrow().clone())
}

/// Result of [`PixelCache::get_or_create`]. Both variants carry one reference
/// the caller must release.
pub enum Lookup {
    Hit(Arc<CacheEntry>),
    /// A fresh entry, write-locked for the producer.
    Created(Arc<CacheEntry>, EntryWriteGuard),
}

impl Lookup {
    pub fn entry(&self) -> &Arc<CacheEntry> {
        match self {
            Lookup::Hit(entry) | Lookup::Created(entry, _) => entry,
        }
    }

    pub fn is_fresh(&self) -> bool {
        matches!(self, Lookup::Created(..))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CacheStats {
    pub entries: usize,
    pub external_entries: usize,
    pub current_memory: usize,
    pub max_memory: usize,
    pub queries: u64,
    pub hits: u64,
    pub arena: ArenaStats,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        if self.queries == 0 {
            return 0.0;
        }
        self.hits as f64 / self.queries as f64
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EntrySnapshot {
    pub hash: u64,
    pub name: String,
    pub size: usize,
    pub pipe_id: i32,
    pub refcount: i32,
    pub hits: u32,
    pub age: u64,
    pub locked: bool,
    pub auto_destroy: bool,
    pub external: bool,
    pub sidecar_images: usize,
}

impl From<&CacheEntry> for EntrySnapshot {
    fn from(entry: &CacheEntry) -> Self {
        Self {
            hash: entry.hash(),
            name: entry.name().to_string(),
            size: entry.size(),
            pipe_id: entry.pipe_id(),
            refcount: entry.refcount(),
            hits: entry.hits(),
            age: entry.age(),
            locked: entry.is_locked(),
            auto_destroy: entry.is_auto_destroy(),
            external: entry.is_external(),
            sidecar_images: entry.sidecar_len(),
        }
    }
}

#[derive(Default)]
struct State {
    main: HashMap<u64, Arc<CacheEntry>>,
    external: HashMap<HostPtr, Arc<CacheEntry>>,
    /// Destroyed entries whose lock was busy. Their pages stay accounted
    /// until they can be reclaimed.
    retired: Vec<Arc<CacheEntry>>,
    current_memory: usize,
    queries: u64,
    hits: u64,
    clock: u64,
}

/// A host buffer outside the pipeline's hash space, borrowed from the cache.
///
/// It stays write-locked and referenced until handed back to
/// [`PixelCache::free_external`].
#[must_use = "external buffers must be returned with PixelCache::free_external"]
pub struct ExternalBuffer {
    entry: Arc<CacheEntry>,
    guard: EntryWriteGuard,
    len: usize,
}

impl ExternalBuffer {
    pub fn host_ptr(&self) -> HostPtr {
        self.entry.host_ptr()
    }

    pub fn entry(&self) -> &Arc<CacheEntry> {
        &self.entry
    }
}

impl Deref for ExternalBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.guard.bytes()[..self.len]
    }
}

impl DerefMut for ExternalBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        let len = self.len;
        &mut self.guard.bytes_mut()[..len]
    }
}

/// Non-blocking read access handed to observers. Dropping it releases both
/// the reader lock and the reference.
pub struct ReadOnlyEntry {
    guard: EntryReadGuard,
    entry: Arc<CacheEntry>,
}

impl ReadOnlyEntry {
    pub fn entry(&self) -> &Arc<CacheEntry> {
        &self.entry
    }
}

impl Deref for ReadOnlyEntry {
    type Target = EntryData;

    fn deref(&self) -> &EntryData {
        &self.guard
    }
}

impl Drop for ReadOnlyEntry {
    fn drop(&mut self) {
        self.entry.release_ref();
    }
}

pub struct PixelCache {
    arena: SharedArena,
    state: Mutex<State>,
    max_memory: usize,
    config: CacheConfig,
    epoch: Instant,
}

impl PixelCache {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            arena: arena::shared(config.max_memory_bytes),
            state: Mutex::new(State::default()),
            max_memory: config.max_memory_bytes,
            config: config.clone(),
            epoch: Instant::now(),
        }
    }

    /// Starts the periodic aging sweep on a background thread.
    pub fn start_aging(self: &Arc<Self>) -> AgingTimer {
        AgingTimer::start(self, self.config.aging_sweep_interval())
    }

    pub fn max_memory(&self) -> usize {
        self.max_memory
    }

    /// Page-rounded size an allocation of `size` bytes is accounted for.
    pub fn rounded_size(&self, size: usize) -> PipeResult<usize> {
        let (_, rounded) = self.arena.lock().calc(size)?;
        Ok(rounded)
    }

    fn now(&self) -> u64 {
        self.epoch.elapsed().as_micros() as u64
    }

    /// Monotonic timestamp, strictly increasing across calls.
    fn tick(&self, state: &mut State) -> u64 {
        state.clock = self.now().max(state.clock + 1);
        state.clock
    }

    /// Looks up `hash`, creating a write-locked entry of `size` bytes on miss.
    ///
    /// Either way the entry comes back with one reference taken. On miss, least
    /// recently used entries are evicted until the new entry fits.
    pub fn get_or_create(
        &self,
        hash: u64,
        size: usize,
        name: &str,
        pipe_id: i32,
        dsc: BufferDesc,
    ) -> PipeResult<Lookup> {
        self.lookup_or_create(hash, size, name, pipe_id, dsc, true)
    }

    /// Same as [`get_or_create`](Self::get_or_create) without touching the
    /// query and hit counters. Used for the pipeline's input stage.
    pub(crate) fn get_or_create_untracked(
        &self,
        hash: u64,
        size: usize,
        name: &str,
        pipe_id: i32,
        dsc: BufferDesc,
    ) -> PipeResult<Lookup> {
        self.lookup_or_create(hash, size, name, pipe_id, dsc, false)
    }

    fn lookup_or_create(
        &self,
        hash: u64,
        size: usize,
        name: &str,
        pipe_id: i32,
        dsc: BufferDesc,
        count: bool,
    ) -> PipeResult<Lookup> {
        let mut state = self.state.lock();
        if count {
            state.queries += 1;
        }

        if let Some(entry) = state.main.get(&hash).cloned() {
            if count {
                state.hits += 1;
            }
            entry.record_hit();
            entry.add_ref();
            let now = self.tick(&mut state);
            entry.touch(now);
            tracing::trace!("[pixelpipe_cache] found {} ({})", hash, entry.name());
            return Ok(Lookup::Hit(entry));
        }

        let block = self.reserve(&mut state, size, name, hash)?;
        let now = self.tick(&mut state);
        let entry = Arc::new(CacheEntry::new(
            hash,
            name,
            pipe_id,
            false,
            EntryData::new(block, dsc),
            now,
        ));
        entry.add_ref();
        // Fresh lock, nobody else can see the entry yet.
        let guard = entry.write();

        state.current_memory += entry.size();
        state.main.insert(hash, Arc::clone(&entry));
        tracing::debug!(
            "[pixelpipe_cache] created {} for {} ({} MiB, total {} MiB)",
            hash,
            name,
            entry.size() / MIB,
            state.current_memory / MIB
        );

        Ok(Lookup::Created(entry, guard))
    }

    /// Frees room for `size` bytes and carves the block from the arena.
    fn reserve(
        &self,
        state: &mut State,
        size: usize,
        name: &str,
        hash: u64,
    ) -> PipeResult<PooledBlock> {
        let calc = self.arena.lock().calc(size);
        let rounded = match calc {
            Ok((_, rounded)) => rounded,
            Err(e) if size == 0 => {
                tracing::warn!("[pixelpipe_cache] invalid cache entry size 0 for {}", name);
                return Err(e.into());
            }
            Err(_) => {
                // Larger than the whole arena: sweep anyway, then give up.
                while Self::reclaim_retired(state) || self.evict_lru(state) {}
                return Err(self.cache_full(state, name, hash));
            }
        };

        while state.current_memory + rounded > self.max_memory {
            if !Self::reclaim_retired(state) && !self.evict_lru(state) {
                return Err(self.cache_full(state, name, hash));
            }
        }

        // The budget fits but the arena may still be fragmented.
        loop {
            match PooledBlock::alloc(&self.arena, size) {
                Ok(block) => return Ok(block),
                Err(ArenaError::OutOfArena { .. }) => {
                    if !Self::reclaim_retired(state) && !self.evict_lru(state) {
                        return Err(self.cache_full(state, name, hash));
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn cache_full(&self, state: &State, name: &str, hash: u64) -> PipeError {
        tracing::warn!(
            "[pixelpipe_cache] cache is full, cannot allocate new entry {} ({}): {} MiB used of {} MiB",
            hash,
            name,
            state.current_memory / MIB,
            self.max_memory / MIB
        );
        for entry in state.main.values() {
            tracing::debug!("[pixelpipe_cache] {:?}", entry);
        }
        PipeError::CacheFull {
            name: name.to_string(),
            module: current_module(),
        }
    }

    /// Removes the oldest unused and unlocked entry. False if none qualifies.
    fn evict_lru(&self, state: &mut State) -> bool {
        let candidate = state
            .main
            .values()
            .filter(|entry| entry.is_evictable())
            .min_by_key(|entry| (entry.age(), entry.hash()))
            .cloned();

        let Some(entry) = candidate else {
            tracing::debug!(
                "[pixelpipe_cache] couldn't remove LRU, {} items and all are used",
                state.main.len()
            );
            return false;
        };

        self.destroy(state, &entry);
        tracing::debug!(
            "[pixelpipe_cache] LRU {} removed. Total cache size: {} MiB",
            entry.hash(),
            state.current_memory / MIB
        );
        true
    }

    /// Drops `entry` from the main map and returns its pages to the arena.
    ///
    /// Handles still held elsewhere see an empty buffer afterwards. An entry
    /// somebody has locked in the meantime is retired instead, and reclaimed
    /// by a later allocation.
    fn destroy(&self, state: &mut State, entry: &Arc<CacheEntry>) {
        if state.main.remove(&entry.hash()).is_none() {
            return;
        }
        entry.sidecar_flush(None);
        if Self::reclaim(state, entry) {
            tracing::trace!("[pixelpipe_cache] freed {} ({})", entry.hash(), entry.name());
        } else {
            tracing::debug!(
                "[pixelpipe_cache] {} ({}) is locked, pages kept until it is released",
                entry.hash(),
                entry.name()
            );
            state.retired.push(Arc::clone(entry));
        }
    }

    /// Frees the storage of a removed entry. False while its lock is held.
    fn reclaim(state: &mut State, entry: &CacheEntry) -> bool {
        let Some(mut guard) = entry.try_write() else {
            return false;
        };
        guard.release_storage();
        state.current_memory -= entry.size();
        true
    }

    /// Reclaims retired entries whose lock became free. True if any was.
    fn reclaim_retired(state: &mut State) -> bool {
        let before = state.retired.len();
        for entry in std::mem::take(&mut state.retired) {
            if !Self::reclaim(state, &entry) {
                state.retired.push(entry);
            }
        }
        state.retired.len() < before
    }

    /// Hit-only lookup. The returned entry carries one reference.
    pub fn get_existing(&self, hash: u64) -> Option<Arc<CacheEntry>> {
        let mut state = self.state.lock();
        state.queries += 1;
        let entry = state.main.get(&hash).cloned()?;
        state.hits += 1;
        entry.record_hit();
        entry.add_ref();
        let now = self.tick(&mut state);
        entry.touch(now);
        Some(entry)
    }

    /// Lookup without taking a reference or touching any counter.
    pub fn peek(&self, hash: u64) -> Option<Arc<CacheEntry>> {
        self.state.lock().main.get(&hash).cloned()
    }

    pub fn contains(&self, hash: u64) -> bool {
        self.state.lock().main.contains_key(&hash)
    }

    /// Destroys the entry unless somebody holds its lock. Unless `force`d,
    /// referenced entries are kept too.
    pub fn remove(&self, hash: u64, force: bool) -> bool {
        let mut state = self.state.lock();
        let Some(entry) = state.main.get(&hash).cloned() else {
            tracing::trace!("[pixelpipe_cache] entry {} not found, not removed", hash);
            return false;
        };

        let used = entry.refcount() > 0;
        if !entry.lock_is_free() {
            tracing::trace!("[pixelpipe_cache] cannot remove {}: locked", hash);
            return false;
        }
        if used && !force {
            tracing::trace!("[pixelpipe_cache] cannot remove {}: used", hash);
            return false;
        }

        self.destroy(&mut state, &entry);
        true
    }

    /// Destroys every unlocked entry of `pipe_id` ([`ANY_PIPE`] for all).
    pub fn flush_pipe(&self, pipe_id: i32) -> usize {
        let mut state = self.state.lock();
        let victims: Vec<Arc<CacheEntry>> = state
            .main
            .values()
            .filter(|entry| pipe_id == ANY_PIPE || entry.pipe_id() == pipe_id)
            .filter(|entry| entry.lock_is_free())
            .cloned()
            .collect();

        for entry in &victims {
            self.destroy(&mut state, entry);
        }
        tracing::debug!(
            "[pixelpipe_cache] flushed {} entries of pipe {}",
            victims.len(),
            pipe_id
        );
        victims.len()
    }

    /// Periodic sweep. Skipped when the cache is busy, to be retried next time.
    pub fn flush_aged(&self) -> usize {
        let Some(mut state) = self.state.try_lock() else {
            tracing::trace!("[pixelpipe_cache] cache busy, aging sweep skipped");
            return 0;
        };
        self.flush_older_than_locked(
            &mut state,
            self.config.aging_threshold(),
            self.config.min_hits_to_keep,
        )
    }

    /// Destroys unused, unlocked entries older than `threshold` with fewer
    /// than `min_hits` hits.
    pub fn flush_older_than(&self, threshold: Duration, min_hits: u32) -> usize {
        let mut state = self.state.lock();
        self.flush_older_than_locked(&mut state, threshold, min_hits)
    }

    fn flush_older_than_locked(&self, state: &mut State, threshold: Duration, min_hits: u32) -> usize {
        let now = self.now();
        let threshold = threshold.as_micros() as u64;
        let victims: Vec<Arc<CacheEntry>> = state
            .main
            .values()
            .filter(|entry| now.saturating_sub(entry.age()) > threshold)
            .filter(|entry| entry.hits() < min_hits)
            .filter(|entry| entry.is_evictable())
            .cloned()
            .collect();

        for entry in &victims {
            self.destroy(state, entry);
        }
        if !victims.is_empty() {
            tracing::debug!("[pixelpipe_cache] aging removed {} entries", victims.len());
        }
        victims.len()
    }

    /// Borrows a buffer from the cache budget for use outside the pipeline.
    pub fn alloc_external(&self, size: usize, name: &str, pipe_id: i32) -> PipeResult<ExternalBuffer> {
        let mut state = self.state.lock();
        let block = self.reserve(&mut state, size, name, 0)?;
        let hash = Djb2Hasher::hash_bytes(
            common::djb2::DJB2_SEED,
            &block.host_ptr().0.to_le_bytes(),
        );
        let now = self.tick(&mut state);
        let entry = Arc::new(CacheEntry::new(
            hash,
            name,
            pipe_id,
            true,
            EntryData::new(block, BufferDesc::default()),
            now,
        ));
        entry.add_ref();
        let guard = entry.write();

        state.current_memory += entry.size();
        state.external.insert(entry.host_ptr(), Arc::clone(&entry));

        Ok(ExternalBuffer {
            entry,
            guard,
            len: size,
        })
    }

    /// Returns an external buffer.
    ///
    /// # Panics
    ///
    /// Panics if the buffer is not tracked by this cache: that means the
    /// accounting is already corrupt.
    pub fn free_external(&self, buffer: ExternalBuffer) {
        let ExternalBuffer { entry, guard, .. } = buffer;
        let host = entry.host_ptr();

        let mut state = self.state.lock();
        let tracked = match state.external.get(&host) {
            Some(tracked) if Arc::ptr_eq(tracked, &entry) => state.external.remove(&host),
            _ => None,
        };
        let Some(tracked) = tracked else {
            drop(state);
            panic!(
                "[pixelpipe_cache] free_external: no external entry found for buffer {:?} ({})",
                host,
                entry.name()
            );
        };

        tracked.release_ref();
        state.current_memory -= tracked.size();
        drop(state);
        drop(guard);
    }

    /// Releases sidecar images of `device` (or every device) cache-wide.
    pub fn flush_sidecars(&self, device: Option<DeviceId>) -> usize {
        // Collected first: callers may hold entry locks, images are released
        // outside the cache mutex.
        let entries: Vec<Arc<CacheEntry>> = {
            let state = self.state.lock();
            state.main.values().chain(state.external.values()).cloned().collect()
        };
        let released: usize = entries
            .iter()
            .map(|entry| entry.sidecar_flush(device))
            .sum();
        if released > 0 {
            tracing::debug!("[pixelpipe_cache] released {} sidecar images", released);
        }
        released
    }

    pub fn unref_hash(&self, hash: u64) {
        let entry = self.peek(hash);
        if let Some(entry) = entry {
            entry.release_ref();
        }
    }

    pub fn flag_auto_destroy(&self, hash: u64) -> bool {
        let state = self.state.lock();
        match state.main.get(&hash) {
            Some(entry) => {
                entry.set_auto_destroy();
                true
            }
            None => false,
        }
    }

    /// Removes `entry` if it is flagged auto-destroy and nobody uses it anymore.
    pub fn auto_destroy_apply(&self, entry: &Arc<CacheEntry>) -> bool {
        if !entry.is_auto_destroy() {
            return false;
        }
        let mut state = self.state.lock();
        let tracked = state
            .main
            .get(&entry.hash())
            .is_some_and(|current| Arc::ptr_eq(current, entry));
        if !tracked || !entry.is_evictable() {
            return false;
        }
        self.destroy(&mut state, entry);
        true
    }

    /// Drops one reference on `entry` and applies its auto-destroy flag.
    pub fn release(&self, entry: &Arc<CacheEntry>) {
        entry.release_ref();
        self.auto_destroy_apply(entry);
    }

    /// Non-blocking reader access for observers. `None` when the entry is
    /// missing or currently being written.
    pub fn get_read_only(&self, hash: u64) -> Option<ReadOnlyEntry> {
        let entry = self.peek(hash)?;
        let guard = entry.try_read()?;
        entry.add_ref();
        Some(ReadOnlyEntry { guard, entry })
    }

    pub fn close_read_only(&self, view: ReadOnlyEntry) {
        drop(view);
    }

    /// Hash of the entry owning the host buffer at `host`.
    pub fn hash_of_data(&self, host: HostPtr) -> Option<u64> {
        let state = self.state.lock();
        let entry = state.main.values().find(|entry| entry.host_ptr() == host)?;
        entry.record_hit();
        Some(entry.hash())
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.state.lock();
        let arena = self.arena.lock().stats();
        CacheStats {
            entries: state.main.len(),
            external_entries: state.external.len(),
            current_memory: state.current_memory,
            max_memory: self.max_memory,
            queries: state.queries,
            hits: state.hits,
            arena,
        }
    }

    /// Main-map entries, oldest first.
    pub fn snapshot(&self) -> Vec<EntrySnapshot> {
        let state = self.state.lock();
        let mut entries: Vec<EntrySnapshot> =
            state.main.values().map(|entry| entry.as_ref().into()).collect();
        entries.sort_by_key(|entry| (entry.age, entry.hash));
        entries
    }

    pub fn log_stats(&self) {
        let stats = self.stats();
        tracing::debug!(
            "[pixelpipe_cache] hit rate so far: {:.3}% - size: {} MiB over {} MiB - {} items",
            100.0 * stats.hit_rate(),
            stats.current_memory / MIB,
            stats.max_memory / MIB,
            stats.entries
        );
    }
}

impl std::fmt::Debug for PixelCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PixelCache")
            .field("max_memory", &self.max_memory)
            .field("stats", &self.stats())
            .finish()
    }
}
