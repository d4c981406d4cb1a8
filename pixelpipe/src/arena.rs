//! Page-granular bounded allocator backing the pixel cache.
//!
//! The arena is split into fixed 64 KiB pages. `free_runs` is kept sorted by
//! first page; each run records a stretch of consecutive free pages. Blocks
//! are carved from the front of the best-fitting run and coalesced with their
//! neighbours when returned.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::buffer::{AlignedBuf, HostPtr};
use crate::error::{ArenaError, ArenaResult};

pub const PAGE_SIZE: usize = 64 * 1024;

static NEXT_ARENA_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FreeRun {
    start: u32,
    length: u32,
}

impl FreeRun {
    fn end(&self) -> u32 {
        self.start + self.length
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ArenaStats {
    pub total_pages: u32,
    pub free_pages: u32,
    pub largest_free_run: u32,
}

/// A page range handed out by [`Arena::alloc`] together with its storage.
#[derive(Debug)]
pub struct ArenaBlock {
    arena_id: u64,
    first_page: u32,
    pages: u32,
    buf: AlignedBuf,
}

impl ArenaBlock {
    /// Page-rounded size in bytes.
    pub fn size(&self) -> usize {
        self.pages as usize * PAGE_SIZE
    }

    pub fn first_page(&self) -> u32 {
        self.first_page
    }

    pub fn pages(&self) -> u32 {
        self.pages
    }

    pub fn data(&self) -> &[u8] {
        self.buf.as_slice()
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        self.buf.as_mut_slice()
    }

    pub fn host_ptr(&self) -> HostPtr {
        self.buf.host_ptr()
    }
}

#[derive(Debug)]
pub struct Arena {
    id: u64,
    num_pages: u32,
    free_runs: Vec<FreeRun>,
}

impl Arena {
    /// Creates an arena of `capacity` bytes, rounded down to whole pages.
    pub fn new(capacity: usize) -> Self {
        let num_pages = (capacity / PAGE_SIZE).min(u32::MAX as usize) as u32;
        let free_runs = if num_pages > 0 {
            vec![FreeRun {
                start: 0,
                length: num_pages,
            }]
        } else {
            Vec::new()
        };

        Self {
            id: NEXT_ARENA_ID.fetch_add(1, Ordering::Relaxed),
            num_pages,
            free_runs,
        }
    }

    pub fn capacity(&self) -> usize {
        self.num_pages as usize * PAGE_SIZE
    }

    /// Page count and page-rounded size for a request of `size` bytes.
    pub fn calc(&self, size: usize) -> ArenaResult<(u32, usize)> {
        if size == 0 || self.num_pages == 0 {
            return Err(ArenaError::InvalidSize(size));
        }

        let pages = size.div_ceil(PAGE_SIZE);
        if pages > self.num_pages as usize {
            return Err(ArenaError::InvalidSize(size));
        }

        Ok((pages as u32, pages * PAGE_SIZE))
    }

    pub fn alloc(&mut self, size: usize) -> ArenaResult<ArenaBlock> {
        let (pages, rounded) = self.calc(size)?;

        let mut best: Option<(usize, u32)> = None;
        for (idx, run) in self.free_runs.iter().enumerate() {
            if run.length >= pages && best.is_none_or(|(_, len)| run.length < len) {
                best = Some((idx, run.length));
                if run.length == pages {
                    break;
                }
            }
        }

        let Some((idx, _)) = best else {
            return Err(ArenaError::OutOfArena {
                pages: pages as usize,
            });
        };

        // Consume from the front so the list stays sorted.
        let run = &mut self.free_runs[idx];
        let first_page = run.start;
        run.start += pages;
        run.length -= pages;
        if run.length == 0 {
            self.free_runs.remove(idx);
        }

        Ok(ArenaBlock {
            arena_id: self.id,
            first_page,
            pages,
            buf: AlignedBuf::new_zeroed(rounded),
        })
    }

    /// Returns a block's pages to the free list.
    ///
    /// Blocks from another arena or overlapping free runs are refused and logged.
    pub fn free(&mut self, block: ArenaBlock) {
        if block.arena_id != self.id {
            tracing::error!("[arena] free: block belongs to another arena");
            return;
        }
        if block.first_page as u64 + block.pages as u64 > self.num_pages as u64 {
            tracing::error!("[arena] free: range out of bounds");
            return;
        }

        let first = block.first_page;
        let pages = block.pages;
        let idx = self.free_runs.partition_point(|run| run.start < first);

        if idx > 0 && self.free_runs[idx - 1].end() > first {
            tracing::error!("[arena] free: overlap with previous run");
            return;
        }
        if idx < self.free_runs.len() && first + pages > self.free_runs[idx].start {
            tracing::error!("[arena] free: overlap with next run");
            return;
        }

        self.free_runs.insert(
            idx,
            FreeRun {
                start: first,
                length: pages,
            },
        );

        if idx + 1 < self.free_runs.len() && self.free_runs[idx].end() == self.free_runs[idx + 1].start
        {
            self.free_runs[idx].length += self.free_runs[idx + 1].length;
            self.free_runs.remove(idx + 1);
        }
        if idx > 0 && self.free_runs[idx - 1].end() == self.free_runs[idx].start {
            self.free_runs[idx - 1].length += self.free_runs[idx].length;
            self.free_runs.remove(idx);
        }
    }

    /// Whether `block` was handed out by this arena and is still allocated.
    pub fn contains(&self, block: &ArenaBlock) -> bool {
        if block.arena_id != self.id {
            return false;
        }
        let first = block.first_page;
        let end = first + block.pages;
        !self
            .free_runs
            .iter()
            .any(|run| run.start < end && first < run.end())
    }

    pub fn stats(&self) -> ArenaStats {
        ArenaStats {
            total_pages: self.num_pages,
            free_pages: self.free_runs.iter().map(|run| run.length).sum(),
            largest_free_run: self.free_runs.iter().map(|run| run.length).max().unwrap_or(0),
        }
    }
}

/// Arena shared between the cache and the blocks it hands out.
pub type SharedArena = Arc<Mutex<Arena>>;

pub fn shared(capacity: usize) -> SharedArena {
    Arc::new(Mutex::new(Arena::new(capacity)))
}

/// A block that returns its pages to the arena when dropped.
///
/// The arena mutex is a leaf lock: it is only taken for the duration of a
/// single alloc or free.
#[derive(Debug)]
pub struct PooledBlock {
    block: Option<ArenaBlock>,
    arena: Weak<Mutex<Arena>>,
}

impl PooledBlock {
    pub fn alloc(arena: &SharedArena, size: usize) -> ArenaResult<Self> {
        let block = arena.lock().alloc(size)?;
        Ok(Self {
            block: Some(block),
            arena: Arc::downgrade(arena),
        })
    }

    pub fn size(&self) -> usize {
        self.block.as_ref().map_or(0, ArenaBlock::size)
    }

    pub fn data(&self) -> &[u8] {
        match self.block.as_ref() {
            Some(block) => block.data(),
            None => &[],
        }
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        match self.block.as_mut() {
            Some(block) => block.data_mut(),
            None => &mut [],
        }
    }

    pub fn host_ptr(&self) -> HostPtr {
        self.block
            .as_ref()
            .map_or(HostPtr::default(), ArenaBlock::host_ptr)
    }

    /// Returns the pages to the arena now. The block is empty afterwards.
    pub fn release(&mut self) {
        if let (Some(block), Some(arena)) = (self.block.take(), self.arena.upgrade()) {
            arena.lock().free(block);
        }
    }

    pub fn is_released(&self) -> bool {
        self.block.is_none()
    }
}

impl Drop for PooledBlock {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use rand::seq::SliceRandom;
    use rand::{Rng, SeedableRng};

    use super::*;

    #[test]
    fn calc_rounds_to_pages() {
        let arena = Arena::new(10 * PAGE_SIZE);
        assert_eq!(arena.calc(1).unwrap(), (1, PAGE_SIZE));
        assert_eq!(arena.calc(PAGE_SIZE).unwrap(), (1, PAGE_SIZE));
        assert_eq!(arena.calc(PAGE_SIZE + 1).unwrap(), (2, 2 * PAGE_SIZE));
        assert_eq!(arena.calc(0), Err(ArenaError::InvalidSize(0)));
        assert!(arena.calc(10 * PAGE_SIZE + 1).is_err());
    }

    #[test]
    fn blocks_are_cacheline_aligned_and_zeroed() {
        let mut arena = Arena::new(4 * PAGE_SIZE);
        let block = arena.alloc(100).unwrap();
        assert_eq!(block.size(), PAGE_SIZE);
        assert_eq!(block.host_ptr().0 % crate::buffer::CACHELINE_BYTES, 0);
        assert!(block.data().iter().all(|&b| b == 0));
    }

    #[test]
    fn out_of_arena_when_no_run_fits() {
        let mut arena = Arena::new(4 * PAGE_SIZE);
        let _a = arena.alloc(3 * PAGE_SIZE).unwrap();
        assert_eq!(
            arena.alloc(2 * PAGE_SIZE).unwrap_err(),
            ArenaError::OutOfArena { pages: 2 }
        );
    }

    #[test]
    fn best_fit_prefers_smallest_sufficient_run() {
        let mut arena = Arena::new(10 * PAGE_SIZE);
        let a = arena.alloc(3 * PAGE_SIZE).unwrap(); // pages 0..3
        let _b = arena.alloc(PAGE_SIZE).unwrap(); // page 3
        let c = arena.alloc(2 * PAGE_SIZE).unwrap(); // pages 4..6
        let _d = arena.alloc(PAGE_SIZE).unwrap(); // page 6
        arena.free(a);
        arena.free(c);

        // Free runs: [0..3), [4..6), [7..10). A 2-page request takes the exact fit.
        let e = arena.alloc(2 * PAGE_SIZE).unwrap();
        assert_eq!(e.first_page(), 4);
    }

    #[test]
    fn free_coalesces_neighbours() {
        let mut arena = Arena::new(6 * PAGE_SIZE);
        let a = arena.alloc(2 * PAGE_SIZE).unwrap();
        let b = arena.alloc(2 * PAGE_SIZE).unwrap();
        let c = arena.alloc(2 * PAGE_SIZE).unwrap();

        arena.free(a);
        arena.free(c);
        assert_eq!(arena.stats().largest_free_run, 2);

        arena.free(b);
        let stats = arena.stats();
        assert_eq!(stats.free_pages, 6);
        assert_eq!(stats.largest_free_run, 6, "runs should merge into one");
    }

    #[test]
    fn foreign_blocks_are_refused() {
        let mut a = Arena::new(4 * PAGE_SIZE);
        let mut b = Arena::new(4 * PAGE_SIZE);
        let block = a.alloc(PAGE_SIZE).unwrap();

        assert!(a.contains(&block));
        assert!(!b.contains(&block));
        b.free(block);
        assert_eq!(b.stats().free_pages, 4);
        assert_eq!(a.stats().free_pages, 3);
    }

    #[test]
    fn random_churn_keeps_accounting() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        let mut arena = Arena::new(256 * PAGE_SIZE);
        let mut live: Vec<ArenaBlock> = Vec::new();

        for _ in 0..2000 {
            if live.is_empty() || rng.random_bool(0.55) {
                let size = rng.random_range(1..8 * PAGE_SIZE);
                if let Ok(block) = arena.alloc(size) {
                    live.push(block);
                }
            } else {
                live.shuffle(&mut rng);
                if let Some(block) = live.pop() {
                    arena.free(block);
                }
            }

            let used: u32 = live.iter().map(|b| b.pages()).sum();
            assert_eq!(arena.stats().free_pages + used, 256);
        }

        for block in live.drain(..) {
            arena.free(block);
        }
        assert_eq!(arena.stats().largest_free_run, 256);
    }

    #[test]
    fn pooled_block_returns_pages_on_drop() {
        let arena = shared(8 * PAGE_SIZE);
        let a = PooledBlock::alloc(&arena, 3 * PAGE_SIZE).unwrap();
        let b = PooledBlock::alloc(&arena, PAGE_SIZE).unwrap();
        assert_eq!(arena.lock().stats().free_pages, 4);

        drop(a);
        assert_eq!(arena.lock().stats().free_pages, 7);
        drop(b);
        assert_eq!(arena.lock().stats().largest_free_run, 8);
    }
}
