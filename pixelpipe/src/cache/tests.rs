use std::sync::Arc;
use std::time::Duration;

use common::log_setup::setup_test_logging;

use super::*;
use crate::arena::PAGE_SIZE;
use crate::buffer::{BufferDesc, Colorspace};
use crate::config::CacheConfig;
use crate::error::PipeError;

fn cache_with_pages(pages: usize) -> PixelCache {
    PixelCache::new(&CacheConfig::with_max_memory(pages * PAGE_SIZE))
}

fn dsc() -> BufferDesc {
    BufferDesc::rgba_f32(Colorspace::Rgb)
}

/// Creates an entry and immediately makes it unused and unlocked.
fn create_released(cache: &PixelCache, hash: u64, size: usize) -> Arc<CacheEntry> {
    match cache.get_or_create(hash, size, "test", 0, dsc()).unwrap() {
        Lookup::Created(entry, guard) => {
            drop(guard);
            cache.release(&entry);
            entry
        }
        Lookup::Hit(_) => panic!("entry {hash} should not exist yet"),
    }
}

fn accounted(cache: &PixelCache) -> usize {
    cache.snapshot().iter().map(|entry| entry.size).sum()
}

#[test]
fn miss_then_hit_updates_counters() {
    setup_test_logging();
    let cache = cache_with_pages(4);

    let first = cache.get_or_create(1, 100, "a", 0, dsc()).unwrap();
    assert!(first.is_fresh());
    assert_eq!(first.entry().refcount(), 1);
    assert!(first.entry().is_locked());
    let entry = Arc::clone(first.entry());
    drop(first);
    assert!(!entry.is_locked());

    let second = cache.get_or_create(1, 100, "a", 0, dsc()).unwrap();
    assert!(!second.is_fresh());
    assert_eq!(entry.refcount(), 2);

    let stats = cache.stats();
    assert_eq!(stats.queries, 2);
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.entries, 1);
    assert_eq!(stats.current_memory, PAGE_SIZE);
    assert!((stats.hit_rate() - 0.5).abs() < 1e-9);
}

#[test]
fn get_existing_takes_reference_and_counts_hits() {
    let cache = cache_with_pages(2);
    let entry = create_released(&cache, 7, 10);

    assert!(cache.get_existing(8).is_none());
    let found = cache.get_existing(7).unwrap();
    assert!(Arc::ptr_eq(&found, &entry));
    assert_eq!(entry.refcount(), 1);
    assert_eq!(entry.hits(), 1);

    let stats = cache.stats();
    assert_eq!(stats.queries, 3);
    assert_eq!(stats.hits, 1);
}

#[test]
fn entries_found_by_hash_survive_aging() {
    let cache = cache_with_pages(4);
    create_released(&cache, 1, 10);
    let reused = create_released(&cache, 2, 10);
    for _ in 0..2 {
        let found = cache.get_existing(2).unwrap();
        cache.release(&found);
    }

    std::thread::sleep(Duration::from_millis(5));
    assert_eq!(cache.flush_older_than(Duration::ZERO, 2), 1);
    assert!(!cache.contains(1));
    assert!(cache.contains(2));
    assert_eq!(reused.hits(), 2);
}

#[test]
fn ages_are_strictly_increasing() {
    let cache = cache_with_pages(4);
    let a = create_released(&cache, 1, 10);
    let b = create_released(&cache, 2, 10);
    assert!(b.age() > a.age());

    let again = cache.get_existing(1).unwrap();
    assert!(again.age() > b.age());
}

#[test]
fn evicts_least_recently_used_first() {
    setup_test_logging();
    let cache = cache_with_pages(3);
    create_released(&cache, 1, PAGE_SIZE);
    create_released(&cache, 2, PAGE_SIZE);
    create_released(&cache, 3, PAGE_SIZE);

    // Touch 1 so that 2 becomes the oldest.
    let touched = cache.get_existing(1).unwrap();
    cache.release(&touched);

    create_released(&cache, 4, PAGE_SIZE);

    assert!(cache.contains(1));
    assert!(!cache.contains(2));
    assert!(cache.contains(3));
    assert!(cache.contains(4));
    assert_eq!(cache.stats().current_memory, 3 * PAGE_SIZE);
    assert_eq!(accounted(&cache), 3 * PAGE_SIZE);
}

#[test]
fn referenced_and_locked_entries_are_not_evicted() {
    let cache = cache_with_pages(2);
    let held = cache.get_existing(create_released(&cache, 1, PAGE_SIZE).hash()).unwrap();
    let locked = create_released(&cache, 2, PAGE_SIZE);
    let read = locked.read();

    let err = cache
        .get_or_create(3, PAGE_SIZE, "third", 0, dsc())
        .err()
        .unwrap();
    assert!(matches!(err, PipeError::CacheFull { .. }));
    assert!(cache.contains(1));
    assert!(cache.contains(2));

    drop(read);
    let created = cache.get_or_create(3, PAGE_SIZE, "third", 0, dsc()).unwrap();
    assert!(created.is_fresh());
    assert!(!cache.contains(2));
    assert_eq!(held.refcount(), 1);
}

#[test]
fn cache_full_reports_current_module() {
    let cache = cache_with_pages(1);
    let _busy = cache.get_or_create(1, PAGE_SIZE, "busy", 0, dsc()).unwrap();

    let err = {
        let _scope = ModuleScope::enter("exposure");
        cache.get_or_create(2, PAGE_SIZE, "next", 0, dsc()).err().unwrap()
    };
    match &err {
        PipeError::CacheFull { name, module } => {
            assert_eq!(name, "next");
            assert_eq!(module.as_deref(), Some("exposure"));
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert!(err.to_string().contains("exposure"));
    assert_eq!(current_module(), None);
}

#[test]
fn oversized_request_evicts_then_fails() {
    let cache = cache_with_pages(2);
    create_released(&cache, 1, PAGE_SIZE);

    let err = cache.get_or_create(2, 3 * PAGE_SIZE, "big", 0, dsc()).err().unwrap();
    assert!(matches!(err, PipeError::CacheFull { .. }));
    // Evicting everything still cannot make room, the entry is gone anyway.
    assert_eq!(cache.stats().current_memory, 0);
}

#[test]
fn flushed_entries_give_pages_back_while_still_held() {
    setup_test_logging();
    let cache = cache_with_pages(2);
    let kept = create_released(&cache, 1, PAGE_SIZE);
    kept.add_ref();
    let peeked = create_released(&cache, 2, PAGE_SIZE);

    assert_eq!(cache.flush_pipe(ANY_PIPE), 2);
    assert_eq!(cache.stats().current_memory, 0);
    assert_eq!(cache.stats().arena.free_pages, 2);
    assert!(kept.read().is_released());
    assert!(peeked.read().bytes().is_empty());

    let third = cache.get_or_create(3, PAGE_SIZE, "third", 0, dsc()).unwrap();
    let fourth = cache.get_or_create(4, PAGE_SIZE, "fourth", 0, dsc()).unwrap();
    assert!(third.is_fresh() && fourth.is_fresh());
    assert_eq!(cache.stats().current_memory, 2 * PAGE_SIZE);
    assert_eq!(accounted(&cache), 2 * PAGE_SIZE);

    cache.release(&kept);
    assert_eq!(kept.refcount(), 0);
}

#[test]
fn evicted_entry_handles_do_not_pin_the_arena() {
    let cache = cache_with_pages(1);
    let stale = create_released(&cache, 1, PAGE_SIZE);

    let next = cache.get_or_create(2, PAGE_SIZE, "next", 0, dsc()).unwrap();
    assert!(next.is_fresh());
    assert!(!cache.contains(1));
    assert!(stale.read().is_released());
}

#[test]
fn zero_size_is_rejected() {
    let cache = cache_with_pages(2);
    let err = cache.get_or_create(1, 0, "empty", 0, dsc()).err().unwrap();
    assert!(matches!(err, PipeError::Arena(_)));
    assert_eq!(cache.stats().entries, 0);
}

#[test]
fn remove_respects_references_and_locks() {
    let cache = cache_with_pages(4);
    let entry = create_released(&cache, 1, 10);

    entry.add_ref();
    assert!(!cache.remove(1, false));
    assert!(cache.contains(1));

    let guard = entry.read();
    assert!(!cache.remove(1, true));
    drop(guard);

    assert!(cache.remove(1, true));
    assert!(!cache.contains(1));
    assert!(!cache.remove(1, true));
    assert_eq!(cache.stats().current_memory, 0);

    create_released(&cache, 2, 10);
    assert!(cache.remove(2, false));
}

#[test]
fn removed_entry_keeps_its_memory_until_dropped() {
    let cache = cache_with_pages(1);
    let entry = create_released(&cache, 1, PAGE_SIZE);
    entry.add_ref();
    assert!(cache.remove(1, true));

    // Budget is free, pages are not.
    let err = cache.get_or_create(2, PAGE_SIZE, "next", 0, dsc()).err().unwrap();
    assert!(matches!(err, PipeError::CacheFull { .. }));

    drop(entry);
    assert!(cache.get_or_create(2, PAGE_SIZE, "next", 0, dsc()).is_ok());
}

#[test]
fn flush_pipe_selects_by_pipe_id() {
    let cache = cache_with_pages(8);
    for (hash, pipe) in [(1, 0), (2, 0), (3, 1), (4, 2)] {
        let lookup = cache.get_or_create(hash, 10, "x", pipe, dsc()).unwrap();
        drop(lookup);
    }
    // Referenced entries are flushed too, locked ones are not.
    let locked = cache.peek(1).unwrap();
    let guard = locked.write();

    assert_eq!(cache.flush_pipe(0), 1);
    assert!(cache.contains(1));
    assert!(!cache.contains(2));
    assert!(cache.contains(3));

    drop(guard);
    assert_eq!(cache.flush_pipe(ANY_PIPE), 3);
    assert_eq!(cache.stats().entries, 0);
    assert_eq!(cache.stats().current_memory, 0);
}

#[test]
fn aging_removes_old_unpopular_entries() {
    let cache = cache_with_pages(8);
    create_released(&cache, 1, 10);
    let popular = create_released(&cache, 2, 10);
    for _ in 0..4 {
        let hit = cache.get_or_create(2, 10, "test", 0, dsc()).unwrap();
        cache.release(hit.entry());
    }
    let used = create_released(&cache, 3, 10);
    used.add_ref();

    std::thread::sleep(Duration::from_millis(5));
    assert_eq!(cache.flush_older_than(Duration::from_secs(60), 4), 0);
    assert_eq!(cache.flush_older_than(Duration::ZERO, 4), 1);

    assert!(!cache.contains(1));
    assert!(cache.contains(2));
    assert!(cache.contains(3));
    assert_eq!(popular.hits(), 4);
}

#[test]
fn aging_timer_sweeps_in_background() {
    let config = CacheConfig {
        max_memory_bytes: 4 * PAGE_SIZE,
        aging_threshold_secs: 0,
        ..CacheConfig::default()
    };
    let cache = Arc::new(PixelCache::new(&config));
    create_released(&cache, 1, 10);

    let mut timer = AgingTimer::start(&cache, Duration::from_millis(5));
    assert!(timer.is_running());

    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while cache.contains(1) && std::time::Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(5));
    }
    assert!(!cache.contains(1));

    timer.stop();
    assert!(!timer.is_running());
}

#[test]
fn aging_skips_when_cache_is_busy() {
    let config = CacheConfig {
        max_memory_bytes: 4 * PAGE_SIZE,
        aging_threshold_secs: 0,
        ..CacheConfig::default()
    };
    let cache = PixelCache::new(&config);
    create_released(&cache, 1, 10);
    std::thread::sleep(Duration::from_millis(2));

    let held = cache.state.lock();
    assert_eq!(cache.flush_aged(), 0);
    drop(held);
    assert_eq!(cache.flush_aged(), 1);
}

#[test]
fn external_buffers_share_the_budget() {
    let cache = cache_with_pages(2);
    create_released(&cache, 1, PAGE_SIZE);
    create_released(&cache, 2, PAGE_SIZE);

    let mut external = cache.alloc_external(100, "scratch", 0).unwrap();
    assert_eq!(external.len(), 100);
    external[0] = 42;
    assert_eq!(external[0], 42);

    let stats = cache.stats();
    assert_eq!(stats.entries, 1);
    assert_eq!(stats.external_entries, 1);
    assert_eq!(stats.current_memory, 2 * PAGE_SIZE);
    assert!(!cache.contains(1));

    // External entries are never eviction candidates.
    let err = cache.alloc_external(2 * PAGE_SIZE, "second", 0).err().unwrap();
    assert!(matches!(err, PipeError::CacheFull { .. }));
    assert_eq!(cache.stats().entries, 0);
    assert_eq!(cache.stats().current_memory, PAGE_SIZE);

    cache.free_external(external);
    let stats = cache.stats();
    assert_eq!(stats.external_entries, 0);
    assert_eq!(stats.current_memory, 0);
}

#[test]
#[should_panic(expected = "free_external")]
fn freeing_a_foreign_external_buffer_panics() {
    let cache = cache_with_pages(2);
    let other = cache_with_pages(2);
    let buffer = other.alloc_external(10, "foreign", 0).unwrap();
    cache.free_external(buffer);
}

#[test]
fn read_only_borrow_is_non_blocking() {
    let cache = cache_with_pages(2);
    let lookup = cache.get_or_create(1, 10, "x", 0, dsc()).unwrap();
    let Lookup::Created(entry, mut guard) = lookup else {
        panic!("expected fresh entry");
    };
    guard.bytes_mut()[0] = 9;

    assert!(cache.get_read_only(1).is_none());
    assert!(cache.get_read_only(2).is_none());
    drop(guard);
    cache.release(&entry);

    let view = cache.get_read_only(1).unwrap();
    assert_eq!(view.bytes()[0], 9);
    assert_eq!(view.dsc, dsc());
    assert_eq!(entry.refcount(), 1);
    assert!(!cache.remove(1, false));

    cache.close_read_only(view);
    assert_eq!(entry.refcount(), 0);
    assert!(!entry.is_locked());
}

#[test]
fn auto_destroy_applies_on_last_release() {
    let cache = cache_with_pages(2);
    let lookup = cache.get_or_create(1, 10, "x", 0, dsc()).unwrap();
    let entry = Arc::clone(lookup.entry());
    drop(lookup);
    entry.add_ref();

    assert!(cache.flag_auto_destroy(1));
    assert!(!cache.flag_auto_destroy(2));

    cache.release(&entry);
    assert!(cache.contains(1));
    cache.release(&entry);
    assert!(!cache.contains(1));
    assert_eq!(cache.stats().current_memory, 0);
}

#[test]
fn hash_of_data_finds_owner() {
    let cache = cache_with_pages(2);
    let entry = create_released(&cache, 11, 10);
    assert_eq!(cache.hash_of_data(entry.host_ptr()), Some(11));
    assert_eq!(entry.hits(), 1);
    assert_eq!(cache.hash_of_data(crate::buffer::HostPtr(1)), None);
}

#[test]
fn unref_hash_never_goes_negative() {
    let cache = cache_with_pages(2);
    let entry = create_released(&cache, 1, 10);
    cache.unref_hash(1);
    cache.unref_hash(1);
    assert_eq!(entry.refcount(), 0);
    cache.unref_hash(99);
}

#[test]
fn concurrent_lookups_keep_accounting_consistent() {
    let cache = Arc::new(cache_with_pages(16));
    std::thread::scope(|scope| {
        for worker in 0..4u64 {
            let cache = Arc::clone(&cache);
            scope.spawn(move || {
                for i in 0..200u64 {
                    let hash = (worker * 7 + i) % 24;
                    if let Ok(lookup) = cache.get_or_create(hash, PAGE_SIZE, "w", 0, dsc()) {
                        let entry = Arc::clone(lookup.entry());
                        drop(lookup);
                        cache.release(&entry);
                    }
                }
            });
        }
    });

    let stats = cache.stats();
    assert!(stats.current_memory <= stats.max_memory);
    assert_eq!(stats.current_memory, accounted(&cache));
    assert_eq!(stats.queries, 800);
    assert!(cache.snapshot().iter().all(|entry| entry.refcount == 0 && !entry.locked));
}
