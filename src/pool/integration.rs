#[cfg(all(test, not(loom)))]
mod tests {
    use crate::pool::allocator::{GlobalPooledAllocator, PooledAllocator, PooledAllocatorConfig};
    use crate::pool::buf::MemoryKind;
    use crate::sync::Arc;
    use crate::sync::barrier::Barrier;
    use crate::sync::thread;

    fn one_arena_config() -> PooledAllocatorConfig {
        PooledAllocatorConfig {
            num_heap_arenas: 1,
            num_direct_arenas: 0,
            ..PooledAllocatorConfig::default()
        }
    }

    #[test]
    fn test_cache_trim_returns_cold_entries_to_arena() {
        let _guard = crate::pool::TEST_MUTEX.read().unwrap();
        let trim_interval = 8192u32;
        let alloc = PooledAllocator::with_config(PooledAllocatorConfig {
            cache_trim_interval: trim_interval,
            ..one_arena_config()
        })
        .unwrap();
        let mut cache = alloc.new_thread_cache();

        // Park 100 page-sized buffers: the 64-entry ring fills, the other
        // 36 overflow straight to the arena.
        let mut bufs = Vec::new();
        for _ in 0..100 {
            bufs.push(alloc.allocate(&mut cache, MemoryKind::Heap, 8192, 8192).unwrap());
        }
        for buf in bufs.drain(..) {
            alloc.release(&mut cache, buf).unwrap();
        }
        assert_eq!(cache.cached_entries(), 64);
        assert_eq!(alloc.metrics().heap_arenas[0].normal_deallocations, 36);

        // A full trim cycle of 16 KiB churn: the 8 KiB ring sees no hits,
        // so the trim frees all 64 of its cold entries.
        for _ in 0..=trim_interval {
            let buf = alloc
                .allocate(&mut cache, MemoryKind::Heap, 16 * 1024, 16 * 1024)
                .unwrap();
            alloc.release(&mut cache, buf).unwrap();
        }
        assert!(
            cache.cached_entries() <= 64,
            "cache retained {} entries",
            cache.cached_entries()
        );
        let deallocs = alloc.metrics().heap_arenas[0].normal_deallocations;
        assert!(
            deallocs >= 100,
            "cold entries were not trimmed back to the arena (deallocs: {deallocs})"
        );

        alloc.free_thread_cache(&mut cache);
        assert_eq!(alloc.used_heap_bytes(), 0);
    }

    #[test]
    fn test_pairs_of_one_class_stay_within_ring_capacity() {
        let _guard = crate::pool::TEST_MUTEX.read().unwrap();
        let alloc = PooledAllocator::with_config(one_arena_config()).unwrap();
        let mut cache = alloc.new_thread_cache();

        // 8192 allocate/release pairs of a single normal class: the working
        // set is one buffer, so the ring never grows past it and the arena
        // sees exactly one real allocation.
        for _ in 0..8192 {
            let buf = alloc.allocate(&mut cache, MemoryKind::Heap, 8192, 8192).unwrap();
            alloc.release(&mut cache, buf).unwrap();
        }
        assert!(cache.cached_entries() <= 64);
        assert_eq!(alloc.metrics().heap_arenas[0].normal_allocations, 1);

        alloc.free_thread_cache(&mut cache);
        assert_eq!(alloc.used_heap_bytes(), 0);
    }

    #[test]
    fn test_foreign_arena_release_bypasses_cache() {
        let _guard = crate::pool::TEST_MUTEX.read().unwrap();
        let alloc = PooledAllocator::with_config(PooledAllocatorConfig {
            num_heap_arenas: 2,
            num_direct_arenas: 0,
            ..PooledAllocatorConfig::default()
        })
        .unwrap();

        let mut cache_a = alloc.new_thread_cache();
        let mut cache_b = alloc.new_thread_cache();
        let arena_a = cache_a.arena_for(MemoryKind::Heap).unwrap();
        assert_ne!(Some(arena_a), cache_b.arena_for(MemoryKind::Heap));

        // Allocated out of arena A, released through B's cache: B is bound
        // to the other arena, so the handle goes straight home.
        let buf = alloc.allocate(&mut cache_a, MemoryKind::Heap, 4096, 4096).unwrap();
        assert_eq!(buf.arena, arena_a);
        alloc.release(&mut cache_b, buf).unwrap();
        assert_eq!(cache_b.cached_entries(), 0);
        assert_eq!(alloc.used_heap_bytes(), 0);

        alloc.free_thread_cache(&mut cache_a);
        alloc.free_thread_cache(&mut cache_b);
    }

    #[test]
    fn test_concurrent_stress_with_data_integrity() {
        let _guard = crate::pool::TEST_MUTEX.read().unwrap();
        let alloc = Arc::new(
            PooledAllocator::with_config(PooledAllocatorConfig {
                num_heap_arenas: 2,
                num_direct_arenas: 0,
                ..PooledAllocatorConfig::default()
            })
            .unwrap(),
        );
        let num_threads = 8u8;
        let iters = 200usize;
        let barrier = Arc::new(Barrier::new(num_threads as usize));

        let handles: Vec<_> = (0..num_threads)
            .map(|t| {
                let alloc = alloc.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    let mut cache = alloc.new_thread_cache();
                    let sizes = [16, 64, 500, 1024, 4096, 8192, 65536];
                    let mut bufs = Vec::with_capacity(iters);

                    barrier.wait();

                    // 1. Sustained concurrent holding: allocate all first.
                    for i in 0..iters {
                        let size = sizes[i % sizes.len()];
                        let buf = alloc
                            .allocate(&mut cache, MemoryKind::Heap, size, size)
                            .unwrap();
                        let tag = [t, (i % 251) as u8];
                        alloc.copy_into(&buf, &tag).unwrap();
                        bufs.push(buf);
                    }

                    // 2. Verify all held buffers still carry their tag.
                    for (i, buf) in bufs.iter().enumerate() {
                        let mut tag = [0u8; 2];
                        alloc.copy_out(buf, &mut tag).unwrap();
                        assert_eq!(
                            tag,
                            [t, (i % 251) as u8],
                            "memory corruption in thread {t} buffer {i}"
                        );
                    }

                    // 3. Free everything and hand the cache back.
                    for buf in bufs {
                        alloc.release(&mut cache, buf).unwrap();
                    }
                    alloc.free_thread_cache(&mut cache);
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(alloc.used_heap_bytes(), 0);
        assert_eq!(alloc.num_thread_caches(), 0);
        let metrics = alloc.metrics();
        for arena in &metrics.heap_arenas {
            assert_eq!(arena.chunk_free_bytes, arena.chunk_total_bytes);
            assert_eq!(arena.huge_allocations, 0);
        }
    }

    #[test]
    fn test_mixed_kind_stress_including_huge() {
        let _guard = crate::pool::TEST_MUTEX.read().unwrap();
        // Small 64 KiB chunks keep the huge allocations cheap to hold.
        let alloc = PooledAllocator::with_config(PooledAllocatorConfig {
            num_heap_arenas: 1,
            num_direct_arenas: 1,
            page_size: 4096,
            max_order: 4,
            ..PooledAllocatorConfig::default()
        })
        .unwrap();
        let mut cache = alloc.new_thread_cache();
        let chunk_size = alloc.chunk_size();
        assert_eq!(chunk_size, 64 * 1024);

        let mut bufs = Vec::new();
        for i in 0..120usize {
            let kind = if i % 2 == 0 {
                MemoryKind::Heap
            } else {
                MemoryKind::Direct
            };
            let size = match i % 4 {
                0 => 48,
                1 => 2048,
                2 => 16 * 1024,
                _ => chunk_size + 4096, // huge
            };
            let buf = alloc.allocate(&mut cache, kind, size, size).unwrap();
            alloc.copy_into(&buf, &[i as u8]).unwrap();
            bufs.push((buf, i as u8));
        }

        for (buf, tag) in &bufs {
            let mut out = [0u8; 1];
            alloc.copy_out(buf, &mut out).unwrap();
            assert_eq!(out[0], *tag);
        }
        for (buf, _) in bufs {
            alloc.release(&mut cache, buf).unwrap();
        }

        alloc.free_thread_cache(&mut cache);
        assert_eq!(alloc.used_heap_bytes(), 0);
        assert_eq!(alloc.used_direct_bytes(), 0);
    }

    #[test]
    fn test_global_facade_drains_caches_on_thread_exit() {
        // Write lock: other tests touching the global instance would skew
        // the used-bytes baseline.
        let _guard = crate::pool::TEST_MUTEX.write().unwrap();
        // Another test may already have initialized the global instance.
        drop(GlobalPooledAllocator::init(PooledAllocatorConfig {
            num_heap_arenas: 1,
            num_direct_arenas: 1,
            ..PooledAllocatorConfig::default()
        }));
        let before = GlobalPooledAllocator::get().used_heap_bytes();

        let handles: Vec<_> = (0..4)
            .map(|_| {
                thread::spawn(|| {
                    for _ in 0..50 {
                        let buf =
                            GlobalPooledAllocator::allocate(MemoryKind::Heap, 1024, 1024).unwrap();
                        GlobalPooledAllocator::release(buf).unwrap();
                    }
                    // The TLS cache still holds recycled entries here; the
                    // thread-exit hook must drain them.
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        // <= rather than ==: a test thread from an earlier global-facade
        // test may still be draining its own TLS cache.
        assert!(
            GlobalPooledAllocator::get().used_heap_bytes() <= before,
            "thread-exit drain must return all cached handles"
        );
    }
}
