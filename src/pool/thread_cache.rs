use super::allocator::PooledAllocator;
use super::buf::MemoryKind;
use super::size_classes::{NUM_TINY_POOLS, SizeClasses, SizeFamily};

/// One recycled allocation parked in a thread-local ring.
#[derive(Clone, Copy, Debug)]
pub(crate) struct CacheEntry {
    pub chunk: u32,
    pub handle: u64,
    pub norm: usize,
}

impl CacheEntry {
    const EMPTY: CacheEntry = CacheEntry {
        chunk: u32::MAX,
        handle: 0,
        norm: 0,
    };
}

/// Fixed-capacity FIFO ring of recycled handles for one size class.
///
/// `hits` counts pops since the last trim; the trim policy frees
/// `capacity - hits` of the oldest entries, shrinking each ring toward its
/// thread's actual working set.
struct CacheRing {
    entries: Box<[CacheEntry]>,
    head: usize,
    len: usize,
    hits: u32,
}

impl CacheRing {
    fn new(capacity: u32) -> Self {
        Self {
            entries: vec![CacheEntry::EMPTY; capacity as usize].into_boxed_slice(),
            head: 0,
            len: 0,
            hits: 0,
        }
    }

    #[inline]
    fn capacity(&self) -> usize {
        self.entries.len()
    }

    fn push(&mut self, entry: CacheEntry) -> bool {
        if self.len == self.capacity() {
            return false;
        }
        let tail = (self.head + self.len) % self.capacity();
        self.entries[tail] = entry;
        self.len += 1;
        true
    }

    fn pop(&mut self) -> Option<CacheEntry> {
        if self.len == 0 {
            return None;
        }
        let entry = self.entries[self.head];
        self.head = (self.head + 1) % self.capacity();
        self.len -= 1;
        Some(entry)
    }

    /// Hand every cached entry to `release` (thread exit / explicit drain).
    fn drain(&mut self, mut release: impl FnMut(CacheEntry)) {
        while let Some(entry) = self.pop() {
            release(entry);
        }
        self.hits = 0;
    }

    /// Free the entries the thread did not re-use since the last trim:
    /// `capacity - hits` oldest ones. Resets the hit counter.
    fn trim(&mut self, mut release: impl FnMut(CacheEntry)) {
        let spare = self.capacity().saturating_sub(self.hits as usize);
        let victims = spare.min(self.len);
        for _ in 0..victims {
            if let Some(entry) = self.pop() {
                release(entry);
            }
        }
        self.hits = 0;
    }
}

/// Ring set for one memory kind, bound to at most one arena. Entries from
/// any other arena bypass the cache (the bound arena is the only one whose
/// `free_handle` these entries may reach).
struct KindCaches {
    arena: Option<u32>,
    tiny: Box<[CacheRing]>,
    small: Box<[CacheRing]>,
    normal: Box<[CacheRing]>,
}

impl KindCaches {
    fn disabled() -> Self {
        Self {
            arena: None,
            tiny: Box::new([]),
            small: Box::new([]),
            normal: Box::new([]),
        }
    }

    fn new(
        arena: Option<u32>,
        sc: &SizeClasses,
        tiny_cache_size: u32,
        small_cache_size: u32,
        normal_cache_size: u32,
        max_cached_buffer_capacity: usize,
    ) -> Self {
        let Some(arena) = arena else {
            return Self::disabled();
        };

        let rings = |count: usize, capacity: u32| -> Box<[CacheRing]> {
            if capacity == 0 {
                Box::new([])
            } else {
                (0..count).map(|_| CacheRing::new(capacity)).collect()
            }
        };

        // Normal rings exist only for classes up to the cached-capacity
        // ceiling; larger classes get no ring at all (capacity zero).
        let cached_cap = max_cached_buffer_capacity.min(sc.chunk_size);
        let normal_count = if normal_cache_size > 0 && cached_cap >= sc.page_size {
            (cached_cap >> sc.page_shifts).ilog2() as usize + 1
        } else {
            0
        };

        Self {
            arena: Some(arena),
            tiny: rings(NUM_TINY_POOLS, tiny_cache_size),
            small: rings(sc.num_small_pools(), small_cache_size),
            normal: rings(normal_count, normal_cache_size),
        }
    }

    fn ring_mut(&mut self, sc: &SizeClasses, norm: usize) -> Option<&mut CacheRing> {
        match sc.family(norm) {
            SizeFamily::Tiny => self.tiny.get_mut(SizeClasses::tiny_idx(norm)),
            SizeFamily::Small => self.small.get_mut(SizeClasses::small_idx(norm)),
            SizeFamily::Normal => {
                let idx = (norm >> sc.page_shifts).ilog2() as usize;
                self.normal.get_mut(idx)
            }
            SizeFamily::Huge => None,
        }
    }

    fn cached_entries(&self) -> usize {
        self.tiny
            .iter()
            .chain(self.small.iter())
            .chain(self.normal.iter())
            .map(|r| r.len)
            .sum()
    }
}

/// Per-thread recycling rings of recently-freed handles.
///
/// Exclusively owned by one thread: the fast path is plain field access
/// with no synchronization. Frees arriving from other threads never touch a
/// foreign cache — they go straight to the owning arena.
///
/// A cached entry's lifecycle: `CACHED -> (popped) ALLOCATED` or
/// `CACHED -> (trim victim / drain) RETURNED-TO-ARENA`.
pub struct ThreadCache {
    heap: KindCaches,
    direct: KindCaches,
    /// Cache hits since the last trim; crossing `trim_interval` schedules one.
    allocations: u32,
    trim_interval: u32,
    /// Set for caches created by the global facade; lets `Drop` drain into
    /// the arenas when the owning thread dies without explicit cleanup.
    pub(crate) owner: Option<&'static PooledAllocator>,
}

impl ThreadCache {
    /// A cache that never holds anything: every push fails, every pop
    /// misses. Used when caching is disabled and in arena-path tests.
    pub fn disabled() -> Self {
        Self {
            heap: KindCaches::disabled(),
            direct: KindCaches::disabled(),
            allocations: 0,
            trim_interval: 0,
            owner: None,
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        heap_arena: Option<u32>,
        direct_arena: Option<u32>,
        sc: &SizeClasses,
        tiny_cache_size: u32,
        small_cache_size: u32,
        normal_cache_size: u32,
        max_cached_buffer_capacity: usize,
        trim_interval: u32,
    ) -> Self {
        Self {
            heap: KindCaches::new(
                heap_arena,
                sc,
                tiny_cache_size,
                small_cache_size,
                normal_cache_size,
                max_cached_buffer_capacity,
            ),
            direct: KindCaches::new(
                direct_arena,
                sc,
                tiny_cache_size,
                small_cache_size,
                normal_cache_size,
                max_cached_buffer_capacity,
            ),
            allocations: 0,
            trim_interval,
            owner: None,
        }
    }

    fn kind_caches(&mut self, kind: MemoryKind) -> &mut KindCaches {
        match kind {
            MemoryKind::Heap => &mut self.heap,
            MemoryKind::Direct => &mut self.direct,
        }
    }

    pub(crate) fn arena_for(&self, kind: MemoryKind) -> Option<u32> {
        match kind {
            MemoryKind::Heap => self.heap.arena,
            MemoryKind::Direct => self.direct.arena,
        }
    }

    pub(crate) fn bound_arenas(&self) -> (Option<u32>, Option<u32>) {
        (self.heap.arena, self.direct.arena)
    }

    /// Pop a recycled handle for `norm` out of the ring bound to `arena`.
    pub(crate) fn pop(
        &mut self,
        kind: MemoryKind,
        arena: u32,
        sc: &SizeClasses,
        norm: usize,
    ) -> Option<CacheEntry> {
        let kc = self.kind_caches(kind);
        if kc.arena != Some(arena) {
            return None;
        }
        let ring = kc.ring_mut(sc, norm)?;
        let entry = ring.pop()?;
        ring.hits = ring.hits.saturating_add(1);
        self.allocations = self.allocations.saturating_add(1);
        Some(entry)
    }

    /// Park a freed handle. Returns false on a full ring, a class with no
    /// ring, or a buffer from an arena this cache is not bound to — the
    /// caller then frees to the arena directly.
    pub(crate) fn push(
        &mut self,
        kind: MemoryKind,
        arena: u32,
        sc: &SizeClasses,
        chunk: u32,
        handle: u64,
        norm: usize,
    ) -> bool {
        let kc = self.kind_caches(kind);
        if kc.arena != Some(arena) {
            return false;
        }
        let Some(ring) = kc.ring_mut(sc, norm) else {
            return false;
        };
        ring.push(CacheEntry { chunk, handle, norm })
    }

    /// True once `trim_interval` cache hits have accumulated.
    pub(crate) fn trim_due(&self) -> bool {
        self.trim_interval > 0 && self.allocations >= self.trim_interval
    }

    /// Shrink every ring toward its working set, freeing spare entries back
    /// to their owning arenas.
    pub fn trim(&mut self, alloc: &PooledAllocator) {
        self.allocations = 0;
        for kind in [MemoryKind::Heap, MemoryKind::Direct] {
            let kc = match kind {
                MemoryKind::Heap => &mut self.heap,
                MemoryKind::Direct => &mut self.direct,
            };
            let Some(arena_idx) = kc.arena else { continue };
            let Some(arena) = alloc.arena(kind, arena_idx) else {
                continue;
            };
            for ring in kc
                .tiny
                .iter_mut()
                .chain(kc.small.iter_mut())
                .chain(kc.normal.iter_mut())
            {
                ring.trim(|e| drop(arena.free_handle(e.chunk, e.handle, e.norm)));
            }
        }
    }

    /// Return every cached handle to its owning arena (thread termination
    /// or explicit release).
    pub(crate) fn drain(&mut self, alloc: &PooledAllocator) {
        self.allocations = 0;
        for kind in [MemoryKind::Heap, MemoryKind::Direct] {
            let kc = match kind {
                MemoryKind::Heap => &mut self.heap,
                MemoryKind::Direct => &mut self.direct,
            };
            let Some(arena_idx) = kc.arena else { continue };
            let Some(arena) = alloc.arena(kind, arena_idx) else {
                continue;
            };
            for ring in kc
                .tiny
                .iter_mut()
                .chain(kc.small.iter_mut())
                .chain(kc.normal.iter_mut())
            {
                ring.drain(|e| drop(arena.free_handle(e.chunk, e.handle, e.norm)));
            }
        }
    }

    pub(crate) fn unbind(&mut self) {
        self.heap.arena = None;
        self.direct.arena = None;
        self.owner = None;
    }

    /// Total entries currently parked across all rings.
    pub fn cached_entries(&self) -> usize {
        self.heap.cached_entries() + self.direct.cached_entries()
    }
}

impl Drop for ThreadCache {
    fn drop(&mut self) {
        // Caches handed out by the global facade drain themselves when the
        // owning thread dies. Explicitly released caches were unbound first,
        // so this is a no-op for them.
        if let Some(owner) = self.owner {
            owner.release_thread_cache_on_drop(self);
        }
    }
}
