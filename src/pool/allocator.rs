use super::arena::{Arena, ArenaMetrics, MAX_CAPACITY};
use super::buf::{MemoryKind, PooledBuf, UNBOUND_ARENA};
use super::error::AllocError;
use super::region::Region;
use super::size_classes::SizeClasses;
use super::thread_cache::ThreadCache;
use crate::sync::atomic::Ordering;
use crate::sync::cell::UnsafeCell;
use crate::sync::{Mutex, OnceLock};
use std::fmt;
use std::ptr::NonNull;

const MIN_PAGE_SIZE: usize = 4096;
const MAX_ORDER_LIMIT: u32 = 14;
/// `page_size << max_order` must stay at or below 1 GiB.
const MAX_CHUNK_SIZE: usize = 1 << 30;

fn default_arena_count() -> usize {
    // Two arenas per core keeps arena-mutex contention low when worker
    // threads are pinned 1:1 with cores. Capped at 8: past that the extra
    // arenas only multiply resident 16 MiB chunks without reducing
    // contention for realistic thread counts.
    std::thread::available_parallelism().map_or(2, |n| (n.get() * 2).min(8))
}

/// Resolved configuration record. The allocator performs no environment
/// parsing; fill this from whatever configuration layer the application has.
#[derive(Clone, Debug)]
pub struct PooledAllocatorConfig {
    /// Heap arena count; 0 routes heap requests to the unpooled fallback.
    pub num_heap_arenas: usize,
    /// Direct arena count; 0 routes direct requests to the unpooled fallback.
    pub num_direct_arenas: usize,
    /// Must be a power of two >= 4096.
    pub page_size: usize,
    /// Buddy-tree depth; `chunk_size = page_size << max_order`. At most 14.
    pub max_order: u32,
    /// Ring capacity per tiny class; 0 disables tiny caching.
    pub tiny_cache_size: u32,
    /// Ring capacity per small class; 0 disables small caching.
    pub small_cache_size: u32,
    /// Ring capacity per normal class up to `max_cached_buffer_capacity`.
    pub normal_cache_size: u32,
    /// Normal classes above this get no cache ring at all.
    pub max_cached_buffer_capacity: usize,
    /// Cache hits between trim cycles; 0 disables trimming.
    pub cache_trim_interval: u32,
    /// When false, caches handed out by the facade are zero-capacity
    /// (every thread still binds an arena for routing).
    pub use_cache_for_all_threads: bool,
    /// 0, or a power of two that direct allocations are padded to.
    pub direct_memory_cache_alignment: usize,
    /// Default kind for [`PooledAllocator::buffer`].
    pub prefer_direct: bool,
}

impl Default for PooledAllocatorConfig {
    fn default() -> Self {
        let arenas = default_arena_count();
        Self {
            num_heap_arenas: arenas,
            num_direct_arenas: arenas,
            page_size: 8192,
            max_order: 11, // 8 KiB << 11 = 16 MiB per chunk
            tiny_cache_size: 512,
            small_cache_size: 256,
            normal_cache_size: 64,
            max_cached_buffer_capacity: 32 * 1024,
            cache_trim_interval: 8192,
            use_cache_for_all_threads: true,
            direct_memory_cache_alignment: 0,
            prefer_direct: true,
        }
    }
}

/// Pooled byte-buffer allocator.
///
/// Owns two arena arrays (heap and direct) plus an unpooled registry for
/// configurations without arenas of the requested kind. Thread caches are
/// created through [`new_thread_cache`](Self::new_thread_cache) and must be
/// given back via [`free_thread_cache`](Self::free_thread_cache) (the
/// global facade automates both).
pub struct PooledAllocator {
    sc: SizeClasses,
    heap_arenas: Box<[Arena]>,
    direct_arenas: Box<[Arena]>,
    tiny_cache_size: u32,
    small_cache_size: u32,
    normal_cache_size: u32,
    max_cached_buffer_capacity: usize,
    cache_trim_interval: u32,
    use_cache_for_all_threads: bool,
    prefer_direct: bool,
    unpooled: Mutex<UnpooledRegistry>,
}

impl PooledAllocator {
    /// Create an allocator with the default configuration.
    ///
    /// # Errors
    ///
    /// Returns `AllocError::ConfigInvalid` if the defaults are rejected
    /// (cannot happen for the built-in values).
    pub fn new() -> Result<Self, AllocError> {
        Self::with_config(PooledAllocatorConfig::default())
    }

    /// Create an allocator from a resolved configuration record.
    ///
    /// # Errors
    ///
    /// `ConfigInvalid` when `page_size` is below 4096 or not a power of two,
    /// `max_order` exceeds 14, the chunk size would exceed 1 GiB, or the
    /// direct-memory alignment is not zero or a power of two.
    pub fn with_config(config: PooledAllocatorConfig) -> Result<Self, AllocError> {
        let sc = Self::validate(&config)?;

        // The alignment pads direct allocations only: heap arenas get a
        // copy of the table with it cleared, so heap tiny classes stay on
        // the 16-byte quantum.
        let heap_sc = SizeClasses { alignment: 0, ..sc };
        let heap_arenas = (0..config.num_heap_arenas)
            .map(|i| Arena::new(MemoryKind::Heap, i as u32, heap_sc))
            .collect();
        let direct_arenas = (0..config.num_direct_arenas)
            .map(|i| Arena::new(MemoryKind::Direct, i as u32, sc))
            .collect();

        Ok(Self {
            sc,
            heap_arenas,
            direct_arenas,
            tiny_cache_size: config.tiny_cache_size,
            small_cache_size: config.small_cache_size,
            normal_cache_size: config.normal_cache_size,
            max_cached_buffer_capacity: config.max_cached_buffer_capacity,
            cache_trim_interval: config.cache_trim_interval,
            use_cache_for_all_threads: config.use_cache_for_all_threads,
            prefer_direct: config.prefer_direct,
            unpooled: Mutex::new(UnpooledRegistry::new()),
        })
    }

    fn validate(config: &PooledAllocatorConfig) -> Result<SizeClasses, AllocError> {
        let page_size = config.page_size;
        if page_size < MIN_PAGE_SIZE {
            return Err(AllocError::ConfigInvalid(format!(
                "page_size: {page_size} (expected: >= {MIN_PAGE_SIZE})"
            )));
        }
        if !page_size.is_power_of_two() {
            return Err(AllocError::ConfigInvalid(format!(
                "page_size: {page_size} (expected: power of 2)"
            )));
        }
        if config.max_order > MAX_ORDER_LIMIT {
            return Err(AllocError::ConfigInvalid(format!(
                "max_order: {} (expected: 0-{MAX_ORDER_LIMIT})",
                config.max_order
            )));
        }
        if (page_size as u128) << config.max_order > MAX_CHUNK_SIZE as u128 {
            return Err(AllocError::ConfigInvalid(format!(
                "page_size ({page_size}) << max_order ({}) must not exceed {MAX_CHUNK_SIZE}",
                config.max_order
            )));
        }
        let alignment = config.direct_memory_cache_alignment;
        if alignment != 0 && !alignment.is_power_of_two() {
            return Err(AllocError::ConfigInvalid(format!(
                "direct_memory_cache_alignment: {alignment} (expected: 0 or power of two)"
            )));
        }
        Ok(SizeClasses::new(page_size, config.max_order, alignment))
    }

    #[inline]
    pub fn chunk_size(&self) -> usize {
        self.sc.chunk_size
    }

    #[inline]
    pub fn page_size(&self) -> usize {
        self.sc.page_size
    }

    #[inline]
    pub fn prefer_direct(&self) -> bool {
        self.prefer_direct && !self.direct_arenas.is_empty()
    }

    #[inline]
    pub fn is_direct_pooled(&self) -> bool {
        !self.direct_arenas.is_empty()
    }

    fn arenas(&self, kind: MemoryKind) -> &[Arena] {
        match kind {
            MemoryKind::Heap => &self.heap_arenas,
            MemoryKind::Direct => &self.direct_arenas,
        }
    }

    pub(crate) fn arena(&self, kind: MemoryKind, index: u32) -> Option<&Arena> {
        self.arenas(kind).get(index as usize)
    }

    /// The arena of `kind` with the fewest bound thread caches; ties break
    /// to the first occurrence.
    fn least_used_arena(&self, kind: MemoryKind) -> Option<u32> {
        let arenas = self.arenas(kind);
        let mut best: Option<(u32, u32)> = None;
        for (i, arena) in arenas.iter().enumerate() {
            let caches = arena.num_thread_caches.load(Ordering::Relaxed);
            if best.is_none_or(|(_, min)| caches < min) {
                best = Some((i as u32, caches));
            }
        }
        best.map(|(i, _)| i)
    }

    // -----------------------------------------------------------------
    // Thread caches
    // -----------------------------------------------------------------

    /// Create a thread cache bound to the least-loaded arena of each kind.
    ///
    /// The cache is exclusively owned by the calling thread. Give it back
    /// with [`free_thread_cache`](Self::free_thread_cache) before dropping
    /// it, or the arena load counters stay inflated (caches created by the
    /// global facade clean up automatically on thread exit).
    pub fn new_thread_cache(&self) -> ThreadCache {
        let heap = self.least_used_arena(MemoryKind::Heap);
        let direct = self.least_used_arena(MemoryKind::Direct);
        for (kind, idx) in [(MemoryKind::Heap, heap), (MemoryKind::Direct, direct)] {
            if let Some(idx) = idx {
                if let Some(arena) = self.arena(kind, idx) {
                    arena.num_thread_caches.fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        let (tiny, small, normal) = if self.use_cache_for_all_threads {
            (
                self.tiny_cache_size,
                self.small_cache_size,
                self.normal_cache_size,
            )
        } else {
            // Caching disabled: the cache still binds arenas for routing,
            // but every ring has zero capacity.
            (0, 0, 0)
        };

        ThreadCache::new(
            heap,
            direct,
            &self.sc,
            tiny,
            small,
            normal,
            self.max_cached_buffer_capacity,
            self.cache_trim_interval,
        )
    }

    /// Drain a cache into its arenas and release its arena bindings.
    pub fn free_thread_cache(&self, cache: &mut ThreadCache) {
        self.drain_and_unbind_counters(cache);
        cache.unbind();
    }

    pub(crate) fn release_thread_cache_on_drop(&self, cache: &mut ThreadCache) {
        self.drain_and_unbind_counters(cache);
    }

    fn drain_and_unbind_counters(&self, cache: &mut ThreadCache) {
        cache.drain(self);
        let (heap, direct) = cache.bound_arenas();
        for (kind, idx) in [(MemoryKind::Heap, heap), (MemoryKind::Direct, direct)] {
            if let Some(idx) = idx {
                if let Some(arena) = self.arena(kind, idx) {
                    arena.num_thread_caches.fetch_sub(1, Ordering::Relaxed);
                }
            }
        }
    }

    // -----------------------------------------------------------------
    // Allocation
    // -----------------------------------------------------------------

    /// Allocate a buffer of `kind` with `req_capacity` usable bytes.
    ///
    /// # Errors
    ///
    /// `CapacityInvalid` for out-of-range capacities, `OutOfMemory` when
    /// backing memory is refused.
    pub fn allocate(
        &self,
        cache: &mut ThreadCache,
        kind: MemoryKind,
        req_capacity: usize,
        max_capacity: usize,
    ) -> Result<PooledBuf, AllocError> {
        let arenas = self.arenas(kind);
        if arenas.is_empty() {
            return self.allocate_unpooled(kind, req_capacity, max_capacity);
        }

        let index = cache
            .arena_for(kind)
            .filter(|i| (*i as usize) < arenas.len())
            .or_else(|| self.least_used_arena(kind))
            .expect("arena array is non-empty");
        let buf = arenas[index as usize].allocate(cache, req_capacity, max_capacity)?;

        if cache.trim_due() {
            cache.trim(self);
        }
        Ok(buf)
    }

    /// Allocate using the configured default kind.
    pub fn buffer(
        &self,
        cache: &mut ThreadCache,
        req_capacity: usize,
        max_capacity: usize,
    ) -> Result<PooledBuf, AllocError> {
        let kind = if self.prefer_direct() {
            MemoryKind::Direct
        } else {
            MemoryKind::Heap
        };
        self.allocate(cache, kind, req_capacity, max_capacity)
    }

    /// Release a buffer, transferring ownership back to the pool.
    ///
    /// # Errors
    ///
    /// `HandleInvalid` on double-free or a handle this allocator never
    /// issued.
    pub fn release(&self, cache: &mut ThreadCache, buf: PooledBuf) -> Result<(), AllocError> {
        if buf.is_empty() {
            return Ok(());
        }
        if buf.arena == UNBOUND_ARENA {
            return self.release_unpooled(buf);
        }
        let Some(arena) = self.arena(buf.kind, buf.arena) else {
            return Err(AllocError::HandleInvalid("unknown arena"));
        };
        arena.free(cache, buf)
    }

    fn allocate_unpooled(
        &self,
        kind: MemoryKind,
        req_capacity: usize,
        max_capacity: usize,
    ) -> Result<PooledBuf, AllocError> {
        if req_capacity > max_capacity || max_capacity > MAX_CAPACITY {
            return Err(AllocError::CapacityInvalid {
                requested: req_capacity,
                maximum: max_capacity.min(MAX_CAPACITY),
            });
        }
        if req_capacity == 0 {
            return Ok(PooledBuf::empty(kind));
        }

        let region = match kind {
            MemoryKind::Heap => Region::heap(req_capacity),
            MemoryKind::Direct => Region::direct(req_capacity, self.sc.alignment),
        }
        .map_err(AllocError::OutOfMemory)?;

        let slot = self
            .unpooled
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(region);
        Ok(PooledBuf {
            kind,
            arena: UNBOUND_ARENA,
            chunk: slot,
            handle: 0,
            offset: 0,
            length: req_capacity,
            max_length: req_capacity,
        })
    }

    fn release_unpooled(&self, buf: PooledBuf) -> Result<(), AllocError> {
        self.unpooled
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(buf.chunk)
    }

    // -----------------------------------------------------------------
    // Data access
    // -----------------------------------------------------------------

    /// Copy `data` into the buffer's window.
    ///
    /// # Errors
    ///
    /// `CapacityInvalid` when `data` exceeds the buffer length,
    /// `HandleInvalid` for a dead handle.
    pub fn copy_into(&self, buf: &PooledBuf, data: &[u8]) -> Result<(), AllocError> {
        if data.is_empty() {
            return Ok(());
        }
        if buf.arena == UNBOUND_ARENA {
            return self
                .unpooled
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .copy_into(buf, data);
        }
        let Some(arena) = self.arena(buf.kind, buf.arena) else {
            return Err(AllocError::HandleInvalid("unknown arena"));
        };
        arena.copy_into(buf, data)
    }

    /// Copy the buffer's window out into `dst`.
    ///
    /// # Errors
    ///
    /// Same as [`copy_into`](Self::copy_into).
    pub fn copy_out(&self, buf: &PooledBuf, dst: &mut [u8]) -> Result<(), AllocError> {
        if dst.is_empty() {
            return Ok(());
        }
        if buf.arena == UNBOUND_ARENA {
            return self
                .unpooled
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .copy_out(buf, dst);
        }
        let Some(arena) = self.arena(buf.kind, buf.arena) else {
            return Err(AllocError::HandleInvalid("unknown arena"));
        };
        arena.copy_out(buf, dst)
    }

    /// Native pointer to the buffer's first byte for VM-mapped regions;
    /// `None` for heap-backed buffers.
    ///
    /// # Errors
    ///
    /// `HandleInvalid` for a dead handle.
    pub fn native_ptr(&self, buf: &PooledBuf) -> Result<Option<NonNull<u8>>, AllocError> {
        if buf.arena == UNBOUND_ARENA {
            return self
                .unpooled
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .native_ptr(buf);
        }
        let Some(arena) = self.arena(buf.kind, buf.arena) else {
            return Err(AllocError::HandleInvalid("unknown arena"));
        };
        arena.native_ptr(buf)
    }

    // -----------------------------------------------------------------
    // Metrics
    // -----------------------------------------------------------------

    /// Bytes live out of heap arenas, saturating at `i64::MAX`.
    pub fn used_heap_bytes(&self) -> u64 {
        Self::used_bytes(&self.heap_arenas)
    }

    /// Bytes live out of direct arenas, saturating at `i64::MAX`.
    pub fn used_direct_bytes(&self) -> u64 {
        Self::used_bytes(&self.direct_arenas)
    }

    fn used_bytes(arenas: &[Arena]) -> u64 {
        let mut total: u64 = 0;
        for arena in arenas {
            total = total.saturating_add(arena.active_bytes() as u64);
        }
        total.min(i64::MAX as u64)
    }

    /// Live thread-cache count. Each cache binds one arena per kind, so the
    /// heap arenas alone (or the direct ones when heap pooling is off)
    /// carry the full census.
    pub fn num_thread_caches(&self) -> u32 {
        let arenas = if self.heap_arenas.is_empty() {
            &self.direct_arenas
        } else {
            &self.heap_arenas
        };
        arenas
            .iter()
            .map(|a| a.num_thread_caches.load(Ordering::Relaxed))
            .sum()
    }

    /// Full snapshot. Walks every arena under its mutex; not for hot paths.
    pub fn metrics(&self) -> AllocatorMetrics {
        AllocatorMetrics {
            num_heap_arenas: self.heap_arenas.len(),
            num_direct_arenas: self.direct_arenas.len(),
            heap_arenas: self.heap_arenas.iter().map(Arena::metrics).collect(),
            direct_arenas: self.direct_arenas.iter().map(Arena::metrics).collect(),
            num_thread_caches: self.num_thread_caches(),
            used_heap_bytes: self.used_heap_bytes(),
            used_direct_bytes: self.used_direct_bytes(),
        }
    }
}

/// Registry for the no-arena fallback path: plain regions keyed by slot id.
struct UnpooledRegistry {
    slots: Vec<Option<Region>>,
    free: Vec<u32>,
}

impl UnpooledRegistry {
    fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
        }
    }

    fn insert(&mut self, region: Region) -> u32 {
        if let Some(slot) = self.free.pop() {
            self.slots[slot as usize] = Some(region);
            slot
        } else {
            self.slots.push(Some(region));
            (self.slots.len() - 1) as u32
        }
    }

    fn remove(&mut self, slot: u32) -> Result<(), AllocError> {
        match self.slots.get_mut(slot as usize) {
            Some(entry @ Some(_)) => {
                *entry = None;
                self.free.push(slot);
                Ok(())
            }
            _ => Err(AllocError::HandleInvalid("unpooled allocation is not live")),
        }
    }

    fn region(&self, buf: &PooledBuf) -> Result<&Region, AllocError> {
        self.slots
            .get(buf.chunk as usize)
            .and_then(Option::as_ref)
            .ok_or(AllocError::HandleInvalid("unpooled allocation is not live"))
    }

    fn copy_into(&self, buf: &PooledBuf, data: &[u8]) -> Result<(), AllocError> {
        if data.len() > buf.length {
            return Err(AllocError::CapacityInvalid {
                requested: data.len(),
                maximum: buf.length,
            });
        }
        // Safety: the live handle owns the whole region.
        unsafe { self.region(buf)?.copy_from(0, data) };
        Ok(())
    }

    fn copy_out(&self, buf: &PooledBuf, dst: &mut [u8]) -> Result<(), AllocError> {
        if dst.len() > buf.length {
            return Err(AllocError::CapacityInvalid {
                requested: dst.len(),
                maximum: buf.length,
            });
        }
        // Safety: the live handle owns the whole region.
        unsafe { self.region(buf)?.copy_to(0, dst) };
        Ok(())
    }

    fn native_ptr(&self, buf: &PooledBuf) -> Result<Option<NonNull<u8>>, AllocError> {
        Ok(self.region(buf)?.native_ptr())
    }
}

/// Point-in-time snapshot of the whole allocator.
#[derive(Clone, Debug)]
pub struct AllocatorMetrics {
    pub num_heap_arenas: usize,
    pub num_direct_arenas: usize,
    pub heap_arenas: Vec<ArenaMetrics>,
    pub direct_arenas: Vec<ArenaMetrics>,
    pub num_thread_caches: u32,
    pub used_heap_bytes: u64,
    pub used_direct_bytes: u64,
}

impl fmt::Display for AllocatorMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{} heap arena(s), {} used bytes:",
            self.num_heap_arenas, self.used_heap_bytes
        )?;
        for (i, arena) in self.heap_arenas.iter().enumerate() {
            writeln!(f, "-- heap arena {i} --")?;
            writeln!(f, "{arena}")?;
        }
        writeln!(
            f,
            "{} direct arena(s), {} used bytes:",
            self.num_direct_arenas, self.used_direct_bytes
        )?;
        for (i, arena) in self.direct_arenas.iter().enumerate() {
            writeln!(f, "-- direct arena {i} --")?;
            writeln!(f, "{arena}")?;
        }
        write!(f, "thread caches: {}", self.num_thread_caches)
    }
}

// ---------------------------------------------------------------------------
// Global singleton
// ---------------------------------------------------------------------------

static GLOBAL_POOLED_INSTANCE: OnceLock<PooledAllocator> = OnceLock::new();

thread_local! {
    static POOLED_THREAD_CACHE: PooledThreadLocal = PooledThreadLocal::new();
}

/// Per-thread handle owning the thread-local cache.
///
/// # Safety
///
/// `cache` is wrapped in `UnsafeCell` because it is only ever accessed by
/// the owning thread (via TLS). `PooledAllocator::allocate`/`release` walk
/// arenas and never re-enter the TLS access point.
struct PooledThreadLocal {
    cache: UnsafeCell<Option<ThreadCache>>,
}

impl PooledThreadLocal {
    fn new() -> Self {
        Self {
            cache: UnsafeCell::new(None),
        }
    }
}

impl Drop for PooledThreadLocal {
    fn drop(&mut self) {
        // Safety: Drop provides &mut self, guaranteeing exclusive access.
        let cache = crate::sync::unsafe_cell_get_mut!(self.cache);
        // The ThreadCache drains itself into its arenas via its owner
        // reference; see ThreadCache::drop.
        drop(cache.take());
    }
}

/// Process-wide lazily initialized allocator.
///
/// Prefer an explicitly constructed [`PooledAllocator`] plumbed through the
/// call graph; this facade exists for code without a convenient place to
/// thread one through. Thread caches are created on a thread's first
/// allocation and drained back to their arenas when the thread terminates.
pub struct GlobalPooledAllocator;

impl GlobalPooledAllocator {
    /// Initialize the global allocator with the given configuration.
    ///
    /// # Errors
    ///
    /// `ConfigInvalid` if the configuration is rejected or the allocator is
    /// already initialized.
    pub fn init(config: PooledAllocatorConfig) -> Result<(), AllocError> {
        GLOBAL_POOLED_INSTANCE
            .set(PooledAllocator::with_config(config)?)
            .map_err(|_| AllocError::ConfigInvalid("already initialized".to_string()))
    }

    /// Initialize with defaults.
    ///
    /// # Errors
    ///
    /// Same as [`init`](Self::init).
    pub fn init_default() -> Result<(), AllocError> {
        Self::init(PooledAllocatorConfig::default())
    }

    /// Returns the initialized global allocator.
    ///
    /// # Panics
    ///
    /// Panics if the global allocator has not been initialized via
    /// [`init`](Self::init).
    pub fn get() -> &'static PooledAllocator {
        GLOBAL_POOLED_INSTANCE
            .get()
            .expect("GlobalPooledAllocator not initialized")
    }

    fn with_cache<R>(f: impl FnOnce(&'static PooledAllocator, &mut ThreadCache) -> R) -> R {
        let alloc = Self::get();
        POOLED_THREAD_CACHE.with(|handle| {
            // Safety: single-threaded TLS access; no re-entrancy possible
            // (arena paths never touch TLS).
            let cache = crate::sync::unsafe_cell_get_mut!(handle.cache);
            let cache = cache.get_or_insert_with(|| {
                let mut cache = alloc.new_thread_cache();
                cache.owner = Some(alloc);
                cache
            });
            f(alloc, cache)
        })
    }

    /// Allocate a buffer of `kind` through the calling thread's cache.
    ///
    /// # Errors
    ///
    /// Same as [`PooledAllocator::allocate`].
    pub fn allocate(
        kind: MemoryKind,
        req_capacity: usize,
        max_capacity: usize,
    ) -> Result<PooledBuf, AllocError> {
        Self::with_cache(|alloc, cache| alloc.allocate(cache, kind, req_capacity, max_capacity))
    }

    /// Allocate using the configured default kind.
    ///
    /// # Errors
    ///
    /// Same as [`PooledAllocator::allocate`].
    pub fn buffer(req_capacity: usize, max_capacity: usize) -> Result<PooledBuf, AllocError> {
        Self::with_cache(|alloc, cache| alloc.buffer(cache, req_capacity, max_capacity))
    }

    /// Release a buffer through the calling thread's cache.
    ///
    /// # Errors
    ///
    /// Same as [`PooledAllocator::release`].
    pub fn release(buf: PooledBuf) -> Result<(), AllocError> {
        Self::with_cache(|alloc, cache| alloc.release(cache, buf))
    }

    /// Flush the calling thread's recycle rings back to their arenas.
    pub fn trim_current_thread() {
        if GLOBAL_POOLED_INSTANCE.get().is_none() {
            return;
        }
        Self::with_cache(|alloc, cache| cache.drain(alloc));
    }
}
