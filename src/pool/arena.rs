use super::buf::{MemoryKind, PooledBuf};
use super::chunk::{self, Chunk};
use super::error::AllocError;
use super::region::Region;
use super::size_classes::{NUM_TINY_POOLS, SizeClasses, SizeFamily};
use super::stats::Counter;
use super::subpage::{NULL_SLOT, Subpage};
use super::thread_cache::{CacheEntry, ThreadCache};
use crate::sync::Mutex;
use crate::sync::atomic::AtomicU32;
use fixedbitset::FixedBitSet;
use std::fmt;
use std::ptr::NonNull;

/// Null chunk-slot marker.
pub(crate) const NULL_CHUNK: u32 = u32::MAX;

/// Per-allocation ceiling (requested and maximum capacities).
pub(crate) const MAX_CAPACITY: usize = i32::MAX as usize;

// ---------------------------------------------------------------------------
// Chunk lists
//
// Six doubly-linked chains partitioned by utilization band. The bands
// overlap on purpose: a chunk bouncing around one boundary would otherwise
// migrate on every alloc/free pair. Migration happens on strict crossing of
// the half-open [lo, hi) interval.
// ---------------------------------------------------------------------------

const Q_INIT: usize = 0;
const Q000: usize = 1;
const Q025: usize = 2;
const Q050: usize = 3;
const Q075: usize = 4;
const Q100: usize = 5;
pub(crate) const NUM_CHUNK_LISTS: usize = 6;

pub(crate) const CHUNK_LIST_NAMES: [&str; NUM_CHUNK_LISTS] =
    ["qInit", "q000", "q025", "q050", "q075", "q100"];

/// Allocation preference. Medium-loaded chunks first keeps lightly-used
/// chunks available for growth; near-full q075 is the last resort before a
/// new chunk.
const ALLOC_ORDER: [usize; 5] = [Q050, Q025, Q000, Q_INIT, Q075];

struct Band {
    lo: i32,
    hi: i32,
    prev: Option<usize>,
    next: Option<usize>,
    /// Completely-free chunks are destroyed only from qInit; chunks that
    /// ever saw real load settle in q000 and are kept for reuse.
    evict_empty: bool,
}

const BANDS: [Band; NUM_CHUNK_LISTS] = [
    // qInit: (-inf, 25)
    Band { lo: i32::MIN, hi: 25, prev: None, next: Some(Q000), evict_empty: true },
    // q000: [1, 50)
    Band { lo: 1, hi: 50, prev: None, next: Some(Q025), evict_empty: false },
    // q025: [25, 75)
    Band { lo: 25, hi: 75, prev: Some(Q000), next: Some(Q050), evict_empty: false },
    // q050: [50, 100)
    Band { lo: 50, hi: 100, prev: Some(Q025), next: Some(Q075), evict_empty: false },
    // q075: [75, 100)
    Band { lo: 75, hi: 100, prev: Some(Q050), next: Some(Q100), evict_empty: false },
    // q100: [100, 100]
    Band { lo: 100, hi: i32::MAX, prev: Some(Q075), next: None, evict_empty: false },
];

// ---------------------------------------------------------------------------
// Slots
// ---------------------------------------------------------------------------

enum ChunkSlot {
    Free { next: u32 },
    Pooled(Box<PooledChunk>),
    Unpooled { region: Region, size: usize },
}

struct PooledChunk {
    chunk: Chunk,
    list: u8,
    prev: u32,
    next: u32,
}

struct ArenaInner {
    chunks: Vec<ChunkSlot>,
    free_chunk_head: u32,
    /// Occupied chunk slots. Consulted on every free so a stray or stale
    /// handle is rejected instead of corrupting a recycled slot.
    chunk_live: FixedBitSet,
    list_heads: [u32; NUM_CHUNK_LISTS],
    subpages: Vec<Option<Subpage>>,
    free_subpages: Vec<u32>,
    /// Head sentinels per tiny class (index = norm >> 4; slot 0 unused).
    tiny_pools: [u32; NUM_TINY_POOLS],
    /// Head sentinels per small class (index = log2(norm) - 9).
    small_pools: Vec<u32>,
}

/// One independently-lockable partition of the pool.
///
/// All chunk and subpage state lives behind a single mutex; tiny/small/
/// normal allocations that miss the thread cache serialize here. The
/// metrics counters are atomics outside the lock and may lag by one update.
pub(crate) struct Arena {
    pub kind: MemoryKind,
    pub index: u32,
    pub(crate) sc: SizeClasses,
    inner: Mutex<ArenaInner>,
    /// Thread caches currently bound to this arena; the facade binds new
    /// caches to the arena where this is lowest.
    pub num_thread_caches: AtomicU32,
    /// Indexed by `SizeFamily::counter_idx()`.
    allocs: [Counter; 4],
    deallocs: [Counter; 4],
    active_bytes: Counter,
}

impl Arena {
    pub fn new(kind: MemoryKind, index: u32, sc: SizeClasses) -> Self {
        let mut subpages = Vec::new();
        let tiny_pools = std::array::from_fn(|_| new_sentinel(&mut subpages));
        let small_pools = (0..sc.num_small_pools())
            .map(|_| new_sentinel(&mut subpages))
            .collect();

        Self {
            kind,
            index,
            sc,
            inner: Mutex::new(ArenaInner {
                chunks: Vec::new(),
                free_chunk_head: NULL_CHUNK,
                chunk_live: FixedBitSet::new(),
                list_heads: [NULL_CHUNK; NUM_CHUNK_LISTS],
                subpages,
                free_subpages: Vec::new(),
                tiny_pools,
                small_pools,
            }),
            num_thread_caches: AtomicU32::new(0),
            allocs: std::array::from_fn(|_| Counter::new()),
            deallocs: std::array::from_fn(|_| Counter::new()),
            active_bytes: Counter::new(),
        }
    }

    fn lock_inner(&self) -> crate::sync::MutexGuard<'_, ArenaInner> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Allocate a buffer of at least `req_capacity` usable bytes.
    ///
    /// The thread cache is consulted first for pooled families; pass a
    /// disabled cache to force the arena path.
    ///
    /// # Errors
    ///
    /// `CapacityInvalid` for out-of-range capacities, `OutOfMemory` when the
    /// OS refuses backing memory for a new chunk or huge region.
    pub fn allocate(
        &self,
        cache: &mut ThreadCache,
        req_capacity: usize,
        max_capacity: usize,
    ) -> Result<PooledBuf, AllocError> {
        if req_capacity > max_capacity || max_capacity > MAX_CAPACITY {
            return Err(AllocError::CapacityInvalid {
                requested: req_capacity,
                maximum: max_capacity.min(MAX_CAPACITY),
            });
        }

        let norm = self.sc.normalize(req_capacity);
        if norm == 0 {
            return Ok(PooledBuf::empty(self.kind));
        }

        match self.sc.family(norm) {
            SizeFamily::Tiny | SizeFamily::Small => {
                self.allocate_subpage_class(cache, req_capacity, norm)
            }
            SizeFamily::Normal => self.allocate_normal(cache, req_capacity, norm),
            SizeFamily::Huge => self.allocate_huge(req_capacity, norm),
        }
    }

    fn allocate_subpage_class(
        &self,
        cache: &mut ThreadCache,
        req_capacity: usize,
        norm: usize,
    ) -> Result<PooledBuf, AllocError> {
        if let Some(entry) = cache.pop(self.kind, self.index, &self.sc, norm) {
            return Ok(self.buf_from_entry(entry, req_capacity));
        }

        let family = self.sc.family(norm);
        let (chunk_id, handle) = {
            let mut inner = self.lock_inner();
            let head = inner.pool_head(family, norm);
            let first = inner.sp(head).next;
            if first != head {
                // A partially-full subpage of this class exists; the pool
                // never holds full subpages, so this allocate cannot fail.
                let sp = inner.sp_mut(first);
                let chunk_id = sp.chunk;
                let mem_idx = sp.mem_idx;
                let bitmap_idx = sp.allocate().expect("pooled subpage has a free slot");
                if inner.sp(first).is_full() {
                    inner.unlink_subpage(first);
                }
                (chunk_id, chunk::subpage_handle(mem_idx, u32::from(bitmap_idx)))
            } else {
                // Pin a fresh page and split it.
                let (chunk_id, mem_idx) =
                    inner.allocate_run_any(self.kind, self.sc, self.sc.max_order)?;
                let slot =
                    inner.insert_subpage(Subpage::new(chunk_id, mem_idx, self.sc.page_size, norm));
                let page = inner.pooled(chunk_id).chunk.page_idx(mem_idx);
                inner.pooled_mut(chunk_id).chunk.set_subpage_slot(page, slot);
                inner.link_subpage_at_head(head, slot);
                let bitmap_idx = inner
                    .sp_mut(slot)
                    .allocate()
                    .expect("fresh subpage has free slots");
                (chunk_id, chunk::subpage_handle(mem_idx, u32::from(bitmap_idx)))
            }
        };

        self.allocs[family.counter_idx()].add(1);
        self.active_bytes.add(norm);
        Ok(self.make_buf(chunk_id, handle, req_capacity, norm))
    }

    fn allocate_normal(
        &self,
        cache: &mut ThreadCache,
        req_capacity: usize,
        norm: usize,
    ) -> Result<PooledBuf, AllocError> {
        if let Some(entry) = cache.pop(self.kind, self.index, &self.sc, norm) {
            return Ok(self.buf_from_entry(entry, req_capacity));
        }

        let depth = self.sc.depth_for(norm);
        let (chunk_id, mem_idx) = {
            let mut inner = self.lock_inner();
            inner.allocate_run_any(self.kind, self.sc, depth)?
        };

        self.allocs[SizeFamily::Normal.counter_idx()].add(1);
        self.active_bytes.add(norm);
        Ok(self.make_buf(chunk_id, chunk::run_handle(mem_idx), req_capacity, norm))
    }

    /// Huge allocations bypass pooling: a dedicated region of exactly `norm`
    /// bytes, released straight back to the OS on free.
    fn allocate_huge(&self, req_capacity: usize, norm: usize) -> Result<PooledBuf, AllocError> {
        let region = self.new_region(norm)?;
        let slot = {
            let mut inner = self.lock_inner();
            inner.insert_chunk_slot(ChunkSlot::Unpooled { region, size: norm })
        };

        self.allocs[SizeFamily::Huge.counter_idx()].add(1);
        self.active_bytes.add(norm);
        Ok(PooledBuf {
            kind: self.kind,
            arena: self.index,
            chunk: slot,
            handle: 0,
            offset: 0,
            length: req_capacity,
            max_length: norm,
        })
    }

    fn new_region(&self, len: usize) -> Result<Region, AllocError> {
        match self.kind {
            MemoryKind::Heap => Region::heap(len),
            MemoryKind::Direct => Region::direct(len, self.sc.alignment),
        }
        .map_err(AllocError::OutOfMemory)
    }

    fn make_buf(&self, chunk_id: u32, handle: u64, req: usize, norm: usize) -> PooledBuf {
        PooledBuf {
            kind: self.kind,
            arena: self.index,
            chunk: chunk_id,
            handle,
            offset: chunk::handle_offset(&self.sc, handle, norm),
            length: req,
            max_length: norm,
        }
    }

    fn buf_from_entry(&self, entry: CacheEntry, req: usize) -> PooledBuf {
        self.make_buf(entry.chunk, entry.handle, req, entry.norm)
    }

    /// Release a buffer. Deferred through the thread cache when possible;
    /// otherwise freed under the arena lock.
    ///
    /// # Errors
    ///
    /// `HandleInvalid` on double-free or a handle this arena never issued.
    pub fn free(&self, cache: &mut ThreadCache, buf: PooledBuf) -> Result<(), AllocError> {
        if buf.is_empty() {
            return Ok(());
        }
        debug_assert_eq!(buf.arena, self.index);
        debug_assert_eq!(buf.kind, self.kind);

        let norm = buf.max_length;
        if norm > self.sc.chunk_size {
            return self.free_huge(buf.chunk, norm);
        }
        if cache.push(self.kind, self.index, &self.sc, buf.chunk, buf.handle, norm) {
            // Deferred: the cache owns the slot until trim or thread exit.
            return Ok(());
        }
        self.free_handle(buf.chunk, buf.handle, norm)
    }

    /// Return a pooled handle to its chunk/subpage. Also the entry point for
    /// thread caches draining their rings.
    pub(crate) fn free_handle(
        &self,
        chunk_id: u32,
        handle: u64,
        norm: usize,
    ) -> Result<(), AllocError> {
        let family = self.sc.family(norm);
        {
            let mut inner = self.lock_inner();
            if !inner.is_live_pooled(chunk_id) {
                return Err(AllocError::HandleInvalid("chunk is not live"));
            }

            let mem_idx = chunk::handle_mem_idx(handle);
            match chunk::handle_bitmap_idx(handle) {
                Some(bitmap_idx) => {
                    inner.free_subpage_slot(&self.sc, chunk_id, mem_idx, bitmap_idx, norm)?
                }
                None => inner.free_run(&self.sc, chunk_id, mem_idx)?,
            }
        }

        self.deallocs[family.counter_idx()].add(1);
        self.active_bytes.sub(norm);
        Ok(())
    }

    fn free_huge(&self, slot: u32, norm: usize) -> Result<(), AllocError> {
        {
            let mut inner = self.lock_inner();
            if !inner.is_live(slot) {
                return Err(AllocError::HandleInvalid("huge allocation is not live"));
            }
            match &inner.chunks[slot as usize] {
                ChunkSlot::Unpooled { size, .. } => {
                    debug_assert_eq!(*size, norm);
                }
                _ => return Err(AllocError::HandleInvalid("handle is not a huge allocation")),
            }
            // Dropping the slot releases the region to the OS immediately.
            inner.remove_chunk_slot(slot);
        }

        self.deallocs[SizeFamily::Huge.counter_idx()].add(1);
        self.active_bytes.sub(norm);
        Ok(())
    }

    // -----------------------------------------------------------------
    // Data access (the MemoryRegion boundary for the buffer type)
    // -----------------------------------------------------------------

    fn with_region<R>(
        &self,
        buf: &PooledBuf,
        f: impl FnOnce(&Region) -> R,
    ) -> Result<R, AllocError> {
        let inner = self.lock_inner();
        if !inner.is_live(buf.chunk) {
            return Err(AllocError::HandleInvalid("chunk is not live"));
        }
        match &inner.chunks[buf.chunk as usize] {
            ChunkSlot::Pooled(pc) => Ok(f(pc.chunk.region())),
            ChunkSlot::Unpooled { region, .. } => Ok(f(region)),
            ChunkSlot::Free { .. } => Err(AllocError::HandleInvalid("chunk slot is free")),
        }
    }

    /// Copy `data` into the buffer's window, starting at its offset.
    pub(crate) fn copy_into(&self, buf: &PooledBuf, data: &[u8]) -> Result<(), AllocError> {
        if data.len() > buf.length {
            return Err(AllocError::CapacityInvalid {
                requested: data.len(),
                maximum: buf.length,
            });
        }
        self.with_region(buf, |region| {
            // Safety: the live handle owns [offset, offset + max_length) and
            // data fits within it.
            unsafe { region.copy_from(buf.offset, data) };
        })
    }

    /// Copy bytes out of the buffer's window into `dst`.
    pub(crate) fn copy_out(&self, buf: &PooledBuf, dst: &mut [u8]) -> Result<(), AllocError> {
        if dst.len() > buf.length {
            return Err(AllocError::CapacityInvalid {
                requested: dst.len(),
                maximum: buf.length,
            });
        }
        self.with_region(buf, |region| {
            // Safety: same window argument as copy_into.
            unsafe { region.copy_to(buf.offset, dst) };
        })
    }

    /// Native pointer to the buffer's first byte, when the backing region
    /// is an OS mapping (direct arenas). Heap regions return `None`.
    pub(crate) fn native_ptr(&self, buf: &PooledBuf) -> Result<Option<NonNull<u8>>, AllocError> {
        self.with_region(buf, |region| {
            region.native_ptr().map(|p| {
                // Safety: offset is within the region per the handle invariant.
                unsafe { NonNull::new_unchecked(p.as_ptr().add(buf.offset)) }
            })
        })
    }

    // -----------------------------------------------------------------
    // Metrics
    // -----------------------------------------------------------------

    pub fn metrics(&self) -> ArenaMetrics {
        use crate::sync::atomic::Ordering;

        let inner = self.lock_inner();
        let mut chunks_per_list = [0usize; NUM_CHUNK_LISTS];
        let mut pooled_chunks = 0;
        let mut chunk_free_bytes = 0;
        let mut huge_allocations = 0;
        let mut huge_bytes = 0;
        for slot in &inner.chunks {
            match slot {
                ChunkSlot::Pooled(pc) => {
                    chunks_per_list[pc.list as usize] += 1;
                    pooled_chunks += 1;
                    chunk_free_bytes += pc.chunk.free_bytes();
                }
                ChunkSlot::Unpooled { size, .. } => {
                    huge_allocations += 1;
                    huge_bytes += size;
                }
                ChunkSlot::Free { .. } => {}
            }
        }

        let mut tiny_subpages = 0;
        let mut small_subpages = 0;
        for sp in inner.subpages.iter().flatten() {
            if sp.is_sentinel() {
                continue;
            }
            if sp.elem_size < super::size_classes::SMALL_THRESHOLD {
                tiny_subpages += 1;
            } else {
                small_subpages += 1;
            }
        }

        ArenaMetrics {
            num_thread_caches: self.num_thread_caches.load(Ordering::Relaxed),
            chunks_per_list,
            pooled_chunks,
            chunk_free_bytes,
            chunk_total_bytes: pooled_chunks * self.sc.chunk_size,
            huge_allocations,
            huge_bytes,
            tiny_subpages,
            small_subpages,
            tiny_allocations: self.allocs[0].get(),
            small_allocations: self.allocs[1].get(),
            normal_allocations: self.allocs[2].get(),
            huge_allocations_total: self.allocs[3].get(),
            tiny_deallocations: self.deallocs[0].get(),
            small_deallocations: self.deallocs[1].get(),
            normal_deallocations: self.deallocs[2].get(),
            huge_deallocations_total: self.deallocs[3].get(),
            active_bytes: self.active_bytes.get(),
        }
    }

    /// Bytes currently allocated out of this arena (normalized sizes of
    /// live handles plus cached entries). Diagnostic; may lag by one update.
    pub fn active_bytes(&self) -> usize {
        self.active_bytes.get()
    }
}

fn new_sentinel(subpages: &mut Vec<Option<Subpage>>) -> u32 {
    let id = subpages.len() as u32;
    let mut s = Subpage::sentinel();
    s.prev = id;
    s.next = id;
    subpages.push(Some(s));
    id
}

impl ArenaInner {
    // --- subpage slab -------------------------------------------------

    fn sp(&self, id: u32) -> &Subpage {
        self.subpages[id as usize]
            .as_ref()
            .expect("subpage slot is occupied")
    }

    fn sp_mut(&mut self, id: u32) -> &mut Subpage {
        self.subpages[id as usize]
            .as_mut()
            .expect("subpage slot is occupied")
    }

    fn insert_subpage(&mut self, sp: Subpage) -> u32 {
        if let Some(id) = self.free_subpages.pop() {
            self.subpages[id as usize] = Some(sp);
            id
        } else {
            self.subpages.push(Some(sp));
            (self.subpages.len() - 1) as u32
        }
    }

    fn remove_subpage(&mut self, id: u32) {
        self.subpages[id as usize] = None;
        self.free_subpages.push(id);
    }

    fn pool_head(&self, family: SizeFamily, norm: usize) -> u32 {
        match family {
            SizeFamily::Tiny => self.tiny_pools[SizeClasses::tiny_idx(norm)],
            SizeFamily::Small => self.small_pools[SizeClasses::small_idx(norm)],
            SizeFamily::Normal | SizeFamily::Huge => {
                unreachable!("no subpage pools for {family:?}")
            }
        }
    }

    fn link_subpage_at_head(&mut self, head: u32, id: u32) {
        let next = self.sp(head).next;
        {
            let s = self.sp_mut(id);
            s.prev = head;
            s.next = next;
        }
        self.sp_mut(head).next = id;
        self.sp_mut(next).prev = id;
    }

    fn unlink_subpage(&mut self, id: u32) {
        let (prev, next) = {
            let s = self.sp(id);
            (s.prev, s.next)
        };
        debug_assert!(prev != NULL_SLOT && next != NULL_SLOT);
        self.sp_mut(prev).next = next;
        self.sp_mut(next).prev = prev;
        let s = self.sp_mut(id);
        s.prev = NULL_SLOT;
        s.next = NULL_SLOT;
    }

    // --- chunk slab ---------------------------------------------------

    fn pooled(&self, id: u32) -> &PooledChunk {
        match &self.chunks[id as usize] {
            ChunkSlot::Pooled(pc) => pc,
            _ => unreachable!("chunk slot {id} is not pooled"),
        }
    }

    fn pooled_mut(&mut self, id: u32) -> &mut PooledChunk {
        match &mut self.chunks[id as usize] {
            ChunkSlot::Pooled(pc) => pc,
            _ => unreachable!("chunk slot {id} is not pooled"),
        }
    }

    fn is_live(&self, id: u32) -> bool {
        (id as usize) < self.chunks.len() && self.chunk_live.contains(id as usize)
    }

    fn is_live_pooled(&self, id: u32) -> bool {
        self.is_live(id) && matches!(self.chunks[id as usize], ChunkSlot::Pooled(_))
    }

    fn insert_chunk_slot(&mut self, slot: ChunkSlot) -> u32 {
        let id = if self.free_chunk_head != NULL_CHUNK {
            let id = self.free_chunk_head;
            self.free_chunk_head = match self.chunks[id as usize] {
                ChunkSlot::Free { next } => next,
                _ => unreachable!("free-list head is occupied"),
            };
            self.chunks[id as usize] = slot;
            id
        } else {
            self.chunks.push(slot);
            (self.chunks.len() - 1) as u32
        };
        self.chunk_live.grow(self.chunks.len());
        self.chunk_live.insert(id as usize);
        id
    }

    fn remove_chunk_slot(&mut self, id: u32) {
        self.chunks[id as usize] = ChunkSlot::Free {
            next: self.free_chunk_head,
        };
        self.free_chunk_head = id;
        self.chunk_live.set(id as usize, false);
    }

    // --- chunk lists --------------------------------------------------

    fn push_front(&mut self, list: usize, id: u32) {
        let head = self.list_heads[list];
        {
            let pc = self.pooled_mut(id);
            pc.list = list as u8;
            pc.prev = NULL_CHUNK;
            pc.next = head;
        }
        if head != NULL_CHUNK {
            self.pooled_mut(head).prev = id;
        }
        self.list_heads[list] = id;
    }

    fn unlink_chunk(&mut self, id: u32) {
        let (list, prev, next) = {
            let pc = self.pooled(id);
            (pc.list as usize, pc.prev, pc.next)
        };
        if prev != NULL_CHUNK {
            self.pooled_mut(prev).next = next;
        } else {
            self.list_heads[list] = next;
        }
        if next != NULL_CHUNK {
            self.pooled_mut(next).prev = prev;
        }
        let pc = self.pooled_mut(id);
        pc.prev = NULL_CHUNK;
        pc.next = NULL_CHUNK;
    }

    /// Migrate a chunk whose utilization strictly crossed its band.
    fn reband(&mut self, id: u32) {
        let usage = self.pooled(id).chunk.usage();
        let mut list = self.pooled(id).list as usize;
        loop {
            let band = &BANDS[list];
            if usage >= band.hi {
                if let Some(next) = band.next {
                    list = next;
                    continue;
                }
            } else if usage < band.lo {
                if let Some(prev) = band.prev {
                    list = prev;
                    continue;
                }
            }
            break;
        }
        if list != self.pooled(id).list as usize {
            self.unlink_chunk(id);
            self.push_front(list, id);
        }
    }

    fn evict_if_empty(&mut self, id: u32) {
        let pc = self.pooled(id);
        if BANDS[pc.list as usize].evict_empty && pc.chunk.is_unused() {
            self.unlink_chunk(id);
            self.remove_chunk_slot(id);
        }
    }

    /// Claim a run at `depth` from the banded lists, creating a fresh chunk
    /// in qInit when every candidate is exhausted.
    fn allocate_run_any(
        &mut self,
        kind: MemoryKind,
        sc: SizeClasses,
        depth: u32,
    ) -> Result<(u32, u32), AllocError> {
        for list in ALLOC_ORDER {
            let mut id = self.list_heads[list];
            while id != NULL_CHUNK {
                let next = self.pooled(id).next;
                if let Some(mem_idx) = self.pooled_mut(id).chunk.allocate_run(depth) {
                    self.reband(id);
                    return Ok((id, mem_idx));
                }
                id = next;
            }
        }

        let region = match kind {
            MemoryKind::Heap => Region::heap(sc.chunk_size),
            MemoryKind::Direct => Region::direct(sc.chunk_size, sc.alignment),
        }
        .map_err(AllocError::OutOfMemory)?;
        let pc = Box::new(PooledChunk {
            chunk: Chunk::new(region, sc),
            list: Q_INIT as u8,
            prev: NULL_CHUNK,
            next: NULL_CHUNK,
        });
        let id = self.insert_chunk_slot(ChunkSlot::Pooled(pc));
        self.push_front(Q_INIT, id);

        let mem_idx = self
            .pooled_mut(id)
            .chunk
            .allocate_run(depth)
            .expect("fresh chunk serves any pooled depth");
        self.reband(id);
        Ok((id, mem_idx))
    }

    fn free_run(
        &mut self,
        sc: &SizeClasses,
        chunk_id: u32,
        mem_idx: u32,
    ) -> Result<(), AllocError> {
        // A run handle must not reference a leaf that is split into a
        // subpage; those are freed slot by slot.
        let idx = mem_idx as usize;
        if idx >= sc.max_pages() && idx < 2 * sc.max_pages() {
            let page = idx - sc.max_pages();
            if self.pooled(chunk_id).chunk.subpage_slot(page) != NULL_SLOT {
                return Err(AllocError::HandleInvalid("run handle references a split page"));
            }
        }
        self.pooled_mut(chunk_id).chunk.free_run(mem_idx)?;
        self.reband(chunk_id);
        self.evict_if_empty(chunk_id);
        Ok(())
    }

    fn free_subpage_slot(
        &mut self,
        sc: &SizeClasses,
        chunk_id: u32,
        mem_idx: u32,
        bitmap_idx: u32,
        norm: usize,
    ) -> Result<(), AllocError> {
        let idx = mem_idx as usize;
        if idx < sc.max_pages() || idx >= 2 * sc.max_pages() {
            return Err(AllocError::HandleInvalid("subpage handle is not a leaf"));
        }
        let page = idx - sc.max_pages();
        let slot = self.pooled(chunk_id).chunk.subpage_slot(page);
        if slot == NULL_SLOT {
            return Err(AllocError::HandleInvalid("page is not split"));
        }
        if self.sp(slot).elem_size != norm {
            return Err(AllocError::HandleInvalid("size class mismatch"));
        }

        let still_in_use = self.sp_mut(slot).free(bitmap_idx)?;
        if self.sp(slot).num_avail() == 1 {
            // First slot freed after the subpage went full: back into the pool.
            let head = self.pool_head(sc.family(norm), norm);
            self.link_subpage_at_head(head, slot);
        }
        if !still_in_use {
            // Empty: unlink, drop the subpage, hand the page back to the tree.
            self.unlink_subpage(slot);
            self.remove_subpage(slot);
            self.pooled_mut(chunk_id).chunk.clear_subpage_slot(page);
            self.pooled_mut(chunk_id).chunk.free_run(mem_idx)?;
            self.reband(chunk_id);
            self.evict_if_empty(chunk_id);
        }
        Ok(())
    }
}

/// Point-in-time snapshot of one arena. Counter fields are eventually
/// consistent with each other.
#[derive(Clone, Debug)]
pub struct ArenaMetrics {
    pub num_thread_caches: u32,
    /// Pooled chunk count per utilization band (qInit, q000, q025, q050,
    /// q075, q100).
    pub chunks_per_list: [usize; NUM_CHUNK_LISTS],
    pub pooled_chunks: usize,
    pub chunk_free_bytes: usize,
    pub chunk_total_bytes: usize,
    /// Live huge (unpooled) allocations.
    pub huge_allocations: usize,
    pub huge_bytes: usize,
    /// Live subpages by family.
    pub tiny_subpages: usize,
    pub small_subpages: usize,
    pub tiny_allocations: usize,
    pub small_allocations: usize,
    pub normal_allocations: usize,
    pub huge_allocations_total: usize,
    pub tiny_deallocations: usize,
    pub small_deallocations: usize,
    pub normal_deallocations: usize,
    pub huge_deallocations_total: usize,
    pub active_bytes: usize,
}

impl fmt::Display for ArenaMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "chunks: {} ({} bytes free of {})",
            self.pooled_chunks, self.chunk_free_bytes, self.chunk_total_bytes
        )?;
        for (name, count) in CHUNK_LIST_NAMES.iter().zip(self.chunks_per_list) {
            writeln!(f, "  {name}: {count}")?;
        }
        writeln!(
            f,
            "subpages: {} tiny, {} small; huge: {} ({} bytes)",
            self.tiny_subpages, self.small_subpages, self.huge_allocations, self.huge_bytes
        )?;
        writeln!(
            f,
            "allocations: tiny {} / small {} / normal {} / huge {}",
            self.tiny_allocations,
            self.small_allocations,
            self.normal_allocations,
            self.huge_allocations_total
        )?;
        writeln!(
            f,
            "deallocations: tiny {} / small {} / normal {} / huge {}",
            self.tiny_deallocations,
            self.small_deallocations,
            self.normal_deallocations,
            self.huge_deallocations_total
        )?;
        write!(
            f,
            "active: {} bytes, thread caches: {}",
            self.active_bytes, self.num_thread_caches
        )
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::pool::thread_cache::ThreadCache;

    const MAX: usize = MAX_CAPACITY;
    const MIB: usize = 1024 * 1024;

    fn test_arena() -> Arena {
        Arena::new(MemoryKind::Heap, 0, SizeClasses::new(8192, 11, 0))
    }

    fn clone_buf(buf: &PooledBuf) -> PooledBuf {
        PooledBuf {
            kind: buf.kind,
            arena: buf.arena,
            chunk: buf.chunk,
            handle: buf.handle,
            offset: buf.offset,
            length: buf.length,
            max_length: buf.max_length,
        }
    }

    #[test]
    fn test_tiny_roundtrip_shares_one_subpage() {
        let _guard = crate::pool::TEST_MUTEX.read().unwrap();
        let arena = test_arena();
        let mut cache = ThreadCache::disabled();

        let a = arena.allocate(&mut cache, 17, MAX).unwrap();
        let b = arena.allocate(&mut cache, 17, MAX).unwrap();
        assert_eq!(a.capacity(), 32);
        assert_eq!(b.capacity(), 32);
        assert_eq!(a.chunk, b.chunk);
        assert_ne!(a.offset(), b.offset());
        // Both slots live on the same pinned page.
        assert_eq!(a.offset() / 8192, b.offset() / 8192);

        arena.free(&mut cache, a).unwrap();
        arena.free(&mut cache, b).unwrap();

        // The subpage emptied, the page went back to the tree, and the
        // never-loaded chunk was destroyed from qInit.
        let metrics = arena.metrics();
        assert_eq!(metrics.pooled_chunks, 0);
        assert_eq!(metrics.tiny_subpages, 0);
        assert_eq!(metrics.active_bytes, 0);
    }

    #[test]
    fn test_small_exhaustion_pins_second_page() {
        let _guard = crate::pool::TEST_MUTEX.read().unwrap();
        let arena = test_arena();
        let mut cache = ThreadCache::disabled();

        // 8192 / 512 = 16 slots fill exactly one page.
        let mut bufs = Vec::new();
        for _ in 0..16 {
            bufs.push(arena.allocate(&mut cache, 512, MAX).unwrap());
        }
        let first_page = bufs[0].offset() / 8192;
        assert!(bufs.iter().all(|b| b.offset() / 8192 == first_page));

        // Full subpage is out of the pool: the 17th pins a new page.
        let b17 = arena.allocate(&mut cache, 512, MAX).unwrap();
        assert_ne!(b17.offset() / 8192, first_page);
        assert_eq!(arena.metrics().small_subpages, 2);

        // Freeing one slot relinks the first subpage at the pool head, so
        // the 18th allocation is served from it again.
        let freed = bufs.swap_remove(0);
        let freed_offset = freed.offset();
        arena.free(&mut cache, freed).unwrap();
        let b18 = arena.allocate(&mut cache, 512, MAX).unwrap();
        assert_eq!(b18.offset(), freed_offset);

        for buf in bufs {
            arena.free(&mut cache, buf).unwrap();
        }
        arena.free(&mut cache, b17).unwrap();
        arena.free(&mut cache, b18).unwrap();
        assert_eq!(arena.metrics().active_bytes, 0);
        assert_eq!(arena.metrics().small_subpages, 0);
    }

    #[test]
    fn test_normal_buddy_fills_chunk_then_grows() {
        let _guard = crate::pool::TEST_MUTEX.read().unwrap();
        let arena = test_arena();
        let mut cache = ThreadCache::disabled();

        // Two 8 MiB runs occupy the two children of a fresh chunk's root.
        let a = arena.allocate(&mut cache, 8 * MIB, MAX).unwrap();
        let b = arena.allocate(&mut cache, 8 * MIB, MAX).unwrap();
        assert_eq!(a.chunk, b.chunk);
        assert_eq!(a.offset(), 0);
        assert_eq!(b.offset(), 8 * MIB);
        assert_eq!(arena.metrics().pooled_chunks, 1);

        // A third one cannot fit: a second chunk appears.
        let c = arena.allocate(&mut cache, 8 * MIB, MAX).unwrap();
        assert_ne!(c.chunk, a.chunk);
        assert_eq!(arena.metrics().pooled_chunks, 2);

        arena.free(&mut cache, a).unwrap();
        arena.free(&mut cache, b).unwrap();
        arena.free(&mut cache, c).unwrap();

        // Both chunks saw real load, so they settle in q000 for reuse.
        let metrics = arena.metrics();
        assert_eq!(metrics.pooled_chunks, 2);
        assert_eq!(metrics.chunks_per_list, [0, 2, 0, 0, 0, 0]);
        assert_eq!(metrics.chunk_free_bytes, metrics.chunk_total_bytes);
    }

    #[test]
    fn test_chunk_list_migration_bands() {
        let _guard = crate::pool::TEST_MUTEX.read().unwrap();
        let arena = test_arena();
        let mut cache = ThreadCache::disabled();

        // 4 MiB runs move one 16 MiB chunk through 25/50/75/100% usage.
        let expected = [
            [0, 1, 0, 0, 0, 0], // 25% -> q000
            [0, 0, 1, 0, 0, 0], // 50% -> q025
            [0, 0, 0, 1, 0, 0], // 75% -> q050
            [0, 0, 0, 0, 0, 1], // 100% -> q100
        ];
        let mut bufs = Vec::new();
        for lists in expected {
            bufs.push(arena.allocate(&mut cache, 4 * MIB, MAX).unwrap());
            assert_eq!(arena.metrics().chunks_per_list, lists);
        }

        // Full release walks it back; empty chunks are kept in q000.
        for buf in bufs.drain(..) {
            arena.free(&mut cache, buf).unwrap();
        }
        let metrics = arena.metrics();
        assert_eq!(metrics.chunks_per_list, [0, 1, 0, 0, 0, 0]);
        assert_eq!(metrics.pooled_chunks, 1);
    }

    #[test]
    fn test_lightly_used_chunk_destroyed_from_qinit() {
        let _guard = crate::pool::TEST_MUTEX.read().unwrap();
        let arena = test_arena();
        let mut cache = ThreadCache::disabled();

        // A single page keeps the chunk under 25% usage: it stays in qInit
        // and is dropped back to the OS once it empties.
        let buf = arena.allocate(&mut cache, 8192, MAX).unwrap();
        assert_eq!(arena.metrics().chunks_per_list[0], 1);
        arena.free(&mut cache, buf).unwrap();
        assert_eq!(arena.metrics().pooled_chunks, 0);
    }

    #[test]
    fn test_huge_bypass_is_unpooled() {
        let _guard = crate::pool::TEST_MUTEX.read().unwrap();
        let arena = test_arena();
        let mut cache = ThreadCache::disabled();

        let buf = arena.allocate(&mut cache, 20 * MIB, MAX).unwrap();
        assert_eq!(buf.capacity(), 20 * MIB, "huge sizes are not rounded");
        let metrics = arena.metrics();
        assert_eq!(metrics.huge_allocations, 1);
        assert_eq!(metrics.huge_bytes, 20 * MIB);
        assert_eq!(metrics.pooled_chunks, 0, "no chunk is involved");

        arena.free(&mut cache, buf).unwrap();
        let metrics = arena.metrics();
        assert_eq!(metrics.huge_allocations, 0);
        assert_eq!(metrics.active_bytes, 0);
    }

    #[test]
    fn test_live_handles_never_overlap() {
        let _guard = crate::pool::TEST_MUTEX.read().unwrap();
        let arena = test_arena();
        let mut cache = ThreadCache::disabled();

        let sizes = [16, 17, 500, 512, 4096, 8192, 16384, 100_000, MIB];
        let mut bufs = Vec::new();
        for i in 0..60 {
            bufs.push(arena.allocate(&mut cache, sizes[i % sizes.len()], MAX).unwrap());
        }

        let mut windows: Vec<(u32, usize, usize)> = bufs
            .iter()
            .filter(|b| b.capacity() <= 16 * MIB)
            .map(|b| (b.chunk, b.offset(), b.offset() + b.capacity()))
            .collect();
        windows.sort();
        for pair in windows.windows(2) {
            let (chunk_a, _, end_a) = pair[0];
            let (chunk_b, start_b, _) = pair[1];
            if chunk_a == chunk_b {
                assert!(end_a <= start_b, "overlap: {:?} vs {:?}", pair[0], pair[1]);
            }
        }

        for buf in bufs {
            arena.free(&mut cache, buf).unwrap();
        }
        let metrics = arena.metrics();
        assert_eq!(metrics.active_bytes, 0);
        assert_eq!(metrics.chunk_free_bytes, metrics.chunk_total_bytes);
    }

    #[test]
    fn test_double_free_and_stray_handles_rejected() {
        let _guard = crate::pool::TEST_MUTEX.read().unwrap();
        let arena = test_arena();
        let mut cache = ThreadCache::disabled();

        let buf = arena.allocate(&mut cache, 1024, MAX).unwrap();
        let dup = clone_buf(&buf);
        arena.free(&mut cache, buf).unwrap();
        assert!(matches!(
            arena.free(&mut cache, dup),
            Err(AllocError::HandleInvalid(_))
        ));

        // Run-class double free against a still-live chunk.
        let keep = arena.allocate(&mut cache, 16384, MAX).unwrap();
        let victim = arena.allocate(&mut cache, 16384, MAX).unwrap();
        let dup = clone_buf(&victim);
        arena.free(&mut cache, victim).unwrap();
        assert!(matches!(
            arena.free(&mut cache, dup),
            Err(AllocError::HandleInvalid(_))
        ));

        // A handle pointing at a chunk slot that never existed.
        let mut bogus = clone_buf(&keep);
        bogus.chunk = 77;
        assert!(matches!(
            arena.free(&mut cache, bogus),
            Err(AllocError::HandleInvalid(_))
        ));

        arena.free(&mut cache, keep).unwrap();
    }

    #[test]
    fn test_family_counters_track_alloc_and_free() {
        let _guard = crate::pool::TEST_MUTEX.read().unwrap();
        let arena = test_arena();
        let mut cache = ThreadCache::disabled();

        let tiny = arena.allocate(&mut cache, 64, MAX).unwrap();
        let small = arena.allocate(&mut cache, 2048, MAX).unwrap();
        let normal = arena.allocate(&mut cache, 64 * 1024, MAX).unwrap();
        let huge = arena.allocate(&mut cache, 17 * MIB, MAX).unwrap();

        let m = arena.metrics();
        assert_eq!(
            (
                m.tiny_allocations,
                m.small_allocations,
                m.normal_allocations,
                m.huge_allocations_total
            ),
            (1, 1, 1, 1)
        );
        assert_eq!(m.active_bytes, 64 + 2048 + 64 * 1024 + 17 * MIB);

        for buf in [tiny, small, normal, huge] {
            arena.free(&mut cache, buf).unwrap();
        }
        let m = arena.metrics();
        assert_eq!(
            (
                m.tiny_deallocations,
                m.small_deallocations,
                m.normal_deallocations,
                m.huge_deallocations_total
            ),
            (1, 1, 1, 1)
        );
        assert_eq!(m.active_bytes, 0);
    }

    #[test]
    fn test_allocation_reuses_kept_chunks() {
        let _guard = crate::pool::TEST_MUTEX.read().unwrap();
        let arena = test_arena();
        let mut cache = ThreadCache::disabled();

        // Fill chunk A completely, forcing chunk B into existence.
        let a1 = arena.allocate(&mut cache, 8 * MIB, MAX).unwrap();
        let a2 = arena.allocate(&mut cache, 8 * MIB, MAX).unwrap();
        assert_eq!(a1.chunk, a2.chunk);
        let b1 = arena.allocate(&mut cache, 8 * MIB, MAX).unwrap();
        assert_ne!(b1.chunk, a1.chunk);

        // B empties back into q000 and is kept; the next allocation must be
        // served from it rather than from a fresh chunk (A sits in q100,
        // which is never scanned).
        let b_chunk = b1.chunk;
        arena.free(&mut cache, b1).unwrap();
        assert_eq!(arena.metrics().pooled_chunks, 2);
        let c = arena.allocate(&mut cache, 4 * MIB, MAX).unwrap();
        assert_eq!(c.chunk, b_chunk, "kept q000 chunk is reused");

        for buf in [a1, a2, c] {
            arena.free(&mut cache, buf).unwrap();
        }
        assert_eq!(arena.metrics().active_bytes, 0);
    }
}
