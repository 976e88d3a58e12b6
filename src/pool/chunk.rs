use super::error::AllocError;
use super::region::Region;
use super::size_classes::SizeClasses;
use super::subpage::NULL_SLOT;

// ---------------------------------------------------------------------------
// Handle encoding
//
// 64 bits, opaque to callers but stable:
//   bits [31:0]   memory-map index of the allocated node
//   bits [63:32]  0 for a run handle, else bitmap index + 1 for a subpage slot
//
// The +1 keeps subpage handles distinct from run handles even for bitmap
// index 0. Offsets are derivable from the handle by pure arithmetic (the
// node depth is log2 of the index), which is what lets the thread cache
// rebuild a buffer on a hit without touching the arena lock.
// ---------------------------------------------------------------------------

#[inline]
pub(crate) fn run_handle(mem_idx: u32) -> u64 {
    u64::from(mem_idx)
}

#[inline]
pub(crate) fn subpage_handle(mem_idx: u32, bitmap_idx: u32) -> u64 {
    u64::from(mem_idx) | (u64::from(bitmap_idx) + 1) << 32
}

#[inline]
pub(crate) fn handle_mem_idx(handle: u64) -> u32 {
    handle as u32
}

#[inline]
pub(crate) fn handle_bitmap_idx(handle: u64) -> Option<u32> {
    let hi = (handle >> 32) as u32;
    if hi == 0 { None } else { Some(hi - 1) }
}

/// Byte offset of a handle inside its chunk. For subpage handles,
/// `elem_size` is the slot size (the normalized capacity).
pub(crate) fn handle_offset(sc: &SizeClasses, handle: u64, elem_size: usize) -> usize {
    let mem_idx = handle_mem_idx(handle) as usize;
    debug_assert!(mem_idx >= 1);
    let depth = mem_idx.ilog2();
    let run_offset = (mem_idx - (1 << depth)) * sc.run_size(depth);
    match handle_bitmap_idx(handle) {
        None => run_offset,
        Some(bitmap_idx) => run_offset + bitmap_idx as usize * elem_size,
    }
}

/// Buddy allocator over one power-of-two backing region.
///
/// `memory_map` is a binary tree laid out by heap index: node `i` has
/// children `2i` and `2i+1`, leaves are single pages. Each node stores the
/// smallest depth at which its subtree can still satisfy an allocation:
///
///   - `memory_map[i] == depth_map[i]`: subtree completely free.
///   - `depth_map[i] < memory_map[i] <= max_order`: partially allocated;
///     only runs deeper than the stored value fit.
///   - `memory_map[i] == max_order + 1` (`unusable`): fully allocated, or
///     the node itself is the allocated unit (including leaves pinned by a
///     live subpage).
///
/// All mutation happens under the owning arena's mutex.
pub(crate) struct Chunk {
    region: Region,
    sc: SizeClasses,
    memory_map: Box<[u8]>,
    depth_map: Box<[u8]>,
    /// Per leaf page: arena subpage-slab index, or `NULL_SLOT`.
    subpage_slots: Box<[u32]>,
    free_bytes: usize,
}

impl Chunk {
    pub fn new(region: Region, sc: SizeClasses) -> Self {
        debug_assert_eq!(region.len(), sc.chunk_size);
        let nodes = 2 * sc.max_pages();
        let mut memory_map = vec![0u8; nodes].into_boxed_slice();
        let mut depth_map = vec![0u8; nodes].into_boxed_slice();
        for idx in 1..nodes {
            let depth = idx.ilog2() as u8;
            memory_map[idx] = depth;
            depth_map[idx] = depth;
        }
        Self {
            region,
            sc,
            memory_map,
            depth_map,
            subpage_slots: vec![NULL_SLOT; sc.max_pages()].into_boxed_slice(),
            free_bytes: sc.chunk_size,
        }
    }

    #[inline]
    pub fn region(&self) -> &Region {
        &self.region
    }

    #[inline]
    pub fn free_bytes(&self) -> usize {
        self.free_bytes
    }

    #[inline]
    pub fn is_unused(&self) -> bool {
        self.free_bytes == self.sc.chunk_size
    }

    /// Utilization percentage for chunk-list banding. A chunk with any
    /// residual free bytes never reports 100, and only a byte-for-byte full
    /// chunk does — the `q100` band holds exactly the full chunks.
    pub fn usage(&self) -> i32 {
        if self.free_bytes == 0 {
            return 100;
        }
        let free_percentage = (self.free_bytes * 100 / self.sc.chunk_size) as i32;
        if free_percentage == 0 {
            return 99;
        }
        100 - free_percentage
    }

    #[inline]
    pub fn subpage_slot(&self, page_idx: usize) -> u32 {
        self.subpage_slots[page_idx]
    }

    #[inline]
    pub fn set_subpage_slot(&mut self, page_idx: usize, slot: u32) {
        debug_assert_eq!(self.subpage_slots[page_idx], NULL_SLOT);
        self.subpage_slots[page_idx] = slot;
    }

    #[inline]
    pub fn clear_subpage_slot(&mut self, page_idx: usize) {
        debug_assert_ne!(self.subpage_slots[page_idx], NULL_SLOT);
        self.subpage_slots[page_idx] = NULL_SLOT;
    }

    #[inline]
    pub fn page_idx(&self, mem_idx: u32) -> usize {
        debug_assert!(mem_idx as usize >= self.sc.max_pages());
        mem_idx as usize - self.sc.max_pages()
    }

    /// Find and claim the first free subtree at exactly `depth`.
    ///
    /// Iterative left-first descent: at every level, step into the left
    /// child when it can still serve the target depth, otherwise the right
    /// one must (the parent's value said so). Left-first keeps allocations
    /// packed at low addresses.
    pub fn allocate_run(&mut self, depth: u32) -> Option<u32> {
        let target = depth as u8;
        if self.memory_map[1] > target {
            return None;
        }

        let mut idx = 1usize;
        for _ in 0..depth {
            idx <<= 1;
            if self.memory_map[idx] > target {
                idx ^= 1;
            }
        }
        debug_assert!(self.memory_map[idx] <= target);
        debug_assert_eq!(self.depth_map[idx], target);

        self.memory_map[idx] = self.sc.unusable();
        self.update_parents_alloc(idx);
        self.free_bytes -= self.sc.run_size(depth);
        Some(idx as u32)
    }

    /// Claim one leaf page for a subpage.
    pub fn allocate_leaf(&mut self) -> Option<u32> {
        self.allocate_run(self.sc.max_order)
    }

    /// Return a run (or a reclaimed subpage leaf) to the tree.
    ///
    /// # Errors
    ///
    /// `HandleInvalid` when the index is out of range or the node is not
    /// currently allocated (stray or double free).
    pub fn free_run(&mut self, mem_idx: u32) -> Result<(), AllocError> {
        let idx = mem_idx as usize;
        if idx < 1 || idx >= self.memory_map.len() {
            return Err(AllocError::HandleInvalid("memory-map index out of range"));
        }
        if self.memory_map[idx] != self.sc.unusable() {
            return Err(AllocError::HandleInvalid("run is not allocated"));
        }

        let depth = self.depth_map[idx];
        self.memory_map[idx] = depth;
        self.update_parents_free(idx);
        self.free_bytes += self.sc.run_size(u32::from(depth));
        Ok(())
    }

    fn update_parents_alloc(&mut self, mut idx: usize) {
        while idx > 1 {
            let parent = idx >> 1;
            let merged = std::cmp::min(self.memory_map[idx], self.memory_map[idx ^ 1]);
            if self.memory_map[parent] == merged {
                break;
            }
            self.memory_map[parent] = merged;
            idx = parent;
        }
    }

    fn update_parents_free(&mut self, mut idx: usize) {
        while idx > 1 {
            let parent = idx >> 1;
            let child_depth = self.depth_map[idx];
            let left = self.memory_map[idx];
            let right = self.memory_map[idx ^ 1];
            // Two fully-free buddies coalesce into a fully-free parent.
            let merged = if left == child_depth && right == child_depth {
                child_depth - 1
            } else {
                std::cmp::min(left, right)
            };
            if self.memory_map[parent] == merged {
                break;
            }
            self.memory_map[parent] = merged;
            idx = parent;
        }
    }

    /// Tree consistency check used by tests and debug assertions:
    /// every internal node not itself allocated equals the merge of its
    /// children.
    #[cfg(test)]
    pub fn check_tree(&self) {
        let unusable = self.sc.unusable();
        for idx in 1..self.sc.max_pages() {
            let val = self.memory_map[idx];
            if val == unusable {
                continue;
            }
            let left = self.memory_map[2 * idx];
            let right = self.memory_map[2 * idx + 1];
            let child_depth = self.depth_map[2 * idx];
            let merged = if left == child_depth && right == child_depth {
                child_depth - 1
            } else {
                std::cmp::min(left, right)
            };
            assert_eq!(
                val, merged,
                "node {idx}: value {val} != merge({left}, {right})"
            );
            assert!(val >= self.depth_map[idx]);
        }
    }

    #[cfg(test)]
    pub fn memory_map_value(&self, idx: usize) -> u8 {
        self.memory_map[idx]
    }
}
