use super::error::AllocError;

/// Null link/slot marker for the subpage slab and its circular lists.
pub(crate) const NULL_SLOT: u32 = u32::MAX;

/// Bitmap allocator over one pinned page.
///
/// The page is split into `page_size / elem_size` equal slots of a single
/// tiny/small class. Free slots are 1-bits; `num_avail` mirrors the popcount.
/// `next_avail` is a direct-index hint written on free and consumed by the
/// next allocation, so a free/alloc pair of the same class never rescans the
/// bitmap.
///
/// Subpages of one class are linked into a per-arena circular list (head
/// sentinel first) through `prev`/`next`, which hold slab indices rather
/// than references. The arena owns the links; a subpage only tracks its own
/// slot accounting. All operations run under the arena mutex, so slot
/// counts stay coherent with the list transitions the arena performs:
/// `num_avail 0 -> 1` re-links at the head, `-> 0` unlinks, and reaching
/// `slot_count` (empty) unlinks and returns the page to the chunk.
pub(crate) struct Subpage {
    /// Owning chunk slot in the arena (NULL_SLOT for sentinels).
    pub chunk: u32,
    /// Leaf index in the owning chunk's memory map.
    pub mem_idx: u32,
    /// Slot size in bytes; 0 marks a list sentinel.
    pub elem_size: usize,
    slot_count: u16,
    num_avail: u16,
    /// Direct slot hint, or -1 when unknown.
    next_avail: i32,
    /// 1-bit = free. `ceil(slot_count / 64)` words.
    bitmap: Box<[u64]>,
    pub prev: u32,
    pub next: u32,
}

impl Subpage {
    pub fn new(chunk: u32, mem_idx: u32, page_size: usize, elem_size: usize) -> Self {
        debug_assert!(elem_size >= 16 && elem_size < page_size);
        // Non-power-of-two tiny classes leave a sub-elem_size tail unused.
        let slot_count = page_size / elem_size;
        debug_assert!(slot_count <= 512);

        let words = slot_count.div_ceil(64);
        let mut bitmap = vec![0u64; words].into_boxed_slice();
        // Set one free bit per slot; the last word may be partial.
        for (w, word) in bitmap.iter_mut().enumerate() {
            let bits = std::cmp::min(64, slot_count - w * 64);
            *word = if bits == 64 { u64::MAX } else { (1u64 << bits) - 1 };
        }

        Self {
            chunk,
            mem_idx,
            elem_size,
            slot_count: slot_count as u16,
            num_avail: slot_count as u16,
            next_avail: 0,
            bitmap,
            prev: NULL_SLOT,
            next: NULL_SLOT,
        }
    }

    /// A list head. Never allocated from; `elem_size == 0` identifies it.
    pub fn sentinel() -> Self {
        Self {
            chunk: NULL_SLOT,
            mem_idx: 0,
            elem_size: 0,
            slot_count: 0,
            num_avail: 0,
            next_avail: -1,
            bitmap: Box::new([]),
            prev: NULL_SLOT,
            next: NULL_SLOT,
        }
    }

    #[inline]
    pub fn is_sentinel(&self) -> bool {
        self.elem_size == 0
    }

    #[inline]
    pub fn slot_count(&self) -> u16 {
        self.slot_count
    }

    #[inline]
    pub fn num_avail(&self) -> u16 {
        self.num_avail
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.num_avail == 0
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.num_avail == self.slot_count
    }

    #[inline]
    fn bit(&self, idx: usize) -> bool {
        self.bitmap[idx / 64] & (1u64 << (idx % 64)) != 0
    }

    /// Claim a free slot. Returns its bitmap index, or `None` when full.
    pub fn allocate(&mut self) -> Option<u16> {
        if self.num_avail == 0 {
            return None;
        }

        let idx = if self.next_avail >= 0 {
            let idx = self.next_avail as usize;
            self.next_avail = -1;
            // The hint is written on free and consumed here before any other
            // slot operation, so it always points at a free bit.
            debug_assert!(self.bit(idx));
            idx
        } else {
            self.find_free()?
        };

        self.bitmap[idx / 64] &= !(1u64 << (idx % 64));
        self.num_avail -= 1;
        Some(idx as u16)
    }

    fn find_free(&self) -> Option<usize> {
        for (w, word) in self.bitmap.iter().enumerate() {
            if *word != 0 {
                return Some(w * 64 + word.trailing_zeros() as usize);
            }
        }
        debug_assert!(false, "num_avail {} but bitmap exhausted", self.num_avail);
        None
    }

    /// Release a slot. Returns `true` while other slots remain allocated;
    /// `false` means the subpage is empty and its page can be reclaimed.
    ///
    /// # Errors
    ///
    /// `HandleInvalid` on an out-of-range index or a slot that is already
    /// free (double-free).
    pub fn free(&mut self, bitmap_idx: u32) -> Result<bool, AllocError> {
        let idx = bitmap_idx as usize;
        if idx >= usize::from(self.slot_count) {
            return Err(AllocError::HandleInvalid("subpage slot out of range"));
        }
        if self.bit(idx) {
            return Err(AllocError::HandleInvalid("subpage slot already free"));
        }

        self.bitmap[idx / 64] |= 1u64 << (idx % 64);
        self.num_avail += 1;
        self.next_avail = bitmap_idx.cast_signed();
        Ok(self.num_avail < self.slot_count)
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_until_full() {
        let mut sp = Subpage::new(0, 2048, 8192, 512);
        assert_eq!(sp.slot_count(), 16);

        let mut seen = std::collections::HashSet::new();
        for _ in 0..16 {
            let idx = sp.allocate().expect("slot available");
            assert!(seen.insert(idx), "slot {idx} handed out twice");
        }
        assert!(sp.is_full());
        assert_eq!(sp.allocate(), None);
    }

    #[test]
    fn test_free_hint_is_reused() {
        let mut sp = Subpage::new(0, 2048, 8192, 1024);
        let a = sp.allocate().unwrap();
        let b = sp.allocate().unwrap();
        assert_ne!(a, b);

        assert!(sp.free(u32::from(a)).unwrap());
        // The freed slot is handed straight back via the hint.
        assert_eq!(sp.allocate().unwrap(), a);

        assert!(sp.free(u32::from(a)).unwrap());
        assert!(!sp.free(u32::from(b)).unwrap(), "last free empties the page");
        assert!(sp.is_empty());
    }

    #[test]
    fn test_double_free_detected() {
        let mut sp = Subpage::new(0, 2048, 8192, 512);
        let idx = sp.allocate().unwrap();
        sp.free(u32::from(idx)).unwrap();
        let err = sp.free(u32::from(idx)).unwrap_err();
        assert!(matches!(err, AllocError::HandleInvalid(_)));
    }

    #[test]
    fn test_out_of_range_free_detected() {
        let mut sp = Subpage::new(0, 2048, 8192, 512);
        let err = sp.free(16).unwrap_err();
        assert!(matches!(err, AllocError::HandleInvalid(_)));
    }

    #[test]
    fn test_tiny_class_with_512_slots() {
        // Smallest class on the default page: 8192 / 16 = 512 slots, 8 words.
        let mut sp = Subpage::new(0, 2048, 8192, 16);
        assert_eq!(sp.slot_count(), 512);
        for _ in 0..512 {
            sp.allocate().unwrap();
        }
        assert!(sp.is_full());
        for idx in 0..512u32 {
            let still_in_use = sp.free(idx).unwrap();
            assert_eq!(still_in_use, idx != 511);
        }
        assert!(sp.is_empty());
    }

    #[test]
    fn test_partial_last_word() {
        // 32 slots fit in half a bitmap word; the unused upper bits must
        // never be handed out.
        let mut sp = Subpage::new(0, 2048, 8192, 256);
        assert_eq!(sp.slot_count(), 32);
        let mut got = Vec::new();
        while let Some(idx) = sp.allocate() {
            got.push(idx);
        }
        assert_eq!(got.len(), 32);
        assert!(got.iter().all(|&i| usize::from(i) < 32));
    }
}
