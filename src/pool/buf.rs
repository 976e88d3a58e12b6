/// Which arena family backs an allocation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MemoryKind {
    /// Process-heap backed regions.
    Heap,
    /// VM-mapped (off-heap) regions.
    Direct,
}

/// Arena slot marker for buffers served by the unpooled fallback registry
/// (configurations with zero arenas of the requested kind).
pub(crate) const UNBOUND_ARENA: u32 = u32::MAX;

/// A live pooled allocation.
///
/// The handle is the unit of ownership transfer: exactly one caller holds it
/// between `allocate` and `release`, and it is deliberately neither `Clone`
/// nor `Copy`. `handle` is an opaque 64-bit encoding of the allocation's
/// position inside its chunk; consumers never interpret it.
///
/// Invariants: `len() <= capacity()` and
/// `offset() + capacity() <= chunk size`.
#[derive(Debug)]
pub struct PooledBuf {
    pub(crate) kind: MemoryKind,
    pub(crate) arena: u32,
    pub(crate) chunk: u32,
    pub(crate) handle: u64,
    pub(crate) offset: usize,
    pub(crate) length: usize,
    pub(crate) max_length: usize,
}

impl PooledBuf {
    /// The empty handle, produced for zero-capacity requests.
    /// Releasing it is a no-op.
    pub(crate) fn empty(kind: MemoryKind) -> Self {
        Self {
            kind,
            arena: UNBOUND_ARENA,
            chunk: u32::MAX,
            handle: 0,
            offset: 0,
            length: 0,
            max_length: 0,
        }
    }

    #[inline]
    pub fn kind(&self) -> MemoryKind {
        self.kind
    }

    /// Usable capacity (the requested size).
    #[inline]
    pub fn len(&self) -> usize {
        self.length
    }

    /// Allocated capacity (the normalized class size, `>= len()`).
    #[inline]
    pub fn capacity(&self) -> usize {
        self.max_length
    }

    /// Byte offset inside the backing chunk.
    #[inline]
    pub fn offset(&self) -> usize {
        self.offset
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.max_length == 0
    }
}
