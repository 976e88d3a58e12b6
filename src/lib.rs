#[cfg(not(target_pointer_width = "64"))]
compile_error!("bufpool supports only 64-bit targets.");

pub(crate) mod sync;

// public module: contains implementation details (hidden via pub(crate))
// and TEST_MUTEX (public for tests)
pub mod pool;

// allocator facade
pub use pool::allocator::{
    AllocatorMetrics, GlobalPooledAllocator, PooledAllocator, PooledAllocatorConfig,
};

// handles and arena metrics
pub use pool::arena::ArenaMetrics;
pub use pool::buf::{MemoryKind, PooledBuf};
pub use pool::thread_cache::ThreadCache;

// errors
pub use pool::error::AllocError;
pub use pool::vm::VmError;
