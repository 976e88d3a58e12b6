use super::vm::VmError;
use std::fmt;

/// Errors surfaced by the pooled allocator.
///
/// All variants are returned synchronously to the calling thread; the
/// allocator never retries and never logs.
#[derive(Debug)]
pub enum AllocError {
    /// Construction-time configuration rejection. Fatal to allocator creation.
    ConfigInvalid(String),
    /// Caller passed an out-of-range capacity (`requested > maximum`, or
    /// either exceeds the allocator ceiling).
    CapacityInvalid { requested: usize, maximum: usize },
    /// The OS refused backing memory for a new chunk or a huge allocation.
    /// Arena state is unchanged.
    OutOfMemory(VmError),
    /// Double-free or stray handle. Detection is best-effort: freed subpage
    /// slots and buddy nodes carry sentinel state that is checked on free.
    HandleInvalid(&'static str),
}

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllocError::ConfigInvalid(msg) => write!(f, "invalid configuration: {msg}"),
            AllocError::CapacityInvalid { requested, maximum } => write!(
                f,
                "invalid capacity: requested {requested} (maximum: {maximum})"
            ),
            AllocError::OutOfMemory(e) => write!(f, "out of memory: {e}"),
            AllocError::HandleInvalid(msg) => write!(f, "invalid handle: {msg}"),
        }
    }
}

impl std::error::Error for AllocError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            AllocError::OutOfMemory(e) => Some(e),
            AllocError::ConfigInvalid(_)
            | AllocError::CapacityInvalid { .. }
            | AllocError::HandleInvalid(_) => None,
        }
    }
}

impl From<VmError> for AllocError {
    fn from(e: VmError) -> Self {
        AllocError::OutOfMemory(e)
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn test_display_carries_context() {
        let e = AllocError::CapacityInvalid {
            requested: 10,
            maximum: 5,
        };
        let msg = e.to_string();
        assert!(msg.contains("10") && msg.contains("5"), "got: {msg}");

        let e = AllocError::ConfigInvalid("page_size: 100 (expected: >= 4096)".to_string());
        assert!(e.to_string().contains("page_size"));
    }

    #[test]
    fn test_source_chain() {
        use std::error::Error;
        let inner = VmError::InitializationFailed("probe".to_string());
        let e = AllocError::from(inner);
        assert!(matches!(e, AllocError::OutOfMemory(_)));
        assert!(e.source().is_some());
        assert!(
            AllocError::HandleInvalid("stray handle").source().is_none()
        );
    }
}
