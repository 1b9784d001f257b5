//! Buffer allocation for frame encoding and payload assembly.

use std::fmt;
use std::sync::{Arc, OnceLock};

use bytes::BytesMut;

/// Source of byte buffers used by the engine.
pub trait BufferAllocator: Send + Sync + fmt::Debug {
    fn allocate(&self) -> BytesMut;

    fn allocate_with_capacity(&self, capacity: usize) -> BytesMut;
}

/// Heap allocator backing [`default_allocator`].
#[derive(Debug, Default)]
pub struct HeapAllocator;

impl BufferAllocator for HeapAllocator {
    fn allocate(&self) -> BytesMut {
        BytesMut::new()
    }

    fn allocate_with_capacity(&self, capacity: usize) -> BytesMut {
        BytesMut::with_capacity(capacity)
    }
}

/// The process-wide allocator used when a configuration names none.
pub fn default_allocator() -> Arc<dyn BufferAllocator> {
    static DEFAULT: OnceLock<Arc<dyn BufferAllocator>> = OnceLock::new();
    DEFAULT.get_or_init(|| Arc::new(HeapAllocator)).clone()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_allocator_is_shared() {
        let a = default_allocator();
        let b = default_allocator();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_allocate_with_capacity() {
        let buf = default_allocator().allocate_with_capacity(4096);
        assert!(buf.capacity() >= 4096);
        assert!(buf.is_empty());
    }
}
