//! Buffer allocation seams for the read path.
//!
//! Two layers cooperate when the core prepares an inbound buffer:
//!
//! - [`BufferAllocator`] produces buffers of a requested capacity. The
//!   default is a plain `BytesMut` allocation; embedders can plug pooled or
//!   pinned allocators behind the same trait.
//! - [`ReadBufferAllocator`] is the per-`read()` override: it sees the read
//!   handle's estimated capacity and decides what actually gets allocated
//!   for this read loop.

use bytes::BytesMut;

/// Allocator used for inbound payload buffers.
pub trait BufferAllocator: Send + Sync {
    fn allocate(&self, capacity: usize) -> BytesMut;
}

/// Default allocator backed by `BytesMut`.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultBufferAllocator;

impl BufferAllocator for DefaultBufferAllocator {
    fn allocate(&self, capacity: usize) -> BytesMut {
        BytesMut::with_capacity(capacity)
    }
}

/// Per-read buffer sizing override, supplied to `Channel::read_with`.
pub trait ReadBufferAllocator: Send + Sync {
    /// Allocate the buffer for one read attempt. `estimated_capacity` is the
    /// read handle's current guess.
    fn allocate(&self, allocator: &dyn BufferAllocator, estimated_capacity: usize) -> BytesMut;
}

/// Default: allocate exactly what the read handle estimates.
#[derive(Debug, Clone, Copy, Default)]
pub struct HandleSizedReadAllocator;

impl ReadBufferAllocator for HandleSizedReadAllocator {
    fn allocate(&self, allocator: &dyn BufferAllocator, estimated_capacity: usize) -> BytesMut {
        allocator.allocate(estimated_capacity)
    }
}

/// Fixed-size override, ignoring the handle's estimate.
#[derive(Debug, Clone, Copy)]
pub struct ExactReadAllocator {
    size: usize,
}

impl ExactReadAllocator {
    #[must_use]
    pub const fn new(size: usize) -> Self {
        Self { size }
    }
}

impl ReadBufferAllocator for ExactReadAllocator {
    fn allocate(&self, allocator: &dyn BufferAllocator, _estimated_capacity: usize) -> BytesMut {
        allocator.allocate(self.size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_allocator_capacity() {
        let buf = DefaultBufferAllocator.allocate(4096);
        assert!(buf.capacity() >= 4096);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_handle_sized_follows_estimate() {
        let buf = HandleSizedReadAllocator.allocate(&DefaultBufferAllocator, 1024);
        assert!(buf.capacity() >= 1024);
    }

    #[test]
    fn test_exact_ignores_estimate() {
        let buf = ExactReadAllocator::new(64).allocate(&DefaultBufferAllocator, 8192);
        assert!(buf.capacity() >= 64);
        assert!(buf.capacity() < 8192);
    }
}
