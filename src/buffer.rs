//! Aligned heap buffers and a handler that pools them.
//!
//! [AlignedBuffer] is the typical pooled resource: a fixed-capacity,
//! alignment-constrained byte buffer. Use page alignment for storage I/O
//! (direct I/O and DMA require it) and cache-line alignment for network I/O
//! (smaller alignment reduces internal fragmentation).

use crate::handler::{HandlerError, ResourceHandler};
use std::{
    alloc::{alloc_zeroed, dealloc, Layout},
    fmt,
    ptr::NonNull,
    slice,
};

/// Returns the system page size.
///
/// On Unix systems, queries the actual page size via `sysconf`. On other
/// systems, defaults to 4 KiB.
#[cfg(unix)]
pub fn page_size() -> usize {
    // SAFETY: sysconf is safe to call.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size <= 0 {
        4096
    } else {
        size as usize
    }
}

#[cfg(not(unix))]
pub const fn page_size() -> usize {
    4096
}

/// Returns a conservative cache line size for the current architecture:
/// 128 bytes on x86_64 and aarch64 (accounting for spatial prefetching),
/// 64 bytes elsewhere.
pub const fn cache_line_size() -> usize {
    cfg_if::cfg_if! {
        if #[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))] {
            128
        } else {
            64
        }
    }
}

/// A fixed-capacity heap buffer allocated with explicit alignment.
///
/// The capacity is set at allocation and never changes; `len` bounds the
/// client-visible slice and is reset by the pool on every acquire. Memory is
/// zeroed at allocation (reused buffers keep whatever the previous holder
/// wrote). The buffer deallocates itself on drop.
pub struct AlignedBuffer {
    ptr: NonNull<u8>,
    layout: Layout,
    len: usize,
}

// SAFETY: the buffer exclusively owns its allocation.
unsafe impl Send for AlignedBuffer {}
// SAFETY: no interior mutability; a shared reference only permits reads.
unsafe impl Sync for AlignedBuffer {}

impl AlignedBuffer {
    /// Allocates a zero-initialized buffer of exactly `capacity` bytes at the
    /// given alignment. Fails when the allocator cannot satisfy the request
    /// or the layout is invalid.
    pub fn new(capacity: usize, alignment: usize) -> Result<Self, HandlerError> {
        let layout = Layout::from_size_align(capacity, alignment)?;
        if capacity == 0 {
            return Ok(Self {
                ptr: NonNull::dangling(),
                layout,
                len: 0,
            });
        }
        // SAFETY: layout has non-zero size.
        let ptr = unsafe { alloc_zeroed(layout) };
        match NonNull::new(ptr) {
            Some(ptr) => Ok(Self {
                ptr,
                layout,
                len: 0,
            }),
            None => Err(format!("allocation of {capacity} bytes (alignment {alignment}) failed").into()),
        }
    }

    /// Returns the fixed capacity of the buffer.
    #[inline]
    pub const fn capacity(&self) -> usize {
        self.layout.size()
    }

    /// Returns the client-visible length.
    #[inline]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Bounds the client-visible slice to `len` bytes.
    ///
    /// # Panics
    ///
    /// Panics if `len` exceeds the capacity.
    pub fn set_len(&mut self, len: usize) {
        assert!(
            len <= self.capacity(),
            "len {len} exceeds capacity {}",
            self.capacity()
        );
        self.len = len;
    }

    /// Returns the visible bytes.
    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: ptr covers capacity >= len initialized bytes (zeroed at
        // allocation, possibly overwritten since).
        unsafe { slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    /// Returns the visible bytes mutably.
    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: as for as_slice; &mut self guarantees exclusivity.
        unsafe { slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }

    /// Returns the base pointer. Aligned to the allocation alignment.
    #[inline]
    pub const fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }
}

impl Drop for AlignedBuffer {
    fn drop(&mut self) {
        if self.layout.size() > 0 {
            // SAFETY: ptr was allocated with this layout.
            unsafe { dealloc(self.ptr.as_ptr(), self.layout) };
        }
    }
}

impl fmt::Debug for AlignedBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AlignedBuffer")
            .field("capacity", &self.capacity())
            .field("len", &self.len)
            .field("align", &self.layout.align())
            .finish()
    }
}

impl AsRef<[u8]> for AlignedBuffer {
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl AsMut<[u8]> for AlignedBuffer {
    fn as_mut(&mut self) -> &mut [u8] {
        self.as_mut_slice()
    }
}

/// Pools [AlignedBuffer]s of a fixed alignment.
///
/// On acquire, a buffer's length is bound to the requested size; on release
/// it is reset to zero. Allocation failure surfaces through the pool as
/// [crate::Error::Handler] rather than aborting, so callers can degrade
/// gracefully under memory pressure.
#[derive(Clone, Copy, Debug)]
pub struct AlignedBufferHandler {
    alignment: usize,
}

impl AlignedBufferHandler {
    /// Creates a handler allocating at the given alignment.
    ///
    /// # Panics
    ///
    /// Panics if `alignment` is not a power of two.
    pub fn new(alignment: usize) -> Self {
        assert!(
            alignment.is_power_of_two(),
            "alignment must be a power of two"
        );
        Self { alignment }
    }

    /// Creates a handler allocating at the system page size.
    pub fn page_aligned() -> Self {
        Self::new(page_size())
    }

    /// Creates a handler allocating at the architecture's cache line size.
    pub const fn cache_line_aligned() -> Self {
        Self {
            alignment: cache_line_size(),
        }
    }
}

impl ResourceHandler for AlignedBufferHandler {
    type Resource = AlignedBuffer;

    fn create(&self, capacity: u64) -> Result<AlignedBuffer, HandlerError> {
        let capacity =
            usize::try_from(capacity).map_err(|_| "capacity exceeds addressable memory")?;
        AlignedBuffer::new(capacity, self.alignment)
    }

    fn destroy(&self, resource: AlignedBuffer) {
        drop(resource);
    }

    fn capacity_of(&self, resource: &AlignedBuffer) -> u64 {
        resource.capacity() as u64
    }

    fn setup(&self, resource: &mut AlignedBuffer, size: u64, _after_create: bool) {
        resource.set_len(size as usize);
    }

    fn cleanup(&self, resource: &mut AlignedBuffer, _before_destroy: bool) {
        resource.set_len(0);
    }
}
