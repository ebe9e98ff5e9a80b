//! Memory mapping helpers for the shared partition regions.
//!
//! Ring channels and mempools both live in memory that two partitions map at
//! the same time. This module offers an abstraction that allocates aligned,
//! contiguous memory while keeping the unsafe surface tightly encapsulated.

use crate::{TransportError, TransportResult};
use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ptr::{self, NonNull};
use std::sync::Arc;

#[cfg(not(target_arch = "wasm32"))]
type NativeMap = memmap2::MmapMut;

#[derive(Debug)]
enum Backing {
    #[cfg(not(target_arch = "wasm32"))]
    Native(#[allow(dead_code)] NativeMap),
    Owned { layout: Layout },
}

/// Backing memory shared between the two ends of a channel or mempool.
///
/// Native targets prefer anonymous `mmap` regions (page aligned). When that is
/// not possible we fall back to heap allocations while honoring the requested
/// alignment. The base pointer is captured once at construction, so shared
/// references can hand out raw access without re-borrowing the mapping.
#[derive(Debug)]
pub struct SharedRegion {
    ptr: NonNull<u8>,
    len: usize,
    alignment: usize,
    backing: Backing,
}

// SAFETY: the region is a plain byte range; all typed access goes through
// atomics (`header`) or explicit copies whose exclusivity callers uphold.
unsafe impl Send for SharedRegion {}
// SAFETY: as above.
unsafe impl Sync for SharedRegion {}

impl SharedRegion {
    /// Allocates a new zeroed region of `len` bytes aligned to `alignment`.
    ///
    /// On native builds we first try to satisfy the request via `mmap`. If the
    /// returned pointer is not suitably aligned, we transparently fall back to
    /// the heap implementation.
    pub fn new_aligned(len: usize, alignment: usize) -> TransportResult<Self> {
        if len == 0 || alignment == 0 || !alignment.is_power_of_two() {
            return Err(TransportError::AllocationFailed {
                size: len,
                alignment,
            });
        }

        #[cfg(not(target_arch = "wasm32"))]
        {
            if let Some(region) = Self::mmap_backed(len, alignment)? {
                return Ok(region);
            }
        }

        Self::heap_backed(len, alignment)
    }

    fn heap_backed(len: usize, alignment: usize) -> TransportResult<Self> {
        let layout = Layout::from_size_align(len, alignment).map_err(|_| {
            TransportError::AllocationFailed {
                size: len,
                alignment,
            }
        })?;

        // SAFETY: `layout` has a non-zero size (checked in `new_aligned`).
        let ptr = unsafe { alloc_zeroed(layout) };

        let ptr = NonNull::new(ptr).ok_or(TransportError::AllocationFailed {
            size: len,
            alignment,
        })?;
        Ok(Self {
            ptr,
            len,
            alignment,
            backing: Backing::Owned { layout },
        })
    }

    #[cfg(not(target_arch = "wasm32"))]
    fn mmap_backed(len: usize, alignment: usize) -> TransportResult<Option<Self>> {
        let mut map = memmap2::MmapOptions::new()
            .len(len)
            .map_anon()
            .map_err(|_| TransportError::AllocationFailed {
                size: len,
                alignment,
            })?;

        let raw = map.as_mut_ptr();
        if raw as usize % alignment != 0 {
            return Ok(None);
        }

        let ptr = NonNull::new(raw).ok_or(TransportError::AllocationFailed {
            size: len,
            alignment,
        })?;
        Ok(Some(Self {
            ptr,
            len,
            alignment,
            backing: Backing::Native(map),
        }))
    }

    /// Total number of bytes managed by this region.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true when the region has zero length.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns the alignment the region was allocated with.
    pub fn alignment(&self) -> usize {
        self.alignment
    }

    /// Raw base pointer of the region.
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    fn header_ptr<T>(&self, offset: usize) -> *mut T {
        assert!(
            offset + std::mem::size_of::<T>() <= self.len,
            "header at {offset} out of range"
        );
        let ptr = self.ptr.as_ptr().wrapping_add(offset);
        assert_eq!(
            ptr as usize % std::mem::align_of::<T>(),
            0,
            "header at {offset} misaligned"
        );
        ptr.cast()
    }

    /// Places `value` at `offset`.
    ///
    /// # Safety
    /// Nothing may reference the bytes at `offset` while they are written.
    pub(crate) unsafe fn init_header<T>(&self, offset: usize, value: T) {
        let ptr = self.header_ptr::<T>(offset);
        // SAFETY: bounds and alignment checked; exclusivity upheld by the caller.
        unsafe { ptr.write(value) };
    }

    /// Drops a header placed with [`init_header`](Self::init_header).
    ///
    /// # Safety
    /// The header must have been initialised and must not be used again.
    pub(crate) unsafe fn drop_header<T>(&self, offset: usize) {
        let ptr = self.header_ptr::<T>(offset);
        // SAFETY: upheld by the caller.
        unsafe { std::ptr::drop_in_place(ptr) };
    }

    /// Borrows a header placed with [`init_header`](Self::init_header).
    ///
    /// Only used for `#[repr(C)]` headers made of atomics.
    pub(crate) fn header<T>(&self, offset: usize) -> &T {
        let ptr = self.header_ptr::<T>(offset);
        // SAFETY: bounds and alignment were checked, the memory was either
        // zero-initialised or written by `init_header`, and `T` only
        // contains atomics.
        unsafe { &*ptr }
    }

    /// Copies `dst.len()` bytes starting at `offset` out of the region.
    ///
    /// # Safety
    /// No writer may be mutating the same byte range concurrently.
    pub(crate) unsafe fn copy_out(&self, offset: usize, dst: &mut [u8]) {
        assert!(offset + dst.len() <= self.len, "copy_out out of range");
        // SAFETY: range checked above; exclusivity upheld by the caller.
        unsafe {
            ptr::copy_nonoverlapping(self.ptr.as_ptr().add(offset), dst.as_mut_ptr(), dst.len())
        };
    }

    /// Copies `src` into the region at `offset`.
    ///
    /// # Safety
    /// No other reader or writer may access the same byte range concurrently.
    pub(crate) unsafe fn copy_in(&self, offset: usize, src: &[u8]) {
        assert!(offset + src.len() <= self.len, "copy_in out of range");
        // SAFETY: range checked above; exclusivity upheld by the caller.
        unsafe {
            ptr::copy_nonoverlapping(src.as_ptr(), self.ptr.as_ptr().add(offset), src.len())
        };
    }
}

impl Drop for SharedRegion {
    fn drop(&mut self) {
        if let Backing::Owned { layout } = &self.backing {
            // SAFETY: `ptr` was returned by `alloc`/`alloc_zeroed` with `layout`.
            unsafe {
                dealloc(self.ptr.as_ptr(), *layout);
            }
        }
    }
}

/// Local mapping of a shared region, as handed out by a mempool.
///
/// The mapping keeps the region alive; it does not arbitrate access. Local
/// exclusivity is the caller's business, and coordination with the remote
/// partition belongs to the protocol carried over the ring.
#[derive(Clone, Debug)]
pub struct MappedMemory {
    region: Arc<SharedRegion>,
}

impl MappedMemory {
    /// Wraps a region that is already shared with the remote partition.
    pub fn new(region: Arc<SharedRegion>) -> Self {
        Self { region }
    }

    /// Base pointer of the mapping.
    pub fn as_ptr(&self) -> *mut u8 {
        self.region.as_ptr()
    }

    /// Size of the mapping in bytes.
    pub fn len(&self) -> usize {
        self.region.len()
    }

    /// Returns true when the mapping is empty.
    pub fn is_empty(&self) -> bool {
        self.region.is_empty()
    }
}
