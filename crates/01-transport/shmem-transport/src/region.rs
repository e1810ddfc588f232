//! Memory backing for the shared layout and buffer pools.
//!
//! On the target the shared window is a fixed physical range handed to us as
//! a raw pointer; in-process links and tests allocate an anonymous `mmap`
//! region instead (falling back to the heap when the mapping cannot satisfy
//! the requested alignment). Every view into the region goes through the
//! helpers below so the unsafe surface stays in one file.

use std::alloc::{alloc, alloc_zeroed, dealloc, Layout};
use std::mem;
use std::ptr::{self, NonNull};

use crate::{TransportError, TransportResult};

/// Specifies how memory in a [`SharedRegion`] should be initialised.
#[derive(Clone, Copy, Debug)]
pub enum RegionInit {
    /// Zero the entire region after allocation.
    Zeroed,
    /// Leave the region uninitialised.
    Uninitialized,
}

/// Types that may be viewed in place inside shared memory.
///
/// # Safety
///
/// Implementors must be `#[repr(C)]`, valid for every bit pattern (including
/// all zeroes) and only mutated through atomics or `UnsafeCell`, because the
/// other processor writes the same bytes concurrently.
pub unsafe trait SharedBlock: Sync {}

// SAFETY: a bare atomic word is valid for any bit pattern.
unsafe impl SharedBlock for std::sync::atomic::AtomicU32 {}

#[derive(Debug)]
enum Backing {
    Native(#[allow(dead_code)] memmap2::MmapMut),
    Owned { layout: Layout },
    Borrowed,
}

/// Contiguous, aligned memory shared with the peer processor.
#[derive(Debug)]
pub struct SharedRegion {
    base: NonNull<u8>,
    len: usize,
    alignment: usize,
    backing: Backing,
}

// SAFETY: the region only hands out raw pointers and `SharedBlock` views; all
// cross-thread mutation happens through atomics or exclusively owned slots.
unsafe impl Send for SharedRegion {}
// SAFETY: as above.
unsafe impl Sync for SharedRegion {}

impl SharedRegion {
    /// Allocates a new region of `len` bytes aligned to `alignment`.
    ///
    /// We first try an anonymous `mmap`. If the returned pointer is not
    /// suitably aligned we transparently fall back to the heap.
    pub fn new_aligned(len: usize, alignment: usize, init: RegionInit) -> TransportResult<Self> {
        if len == 0 || alignment == 0 || !alignment.is_power_of_two() {
            return Err(TransportError::AllocationFailed {
                size: len,
                alignment,
            });
        }

        if let Some(region) = Self::mmap_backed(len, alignment, init)? {
            return Ok(region);
        }

        Self::heap_backed(len, alignment, init)
    }

    /// Wraps memory owned by someone else, typically the fixed shared window
    /// between the two processors.
    ///
    /// # Safety
    ///
    /// `ptr` must be valid for reads and writes of `len` bytes for the
    /// lifetime of the returned region and must not be freed by it.
    pub unsafe fn from_raw_parts(ptr: NonNull<u8>, len: usize) -> Self {
        let alignment = 1usize << (ptr.as_ptr() as usize).trailing_zeros().min(12);
        Self {
            base: ptr,
            len,
            alignment,
            backing: Backing::Borrowed,
        }
    }

    fn heap_backed(len: usize, alignment: usize, init: RegionInit) -> TransportResult<Self> {
        let layout = Layout::from_size_align(len, alignment).map_err(|_| {
            TransportError::AllocationFailed {
                size: len,
                alignment,
            }
        })?;

        let ptr = unsafe {
            // SAFETY: `layout` has a non-zero size.
            match init {
                RegionInit::Zeroed => alloc_zeroed(layout),
                RegionInit::Uninitialized => alloc(layout),
            }
        };

        let base = NonNull::new(ptr).ok_or(TransportError::AllocationFailed {
            size: len,
            alignment,
        })?;
        Ok(Self {
            base,
            len,
            alignment,
            backing: Backing::Owned { layout },
        })
    }

    fn mmap_backed(len: usize, alignment: usize, init: RegionInit) -> TransportResult<Option<Self>> {
        let mut map = memmap2::MmapOptions::new()
            .len(len)
            .map_anon()
            .map_err(|_| TransportError::AllocationFailed {
                size: len,
                alignment,
            })?;

        let ptr = map.as_mut_ptr();
        if ptr as usize % alignment != 0 {
            return Ok(None);
        }

        if matches!(init, RegionInit::Zeroed) {
            unsafe {
                // SAFETY: the anonymous mapping exposes `len` bytes that can be zeroed here.
                ptr::write_bytes(ptr, 0, len)
            };
        }

        let Some(base) = NonNull::new(ptr) else {
            return Ok(None);
        };
        Ok(Some(Self {
            base,
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

    /// Base address of the region.
    pub fn as_ptr(&self) -> *const u8 {
        self.base.as_ptr()
    }

    /// Raw pointer `offset` bytes into the region.
    ///
    /// # Panics
    ///
    /// Panics if `offset + len` exceeds the region.
    pub(crate) fn byte_ptr(&self, offset: usize, len: usize) -> *mut u8 {
        assert!(
            offset.checked_add(len).is_some_and(|end| end <= self.len),
            "range {offset}+{len} outside region of {} bytes",
            self.len
        );
        // SAFETY: bounds checked above.
        unsafe { self.base.as_ptr().add(offset) }
    }

    /// Borrows a `T` living `offset` bytes into the region.
    ///
    /// # Panics
    ///
    /// Panics if the view is out of bounds or misaligned.
    pub fn view<T: SharedBlock>(&self, offset: usize) -> &T {
        let ptr = self.byte_ptr(offset, mem::size_of::<T>());
        assert_eq!(
            ptr as usize % mem::align_of::<T>(),
            0,
            "misaligned shared view at offset {offset}"
        );
        // SAFETY: in bounds, aligned, and `SharedBlock` guarantees every bit
        // pattern is valid and all mutation is interior.
        unsafe { &*(ptr as *const T) }
    }

    /// Borrows `count` consecutive `T`s starting `offset` bytes into the region.
    ///
    /// # Panics
    ///
    /// Panics if the view is out of bounds or misaligned.
    pub fn view_slice<T: SharedBlock>(&self, offset: usize, count: usize) -> &[T] {
        let bytes = mem::size_of::<T>().saturating_mul(count);
        let ptr = self.byte_ptr(offset, bytes);
        assert_eq!(
            ptr as usize % mem::align_of::<T>(),
            0,
            "misaligned shared slice at offset {offset}"
        );
        // SAFETY: as in `view`.
        unsafe { std::slice::from_raw_parts(ptr as *const T, count) }
    }
}

impl Drop for SharedRegion {
    fn drop(&mut self) {
        if let Backing::Owned { layout } = &self.backing {
            unsafe {
                // SAFETY: `base` was returned by `alloc`/`alloc_zeroed` with `layout`.
                dealloc(self.base.as_ptr(), *layout);
            }
        }
    }
}
