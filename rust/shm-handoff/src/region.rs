//! Views over the shared memory a transfer runs in.
//!
//! - [`Region`]: a cheap, cloneable view (base pointer + length). It either
//!   borrows caller-managed memory ([`Region::from_raw`]) or keeps a
//!   [`HeapRegion`] allocation alive.
//! - [`HeapRegion`]: an owned, zeroed, cache-line aligned allocation for
//!   peers living in the same process.

use std::alloc::{self, Layout};
use std::fmt;
use std::ptr::NonNull;
use std::sync::Arc;

use crate::layout::{HEADER_SIZE, Header, LayoutError, RegionLayout};

/// Alignment of heap-backed regions.
const HEAP_REGION_ALIGN: usize = 64;

/// A view of a shared region.
///
/// Cloning is cheap. Clones of a heap-backed view keep the allocation alive.
#[derive(Clone)]
pub struct Region {
    base: NonNull<u8>,
    len: usize,
    _owner: Option<Arc<HeapBuffer>>,
}

// SAFETY: the region is shared memory; all concurrent access goes through the
// atomic header words, and the payload area is only touched by the side the
// semaphore currently hands it to.
unsafe impl Send for Region {}
unsafe impl Sync for Region {}

impl Region {
    /// Create a view over caller-managed memory.
    ///
    /// The length and alignment are not checked here; writers and readers
    /// validate them before touching the header.
    ///
    /// # Safety
    ///
    /// `base` must be valid for reads and writes of `len` bytes for as long as
    /// any clone of the returned view (or any in-flight wait on it) exists,
    /// and must only be shared with the single peer of the protocol.
    pub unsafe fn from_raw(base: NonNull<u8>, len: usize) -> Self {
        Self {
            base,
            len,
            _owner: None,
        }
    }

    /// Region length in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Base address of the region.
    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.base.as_ptr()
    }

    /// Validate length and alignment.
    pub fn layout(&self) -> Result<RegionLayout, LayoutError> {
        RegionLayout::for_raw(self.base.as_ptr(), self.len)
    }

    /// The control header, after validating the region.
    pub fn header(&self) -> Result<&Header, LayoutError> {
        self.layout()?;
        // SAFETY: validated just above.
        Ok(unsafe { self.header_unchecked() })
    }

    /// The control header without validation.
    ///
    /// # Safety
    ///
    /// [`Region::layout`] must have succeeded for this region.
    #[inline]
    pub(crate) unsafe fn header_unchecked(&self) -> &Header {
        debug_assert!(self.len > HEADER_SIZE);
        unsafe { &*(self.base.as_ptr() as *const Header) }
    }

    /// Copy `src` to the start of the payload area.
    ///
    /// # Safety
    ///
    /// The region must be validated, `src.len()` must not exceed the payload
    /// capacity, and the caller must currently own the payload area.
    pub(crate) unsafe fn write_payload(&self, src: &[u8]) {
        debug_assert!(HEADER_SIZE + src.len() <= self.len);
        unsafe {
            let dst = self.base.as_ptr().add(HEADER_SIZE);
            std::ptr::copy_nonoverlapping(src.as_ptr(), dst, src.len());
        }
    }

    /// Copy `dst.len()` bytes from the start of the payload area.
    ///
    /// # Safety
    ///
    /// The region must be validated, `dst.len()` must not exceed the payload
    /// capacity, and the peer must have handed the payload area over.
    pub(crate) unsafe fn read_payload(&self, dst: &mut [u8]) {
        debug_assert!(HEADER_SIZE + dst.len() <= self.len);
        unsafe {
            let src = self.base.as_ptr().add(HEADER_SIZE);
            std::ptr::copy_nonoverlapping(src, dst.as_mut_ptr(), dst.len());
        }
    }
}

impl fmt::Debug for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Region")
            .field("base", &self.base)
            .field("len", &self.len)
            .field("owned", &self._owner.is_some())
            .finish()
    }
}

/// Owned backing allocation.
struct HeapBuffer {
    ptr: NonNull<u8>,
    layout: Layout,
}

// SAFETY: HeapBuffer only frees its allocation; access goes through Region.
unsafe impl Send for HeapBuffer {}
unsafe impl Sync for HeapBuffer {}

impl Drop for HeapBuffer {
    fn drop(&mut self) {
        // SAFETY: allocated in HeapRegion::new_zeroed with this layout.
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) }
    }
}

/// A zeroed heap allocation usable as a region by threads of one process.
///
/// A freshly created region has its semaphore at `READY`.
pub struct HeapRegion {
    buffer: Arc<HeapBuffer>,
    len: usize,
}

impl HeapRegion {
    /// Allocate `len` zeroed bytes.
    ///
    /// Any length is accepted so that invalid geometries can be exercised;
    /// transfers reject them on construction.
    pub fn new_zeroed(len: usize) -> Self {
        // Zero-sized allocations are not allowed; over-allocate one word.
        let alloc_len = len.max(core::mem::size_of::<i32>());
        let layout = match Layout::from_size_align(alloc_len, HEAP_REGION_ALIGN) {
            Ok(layout) => layout,
            Err(_) => panic!("region length {} overflows the allocator", len),
        };
        // SAFETY: layout has non-zero size.
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        let Some(ptr) = NonNull::new(raw) else {
            alloc::handle_alloc_error(layout);
        };
        Self {
            buffer: Arc::new(HeapBuffer { ptr, layout }),
            len,
        }
    }

    /// A view that keeps this allocation alive.
    pub fn region(&self) -> Region {
        Region {
            base: self.buffer.ptr,
            len: self.len,
            _owner: Some(self.buffer.clone()),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}
