//! Boundary-tagged block codec.
//!
//! Every heap block is delimited by a header word and an identical footer
//! word, each packing the block's total size (a multiple of 8, so the low
//! bits are free) with the allocated flag in bit 0. The footer exists so
//! the left neighbor of any block can be found in constant time: the word
//! immediately before a header is the previous block's footer.
//!
//! A [`Block`] is a copyable handle around the payload pointer, the same
//! address the user receives. All pointer arithmetic over heap blocks
//! lives in this module; the rest of the allocator navigates through the
//! typed accessors only.
//!
//! A free block reuses the first two payload words as its free-list links
//! (previous, then next). The header's allocated bit discriminates whether
//! the payload is user data or links, so the links never need space of
//! their own.

use core::mem;
use core::ptr;

/// Size of the header word at the start of every block.
pub(crate) const HEADER_SIZE: usize = mem::size_of::<usize>();
/// Size of the footer word mirroring the header at the end of the block.
pub(crate) const FOOTER_SIZE: usize = mem::size_of::<usize>();
/// Combined header and footer overhead of one block.
pub(crate) const HF_OVERHEAD: usize = HEADER_SIZE + FOOTER_SIZE;
/// The two link slots a free block keeps at the start of its payload.
pub(crate) const LINK_SLOTS_SIZE: usize = 2 * mem::size_of::<*mut u8>();

/// Smallest total size any block may have, allocated or free: it must be
/// able to host header, footer and both links once it is freed.
pub(crate) const MIN_BLOCK_SIZE: usize = crate::align8(HF_OVERHEAD + LINK_SLOTS_SIZE);

const ALLOCATED_BIT: usize = 1;
const SIZE_MASK: usize = !(crate::ALIGNMENT - 1);

/// Handle to one heap block, held as its payload pointer.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) struct Block {
    payload: *mut u8,
}

impl Block {
    /// Wrap a payload pointer previously produced by this allocator.
    #[inline]
    pub fn from_payload(payload: *mut u8) -> Block {
        Block { payload }
    }

    /// Block whose header sits at the base of a freshly grown region.
    ///
    /// # Safety
    /// `base` must point to at least [`HF_OVERHEAD`] addressable bytes.
    #[inline]
    pub unsafe fn from_region_base(base: *mut u8) -> Block {
        Block {
            payload: unsafe { base.add(HEADER_SIZE) },
        }
    }

    /// The user-visible pointer.
    #[inline]
    pub fn payload(self) -> *mut u8 {
        self.payload
    }

    #[inline]
    unsafe fn header(self) -> *mut usize {
        unsafe { self.payload.sub(HEADER_SIZE) as *mut usize }
    }

    #[inline]
    unsafe fn footer(self, size: usize) -> *mut usize {
        unsafe { self.payload.add(size - HF_OVERHEAD) as *mut usize }
    }

    /// Total size of the block, header and footer included.
    ///
    /// # Safety
    /// The block's header must be initialized and in bounds.
    #[inline]
    pub unsafe fn size(self) -> usize {
        (unsafe { *self.header() }) & SIZE_MASK
    }

    /// # Safety
    /// The block's header must be initialized and in bounds.
    #[inline]
    pub unsafe fn is_allocated(self) -> bool {
        (unsafe { *self.header() }) & ALLOCATED_BIT != 0
    }

    /// Write both boundary tags. The footer position is derived from the
    /// size being written, not from the old header.
    ///
    /// # Safety
    /// The block must span `size` addressable bytes starting at its header.
    #[inline]
    pub unsafe fn set(self, size: usize, allocated: bool) {
        debug_assert!(size % crate::ALIGNMENT == 0);
        debug_assert!(size >= MIN_BLOCK_SIZE);
        let word = size | allocated as usize;
        unsafe {
            *self.header() = word;
            *self.footer(size) = word;
        }
    }

    /// The block immediately to the right (higher address).
    ///
    /// # Safety
    /// The callee must not be the last block of the heap.
    #[inline]
    pub unsafe fn right(self) -> Block {
        Block::from_payload(unsafe { self.payload.add(self.size()) })
    }

    /// The block immediately to the left, located through its footer.
    ///
    /// # Safety
    /// The callee must not be the first block of the heap.
    #[inline]
    pub unsafe fn left(self) -> Block {
        let left_footer = unsafe { self.payload.sub(HF_OVERHEAD) as *const usize };
        let left_size = unsafe { *left_footer } & SIZE_MASK;
        Block::from_payload(unsafe { self.payload.sub(left_size) })
    }

    /// Raw header word, for diagnostics.
    #[inline]
    pub unsafe fn header_word(self) -> usize {
        unsafe { *self.header() }
    }

    /// Raw footer word, for diagnostics.
    #[inline]
    pub unsafe fn footer_word(self) -> usize {
        unsafe { *self.footer(self.size()) }
    }

    // Free-list links. Only meaningful while the allocated bit is clear;
    // the same bytes are user payload otherwise.

    #[inline]
    unsafe fn prev_slot(self) -> *mut *mut u8 {
        self.payload as *mut *mut u8
    }

    #[inline]
    unsafe fn next_slot(self) -> *mut *mut u8 {
        unsafe { self.payload.add(mem::size_of::<*mut u8>()) as *mut *mut u8 }
    }

    /// # Safety
    /// The block must be free and its links initialized.
    #[inline]
    pub unsafe fn prev_free(self) -> Option<Block> {
        let prev = unsafe { *self.prev_slot() };
        (!prev.is_null()).then(|| Block::from_payload(prev))
    }

    /// # Safety
    /// The block must be free and its links initialized.
    #[inline]
    pub unsafe fn next_free(self) -> Option<Block> {
        let next = unsafe { *self.next_slot() };
        (!next.is_null()).then(|| Block::from_payload(next))
    }

    /// # Safety
    /// The block must be free.
    #[inline]
    pub unsafe fn set_prev_free(self, prev: Option<Block>) {
        unsafe { *self.prev_slot() = prev.map_or(ptr::null_mut(), Block::payload) };
    }

    /// # Safety
    /// The block must be free.
    #[inline]
    pub unsafe fn set_next_free(self, next: Option<Block>) {
        unsafe { *self.next_slot() = next.map_or(ptr::null_mut(), Block::payload) };
    }
}
