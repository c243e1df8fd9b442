//! The allocation policy: allocate, free and reallocate over one
//! contiguous heap, plus the split/coalesce helpers they share.
//!
//! The heap is a dense sequence of boundary-tagged blocks framed by
//! `first_block` and `end_heap` (payload pointers of the lowest and
//! highest block). The class table at the very bottom of the heap indexes
//! the free blocks in between. Memory is only ever added, one grow call at
//! a time, at the high end.

use core::fmt;
use core::ptr;

use crate::align8;
use crate::block::{Block, HEADER_SIZE, HF_OVERHEAD, MIN_BLOCK_SIZE};
use crate::free_list::{FitPolicy, FreeTable};
use crate::platform::HeapGrower;
use crate::size_class::{COALESCE_THRESHOLD, LIMIT_COALESCE, NUM_CLASSES, size_to_class};

/// Construction failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitError {
    /// The grow primitive refused the initial heap request.
    OutOfMemory,
}

/// A segregated-fits allocator over a heap obtained from `G`.
///
/// Single-threaded by construction: every operation takes `&mut self` and
/// the type holds raw pointers, so it is neither `Send` nor `Sync`.
pub struct SfMalloc<G: HeapGrower> {
    grower: G,
    table: FreeTable,
    /// Payload pointer of the lowest-address block.
    first_block: Block,
    /// Payload pointer of the highest-address block; its right edge is the
    /// current end of the heap.
    end_heap: Block,
    policy: FitPolicy,
}

impl<G: HeapGrower> SfMalloc<G> {
    /// Initialize a heap with the default fit policy.
    pub fn new(grower: G) -> Result<Self, InitError> {
        Self::with_policy(grower, FitPolicy::default())
    }

    /// Initialize a heap: one grow call covering the alignment padding,
    /// the class table and a first minimum-size free block.
    pub fn with_policy(mut grower: G, policy: FitPolicy) -> Result<Self, InitError> {
        // Padding so the first payload after the table and a header is
        // 8-byte aligned.
        let padding = align8(FreeTable::BYTES + HEADER_SIZE) - FreeTable::BYTES - HEADER_SIZE;

        let base = unsafe { grower.grow(padding + FreeTable::BYTES + MIN_BLOCK_SIZE) };
        if base.is_null() {
            return Err(InitError::OutOfMemory);
        }

        let table = unsafe { FreeTable::new(base.add(padding)) };
        let first = unsafe { Block::from_region_base(base.add(padding + FreeTable::BYTES)) };
        debug_assert!(first.payload() as usize % crate::ALIGNMENT == 0);
        unsafe {
            first.set(MIN_BLOCK_SIZE, false);
            table.push(0, first);
        }

        Ok(SfMalloc {
            grower,
            table,
            first_block: first,
            end_heap: first,
            policy,
        })
    }

    /// The fit policy this heap was built with.
    pub fn policy(&self) -> FitPolicy {
        self.policy
    }

    /// Allocate at least `size` bytes, 8-byte aligned.
    ///
    /// Returns null on a zero-size request, on an unrepresentably large
    /// one, or when the grow primitive fails. A failed call leaves the
    /// heap unchanged.
    ///
    /// # Safety
    /// The heap and its index must be in a consistent state: every pointer
    /// previously returned and not yet freed is still owned by its caller,
    /// and no payload write has strayed out of its block.
    pub unsafe fn allocate(&mut self, size: usize) -> *mut u8 {
        if size == 0 {
            return ptr::null_mut();
        }
        let Some(newsize) = padded_request(size) else {
            return ptr::null_mut();
        };

        // Search the fitting class first, then every larger one.
        let mut class = size_to_class(newsize);
        while class < NUM_CLASSES {
            if let Some(block) = unsafe { self.table.search(class, newsize, self.policy) } {
                let remainder = unsafe { block.size() } - newsize;
                if remainder <= MIN_BLOCK_SIZE {
                    // The leftover could not host a block of its own:
                    // hand out the whole thing.
                    unsafe {
                        self.table.remove(class, block);
                        block.set(block.size(), true);
                    }
                } else {
                    unsafe { self.split(block, newsize) };
                }
                return block.payload();
            }
            class += 1;
        }

        // No free block fits anywhere: extend the heap by exactly one
        // block and hand it out allocated.
        let region = unsafe { self.grower.grow(newsize) };
        if region.is_null() {
            return ptr::null_mut();
        }
        let block = unsafe { Block::from_region_base(region) };
        unsafe { block.set(newsize, true) };
        self.end_heap = block;
        block.payload()
    }

    /// Return a block to the free index. Null is a no-op.
    ///
    /// Blocks above [`LIMIT_COALESCE`] are merged with their large free
    /// neighbors first; smaller blocks go straight back on their list.
    ///
    /// # Safety
    /// `ptr` must be null or a pointer obtained from [`Self::allocate`] /
    /// [`Self::reallocate`] on this heap and not freed since.
    pub unsafe fn free(&mut self, ptr: *mut u8) {
        if ptr.is_null() {
            return;
        }
        let mut block = Block::from_payload(ptr);
        unsafe {
            block.set(block.size(), false);
            let mut class = size_to_class(block.size());
            if class > LIMIT_COALESCE {
                block = self.coalesce(block);
                class = size_to_class(block.size());
            }
            self.table.push(class, block);
        }
    }

    /// Resize an allocation, preserving the payload prefix.
    ///
    /// A null `ptr` allocates; `size == 0` frees and returns `ptr` itself,
    /// which is dangling from that point on and must not be dereferenced.
    /// Growth is attempted in place by absorbing free right neighbors
    /// whole (the block may end up larger than requested); otherwise the
    /// payload moves to a fresh allocation. Shrinking splits the tail off
    /// unless the spared space could not host a block.
    ///
    /// # Safety
    /// Same contract as [`Self::free`] for `ptr`.
    pub unsafe fn reallocate(&mut self, ptr: *mut u8, size: usize) -> *mut u8 {
        if ptr.is_null() {
            if size > 0 {
                return unsafe { self.allocate(size) };
            }
            return ptr::null_mut();
        }
        if size == 0 {
            unsafe { self.free(ptr) };
            return ptr;
        }

        let block = Block::from_payload(ptr);
        let old_size = unsafe { block.size() };
        let Some(newsize) = padded_request(size) else {
            return ptr::null_mut();
        };

        if newsize == old_size {
            return ptr;
        }

        if newsize > old_size {
            let diff = newsize - old_size;

            if unsafe { self.simulate_right_coalesce(block, diff) } {
                // Enough free space sits to our right: absorb neighbors
                // whole until the deficit is covered.
                let mut absorbed = 0;
                let mut cursor = block;
                let mut last = block;
                while cursor != self.end_heap {
                    let next = unsafe { cursor.right() };
                    if unsafe { next.is_allocated() } {
                        break;
                    }
                    unsafe {
                        absorbed += next.size();
                        self.table.remove(size_to_class(next.size()), next);
                    }
                    last = next;
                    cursor = next;
                    if absorbed >= diff {
                        break;
                    }
                }
                unsafe { block.set(old_size + absorbed, true) };
                if last == self.end_heap {
                    self.end_heap = block;
                }
                return ptr;
            }

            // Move: fresh allocation, byte copy, release the old block.
            let new_ptr = unsafe { self.allocate(newsize) };
            if new_ptr.is_null() {
                return ptr::null_mut();
            }
            unsafe {
                ptr::copy_nonoverlapping(ptr, new_ptr, old_size - HF_OVERHEAD);
                self.free(ptr);
            }
            return new_ptr;
        }

        // Shrink. If the spared space could not host a block of its own,
        // keep the allocation as is.
        if old_size - newsize <= MIN_BLOCK_SIZE {
            return ptr;
        }
        unsafe { self.split(block, newsize) };
        ptr
    }

    /// Payload capacity behind a pointer returned by this heap. Zero for
    /// null.
    ///
    /// # Safety
    /// Same contract as [`Self::free`] for `ptr`.
    pub unsafe fn usable_size(&self, ptr: *mut u8) -> usize {
        if ptr.is_null() {
            return 0;
        }
        (unsafe { Block::from_payload(ptr).size() }) - HF_OVERHEAD
    }

    /// Scan the heap and every free list, writing a line to `out` for each
    /// inconsistency found: a pair of adjacent large free blocks that
    /// escaped coalescing, or a free-list member not marked free. Returns
    /// the number of findings.
    pub fn check(&self, out: &mut dyn fmt::Write) -> usize {
        let mut findings = 0;
        unsafe {
            let mut block = self.first_block;
            while block != self.end_heap {
                let right = block.right();
                if !block.is_allocated()
                    && block.size() > COALESCE_THRESHOLD
                    && !right.is_allocated()
                    && right.size() > COALESCE_THRESHOLD
                {
                    findings += 1;
                    let _ = writeln!(
                        out,
                        "*ERROR: adjacent blocks {:p} and {:p} escaped the coalescing process",
                        block.payload(),
                        right.payload()
                    );
                }
                block = right;
            }

            for class in 0..NUM_CLASSES {
                let mut cursor = self.table.head(class);
                while let Some(member) = cursor {
                    if member.is_allocated() {
                        findings += 1;
                        let _ = writeln!(
                            out,
                            "*ERROR: block {:p} is in the class {} free list but not marked free",
                            member.payload(),
                            class
                        );
                    }
                    cursor = member.next_free();
                }
            }
        }
        findings
    }

    /// Split `block` into an allocated prefix of `newsize` bytes and a
    /// free remainder pushed onto its class list.
    ///
    /// Caller guarantees `block.size() - newsize > MIN_BLOCK_SIZE`.
    unsafe fn split(&mut self, block: Block, newsize: usize) {
        unsafe {
            let remainder_size = block.size() - newsize;
            if !block.is_allocated() {
                self.table.remove(size_to_class(block.size()), block);
            }
            block.set(newsize, true);

            let remainder = block.right();
            remainder.set(remainder_size, false);
            self.table.push(size_to_class(remainder_size), remainder);

            if self.end_heap == block {
                self.end_heap = remainder;
            }
        }
    }

    /// Merge `block` with the contiguous free neighbors larger than
    /// [`COALESCE_THRESHOLD`] on both sides, unlinking each absorbed
    /// neighbor from its list. Returns the merged block.
    ///
    /// The size gate applies to each neighbor individually: sub-threshold
    /// free splinters stop the sweep, which keeps large free blocks fully
    /// merged without ever paying to collect small change.
    unsafe fn coalesce(&mut self, mut block: Block) -> Block {
        unsafe {
            let mut total = block.size();

            let mut rightmost = block;
            while rightmost != self.end_heap {
                let next = rightmost.right();
                if next.is_allocated() || next.size() <= COALESCE_THRESHOLD {
                    break;
                }
                total += next.size();
                self.table.remove(size_to_class(next.size()), next);
                rightmost = next;
            }

            while block != self.first_block {
                let prev = block.left();
                if prev.is_allocated() || prev.size() <= COALESCE_THRESHOLD {
                    break;
                }
                total += prev.size();
                self.table.remove(size_to_class(prev.size()), prev);
                block = prev;
            }

            block.set(total, false);
            if self.end_heap == rightmost {
                self.end_heap = block;
            }
            block
        }
    }

    /// Dry run of the in-place growth path: would absorbing free right
    /// neighbors cover `diff` more bytes?
    unsafe fn simulate_right_coalesce(&self, block: Block, diff: usize) -> bool {
        unsafe {
            let mut total = 0;
            let mut cursor = block;
            while cursor != self.end_heap {
                let next = cursor.right();
                if next.is_allocated() {
                    break;
                }
                total += next.size();
                cursor = next;
                if total >= diff {
                    return true;
                }
            }
            false
        }
    }
}

/// Total block size needed to serve a `size`-byte request: payload plus
/// both boundary tags, rounded up to alignment, never below the minimum
/// block size. None when the padding overflows.
#[inline]
fn padded_request(size: usize) -> Option<usize> {
    let raw = size.checked_add(HF_OVERHEAD + crate::ALIGNMENT - 1)?;
    Some((raw & !(crate::ALIGNMENT - 1)).max(MIN_BLOCK_SIZE))
}
