//! The segregated free-list index.
//!
//! One doubly linked LIFO list per size class. The heads live in a table
//! at the bottom of the heap, right after the alignment padding; the links
//! are threaded through the free blocks' payloads, so the index costs no
//! memory beyond the table itself.

use core::mem;
use core::ptr;

use crate::block::Block;
use crate::size_class::NUM_CLASSES;

/// Selection policy used when scanning a class list for a fitting block.
///
/// Chosen once at allocator construction. The choice shows up in
/// fragmentation statistics, never in correctness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FitPolicy {
    /// Smallest fitting block wins; ties go to the earlier list position.
    #[default]
    BestFit,
    /// First fitting block wins.
    FirstFit,
}

/// The class-head table: [`NUM_CLASSES`] pointer-sized slots, each null or
/// the payload pointer of the most recently inserted free block of that
/// class.
pub(crate) struct FreeTable {
    slots: *mut *mut u8,
}

impl FreeTable {
    /// Bytes of heap the table occupies.
    pub const BYTES: usize = NUM_CLASSES * mem::size_of::<*mut u8>();

    /// Take ownership of [`Self::BYTES`] bytes at `base` and empty every
    /// class list.
    ///
    /// # Safety
    /// `base` must be pointer-aligned and point to at least `BYTES`
    /// addressable bytes reserved for the table.
    pub unsafe fn new(base: *mut u8) -> FreeTable {
        let table = FreeTable {
            slots: base as *mut *mut u8,
        };
        for class in 0..NUM_CLASSES {
            unsafe { table.set_head(class, None) };
        }
        table
    }

    #[inline]
    fn slot(&self, class: usize) -> *mut *mut u8 {
        debug_assert!(class < NUM_CLASSES);
        self.slots.wrapping_add(class)
    }

    /// Head of the class list, if any.
    ///
    /// # Safety
    /// The table must have been initialized by [`FreeTable::new`].
    #[inline]
    pub unsafe fn head(&self, class: usize) -> Option<Block> {
        let head = unsafe { *self.slot(class) };
        (!head.is_null()).then(|| Block::from_payload(head))
    }

    #[inline]
    unsafe fn set_head(&self, class: usize, block: Option<Block>) {
        unsafe { *self.slot(class) = block.map_or(ptr::null_mut(), Block::payload) };
    }

    /// LIFO insert at the head of the class list.
    ///
    /// # Safety
    /// `block` must be a free block not currently on any list.
    pub unsafe fn push(&self, class: usize, block: Block) {
        unsafe {
            let old_head = self.head(class);
            block.set_prev_free(None);
            block.set_next_free(old_head);
            if let Some(head) = old_head {
                head.set_prev_free(Some(block));
            }
            self.set_head(class, Some(block));
        }
    }

    /// Splice `block` out of the class list it is linked into.
    ///
    /// # Safety
    /// `block` must currently be on the list of `class`.
    pub unsafe fn remove(&self, class: usize, block: Block) {
        unsafe {
            let prev = block.prev_free();
            let next = block.next_free();
            match prev {
                Some(prev) => prev.set_next_free(next),
                None => self.set_head(class, next),
            }
            if let Some(next) = next {
                next.set_prev_free(prev);
            }
        }
    }

    /// Scan the class list for a block of at least `min_size` bytes.
    ///
    /// # Safety
    /// The list of `class` must be well formed.
    pub unsafe fn search(&self, class: usize, min_size: usize, policy: FitPolicy) -> Option<Block> {
        match policy {
            FitPolicy::FirstFit => unsafe { self.search_first_fit(class, min_size) },
            FitPolicy::BestFit => unsafe { self.search_best_fit(class, min_size) },
        }
    }

    unsafe fn search_first_fit(&self, class: usize, min_size: usize) -> Option<Block> {
        let mut cursor = unsafe { self.head(class) };
        while let Some(block) = cursor {
            if unsafe { block.size() } >= min_size {
                return Some(block);
            }
            cursor = unsafe { block.next_free() };
        }
        None
    }

    unsafe fn search_best_fit(&self, class: usize, min_size: usize) -> Option<Block> {
        let mut best: Option<(Block, usize)> = None;
        let mut cursor = unsafe { self.head(class) };
        while let Some(block) = cursor {
            let size = unsafe { block.size() };
            if size >= min_size && best.is_none_or(|(_, best_size)| size < best_size) {
                if size == min_size {
                    return Some(block);
                }
                best = Some((block, size));
            }
            cursor = unsafe { block.next_free() };
        }
        best.map(|(block, _)| block)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // A miniature heap: a table followed by hand-built free blocks. Boxed
    // so the block pointers stay valid when the buffer is returned.
    #[repr(align(8))]
    struct Buf([u8; 1024]);

    fn setup(sizes: &[usize]) -> (Box<Buf>, FreeTable, Vec<Block>) {
        let mut buf = Box::new(Buf([0; 1024]));
        let base = buf.0.as_mut_ptr();
        let table = unsafe { FreeTable::new(base) };
        let mut blocks = Vec::new();
        let mut offset = FreeTable::BYTES;
        for &size in sizes {
            let block = unsafe { Block::from_region_base(base.add(offset)) };
            unsafe { block.set(size, false) };
            blocks.push(block);
            offset += size;
        }
        (buf, table, blocks)
    }

    fn collect(table: &FreeTable, class: usize) -> Vec<Block> {
        let mut out = Vec::new();
        let mut cursor = unsafe { table.head(class) };
        while let Some(block) = cursor {
            out.push(block);
            cursor = unsafe { block.next_free() };
        }
        out
    }

    #[test]
    fn test_push_is_lifo() {
        let (_buf, table, blocks) = setup(&[40, 48, 56]);
        unsafe {
            table.push(0, blocks[0]);
            table.push(0, blocks[1]);
            table.push(0, blocks[2]);
        }
        assert_eq!(collect(&table, 0), vec![blocks[2], blocks[1], blocks[0]]);
    }

    #[test]
    fn test_remove_head_middle_tail() {
        let (_buf, table, blocks) = setup(&[64, 72, 80, 88]);
        unsafe {
            for &b in &blocks {
                table.push(1, b);
            }
            // list is [3, 2, 1, 0]
            table.remove(1, blocks[2]); // middle
            assert_eq!(collect(&table, 1), vec![blocks[3], blocks[1], blocks[0]]);
            table.remove(1, blocks[3]); // head
            assert_eq!(collect(&table, 1), vec![blocks[1], blocks[0]]);
            table.remove(1, blocks[0]); // tail
            assert_eq!(collect(&table, 1), vec![blocks[1]]);
            table.remove(1, blocks[1]); // only member
            assert!(table.head(1).is_none());
        }
    }

    #[test]
    fn test_search_empty_list() {
        let (_buf, table, _blocks) = setup(&[]);
        unsafe {
            assert_eq!(table.search(0, 32, FitPolicy::BestFit), None);
            assert_eq!(table.search(0, 32, FitPolicy::FirstFit), None);
        }
    }

    #[test]
    fn test_first_fit_takes_the_head_side() {
        let (_buf, table, blocks) = setup(&[72, 120, 80]);
        unsafe {
            table.push(1, blocks[0]); // 72
            table.push(1, blocks[1]); // 120
            table.push(1, blocks[2]); // 80, head
            // 80 fits an 80-byte request and sits first
            assert_eq!(table.search(1, 80, FitPolicy::FirstFit), Some(blocks[2]));
            // 80 does not fit 96; the next fitting block is 120
            assert_eq!(table.search(1, 96, FitPolicy::FirstFit), Some(blocks[1]));
        }
    }

    #[test]
    fn test_best_fit_prefers_smallest() {
        let (_buf, table, blocks) = setup(&[96, 72, 120]);
        unsafe {
            table.push(1, blocks[2]); // 120
            table.push(1, blocks[0]); // 96
            table.push(1, blocks[1]); // 72, head
            // first fit would stop at 96 (first fitting after 72 fails)
            assert_eq!(table.search(1, 80, FitPolicy::BestFit), Some(blocks[0]));
            assert_eq!(table.search(1, 104, FitPolicy::BestFit), Some(blocks[2]));
            // exact fit returns early
            assert_eq!(table.search(1, 72, FitPolicy::BestFit), Some(blocks[1]));
        }
    }

    #[test]
    fn test_no_fit_returns_none() {
        let (_buf, table, blocks) = setup(&[40, 48]);
        unsafe {
            table.push(0, blocks[0]);
            table.push(0, blocks[1]);
            assert_eq!(table.search(0, 512, FitPolicy::BestFit), None);
            assert_eq!(table.search(0, 512, FitPolicy::FirstFit), None);
        }
    }
}
