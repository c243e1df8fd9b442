//! Size classes: the power-of-two partition that indexes the free lists.
//!
//! Class `c` covers block sizes up to `2^(c+6) - 1` bytes: class 0 holds
//! sizes below 64, class 1 below 128, and so on. The last class also
//! absorbs anything larger than the table covers.

/// Number of size classes, and therefore of free lists.
pub const NUM_CLASSES: usize = 20;

/// Highest class whose blocks are reissued without coalescing.
///
/// Blocks of class 0..=2 (under 256 bytes) are cheap to hand out again;
/// merging them costs more throughput than the saved fragmentation is
/// worth. Larger blocks are always coalesced so splinters cannot pile up.
pub const LIMIT_COALESCE: usize = 2;

/// Free neighbors at or below this size are skipped by the coalescer.
pub const COALESCE_THRESHOLD: usize = class_max_size(LIMIT_COALESCE);

/// Largest block size class `class` covers.
#[inline]
pub const fn class_max_size(class: usize) -> usize {
    (1 << (class + 6)) - 1
}

/// Map a block size to its class: the smallest `c` with
/// `size <= class_max_size(c)`, clamped to the last class.
#[inline]
pub const fn size_to_class(size: usize) -> usize {
    let mut class = 0;
    let mut bound = 64usize;
    while class < NUM_CLASSES - 1 {
        if size < bound {
            return class;
        }
        bound *= 2;
        class += 1;
    }
    NUM_CLASSES - 1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_class_boundaries() {
        assert_eq!(size_to_class(0), 0);
        assert_eq!(size_to_class(32), 0);
        assert_eq!(size_to_class(63), 0);
        assert_eq!(size_to_class(64), 1);
        assert_eq!(size_to_class(127), 1);
        assert_eq!(size_to_class(128), 2);
        assert_eq!(size_to_class(255), 2);
        assert_eq!(size_to_class(256), 3);
        assert_eq!(size_to_class(4096), 6);
    }

    #[test]
    fn test_class_covers_its_max_size() {
        for class in 0..NUM_CLASSES {
            assert_eq!(
                size_to_class(class_max_size(class)),
                class,
                "class_max_size({}) must still map to class {}",
                class,
                class
            );
        }
    }

    #[test]
    fn test_class_is_monotonic_in_size() {
        let mut last = 0;
        for size in (0..1 << 20).step_by(8) {
            let class = size_to_class(size);
            assert!(class >= last, "class regressed at size {}", size);
            last = class;
        }
    }

    #[test]
    fn test_last_class_absorbs_oversized_blocks() {
        assert_eq!(size_to_class(class_max_size(NUM_CLASSES - 1)), NUM_CLASSES - 1);
        assert_eq!(size_to_class(1 << 25), NUM_CLASSES - 1);
        assert_eq!(size_to_class(1 << 40), NUM_CLASSES - 1);
        assert_eq!(size_to_class(usize::MAX), NUM_CLASSES - 1);
    }

    #[test]
    fn test_coalesce_threshold() {
        assert_eq!(COALESCE_THRESHOLD, 255);
        // The threshold is the exact boundary between never-coalesced and
        // always-coalesced classes.
        assert_eq!(size_to_class(COALESCE_THRESHOLD), LIMIT_COALESCE);
        assert_eq!(size_to_class(COALESCE_THRESHOLD + 1), LIMIT_COALESCE + 1);
    }
}
