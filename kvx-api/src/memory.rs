//! Page granularity helpers
//!
//! The KVX kernel runs with 4K base pages; larger mappings (64K, 2M, 512M)
//! are expressed through the TLB page-size field.

/// Page size (4KB)
pub const PAGE_SIZE: u64 = 4096;
/// Page shift (log2 of PAGE_SIZE)
pub const PAGE_SHIFT: u32 = 12;
/// Mask keeping the page-aligned part of an address
pub const PAGE_MASK: u64 = !(PAGE_SIZE - 1);

/// Align address down to page boundary
#[inline]
pub const fn page_round_down(addr: u64) -> u64 {
    addr & PAGE_MASK
}

/// Whether `addr` is a multiple of `size` (`size` must be a power of two)
#[inline]
pub const fn is_aligned(addr: u64, size: u64) -> bool {
    addr & (size - 1) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_rounding() {
        assert_eq!(page_round_down(0x1fff), 0x1000);
        assert_eq!(page_round_down(0x2000), 0x2000);
        assert_eq!(page_round_down(u64::MAX), 0xffff_ffff_ffff_f000);
    }

    #[test]
    fn test_alignment() {
        assert!(is_aligned(0x20_0000, 0x20_0000));
        assert!(!is_aligned(0x20_1000, 0x20_0000));
        assert!(is_aligned(0, PAGE_SIZE));
    }
}
