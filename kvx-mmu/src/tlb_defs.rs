//! Architecture constants of the KVX MMU
//!
//! Geometry of both TLBs, the enumerations carried by a TLB entry and the
//! layout of the fixed LTLB slots.

use static_assertions::const_assert_eq;

/// Number of LTLB sets
pub const MMU_LTLB_SETS: usize = 1;
/// Number of LTLB ways
pub const MMU_LTLB_WAYS: usize = 16;

/// Number of JTLB sets
pub const MMU_JTLB_SETS: usize = 64;
/// log2 of the number of JTLB ways
pub const MMU_JTLB_WAYS_SHIFT: usize = 2;
/// Number of JTLB ways
pub const MMU_JTLB_WAYS: usize = 1 << MMU_JTLB_WAYS_SHIFT;
/// Total JTLB capacity
pub const MMU_JTLB_ENTRIES: usize = MMU_JTLB_SETS << MMU_JTLB_WAYS_SHIFT;

/// Set is determined using the 6 lsb of the virtual page number
pub const MMU_JTLB_SET_MASK: usize = MMU_JTLB_SETS - 1;
/// Mask applied to the round-robin cursor
pub const MMU_JTLB_WAY_MASK: usize = MMU_JTLB_WAYS - 1;

const_assert_eq!(MMU_JTLB_ENTRIES, 256);
const_assert_eq!(MMU_JTLB_SETS & MMU_JTLB_SET_MASK, 0);

/// Virtual addresses can use at most 41 bits
pub const MMU_VIRT_BITS: u32 = 41;

/// ASN used when probing global entries
///
/// Chosen so that a kernel path forgetting to restore the user ASN is easy
/// to spot.
pub const KERNEL_DUMMY_ASN: u32 = 42;

/// Page count above which a range flush regenerates the ASN instead
pub const ASN_FLUSH_PAGE_THRESHOLD: u64 = MMU_JTLB_ENTRIES as u64;
/// Page count above which a kernel range flush empties the JTLB instead
pub const FLUSH_ALL_PAGE_THRESHOLD: u64 = MMU_JTLB_ENTRIES as u64;

/// LTLB slot holding the kernel text mapping
pub const LTLB_ENTRY_KERNEL_TEXT: usize = 0;
/// LTLB slot holding the debugger page
pub const LTLB_ENTRY_GDB_PAGE: usize = 1;
/// First slot reserved for kernel pagination
pub const LTLB_KERNEL_RESERVED: usize = 2;
/// Number of 512M entries used by the fast refill path
pub const REFILL_PERF_ENTRIES: usize = 4;
/// Number of fixed LTLB slots, never handed out by the allocator
pub const LTLB_ENTRY_FIXED_COUNT: usize = LTLB_KERNEL_RESERVED + REFILL_PERF_ENTRIES;
/// Slot used by the boot code to map shared memory before the MMU is set up
pub const LTLB_ENTRY_EARLY_SMEM: usize = LTLB_ENTRY_FIXED_COUNT;

const_assert_eq!(LTLB_ENTRY_FIXED_COUNT, 6);

/// TLB entry status (TEL.ES)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum EntryStatus {
    /// Slot unoccupied
    Invalid = 0,
    /// Present
    Present = 1,
    /// Modified
    Modified = 2,
    /// Accessed and modified
    AccessedModified = 3,
}

impl EntryStatus {
    /// Decode a 2-bit field
    pub const fn from_bits(bits: u64) -> Self {
        match bits & 0x3 {
            0 => EntryStatus::Invalid,
            1 => EntryStatus::Present,
            2 => EntryStatus::Modified,
            _ => EntryStatus::AccessedModified,
        }
    }
}

/// Cache policy (TEL.CP): data policy then instruction policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CachePolicy {
    /// Device / uncached
    DeviceUncached = 0,
    /// Uncached / uncached
    Uncached = 1,
    /// Write-through / cached
    WriteThroughCached = 2,
    /// Uncached data / cached instructions
    UncachedCached = 3,
}

impl CachePolicy {
    /// Decode a 2-bit field
    pub const fn from_bits(bits: u64) -> Self {
        match bits & 0x3 {
            0 => CachePolicy::DeviceUncached,
            1 => CachePolicy::Uncached,
            2 => CachePolicy::WriteThroughCached,
            _ => CachePolicy::UncachedCached,
        }
    }
}

/// Protection attributes (TEL.PA)
///
/// First half applies when PM=0 (user), second half when PM=1 (kernel).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Protection {
    /// No access at all
    NaNa = 0,
    /// Kernel read
    NaR = 1,
    /// Kernel read/write
    NaRw = 2,
    /// Kernel read/execute
    NaRx = 3,
    /// Kernel read/write/execute
    NaRwx = 4,
    /// User read, kernel read
    RR = 5,
    /// User read, kernel read/write
    RRw = 6,
    /// User read, kernel read/execute
    RRx = 7,
    /// User read, kernel read/write/execute
    RRwx = 8,
    /// User read/write, kernel read/write
    RwRw = 9,
    /// User read/write, kernel read/write/execute
    RwRwx = 10,
    /// User read/execute, kernel read/execute
    RxRx = 11,
    /// User read/execute, kernel read/write/execute
    RxRwx = 12,
    /// User and kernel read/write/execute
    RwxRwx = 13,
}

impl Protection {
    /// Decode a 4-bit field, `None` for the two reserved encodings
    pub const fn from_bits(bits: u64) -> Option<Self> {
        Some(match bits & 0xf {
            0 => Protection::NaNa,
            1 => Protection::NaR,
            2 => Protection::NaRw,
            3 => Protection::NaRx,
            4 => Protection::NaRwx,
            5 => Protection::RR,
            6 => Protection::RRw,
            7 => Protection::RRx,
            8 => Protection::RRwx,
            9 => Protection::RwRw,
            10 => Protection::RwRwx,
            11 => Protection::RxRx,
            12 => Protection::RxRwx,
            13 => Protection::RwxRwx,
            _ => return None,
        })
    }
}

/// Page size class (TEL.PS)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum PageSize {
    /// 4 KiB
    Size4K = 0,
    /// 64 KiB
    Size64K = 1,
    /// 2 MiB
    Size2M = 2,
    /// 512 MiB
    Size512M = 3,
}

impl PageSize {
    /// Every page size, smallest first
    pub const ALL: [PageSize; 4] = [
        PageSize::Size4K,
        PageSize::Size64K,
        PageSize::Size2M,
        PageSize::Size512M,
    ];

    /// Decode a 2-bit field
    pub const fn from_bits(bits: u64) -> Self {
        match bits & 0x3 {
            0 => PageSize::Size4K,
            1 => PageSize::Size64K,
            2 => PageSize::Size2M,
            _ => PageSize::Size512M,
        }
    }

    /// log2 of the page size
    pub const fn shift(self) -> u32 {
        match self {
            PageSize::Size4K => 12,
            PageSize::Size64K => 16,
            PageSize::Size2M => 21,
            PageSize::Size512M => 29,
        }
    }

    /// Page size in bytes
    pub const fn bytes(self) -> u64 {
        1u64 << self.shift()
    }

    /// Mask keeping the page-aligned part of an address
    pub const fn mask(self) -> u64 {
        u64::MAX << self.shift()
    }
}

/// Whether a TLB entry ignores the ASN
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Global {
    /// Entry only matches its own ASN
    UseAsn = 0,
    /// Entry matches every ASN
    Global = 1,
}

impl Global {
    /// Whether the entry is global
    pub const fn is_global(self) -> bool {
        matches!(self, Global::Global)
    }
}

impl From<bool> for Global {
    fn from(global: bool) -> Self {
        if global { Global::Global } else { Global::UseAsn }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_size_shifts() {
        assert_eq!(PageSize::Size4K.bytes(), 0x1000);
        assert_eq!(PageSize::Size64K.bytes(), 0x1_0000);
        assert_eq!(PageSize::Size2M.bytes(), 0x20_0000);
        assert_eq!(PageSize::Size512M.bytes(), 0x2000_0000);
        for ps in PageSize::ALL {
            assert_eq!(PageSize::from_bits(ps as u64), ps);
        }
    }

    #[test]
    fn test_protection_reserved_encodings() {
        assert_eq!(Protection::from_bits(13), Some(Protection::RwxRwx));
        assert_eq!(Protection::from_bits(14), None);
        assert_eq!(Protection::from_bits(15), None);
    }

    #[test]
    fn test_jtlb_geometry() {
        assert_eq!(MMU_JTLB_WAYS, 4);
        assert_eq!(MMU_JTLB_SET_MASK, 0x3f);
        assert_eq!(ASN_FLUSH_PAGE_THRESHOLD, 256);
    }
}
