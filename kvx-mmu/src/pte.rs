//! Page table entry format
//!
//! There is no hardware page table walker, so the PTE layout is ours. Parts
//! of it match `$tel` so the refill path can copy them over:
//!
//! ```text
//!  +---------+--------+----+--------+---+---+---+---+---+---+------+---+---+
//!  | 63..23  | 22..13 | 12 | 11..10 | 9 | 8 | 7 | 6 | 5 | 4 | 3..2 | 1 | 0 |
//!  +---------+--------+----+--------+---+---+---+---+---+---+------+---+---+
//!      PFN     Unused   S    PageSZ   H   G   X   W   R   D    CP    A   P
//! ```

use bitflags::bitflags;
use static_assertions::const_assert_eq;

use crate::entry::{TEL_CP, TEL_PS, access_permission_from_pte_bits};
use crate::sfr::SfrField;
use crate::tlb_defs::{CachePolicy, PageSize, Protection};
use kvx_api::PAGE_SHIFT;

bitflags! {
    /// Single-bit PTE flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PteFlags: u64 {
        /// Present
        const PRESENT = 1 << 0;
        /// Set by the refill code on any access
        const ACCESSED = 1 << 1;
        /// Set by the refill code on any write
        const DIRTY = 1 << 4;
        /// Readable
        const READ = 1 << 5;
        /// Writable
        const WRITE = 1 << 6;
        /// Executable
        const EXEC = 1 << 7;
        /// Global (kernel) mapping
        const GLOBAL = 1 << 8;
        /// Huge page
        const HUGE = 1 << 9;
        /// Reserved for software
        const SOFT = 1 << 12;
    }
}

/// PTE.CP: cache policy, same position as TEL.CP
pub const PTE_CP: SfrField = SfrField::new(2, 2);
/// PTE.PS: page size, same position as TEL.PS
pub const PTE_PS: SfrField = SfrField::new(10, 2);
/// PTE.PERMS: read/write/exec/global index
pub const PTE_PERMS: SfrField = SfrField::new(5, 4);
/// First bit of the page frame number
pub const PTE_PFN_SHIFT: u32 = 23;

// The refill path copies these fields verbatim into TEL.
const_assert_eq!(PTE_PS.shift, TEL_PS.shift);
const_assert_eq!(PTE_CP.shift, TEL_CP.shift);

/// Page table entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
#[repr(transparent)]
pub struct Pte(pub u64);

/// Protection bits handed to the LTLB manager (`pgprot_t`)
pub type PgProt = Pte;

impl Pte {
    /// Build a PTE mapping `pfn`
    pub const fn new(pfn: u64, flags: PteFlags, ps: PageSize, cp: CachePolicy) -> Self {
        let val = (pfn << PTE_PFN_SHIFT) | flags.bits();
        let val = PTE_PS.set(val, ps as u64);
        Self(PTE_CP.set(val, cp as u64))
    }

    /// Protection bits with only a cache policy set
    pub const fn with_cache_policy(cp: CachePolicy) -> PgProt {
        Self(PTE_CP.set(0, cp as u64))
    }

    /// Raw value
    pub const fn val(self) -> u64 {
        self.0
    }

    /// Page frame number
    pub const fn pfn(self) -> u64 {
        self.0 >> PTE_PFN_SHIFT
    }

    /// Physical address of the mapped frame
    pub const fn phys(self) -> u64 {
        self.pfn() << PAGE_SHIFT
    }

    /// Single-bit flags
    pub const fn flags(self) -> PteFlags {
        PteFlags::from_bits_truncate(self.0)
    }

    /// Whether the mapping is global
    pub const fn is_global(self) -> bool {
        self.flags().contains(PteFlags::GLOBAL)
    }

    /// Page size class
    pub const fn page_size(self) -> PageSize {
        PageSize::from_bits(PTE_PS.get(self.0))
    }

    /// Cache policy (`pgprot_cache_policy`)
    pub const fn cache_policy(self) -> CachePolicy {
        CachePolicy::from_bits(PTE_CP.get(self.0))
    }

    /// 4-bit read/write/exec/global index
    pub const fn perms_index(self) -> u8 {
        PTE_PERMS.get(self.0) as u8
    }

    /// Hardware protection code for this PTE
    pub const fn protection(self) -> Protection {
        access_permission_from_pte_bits(self.perms_index())
    }

    /// Set the accessed bit
    pub fn mark_accessed(&mut self) {
        self.0 |= PteFlags::ACCESSED.bits();
    }
}

/// Page middle directory entry
///
/// Huge pages are mapped at the PMD level with the same layout as a PTE.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
#[repr(transparent)]
pub struct Pmd(pub u64);

impl Pmd {
    /// Same entry seen as a PTE
    pub const fn as_pte(self) -> Pte {
        Pte(self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pte_fields() {
        let pte = Pte::new(
            0x2,
            PteFlags::PRESENT | PteFlags::READ | PteFlags::WRITE,
            PageSize::Size4K,
            CachePolicy::WriteThroughCached,
        );

        assert_eq!(pte.pfn(), 2);
        assert_eq!(pte.phys(), 0x2000);
        assert_eq!(pte.page_size(), PageSize::Size4K);
        assert_eq!(pte.cache_policy(), CachePolicy::WriteThroughCached);
        assert_eq!(pte.protection(), Protection::RwRw);
        assert!(!pte.is_global());
    }

    #[test]
    fn test_perms_index_layout() {
        let pte = Pte::new(
            0,
            PteFlags::READ | PteFlags::EXEC | PteFlags::GLOBAL,
            PageSize::Size2M,
            CachePolicy::DeviceUncached,
        );

        assert_eq!(pte.perms_index(), 0b1101);
        assert_eq!(pte.protection(), Protection::NaRx);
        assert_eq!(pte.page_size(), PageSize::Size2M);
    }

    #[test]
    fn test_mark_accessed() {
        let mut pte = Pte::new(1, PteFlags::PRESENT | PteFlags::READ, PageSize::Size4K, CachePolicy::Uncached);
        assert!(!pte.flags().contains(PteFlags::ACCESSED));
        pte.mark_accessed();
        assert!(pte.flags().contains(PteFlags::ACCESSED));
    }
}
