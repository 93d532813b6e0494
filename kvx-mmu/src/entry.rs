//! TLB entry codec
//!
//! A TLB entry is two 64-bit words loaded into `$tel` and `$teh` before a
//! `tlbwrite`, or read back from them after a `tlbread`/`tlbprobe`.
//!
//! ```text
//!  TEL: | 63..40 | 39..12 |  11..10  | 9..8 | 7..4 | 3..2 | 1..0 |
//!       |   -    |   FN   |    PS    |  -   |  PA  |  CP  |  ES  |
//!
//!  TEH: | 63..41 | 40..12 |  11..10  |  9   | 8..0 |
//!       |   -    |   PN   |    VS    |  G   | ASN  |
//! ```

use core::fmt;

use crate::sfr::SfrField;
use crate::tlb_defs::{CachePolicy, EntryStatus, Global, MMU_VIRT_BITS, PageSize, Protection};

/// TEL.ES: entry status
pub const TEL_ES: SfrField = SfrField::new(0, 2);
/// TEL.CP: cache policy
pub const TEL_CP: SfrField = SfrField::new(2, 2);
/// TEL.PA: protection attributes
pub const TEL_PA: SfrField = SfrField::new(4, 4);
/// TEL.PS: page size
pub const TEL_PS: SfrField = SfrField::new(10, 2);
/// TEL.FN: frame number
pub const TEL_FN: SfrField = SfrField::new(12, 28);

/// TEH.ASN: address space number
pub const TEH_ASN: SfrField = SfrField::new(0, 9);
/// TEH.G: global indicator
pub const TEH_G: SfrField = SfrField::new(9, 1);
/// TEH.VS: virtual space
pub const TEH_VS: SfrField = SfrField::new(10, 2);
/// TEH.PN: page number
pub const TEH_PN: SfrField = SfrField::new(12, 29);

/// Mask of the virtual address bits held in TEH.PN
pub const VIRT_PN_MASK: u64 = ((1u64 << MMU_VIRT_BITS) - 1) & !((1u64 << TEH_PN.shift) - 1);

/// Hardware TLB entry
#[derive(Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct TlbEntry {
    /// Entry low word
    pub tel: u64,
    /// Entry high word
    pub teh: u64,
}

impl TlbEntry {
    /// Entry with every field cleared, status invalid
    pub const EMPTY: TlbEntry = TlbEntry { tel: 0, teh: 0 };

    /// Build an entry from its raw words
    pub const fn from_raw(tel: u64, teh: u64) -> Self {
        Self { tel, teh }
    }

    /// Build an entry
    ///
    /// Both addresses are truncated to the page boundary implied by `ps`.
    /// The virtual space is always 0: when running virtualized, the
    /// hypervisor fills it in on `tlbwrite`.
    #[allow(clippy::too_many_arguments)]
    pub const fn new(
        paddr: u64,
        vaddr: u64,
        ps: PageSize,
        global: Global,
        pa: Protection,
        cp: CachePolicy,
        asn: u32,
        es: EntryStatus,
    ) -> Self {
        let mask = ps.mask();

        let teh = TEH_PN.set(0, (vaddr & mask) >> TEH_PN.shift);
        let teh = TEH_VS.set(teh, 0);
        let teh = TEH_G.set(teh, global as u64);
        let teh = TEH_ASN.set(teh, asn as u64);

        let tel = TEL_FN.set(0, (paddr & mask) >> TEL_FN.shift);
        let tel = TEL_PS.set(tel, ps as u64);
        let tel = TEL_PA.set(tel, pa as u64);
        let tel = TEL_CP.set(tel, cp as u64);
        let tel = TEL_ES.set(tel, es as u64);

        Self { tel, teh }
    }

    /// Physical address of the mapped page
    pub const fn phys(&self) -> u64 {
        TEL_FN.get(self.tel) << TEL_FN.shift
    }

    /// Virtual address of the mapped page
    pub const fn virt(&self) -> u64 {
        TEH_PN.get(self.teh) << TEH_PN.shift
    }

    /// Page size class
    pub const fn page_size(&self) -> PageSize {
        PageSize::from_bits(TEL_PS.get(self.tel))
    }

    /// Size of the mapping in bytes
    pub const fn size(&self) -> u64 {
        self.page_size().bytes()
    }

    /// Entry status
    pub const fn status(&self) -> EntryStatus {
        EntryStatus::from_bits(TEL_ES.get(self.tel))
    }

    /// Whether the slot holds a live translation
    pub const fn is_valid(&self) -> bool {
        !matches!(self.status(), EntryStatus::Invalid)
    }

    /// Cache policy
    pub const fn cache_policy(&self) -> CachePolicy {
        CachePolicy::from_bits(TEL_CP.get(self.tel))
    }

    /// Protection attributes, `None` for a reserved encoding
    pub const fn protection(&self) -> Option<Protection> {
        Protection::from_bits(TEL_PA.get(self.tel))
    }

    /// Address space number
    pub const fn asn(&self) -> u32 {
        TEH_ASN.get(self.teh) as u32
    }

    /// Global indicator
    pub const fn global(&self) -> Global {
        if TEH_G.get(self.teh) != 0 { Global::Global } else { Global::UseAsn }
    }

    /// Copy with another entry status
    pub const fn with_status(self, es: EntryStatus) -> Self {
        Self {
            tel: TEL_ES.set(self.tel, es as u64),
            teh: self.teh,
        }
    }

    /// Whether `vaddr` falls inside the page mapped by this entry
    pub const fn contains(&self, vaddr: u64) -> bool {
        let vaddr = vaddr & VIRT_PN_MASK;
        let start = self.virt();
        vaddr >= start && vaddr - start < self.size()
    }

    /// Whether the entry maps exactly the page starting at `vaddr`
    ///
    /// Entries store at most 41 bits of virtual address, so `vaddr` is
    /// truncated the same way before comparing.
    pub const fn matches_addr(&self, vaddr: u64) -> bool {
        self.virt() == vaddr & VIRT_PN_MASK
    }

    /// Whether the virtual ranges of two entries intersect
    pub const fn overlaps(&self, other: &TlbEntry) -> bool {
        let start1 = self.virt();
        let end1 = start1 + self.size();
        let start2 = other.virt();
        let end2 = start2 + other.size();

        start1 < end2 && start2 < end1
    }
}

impl fmt::Debug for TlbEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlbEntry")
            .field("virt", &format_args!("{:#x}", self.virt()))
            .field("phys", &format_args!("{:#x}", self.phys()))
            .field("ps", &self.page_size())
            .field("es", &self.status())
            .field("g", &self.global())
            .field("asn", &self.asn())
            .finish()
    }
}

/// Protection codes indexed by the (W, X, G) bits of a readable page
///
/// A user page grants the kernel the same rights as userspace. A global
/// page belongs to the kernel and is not accessible from userspace.
const PAGE_ACCESS_PERMS: [Protection; 8] = [
    Protection::RR,
    Protection::RwRw,
    Protection::RxRx,
    Protection::RwxRwx,
    Protection::NaR,
    Protection::NaRw,
    Protection::NaRx,
    Protection::NaRwx,
];

/// Bit of the permission index holding the read right
pub const PERMS_INDEX_READ: u8 = 1 << 0;
/// Bit of the permission index holding the write right
pub const PERMS_INDEX_WRITE: u8 = 1 << 1;
/// Bit of the permission index holding the execute right
pub const PERMS_INDEX_EXEC: u8 = 1 << 2;
/// Bit of the permission index holding the global flag
pub const PERMS_INDEX_GLOBAL: u8 = 1 << 3;

/// Translate a 4-bit permission index into a hardware protection code
///
/// The index packs, from bit 0 upwards: read, write, execute, global.
/// Without the read bit there is no access at all.
pub const fn access_permission_from_pte_bits(index: u8) -> Protection {
    if index & PERMS_INDEX_READ == 0 {
        return Protection::NaNa;
    }

    PAGE_ACCESS_PERMS[((index & 0xf) >> 1) as usize]
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn page_size() -> impl Strategy<Value = PageSize> {
        prop::sample::select(PageSize::ALL.to_vec())
    }

    #[test]
    fn test_make_entry_4k() {
        let entry = TlbEntry::new(
            0x2000,
            0x1000,
            PageSize::Size4K,
            Global::UseAsn,
            Protection::RwRw,
            CachePolicy::WriteThroughCached,
            7,
            EntryStatus::AccessedModified,
        );

        assert_eq!(entry.virt(), 0x1000);
        assert_eq!(entry.phys(), 0x2000);
        assert_eq!(entry.asn(), 7);
        assert_eq!(entry.global(), Global::UseAsn);
        assert_eq!(entry.protection(), Some(Protection::RwRw));
        assert_eq!(entry.cache_policy(), CachePolicy::WriteThroughCached);
        assert_eq!(entry.status(), EntryStatus::AccessedModified);
        assert!(entry.is_valid());
        assert_eq!(entry.tel, 0x2000 | (9 << 4) | (2 << 2) | 3);
        assert_eq!(entry.teh, 0x1000 | 7);
    }

    #[test]
    fn test_make_entry_masks_to_page_size() {
        let entry = TlbEntry::new(
            0x2012_3456,
            0x4012_3456,
            PageSize::Size2M,
            Global::Global,
            Protection::NaRw,
            CachePolicy::DeviceUncached,
            0,
            EntryStatus::Present,
        );

        assert_eq!(entry.virt(), 0x4000_0000);
        assert_eq!(entry.phys(), 0x2000_0000);
        assert_eq!(entry.size(), 0x20_0000);
        assert!(entry.global().is_global());
    }

    #[test]
    fn test_kernel_address_truncated_to_41_bits() {
        let kaddr = 0xffff_ff80_0012_3000;
        let entry = TlbEntry::new(
            0,
            kaddr,
            PageSize::Size4K,
            Global::Global,
            Protection::NaRwx,
            CachePolicy::WriteThroughCached,
            0,
            EntryStatus::AccessedModified,
        );

        assert_eq!(entry.virt(), kaddr & VIRT_PN_MASK);
        assert!(entry.matches_addr(kaddr));
        assert!(entry.contains(kaddr + 0xfff));
        assert!(!entry.matches_addr(kaddr + 0x1000));
    }

    #[test]
    fn test_overlaps() {
        let big = TlbEntry::new(
            0,
            0x4000_0000,
            PageSize::Size2M,
            Global::Global,
            Protection::NaRw,
            CachePolicy::DeviceUncached,
            0,
            EntryStatus::AccessedModified,
        );
        let inside = TlbEntry::new(
            0,
            0x4010_0000,
            PageSize::Size4K,
            Global::Global,
            Protection::NaRw,
            CachePolicy::DeviceUncached,
            0,
            EntryStatus::AccessedModified,
        );
        let adjacent = TlbEntry::new(
            0,
            0x4020_0000,
            PageSize::Size4K,
            Global::Global,
            Protection::NaRw,
            CachePolicy::DeviceUncached,
            0,
            EntryStatus::AccessedModified,
        );

        assert!(big.overlaps(&inside));
        assert!(inside.overlaps(&big));
        assert!(!big.overlaps(&adjacent));
    }

    #[test]
    fn test_access_permission_table() {
        let r = PERMS_INDEX_READ;
        let w = PERMS_INDEX_WRITE;
        let x = PERMS_INDEX_EXEC;
        let g = PERMS_INDEX_GLOBAL;

        assert_eq!(access_permission_from_pte_bits(r), Protection::RR);
        assert_eq!(access_permission_from_pte_bits(r | w), Protection::RwRw);
        assert_eq!(access_permission_from_pte_bits(r | x), Protection::RxRx);
        assert_eq!(access_permission_from_pte_bits(r | w | x), Protection::RwxRwx);
        assert_eq!(access_permission_from_pte_bits(r | g), Protection::NaR);
        assert_eq!(access_permission_from_pte_bits(r | w | g), Protection::NaRw);
        assert_eq!(access_permission_from_pte_bits(r | x | g), Protection::NaRx);
        assert_eq!(access_permission_from_pte_bits(r | w | x | g), Protection::NaRwx);
    }

    proptest! {
        #[test]
        fn prop_entry_round_trip(
            ps in page_size(),
            vaddr in any::<u64>(),
            paddr in 0u64..(1u64 << 40),
            asn in 0u32..512,
            global in any::<bool>(),
        ) {
            let entry = TlbEntry::new(
                paddr,
                vaddr,
                ps,
                Global::from(global),
                Protection::NaRw,
                CachePolicy::Uncached,
                asn,
                EntryStatus::AccessedModified,
            );

            prop_assert_eq!(entry.page_size(), ps);
            prop_assert_eq!(entry.virt(), vaddr & ps.mask() & VIRT_PN_MASK);
            prop_assert_eq!(entry.phys(), paddr & ps.mask());
            prop_assert_eq!(entry.asn(), asn);
            prop_assert_eq!(entry.global().is_global(), global);
            prop_assert!(entry.contains(vaddr));
        }

        #[test]
        fn prop_no_read_means_no_access(index in 0u8..16) {
            let index = index & !PERMS_INDEX_READ;
            prop_assert_eq!(access_permission_from_pte_bits(index), Protection::NaNa);
        }

        #[test]
        fn prop_read_always_grants_access(index in 0u8..16) {
            let index = index | PERMS_INDEX_READ;
            prop_assert_ne!(access_permission_from_pte_bits(index), Protection::NaNa);
        }
    }
}
