//! Locked TLB bookkeeping
//!
//! Software copy of the LTLB mappings handed out at runtime (MMIO windows,
//! mailboxes). Slots below [`LTLB_ENTRY_FIXED_COUNT`] belong to the boot
//! code and are never allocated or removed here. The copy is what gets
//! replayed onto secondary CPUs during their early setup.

use crate::entry::TlbEntry;
use crate::tlb_defs::{
    LTLB_ENTRY_FIXED_COUNT, LTLB_ENTRY_GDB_PAGE, LTLB_ENTRY_KERNEL_TEXT, LTLB_KERNEL_RESERVED,
    MMU_LTLB_WAYS, REFILL_PERF_ENTRIES,
};

/// One of the fixed LTLB slots managed by boot code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedSlot(usize);

impl FixedSlot {
    /// Kernel text, or only the exception vectors in strict RWX mode
    pub const KERNEL_TEXT: FixedSlot = FixedSlot(LTLB_ENTRY_KERNEL_TEXT);
    /// Debugger page
    pub const GDB_PAGE: FixedSlot = FixedSlot(LTLB_ENTRY_GDB_PAGE);

    /// `index`-th 512M entry of the fast refill path
    pub const fn refill_perf(index: usize) -> Option<FixedSlot> {
        if index < REFILL_PERF_ENTRIES {
            Some(FixedSlot(LTLB_KERNEL_RESERVED + index))
        } else {
            None
        }
    }

    /// Hardware slot number
    pub const fn index(self) -> usize {
        self.0
    }
}

/// Allocation bitmap and copy of the runtime LTLB mappings
#[derive(Debug, Clone)]
pub struct LtlbTable {
    entries: [TlbEntry; MMU_LTLB_WAYS],
    bitmap: u16,
}

impl Default for LtlbTable {
    fn default() -> Self {
        Self::new()
    }
}

impl LtlbTable {
    pub const fn new() -> Self {
        Self {
            entries: [TlbEntry::EMPTY; MMU_LTLB_WAYS],
            bitmap: 0,
        }
    }

    /// Whether `slot` holds a runtime mapping
    pub const fn is_used(&self, slot: usize) -> bool {
        slot < MMU_LTLB_WAYS && self.bitmap & (1 << slot) != 0
    }

    /// Number of runtime mappings
    pub const fn len(&self) -> usize {
        self.bitmap.count_ones() as usize
    }

    pub const fn is_empty(&self) -> bool {
        self.bitmap == 0
    }

    /// Runtime mappings with their slot
    pub fn iter(&self) -> impl Iterator<Item = (usize, TlbEntry)> + '_ {
        (LTLB_ENTRY_FIXED_COUNT..MMU_LTLB_WAYS)
            .filter(|&slot| self.is_used(slot))
            .map(|slot| (slot, self.entries[slot]))
    }

    /// Whether `entry` intersects a runtime mapping
    pub fn overlaps(&self, entry: &TlbEntry) -> bool {
        self.iter().any(|(_, used)| used.overlaps(entry))
    }

    /// Slot of a mapping with the same address and size as `entry`
    pub fn find_same(&self, entry: &TlbEntry) -> Option<usize> {
        self.iter()
            .find(|(_, used)| used.virt() == entry.virt() && used.page_size() == entry.page_size())
            .map(|(slot, _)| slot)
    }

    /// Record `entry` in the first free slot
    pub fn allocate(&mut self, entry: TlbEntry) -> Option<usize> {
        let slot = (LTLB_ENTRY_FIXED_COUNT..MMU_LTLB_WAYS).find(|&slot| !self.is_used(slot))?;
        self.bitmap |= 1 << slot;
        self.entries[slot] = entry;
        Some(slot)
    }

    /// Forget the mapping starting at `vaddr`
    pub fn release(&mut self, vaddr: u64) -> Option<usize> {
        let slot = self
            .iter()
            .find(|(_, used)| used.matches_addr(vaddr))
            .map(|(slot, _)| slot)?;
        self.bitmap &= !(1 << slot);
        Some(slot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tlb_defs::{CachePolicy, EntryStatus, Global, PageSize, Protection};

    fn mapping(vaddr: u64, ps: PageSize) -> TlbEntry {
        TlbEntry::new(
            vaddr,
            vaddr,
            ps,
            Global::Global,
            Protection::NaRw,
            CachePolicy::DeviceUncached,
            0,
            EntryStatus::AccessedModified,
        )
    }

    #[test]
    fn test_allocate_skips_fixed_slots() {
        let mut table = LtlbTable::new();
        assert_eq!(table.allocate(mapping(0x1000_0000, PageSize::Size4K)), Some(LTLB_ENTRY_FIXED_COUNT));
        assert_eq!(table.allocate(mapping(0x2000_0000, PageSize::Size4K)), Some(LTLB_ENTRY_FIXED_COUNT + 1));
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_table_full() {
        let mut table = LtlbTable::new();
        for i in 0..(MMU_LTLB_WAYS - LTLB_ENTRY_FIXED_COUNT) as u64 {
            assert!(table.allocate(mapping(i << 21, PageSize::Size2M)).is_some());
        }
        assert_eq!(table.allocate(mapping(0x4000_0000, PageSize::Size4K)), None);
    }

    #[test]
    fn test_release_reuses_slot() {
        let mut table = LtlbTable::new();
        table.allocate(mapping(0x1000_0000, PageSize::Size4K));
        let second = table.allocate(mapping(0x2000_0000, PageSize::Size4K));

        assert_eq!(table.release(0x1000_0000), Some(LTLB_ENTRY_FIXED_COUNT));
        assert_eq!(table.release(0x1000_0000), None);
        assert_eq!(table.allocate(mapping(0x3000_0000, PageSize::Size4K)), Some(LTLB_ENTRY_FIXED_COUNT));
        assert!(second.is_some_and(|slot| table.is_used(slot)));
    }

    #[test]
    fn test_overlap_and_same() {
        let mut table = LtlbTable::new();
        table.allocate(mapping(0x4000_0000, PageSize::Size2M));

        assert!(table.overlaps(&mapping(0x4010_0000, PageSize::Size4K)));
        assert!(!table.overlaps(&mapping(0x4020_0000, PageSize::Size4K)));
        assert_eq!(table.find_same(&mapping(0x4000_0000, PageSize::Size2M)), Some(LTLB_ENTRY_FIXED_COUNT));
        assert_eq!(table.find_same(&mapping(0x4000_0000, PageSize::Size4K)), None);
    }

    #[test]
    fn test_fixed_slots() {
        assert_eq!(FixedSlot::KERNEL_TEXT.index(), 0);
        assert_eq!(FixedSlot::refill_perf(3).map(FixedSlot::index), Some(5));
        assert_eq!(FixedSlot::refill_perf(REFILL_PERF_ENTRIES), None);
    }
}
