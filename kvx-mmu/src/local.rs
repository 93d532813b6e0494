//! Per-CPU TLB management
//!
//! [`LocalMmu`] groups everything one CPU owns: its TLB hardware, its ASN
//! counter, the round-robin refill cursor of each JTLB set and the mm it is
//! currently running. All operations act on the local TLB only and must be
//! called with local interrupts disabled; [`crate::MmuSystem`] takes care of
//! that and of the cross-CPU side.

extern crate alloc;

use alloc::sync::Arc;

use kvx_api::{CpuId, FatalMmuError, MmuError, PAGE_SHIFT, PAGE_SIZE, TlbBuffer, page_round_down};
use log::{debug, error, warn};

use crate::asn::{AsnCache, MM_CTXT_NO_ASN, MmContext, asn_cycle, asn_tag};
use crate::config::MmuConfig;
use crate::entry::{TEH_PN, TlbEntry};
use crate::hw::TlbHardware;
use crate::ltlb::LtlbTable;
use crate::pte::Pte;
use crate::stats::{MmuStats, RefillType};
use crate::tlb_defs::{
    ASN_FLUSH_PAGE_THRESHOLD, CachePolicy, EntryStatus, FLUSH_ALL_PAGE_THRESHOLD, Global,
    KERNEL_DUMMY_ASN, MMU_JTLB_SET_MASK, MMU_JTLB_SETS, MMU_JTLB_WAY_MASK, MMU_JTLB_WAYS,
    PageSize, Protection,
};
use crate::trace::{TlbAccessLog, TracedTlb};

/// Outcome of a refill
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Refill {
    /// Entry written in the JTLB
    Installed {
        /// JTLB set
        set: usize,
        /// JTLB way
        way: usize,
    },
    /// The mm is not running here, the entry will be refilled on its next fault
    Deferred,
}

/// Log a fatal error and hand it back
pub(crate) fn fatal(err: FatalMmuError) -> FatalMmuError {
    error!("{}", err);
    err
}

/// Keep only the fatal part of a clear. A missing entry was simply evicted
/// already.
fn tolerate_clear(result: Result<(), MmuError>) -> Result<(), FatalMmuError> {
    match result {
        Err(err) => err.into_fatal().map_or(Ok(()), Err),
        Ok(()) => Ok(()),
    }
}

/// Number of pages in `[start, end)`
///
/// An inverted range wraps to a huge count, so it takes the full flush path.
fn range_pages(start: u64, end: u64) -> u64 {
    end.wrapping_sub(start) >> PAGE_SHIFT
}

/// Page addresses of `[start, end)`, stopping at the top of the address space
fn range_addrs(start: u64, end: u64) -> impl Iterator<Item = u64> {
    core::iter::successors(Some(page_round_down(start)), |addr| addr.checked_add(PAGE_SIZE))
        .take_while(move |&addr| addr < end)
}

/// TLB state of one CPU
pub struct LocalMmu<H: TlbHardware> {
    cpu: CpuId,
    config: MmuConfig,
    hw: H,
    asn_cache: AsnCache,
    set_way: [u8; MMU_JTLB_SETS],
    active_mm: Option<Arc<MmContext>>,
    stats: MmuStats,
    trace: Option<TlbAccessLog>,
}

impl<H: TlbHardware> LocalMmu<H> {
    pub fn new(cpu: CpuId, config: MmuConfig, hw: H) -> Self {
        Self {
            cpu,
            config,
            hw,
            asn_cache: AsnCache::new(),
            set_way: [0; MMU_JTLB_SETS],
            active_mm: None,
            stats: MmuStats::default(),
            trace: config.trace_tlb_access.then(TlbAccessLog::new),
        }
    }

    pub fn cpu(&self) -> CpuId {
        self.cpu
    }

    pub fn hw(&self) -> &H {
        &self.hw
    }

    pub fn hw_mut(&mut self) -> &mut H {
        &mut self.hw
    }

    pub fn asn_cache(&self) -> &AsnCache {
        &self.asn_cache
    }

    pub fn stats(&self) -> &MmuStats {
        &self.stats
    }

    /// TLB access trace, when enabled
    pub fn trace(&self) -> Option<&TlbAccessLog> {
        self.trace.as_ref()
    }

    /// Mm currently running on this CPU
    pub fn active_mm(&self) -> Option<&Arc<MmContext>> {
        self.active_mm.as_ref()
    }

    /// Whether `mm` is the mm currently running on this CPU
    pub fn is_active(&self, mm: &MmContext) -> bool {
        self.active_mm
            .as_deref()
            .is_some_and(|active| core::ptr::eq(active, mm))
    }

    fn tlb(&mut self) -> TracedTlb<'_, H> {
        TracedTlb::new(&mut self.hw, self.trace.as_mut())
    }

    /// Invalidate the entry translating `addr` under `asn`
    ///
    /// The ASN programmed in MMC is restored before returning, whatever
    /// the outcome. A parity error during the probe is recovered by
    /// flushing the whole JTLB and reported as [`MmuError::NotFound`].
    pub fn clear_tlb_entry(
        &mut self,
        addr: u64,
        global: Global,
        asn: u64,
        buffer: TlbBuffer,
    ) -> Result<(), MmuError> {
        let asn = asn_tag(asn);
        let saved_asn = self.hw.mmc().asn();

        let result = self.probe_and_clear(addr, global, asn, buffer);

        self.tlb().set_asn(saved_asn);
        result
    }

    fn probe_and_clear(
        &mut self,
        addr: u64,
        global: Global,
        asn: u32,
        buffer: TlbBuffer,
    ) -> Result<(), MmuError> {
        // Probe is based on PN and ASN, the other fields are irrelevant.
        let probe = TlbEntry::new(
            0,
            addr,
            PageSize::Size4K,
            global,
            Protection::NaNa,
            CachePolicy::DeviceUncached,
            0,
            EntryStatus::Invalid,
        );

        let mmc = {
            let mut tlb = self.tlb();
            tlb.set_asn(asn);
            tlb.set_entry(probe);
            tlb.tlbprobe();
            tlb.mmc()
        };

        if mmc.error() {
            if mmc.parity() {
                warn!(
                    "cpu{}: parity error during lookup (addr {:#x}, asn {}). JTLB will be flushed",
                    self.cpu, addr, asn
                );
                self.tlb().clear_parity();
                if self.config.collect_stats {
                    self.stats.parity_recoveries += 1;
                }
                self.local_flush_tlb_all()?;
            }

            self.tlb().clear_error();
            return Err(MmuError::NotFound);
        }

        if mmc.buffer() != buffer {
            return Err(MmuError::WrongBuffer {
                found: mmc.buffer(),
            });
        }

        // TEL/TEH now hold the matching entry, invalidate it in place.
        let mut tlb = self.tlb();
        let found = tlb.entry();
        tlb.set_entry(found.with_status(EntryStatus::Invalid));
        tlb.tlbwrite();

        if tlb.error() {
            return Err(fatal(FatalMmuError::ClearFailed { addr, asn }).into());
        }

        debug!("cpu{}: entry (addr {:#x}, asn {}) cleared", self.cpu, addr, asn);
        Ok(())
    }

    /// Remove the locked mapping of `vaddr` from this CPU's LTLB
    pub fn clear_ltlb_entry(&mut self, vaddr: u64) -> Result<(), MmuError> {
        self.clear_tlb_entry(vaddr, Global::Global, KERNEL_DUMMY_ASN as u64, TlbBuffer::Ltlb)
    }

    /// Invalidate every JTLB slot
    pub fn local_flush_tlb_all(&mut self) -> Result<(), FatalMmuError> {
        if self.config.collect_stats {
            self.stats.tlb_flush_all += 1;
        }

        let mut tlb = self.tlb();
        tlb.select_buffer(TlbBuffer::Jtlb);

        for set in 0..MMU_JTLB_SETS {
            // With 4K pages the hardware picks the set from the low bits of PN.
            let invalid = TlbEntry::from_raw(TlbEntry::EMPTY.tel, TEH_PN.set(0, set as u64));
            for way in 0..MMU_JTLB_WAYS {
                tlb.set_entry(invalid);
                tlb.select_way(way);
                tlb.tlbwrite();

                if tlb.error() {
                    return Err(fatal(FatalMmuError::JtlbResetFailed { set, way }));
                }
            }
        }

        Ok(())
    }

    /// Invalidate the translation of `addr` in `mm`
    pub fn local_flush_tlb_page(&mut self, mm: &MmContext, addr: u64) -> Result<(), FatalMmuError> {
        let asn = mm.asn(self.cpu);

        // Without an ASN nothing of this mm can be cached here.
        if asn == MM_CTXT_NO_ASN {
            return Ok(());
        }

        tolerate_clear(self.clear_tlb_entry(addr, Global::UseAsn, asn, TlbBuffer::Jtlb))
    }

    /// Invalidate the translations of `[start, end)` in `mm`
    ///
    /// Above [`ASN_FLUSH_PAGE_THRESHOLD`] pages the whole context is dropped
    /// instead.
    pub fn local_flush_tlb_range(
        &mut self,
        mm: &MmContext,
        start: u64,
        end: u64,
    ) -> Result<(), FatalMmuError> {
        if range_pages(start, end) > ASN_FLUSH_PAGE_THRESHOLD {
            return self.local_flush_tlb_mm(mm);
        }

        let asn = mm.asn(self.cpu);
        if asn == MM_CTXT_NO_ASN {
            return Ok(());
        }

        for addr in range_addrs(start, end) {
            tolerate_clear(self.clear_tlb_entry(addr, Global::UseAsn, asn, TlbBuffer::Jtlb))?;
        }

        Ok(())
    }

    /// Invalidate every translation of `mm`
    ///
    /// A running mm gets a new ASN right away, which makes its old entries
    /// unreachable. Otherwise the ASN is dropped and a new one is assigned
    /// when the mm is next scheduled here.
    pub fn local_flush_tlb_mm(&mut self, mm: &MmContext) -> Result<(), FatalMmuError> {
        self.destroy_context(mm);
        if self.is_active(mm) {
            self.activate_context(mm)?;
        }
        Ok(())
    }

    /// Invalidate the kernel translations of `[start, end)`
    ///
    /// Kernel entries are global, so above [`FLUSH_ALL_PAGE_THRESHOLD`]
    /// pages the whole JTLB is flushed.
    pub fn local_flush_tlb_kernel_range(&mut self, start: u64, end: u64) -> Result<(), FatalMmuError> {
        if range_pages(start, end) > FLUSH_ALL_PAGE_THRESHOLD {
            return self.local_flush_tlb_all();
        }

        for addr in range_addrs(start, end) {
            tolerate_clear(self.clear_tlb_entry(
                addr,
                Global::Global,
                KERNEL_DUMMY_ASN as u64,
                TlbBuffer::Jtlb,
            ))?;
        }

        Ok(())
    }

    /// Assign `mm` a new ASN on this CPU
    pub fn get_new_mmu_context(&mut self, mm: &MmContext) -> Result<u64, FatalMmuError> {
        let grant = self.asn_cache.next();

        if grant.new_cycle {
            debug!("cpu{}: start new ASN cycle, flush all tlb", self.cpu);
            if self.config.collect_stats {
                self.stats.asn_rollovers += 1;
            }
            self.local_flush_tlb_all()?;
        }

        mm.set_asn(self.cpu, grant.asn);
        debug!(
            "{}: cpu[{}], cycle: {}, asn: {}",
            mm.id(),
            self.cpu,
            asn_cycle(grant.asn),
            asn_tag(grant.asn)
        );

        Ok(grant.asn)
    }

    /// ASN of `mm`, renewed if it belongs to an older cycle or is unset
    pub fn get_mmu_context(&mut self, mm: &MmContext) -> Result<u64, FatalMmuError> {
        let asn = mm.asn(self.cpu);
        if self.asn_cache.is_stale(asn) {
            return self.get_new_mmu_context(mm);
        }
        Ok(asn)
    }

    /// Make sure `mm` has a current ASN and program it in MMC
    pub fn activate_context(&mut self, mm: &MmContext) -> Result<(), FatalMmuError> {
        let asn = self.get_mmu_context(mm)?;
        self.tlb().set_asn(asn_tag(asn));
        Ok(())
    }

    /// Drop the ASN of `mm` on this CPU
    pub fn destroy_context(&mut self, mm: &MmContext) {
        mm.set_asn(self.cpu, MM_CTXT_NO_ASN);
    }

    /// Switch this CPU to `next`
    pub fn switch_mm(&mut self, next: &Arc<MmContext>) -> Result<(), FatalMmuError> {
        next.mark_cpu(self.cpu);

        if !self.is_active(next) {
            self.activate_context(next)?;
            self.active_mm = Some(Arc::clone(next));
        }

        Ok(())
    }

    /// Write the translation of `pte` for `address` into the JTLB
    ///
    /// The victim way is picked round-robin in the set selected by the
    /// address. `ltlb` is passed when refills must be checked against the
    /// locked mappings.
    pub fn jtlb_add_entry(
        &mut self,
        address: u64,
        pte: &mut Pte,
        asn: u64,
        ltlb: Option<&LtlbTable>,
    ) -> Result<(usize, usize), FatalMmuError> {
        let val = *pte;
        pte.mark_accessed();

        let ps = val.page_size();
        let entry = TlbEntry::new(
            val.phys(),
            address,
            ps,
            Global::from(val.is_global()),
            val.protection(),
            val.cache_policy(),
            asn_tag(asn),
            EntryStatus::AccessedModified,
        );

        let set = (address >> ps.shift()) as usize & MMU_JTLB_SET_MASK;

        if ltlb.is_some_and(|table| table.overlaps(&entry)) {
            return Err(fatal(FatalMmuError::RefillOverlapsLtlb { addr: address }));
        }

        let cursor = self.set_way[set];
        self.set_way[set] = cursor.wrapping_add(1);
        let way = cursor as usize & MMU_JTLB_WAY_MASK;

        let mut tlb = self.tlb();
        tlb.add_entry(TlbBuffer::Jtlb, way, entry);
        if tlb.error() {
            return Err(fatal(FatalMmuError::JtlbWriteFailed { addr: address, set, way }));
        }

        Ok((set, way))
    }

    /// Refill the JTLB after `mm` faulted on `address`
    pub fn update_mmu_cache(
        &mut self,
        mm: &MmContext,
        address: u64,
        pte: &mut Pte,
        ltlb: Option<&LtlbTable>,
    ) -> Result<Refill, FatalMmuError> {
        // A previous translation may still sit in another way of the set.
        self.local_flush_tlb_page(mm, address)?;

        if !self.is_active(mm) {
            debug!("cpu{}: {} not running, refill of {:#x} deferred", self.cpu, mm.id(), address);
            if self.config.collect_stats {
                self.stats.deferred_refills += 1;
            }
            return Ok(Refill::Deferred);
        }

        // Kernel pages are global, their ASN can be anything.
        let asn = mm.asn(self.cpu);

        if self.config.debug_asn && self.config.is_user_address(address) {
            let mmc_asn = self.hw.mmc().asn();

            if asn == MM_CTXT_NO_ASN {
                return Err(fatal(FatalMmuError::MissingAsn { addr: address, cpu: self.cpu }));
            }
            if asn_tag(asn) != mmc_asn {
                return Err(fatal(FatalMmuError::AsnOutOfSync { asn: asn_tag(asn), mmc_asn }));
            }
        }

        let (set, way) = self.jtlb_add_entry(address, pte, asn, ltlb)?;

        if self.config.collect_stats {
            self.stats.record_refill(RefillType::classify(&self.config, address));
        }

        Ok(Refill::Installed { set, way })
    }

    /// Write `entry` into LTLB `slot`
    pub fn ltlb_write(&mut self, slot: usize, entry: TlbEntry) -> Result<(), FatalMmuError> {
        let mut tlb = self.tlb();
        tlb.add_entry(TlbBuffer::Ltlb, slot, entry);
        if tlb.error() {
            return Err(fatal(FatalMmuError::LtlbWriteFailed {
                vaddr: entry.virt(),
                slot,
            }));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asn::MM_CTXT_FIRST_CYCLE;
    use crate::pte::PteFlags;
    use crate::sim::SimulatedTlb;
    use kvx_api::MmId;

    fn local() -> LocalMmu<SimulatedTlb> {
        LocalMmu::new(0, MmuConfig::with_cpus(1), SimulatedTlb::new())
    }

    fn user_pte(pfn: u64) -> Pte {
        Pte::new(
            pfn,
            PteFlags::PRESENT | PteFlags::READ | PteFlags::WRITE,
            PageSize::Size4K,
            CachePolicy::WriteThroughCached,
        )
    }

    #[test]
    fn test_activate_programs_mmc() {
        let mut mmu = local();
        let mm = Arc::new(MmContext::new(MmId(1), 1));

        mmu.switch_mm(&mm).unwrap();

        assert_eq!(mm.asn(0), MM_CTXT_FIRST_CYCLE + 1);
        assert_eq!(mmu.hw().mmc().asn(), 1);
        assert!(mmu.is_active(&mm));
        assert!(mm.cpumask().contains(0));
    }

    #[test]
    fn test_get_mmu_context_is_stable() {
        let mut mmu = local();
        let mm = MmContext::new(MmId(1), 1);

        let first = mmu.get_mmu_context(&mm).unwrap();
        for _ in 0..10 {
            assert_eq!(mmu.get_mmu_context(&mm).unwrap(), first);
        }
    }

    #[test]
    fn test_refill_round_robin() {
        let mut mmu = local();
        let mm = Arc::new(MmContext::new(MmId(1), 1));
        mmu.switch_mm(&mm).unwrap();

        // Same set, different pages: the cursor walks the four ways.
        let ways: Vec<_> = (0..5u64)
            .map(|i| {
                let mut pte = user_pte(i + 1);
                match mmu.update_mmu_cache(&mm, (i * MMU_JTLB_SETS as u64) << PAGE_SHIFT, &mut pte, None) {
                    Ok(Refill::Installed { set, way }) => (set, way),
                    other => panic!("unexpected refill outcome {:?}", other),
                }
            })
            .collect();

        assert_eq!(ways, [(0, 0), (0, 1), (0, 2), (0, 3), (0, 0)]);
    }

    #[test]
    fn test_refill_marks_pte_accessed() {
        let mut mmu = local();
        let mm = Arc::new(MmContext::new(MmId(1), 1));
        mmu.switch_mm(&mm).unwrap();

        let mut pte = user_pte(2);
        mmu.update_mmu_cache(&mm, 0x1000, &mut pte, None).unwrap();
        assert!(pte.flags().contains(PteFlags::ACCESSED));
    }

    #[test]
    fn test_clear_missing_entry_restores_asn() {
        let mut mmu = local();
        mmu.hw_mut().set_asn(5);

        let result = mmu.clear_tlb_entry(0x1000, Global::UseAsn, 9, TlbBuffer::Jtlb);

        assert_eq!(result, Err(MmuError::NotFound));
        assert_eq!(mmu.hw().mmc().asn(), 5);
        assert!(!mmu.hw().mmc().error());
    }

    #[test]
    fn test_clear_reports_wrong_buffer() {
        let mut mmu = local();
        let locked = TlbEntry::new(
            0x8000_0000,
            0x8000_0000,
            PageSize::Size2M,
            Global::Global,
            Protection::NaRw,
            CachePolicy::DeviceUncached,
            0,
            EntryStatus::AccessedModified,
        );
        mmu.ltlb_write(8, locked).unwrap();

        let result = mmu.clear_tlb_entry(0x8000_0000, Global::Global, KERNEL_DUMMY_ASN as u64, TlbBuffer::Jtlb);
        assert_eq!(result, Err(MmuError::WrongBuffer { found: TlbBuffer::Ltlb }));
        assert!(mmu.hw().ltlb_entry(8).is_valid());
    }

    #[test]
    fn test_flush_all_failure_is_fatal() {
        let mut mmu = local();
        mmu.hw_mut().fail_next_writes(1);
        assert_eq!(
            mmu.local_flush_tlb_all(),
            Err(FatalMmuError::JtlbResetFailed { set: 0, way: 0 })
        );
    }

    #[test]
    fn test_trace_records_when_enabled() {
        let config = MmuConfig {
            trace_tlb_access: true,
            ..MmuConfig::with_cpus(1)
        };
        let mut mmu = LocalMmu::new(0, config, SimulatedTlb::new());
        mmu.local_flush_tlb_page(&MmContext::new(MmId(1), 1), 0x1000).unwrap();
        assert!(mmu.trace().is_some_and(|log| log.is_empty()));

        let _ = mmu.clear_tlb_entry(0x1000, Global::UseAsn, 1, TlbBuffer::Jtlb);
        assert_eq!(mmu.trace().map(|log| log.len()), Some(1));
        assert!(local().trace().is_none());
    }

    #[test]
    fn test_range_walk_stops_at_top_of_address_space() {
        let top: Vec<_> = range_addrs(0xffff_ffff_ffff_e000, u64::MAX).collect();
        assert_eq!(top, [0xffff_ffff_ffff_e000, 0xffff_ffff_ffff_f000]);

        let unaligned: Vec<_> = range_addrs(0x1800, 0x3000).collect();
        assert_eq!(unaligned, [0x1000, 0x2000]);
        assert_eq!(range_addrs(0x5000, 0x1000).count(), 0);

        assert_eq!(range_pages(0x1000, 0x3000), 2);
        assert!(range_pages(0x5000, 0x1000) > ASN_FLUSH_PAGE_THRESHOLD);
    }

    #[test]
    fn test_inverted_range_drops_context() {
        let mut mmu = local();
        let mm = Arc::new(MmContext::new(MmId(1), 1));
        mmu.switch_mm(&mm).unwrap();
        let old = mm.asn(0);

        mmu.local_flush_tlb_range(&mm, 0x5000, 0x1000).unwrap();

        assert_ne!(mm.asn(0), old);
        assert_eq!(mmu.hw().mmc().asn(), asn_tag(mm.asn(0)));
    }
}
