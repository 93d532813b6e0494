//! MMU state of the whole machine and cross-CPU TLB shootdown
//!
//! [`MmuSystem`] owns one [`LocalMmu`] per CPU and the shared LTLB table.
//! Every entry point takes the id of the CPU executing it, as
//! `smp_processor_id()` would return, and only touches that CPU's TLB
//! directly. Other CPUs are reached through their mailbox and the IPI
//! doorbell: the request is queued, the doorbell is rung once for all
//! targets, and each target applies it from [`MmuSystem::handle_ipi`].
//!
//! Lock order is LTLB table, then per-CPU state.

extern crate alloc;

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};

use kvx_api::{
    CpuId, CpuMask, FatalMmuError, IpiDoorbell, IrqControl, IrqGuard, MmId, MmuError, NR_CPUS,
    NoopDoorbell, NoopIrq, is_aligned,
};
use log::{debug, info};
use spin::Mutex;

use crate::asn::MmContext;
use crate::config::MmuConfig;
use crate::entry::TlbEntry;
use crate::hw::TlbHardware;
use crate::local::{LocalMmu, Refill, fatal};
use crate::ltlb::{FixedSlot, LtlbTable};
use crate::pte::{PgProt, Pmd, Pte};
use crate::sim::SimulatedTlb;
use crate::stats::MmuStats;
use crate::tlb_defs::{
    CachePolicy, EntryStatus, Global, LTLB_ENTRY_EARLY_SMEM, MMU_JTLB_SETS, MMU_JTLB_WAYS,
    MMU_LTLB_WAYS, PageSize, Protection,
};

/// TLB invalidation to run on a set of CPUs
#[derive(Debug, Clone)]
pub enum FlushRequest {
    /// One page of an mm
    Page {
        mm: Arc<MmContext>,
        addr: u64,
    },
    /// `[start, end)` of an mm
    Range {
        mm: Arc<MmContext>,
        start: u64,
        end: u64,
    },
    /// Every translation of an mm
    Mm(Arc<MmContext>),
    /// Kernel translations of `[start, end)`
    KernelRange { start: u64, end: u64 },
    /// The whole JTLB
    All,
}

impl FlushRequest {
    /// CPUs that may cache translations concerned by the request
    pub fn targets(&self, online: CpuMask) -> CpuMask {
        match self {
            FlushRequest::Page { mm, .. } | FlushRequest::Range { mm, .. } | FlushRequest::Mm(mm) => {
                mm.cpumask().and(online)
            }
            FlushRequest::KernelRange { .. } | FlushRequest::All => online,
        }
    }

    /// Run the request on the local TLB
    pub fn apply<H: TlbHardware>(&self, local: &mut LocalMmu<H>) -> Result<(), FatalMmuError> {
        match self {
            FlushRequest::Page { mm, addr } => local.local_flush_tlb_page(mm, *addr),
            FlushRequest::Range { mm, start, end } => local.local_flush_tlb_range(mm, *start, *end),
            FlushRequest::Mm(mm) => local.local_flush_tlb_mm(mm),
            FlushRequest::KernelRange { start, end } => local.local_flush_tlb_kernel_range(*start, *end),
            FlushRequest::All => local.local_flush_tlb_all(),
        }
    }
}

#[derive(Default)]
struct Pending {
    last_seq: u64,
    requests: VecDeque<(u64, FlushRequest)>,
}

/// Flush requests addressed to one CPU
#[derive(Default)]
struct Mailbox {
    pending: Mutex<Pending>,
    completed: AtomicU64,
}

impl Mailbox {
    fn post(&self, request: FlushRequest) -> u64 {
        let mut pending = self.pending.lock();
        pending.last_seq += 1;
        let seq = pending.last_seq;
        pending.requests.push_back((seq, request));
        seq
    }

    fn take(&self) -> Option<(u64, FlushRequest)> {
        self.pending.lock().requests.pop_front()
    }

    fn complete(&self, seq: u64) {
        self.completed.fetch_max(seq, Ordering::AcqRel);
    }

    fn is_done(&self, seq: u64) -> bool {
        self.completed.load(Ordering::Acquire) >= seq
    }
}

/// MMU state of every CPU
pub struct MmuSystem<H: TlbHardware> {
    config: MmuConfig,
    locals: Vec<Mutex<LocalMmu<H>>>,
    mailboxes: Vec<Mailbox>,
    ltlb: Mutex<LtlbTable>,
    irq: Arc<dyn IrqControl>,
    doorbell: Arc<dyn IpiDoorbell>,
    next_mm_id: AtomicU64,
}

impl MmuSystem<SimulatedTlb> {
    /// System backed by simulated TLBs, without interrupts nor IPIs
    pub fn simulated(config: MmuConfig) -> Result<Self, FatalMmuError> {
        Self::new(config, Arc::new(NoopIrq), Arc::new(NoopDoorbell), |_| SimulatedTlb::new())
    }
}

impl<H: TlbHardware> MmuSystem<H> {
    /// Build the MMU state, `hw` provides the TLB of each CPU
    pub fn new(
        config: MmuConfig,
        irq: Arc<dyn IrqControl>,
        doorbell: Arc<dyn IpiDoorbell>,
        mut hw: impl FnMut(CpuId) -> H,
    ) -> Result<Self, FatalMmuError> {
        config.validate()?;

        let locals = (0..config.nr_cpus)
            .map(|cpu| Mutex::new(LocalMmu::new(cpu, config, hw(cpu))))
            .collect();
        let mailboxes = (0..config.nr_cpus).map(|_| Mailbox::default()).collect();

        info!(
            "KVX MMU: {} CPUs, JTLB {}x{}, LTLB {} ways",
            config.nr_cpus, MMU_JTLB_SETS, MMU_JTLB_WAYS, MMU_LTLB_WAYS
        );

        Ok(Self {
            config,
            locals,
            mailboxes,
            ltlb: Mutex::new(LtlbTable::new()),
            irq,
            doorbell,
            next_mm_id: AtomicU64::new(1),
        })
    }

    pub fn config(&self) -> &MmuConfig {
        &self.config
    }

    /// CPUs managed by this system
    pub fn online(&self) -> CpuMask {
        CpuMask::first(self.config.nr_cpus)
    }

    fn local(&self, cpu: CpuId) -> Result<&Mutex<LocalMmu<H>>, FatalMmuError> {
        self.locals.get(cpu).ok_or(FatalMmuError::InvalidCpu { cpu })
    }

    fn mailbox(&self, cpu: CpuId) -> Result<&Mailbox, FatalMmuError> {
        self.mailboxes.get(cpu).ok_or(FatalMmuError::InvalidCpu { cpu })
    }

    /// Run `f` on the state of `cpu` with local interrupts disabled
    pub fn with_local<R>(
        &self,
        cpu: CpuId,
        f: impl FnOnce(&mut LocalMmu<H>) -> R,
    ) -> Result<R, FatalMmuError> {
        let local = self.local(cpu)?;
        let _irq = IrqGuard::new(&*self.irq);
        let mut local = local.lock();
        Ok(f(&mut local))
    }

    /// Counters of `cpu`
    pub fn stats(&self, cpu: CpuId) -> Result<MmuStats, FatalMmuError> {
        self.with_local(cpu, |local| *local.stats())
    }

    /// Write the counters of every CPU
    pub fn write_stats(&self, out: &mut impl fmt::Write) -> fmt::Result {
        for cpu in self.online() {
            if let Ok(stats) = self.stats(cpu) {
                writeln!(out, " - CPU {}", cpu)?;
                writeln!(out, "{}", stats)?;
            }
        }
        Ok(())
    }

    /// Copy of the runtime LTLB mappings
    pub fn ltlb_table(&self) -> LtlbTable {
        self.ltlb.lock().clone()
    }

    // Context hooks

    /// New mm with no ASN on any CPU (`init_new_context`)
    pub fn init_new_context(&self) -> Arc<MmContext> {
        let id = MmId(self.next_mm_id.fetch_add(1, Ordering::Relaxed));
        Arc::new(MmContext::new(id, self.config.nr_cpus))
    }

    /// Drop the ASN of `mm` on `cpu`
    pub fn destroy_context(&self, cpu: CpuId, mm: &MmContext) -> Result<(), FatalMmuError> {
        self.with_local(cpu, |local| local.destroy_context(mm))
    }

    /// Give `mm` a current ASN on `cpu` and program it in MMC
    pub fn activate_context(&self, cpu: CpuId, mm: &MmContext) -> Result<(), FatalMmuError> {
        self.with_local(cpu, |local| local.activate_context(mm))?
    }

    /// Context switch of `cpu` to `next`, also used as `activate_mm`
    pub fn switch_mm(&self, cpu: CpuId, next: &Arc<MmContext>) -> Result<(), FatalMmuError> {
        self.with_local(cpu, |local| local.switch_mm(next))?
    }

    // Refill

    /// Install the translation of `address` after `mm` faulted on it
    pub fn update_mmu_cache(
        &self,
        cpu: CpuId,
        mm: &MmContext,
        address: u64,
        pte: &mut Pte,
    ) -> Result<Refill, FatalMmuError> {
        let local = self.local(cpu)?;
        let _irq = IrqGuard::new(&*self.irq);
        let table = self.config.debug_tlb_write.then(|| self.ltlb.lock());
        let mut local = local.lock();

        local.update_mmu_cache(mm, address, pte, table.as_deref())
    }

    /// Huge page refill: the PMD is handled as a PTE
    pub fn update_mmu_cache_pmd(
        &self,
        cpu: CpuId,
        mm: &MmContext,
        address: u64,
        pmd: &Pmd,
    ) -> Result<Refill, FatalMmuError> {
        let mut pte = pmd.as_pte();
        self.update_mmu_cache(cpu, mm, address, &mut pte)
    }

    // Local flushes

    pub fn local_flush_tlb_page(&self, cpu: CpuId, mm: &MmContext, addr: u64) -> Result<(), FatalMmuError> {
        self.with_local(cpu, |local| local.local_flush_tlb_page(mm, addr))?
    }

    pub fn local_flush_tlb_range(
        &self,
        cpu: CpuId,
        mm: &MmContext,
        start: u64,
        end: u64,
    ) -> Result<(), FatalMmuError> {
        self.with_local(cpu, |local| local.local_flush_tlb_range(mm, start, end))?
    }

    pub fn local_flush_tlb_mm(&self, cpu: CpuId, mm: &MmContext) -> Result<(), FatalMmuError> {
        self.with_local(cpu, |local| local.local_flush_tlb_mm(mm))?
    }

    pub fn local_flush_tlb_all(&self, cpu: CpuId) -> Result<(), FatalMmuError> {
        self.with_local(cpu, |local| local.local_flush_tlb_all())?
    }

    pub fn local_flush_tlb_kernel_range(&self, cpu: CpuId, start: u64, end: u64) -> Result<(), FatalMmuError> {
        self.with_local(cpu, |local| local.local_flush_tlb_kernel_range(start, end))?
    }

    // Cross-CPU flushes

    /// Run `request` on every CPU concerned and wait until all of them
    /// have applied it
    pub fn smp_flush(&self, cpu: CpuId, request: FlushRequest) -> Result<(), FatalMmuError> {
        self.broadcast(cpu, request, true)
    }

    /// Run `request` on every CPU concerned without waiting for the remote
    /// ones
    ///
    /// Only the local part is done on return. Remote CPUs apply the request
    /// when they take the IPI.
    pub fn smp_flush_async(&self, cpu: CpuId, request: FlushRequest) -> Result<(), FatalMmuError> {
        self.broadcast(cpu, request, false)
    }

    pub fn smp_flush_tlb_page(&self, cpu: CpuId, mm: &Arc<MmContext>, addr: u64) -> Result<(), FatalMmuError> {
        self.smp_flush(
            cpu,
            FlushRequest::Page {
                mm: Arc::clone(mm),
                addr,
            },
        )
    }

    pub fn smp_flush_tlb_range(
        &self,
        cpu: CpuId,
        mm: &Arc<MmContext>,
        start: u64,
        end: u64,
    ) -> Result<(), FatalMmuError> {
        self.smp_flush(
            cpu,
            FlushRequest::Range {
                mm: Arc::clone(mm),
                start,
                end,
            },
        )
    }

    pub fn smp_flush_tlb_mm(&self, cpu: CpuId, mm: &Arc<MmContext>) -> Result<(), FatalMmuError> {
        self.smp_flush(cpu, FlushRequest::Mm(Arc::clone(mm)))
    }

    /// Kernel mappings are global: every online CPU is flushed
    pub fn smp_flush_tlb_kernel_range(&self, cpu: CpuId, start: u64, end: u64) -> Result<(), FatalMmuError> {
        self.smp_flush(cpu, FlushRequest::KernelRange { start, end })
    }

    pub fn smp_flush_tlb_all(&self, cpu: CpuId) -> Result<(), FatalMmuError> {
        self.smp_flush(cpu, FlushRequest::All)
    }

    fn broadcast(&self, cpu: CpuId, request: FlushRequest, wait: bool) -> Result<(), FatalMmuError> {
        let local = self.local(cpu)?;
        let targets = request.targets(self.online());
        let remote = targets.without(cpu);

        let mut seqs = [0u64; NR_CPUS];
        for target in remote {
            seqs[target] = self.mailboxes[target].post(request.clone());
        }
        if !remote.is_empty() {
            self.doorbell.raise(remote);
        }

        if targets.contains(cpu) {
            let _irq = IrqGuard::new(&*self.irq);
            request.apply(&mut local.lock())?;
        }

        if !wait {
            return Ok(());
        }

        for target in remote {
            while !self.mailboxes[target].is_done(seqs[target]) {
                // Keep serving our own mailbox, the target may be waiting on us.
                self.handle_ipi(cpu)?;
                core::hint::spin_loop();
            }
        }

        Ok(())
    }

    /// TLB shootdown IPI handler of `cpu`
    ///
    /// Applies every queued request and returns how many were handled.
    pub fn handle_ipi(&self, cpu: CpuId) -> Result<usize, FatalMmuError> {
        let mailbox = self.mailbox(cpu)?;
        let local = self.local(cpu)?;
        let mut handled = 0;

        while let Some((seq, request)) = mailbox.take() {
            let result = {
                let _irq = IrqGuard::new(&*self.irq);
                request.apply(&mut local.lock())
            };
            // Waiters are released even if the flush failed, the error
            // is reported to the caller.
            mailbox.complete(seq);
            result?;
            handled += 1;
        }

        Ok(handled)
    }

    // Locked mappings

    /// Lock a kernel mapping in the LTLB of `cpu` (`kvx_mmu_ltlb_add_entry`)
    ///
    /// The mapping is recorded so secondary CPUs get it during their early
    /// setup. Returns the slot used.
    pub fn ltlb_add_entry(
        &self,
        cpu: CpuId,
        vaddr: u64,
        paddr: u64,
        prot: PgProt,
        ps: PageSize,
    ) -> Result<usize, MmuError> {
        let local = self.local(cpu)?;
        let size = ps.bytes();

        if !is_aligned(vaddr, size) || !is_aligned(paddr, size) {
            return Err(fatal(FatalMmuError::MisalignedMapping { vaddr, paddr, size }).into());
        }

        let entry = TlbEntry::new(
            paddr,
            vaddr,
            ps,
            Global::Global,
            Protection::NaRw,
            prot.cache_policy(),
            0,
            EntryStatus::AccessedModified,
        );

        let _irq = IrqGuard::new(&*self.irq);
        let mut table = self.ltlb.lock();

        if self.config.debug_tlb_write {
            if table.overlaps(&entry) {
                return Err(fatal(FatalMmuError::LtlbOverlap { vaddr }).into());
            }
        } else if table.find_same(&entry).is_some() {
            return Err(MmuError::AlreadyMapped { vaddr });
        }

        let slot = table
            .allocate(entry)
            .ok_or_else(|| fatal(FatalMmuError::LtlbFull { vaddr }))?;
        local.lock().ltlb_write(slot, entry)?;

        debug!("cpu{}: LTLB[{}] maps {:#x} -> {:#x} ({:?})", cpu, slot, vaddr, paddr, ps);
        Ok(slot)
    }

    /// Remove a mapping added with [`MmuSystem::ltlb_add_entry`]
    pub fn ltlb_remove_entry(&self, cpu: CpuId, vaddr: u64) -> Result<(), FatalMmuError> {
        let local = self.local(cpu)?;
        let _irq = IrqGuard::new(&*self.irq);
        let mut table = self.ltlb.lock();

        let slot = table
            .release(vaddr)
            .ok_or_else(|| fatal(FatalMmuError::LtlbEntryNotFound { vaddr }))?;

        local
            .lock()
            .clear_ltlb_entry(vaddr)
            .map_err(|_| fatal(FatalMmuError::LtlbRemoveFailed { vaddr }))?;

        debug!("cpu{}: LTLB[{}] for {:#x} removed", cpu, slot, vaddr);
        Ok(())
    }

    /// Program one of the boot-time LTLB slots of `cpu`
    ///
    /// Pass [`TlbEntry::EMPTY`] to invalidate it.
    pub fn install_fixed_ltlb_entry(
        &self,
        cpu: CpuId,
        slot: FixedSlot,
        entry: TlbEntry,
    ) -> Result<(), FatalMmuError> {
        self.with_local(cpu, |local| local.ltlb_write(slot.index(), entry))?
    }

    /// Map the kernel with a single 512M locked entry (non strict RWX)
    pub fn map_kernel_in_ltlb(&self, cpu: CpuId, phys_offset: u64) -> Result<(), FatalMmuError> {
        let entry = TlbEntry::new(
            phys_offset,
            self.config.page_offset,
            PageSize::Size512M,
            Global::Global,
            Protection::NaRwx,
            CachePolicy::WriteThroughCached,
            0,
            EntryStatus::AccessedModified,
        );
        self.install_fixed_ltlb_entry(cpu, FixedSlot::KERNEL_TEXT, entry)
    }

    /// MMU setup of a CPU coming online
    ///
    /// Drops the shared memory mapping used by the boot code. Secondary
    /// CPUs also get every runtime LTLB mapping recorded so far.
    pub fn early_setup(&self, cpu: CpuId) -> Result<(), FatalMmuError> {
        let local = self.local(cpu)?;
        let _irq = IrqGuard::new(&*self.irq);
        let table = self.ltlb.lock();
        let mut local = local.lock();

        local.ltlb_write(LTLB_ENTRY_EARLY_SMEM, TlbEntry::EMPTY)?;

        if cpu != 0 {
            for (slot, entry) in table.iter() {
                local.ltlb_write(slot, entry)?;
            }
        }

        Ok(())
    }
}
