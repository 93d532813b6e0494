//! Address space numbers
//!
//! TLB entries are tagged with a 9-bit ASN so that entries of different
//! processes can live in the TLB at the same time and a context switch does
//! not need a flush.
//!
//! Each CPU owns a 64-bit counter. Its low 9 bits are the hardware tag and
//! the upper bits are a generation (cycle). An mm keeps, for every CPU, the
//! counter value it was last given there. When the tag wraps to 0 a new
//! cycle starts, the local TLB is flushed, and every ASN of the previous
//! cycle becomes stale.

extern crate alloc;

use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use kvx_api::{CpuId, CpuMask, MmId};

use crate::sfr::MMC_ASN_WIDTH;

/// Hardware-visible part of an ASN
pub const MM_CTXT_ASN_MASK: u64 = (1 << MMC_ASN_WIDTH) - 1;
/// Generation part of an ASN
pub const MM_CTXT_CYCLE_MASK: u64 = !MM_CTXT_ASN_MASK;
/// No ASN assigned on this CPU. Its cycle is 0, which never matches.
pub const MM_CTXT_NO_ASN: u64 = 0;
/// First value of every per-CPU counter
pub const MM_CTXT_FIRST_CYCLE: u64 = MM_CTXT_ASN_MASK + 1;

/// Hardware tag of an ASN
#[inline]
pub const fn asn_tag(asn: u64) -> u32 {
    (asn & MM_CTXT_ASN_MASK) as u32
}

/// Generation of an ASN
#[inline]
pub const fn asn_cycle(asn: u64) -> u64 {
    (asn & MM_CTXT_CYCLE_MASK) >> MMC_ASN_WIDTH
}

/// Result of [`AsnCache::next`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AsnGrant {
    /// Newly assigned ASN
    pub asn: u64,
    /// The tag wrapped: the local TLB must be flushed
    pub new_cycle: bool,
}

/// Per-CPU ASN counter (`kvx_asn_cache`)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AsnCache {
    last: u64,
}

impl Default for AsnCache {
    fn default() -> Self {
        Self::new()
    }
}

impl AsnCache {
    pub const fn new() -> Self {
        Self {
            last: MM_CTXT_FIRST_CYCLE,
        }
    }

    /// Last ASN handed out
    pub const fn last(&self) -> u64 {
        self.last
    }

    /// Whether `asn` belongs to an older cycle, or was never assigned
    pub const fn is_stale(&self, asn: u64) -> bool {
        (asn ^ self.last) & MM_CTXT_CYCLE_MASK != 0
    }

    /// Hand out the next ASN
    pub fn next(&mut self) -> AsnGrant {
        let mut asn = self.last.wrapping_add(1);
        let new_cycle = asn & MM_CTXT_ASN_MASK == 0;

        // The 64-bit container itself wrapped: skip cycle 0, it means "no ASN".
        if new_cycle && asn == 0 {
            asn = MM_CTXT_FIRST_CYCLE;
        }

        self.last = asn;
        AsnGrant { asn, new_cycle }
    }
}

/// Per-mm MMU context (`mm->context`)
///
/// Shared by every CPU running the mm. Each CPU only ever writes its own
/// ASN slot.
#[derive(Debug)]
pub struct MmContext {
    id: MmId,
    asn: Vec<AtomicU64>,
    cpumask: AtomicU64,
}

impl MmContext {
    /// Fresh context with no ASN on any CPU (`init_new_context`)
    pub fn new(id: MmId, nr_cpus: usize) -> Self {
        Self {
            id,
            asn: (0..nr_cpus).map(|_| AtomicU64::new(MM_CTXT_NO_ASN)).collect(),
            cpumask: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> MmId {
        self.id
    }

    /// ASN of this mm on `cpu` (`mm_asn`)
    pub fn asn(&self, cpu: CpuId) -> u64 {
        self.asn
            .get(cpu)
            .map_or(MM_CTXT_NO_ASN, |asn| asn.load(Ordering::Relaxed))
    }

    /// Callers validate `cpu` against the managed CPUs first
    pub(crate) fn set_asn(&self, cpu: CpuId, asn: u64) {
        debug_assert!(cpu < self.asn.len(), "ASN update for unmanaged CPU {}", cpu);
        if let Some(slot) = self.asn.get(cpu) {
            slot.store(asn, Ordering::Relaxed);
        }
    }

    /// CPUs this mm has ever run on (`mm_cpumask`)
    pub fn cpumask(&self) -> CpuMask {
        CpuMask::from_bits(self.cpumask.load(Ordering::Acquire))
    }

    /// Add `cpu` to the mask. The mask is never shrunk: a task migrating
    /// back to a CPU could otherwise reuse stale entries there.
    pub(crate) fn mark_cpu(&self, cpu: CpuId) {
        self.cpumask.fetch_or(CpuMask::of(cpu).bits(), Ordering::AcqRel);
    }
}
