//! Per-CPU MMU statistics

use core::fmt;

use crate::config::{KERNEL_DIRECT_MEMORY_MAP_SIZE, MmuConfig};

/// Kind of refill, by faulting address
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefillType {
    /// Userspace address
    User,
    /// Kernel address outside of the direct map
    Kernel,
    /// Kernel direct memory map
    KernelDirect,
}

impl RefillType {
    pub const COUNT: usize = 3;

    /// Classify a refilled address
    pub const fn classify(config: &MmuConfig, addr: u64) -> Self {
        if config.is_user_address(addr) {
            RefillType::User
        } else if addr - config.page_offset < KERNEL_DIRECT_MEMORY_MAP_SIZE {
            RefillType::KernelDirect
        } else {
            RefillType::Kernel
        }
    }

    const fn name(self) -> &'static str {
        match self {
            RefillType::User => "User",
            RefillType::Kernel => "Kernel",
            RefillType::KernelDirect => "Kernel Direct",
        }
    }
}

/// Counters of one CPU
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MmuStats {
    /// Refills installed, indexed by [`RefillType`]
    pub refills: [u64; RefillType::COUNT],
    /// Refills skipped because the mm was not running
    pub deferred_refills: u64,
    /// Full JTLB flushes
    pub tlb_flush_all: u64,
    /// ASN generation rollovers
    pub asn_rollovers: u64,
    /// Parity errors recovered by a full flush
    pub parity_recoveries: u64,
}

impl MmuStats {
    pub fn record_refill(&mut self, kind: RefillType) {
        self.refills[kind as usize] += 1;
    }

    pub fn refill_count(&self, kind: RefillType) -> u64 {
        self.refills[kind as usize]
    }

    pub fn total_refills(&self) -> u64 {
        self.refills.iter().sum()
    }
}

impl fmt::Display for MmuStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for kind in [RefillType::User, RefillType::Kernel, RefillType::KernelDirect] {
            writeln!(f, "  - {} refill count: {}", kind.name(), self.refill_count(kind))?;
        }
        writeln!(f, "  - Deferred refills: {}", self.deferred_refills)?;
        writeln!(f, "  - tlb_flush_all calls: {}", self.tlb_flush_all)?;
        writeln!(f, "  - ASN rollovers: {}", self.asn_rollovers)?;
        write!(f, "  - Parity recoveries: {}", self.parity_recoveries)
    }
}
