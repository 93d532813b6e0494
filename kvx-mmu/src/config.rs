//! MMU configuration

use kvx_api::{FatalMmuError, NR_CPUS};

/// Default first kernel virtual address
pub const DEFAULT_PAGE_OFFSET: u64 = 0xffff_ff80_0000_0000;

/// Size of the kernel direct memory map starting at the page offset
pub const KERNEL_DIRECT_MEMORY_MAP_SIZE: u64 = 0x10_0000_0000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MmuConfig {
    /// Number of CPUs managed, at most [`NR_CPUS`]
    pub nr_cpus: usize,
    /// First kernel virtual address, user addresses are below it
    pub page_offset: u64,
    /// Reject LTLB overlaps on LTLB add and JTLB refill
    pub debug_tlb_write: bool,
    /// Check the ASN of user refills against MMC.ASN
    pub debug_asn: bool,
    /// Record every TLB instruction in a per-CPU ring buffer
    pub trace_tlb_access: bool,
    /// Maintain per-CPU MMU statistics
    pub collect_stats: bool,
}

impl Default for MmuConfig {
    fn default() -> Self {
        Self {
            nr_cpus: 1,
            page_offset: DEFAULT_PAGE_OFFSET,
            debug_tlb_write: cfg!(feature = "debug_tlb_write"),
            debug_asn: cfg!(feature = "debug_asn"),
            trace_tlb_access: cfg!(feature = "debug_tlb_access"),
            collect_stats: cfg!(feature = "mmu_stats"),
        }
    }
}

impl MmuConfig {
    /// Default configuration for `nr_cpus` CPUs
    pub fn with_cpus(nr_cpus: usize) -> Self {
        Self {
            nr_cpus,
            ..Self::default()
        }
    }

    /// Check the configuration before building the MMU state
    pub fn validate(&self) -> Result<(), FatalMmuError> {
        if self.nr_cpus == 0 || self.nr_cpus > NR_CPUS {
            return Err(FatalMmuError::InvalidCpu { cpu: self.nr_cpus });
        }
        Ok(())
    }

    /// Whether `addr` belongs to userspace
    pub const fn is_user_address(&self, addr: u64) -> bool {
        addr < self.page_offset
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_cpu_count() {
        assert!(MmuConfig::with_cpus(4).validate().is_ok());
        assert!(MmuConfig::with_cpus(NR_CPUS).validate().is_ok());
        assert_eq!(
            MmuConfig::with_cpus(0).validate(),
            Err(FatalMmuError::InvalidCpu { cpu: 0 })
        );
        assert!(MmuConfig::with_cpus(NR_CPUS + 1).validate().is_err());
    }

    #[test]
    fn test_user_address_split() {
        let config = MmuConfig::default();
        assert!(config.is_user_address(0x1000));
        assert!(!config.is_user_address(DEFAULT_PAGE_OFFSET));
    }
}
