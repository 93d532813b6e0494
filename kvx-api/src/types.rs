//! Core types shared by the TLB layer and its collaborators

use core::fmt;

use static_assertions::const_assert;

/// Maximum number of CPUs handled by one MMU instance
pub const NR_CPUS: usize = 64;

// A CPU mask is a single 64-bit word.
const_assert!(NR_CPUS <= u64::BITS as usize);

/// Logical CPU number (`smp_processor_id()`)
pub type CpuId = usize;

/// Identifier of an address space (one per `mm`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct MmId(pub u64);

impl fmt::Display for MmId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "mm#{}", self.0)
    }
}

/// TLB buffer selected through MMC.SB
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TlbBuffer {
    /// Joint TLB, set/way organised and software refilled
    Jtlb = 0,
    /// Locked TLB, fully associative, never evicted by refills
    Ltlb = 1,
}

impl TlbBuffer {
    /// Decode the MMC.SB bit
    pub const fn from_bit(bit: u64) -> Self {
        if bit & 1 == 0 { TlbBuffer::Jtlb } else { TlbBuffer::Ltlb }
    }

    /// Value to program in MMC.SB
    pub const fn bit(self) -> u64 {
        self as u64
    }
}

impl fmt::Display for TlbBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TlbBuffer::Jtlb => write!(f, "JTLB"),
            TlbBuffer::Ltlb => write!(f, "LTLB"),
        }
    }
}

/// Set of CPUs, one bit per CPU id
///
/// Used both for the per-mm "CPUs this mm ever ran on" mask and for IPI
/// targets.
#[derive(Clone, Copy, PartialEq, Eq, Default, Hash)]
#[repr(transparent)]
pub struct CpuMask(u64);

impl CpuMask {
    /// Mask with no CPU set
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Mask with CPUs `0..nr_cpus` set
    pub const fn first(nr_cpus: usize) -> Self {
        if nr_cpus >= NR_CPUS {
            Self(u64::MAX)
        } else {
            Self((1u64 << nr_cpus) - 1)
        }
    }

    /// Mask with only `cpu` set
    pub const fn of(cpu: CpuId) -> Self {
        Self(1u64 << cpu)
    }

    /// Build a mask from its raw bits
    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    /// Raw bits
    pub const fn bits(self) -> u64 {
        self.0
    }

    /// Add `cpu` to the mask
    pub fn set(&mut self, cpu: CpuId) {
        self.0 |= 1u64 << cpu;
    }

    /// Remove `cpu` from the mask
    pub fn clear(&mut self, cpu: CpuId) {
        self.0 &= !(1u64 << cpu);
    }

    /// Whether `cpu` is in the mask
    pub const fn contains(self, cpu: CpuId) -> bool {
        cpu < NR_CPUS && self.0 & (1u64 << cpu) != 0
    }

    /// Copy of the mask without `cpu`
    pub const fn without(self, cpu: CpuId) -> Self {
        Self(self.0 & !(1u64 << cpu))
    }

    /// Intersection of two masks
    pub const fn and(self, other: CpuMask) -> Self {
        Self(self.0 & other.0)
    }

    /// Whether no CPU is set
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Number of CPUs in the mask
    pub const fn weight(self) -> u32 {
        self.0.count_ones()
    }

    /// Iterate over the CPU ids in ascending order
    pub fn iter(self) -> CpuMaskIter {
        CpuMaskIter(self.0)
    }
}

impl fmt::Debug for CpuMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

impl IntoIterator for CpuMask {
    type Item = CpuId;
    type IntoIter = CpuMaskIter;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Iterator over the CPUs of a [`CpuMask`]
pub struct CpuMaskIter(u64);

impl Iterator for CpuMaskIter {
    type Item = CpuId;

    fn next(&mut self) -> Option<CpuId> {
        if self.0 == 0 {
            return None;
        }
        let cpu = self.0.trailing_zeros() as CpuId;
        self.0 &= self.0 - 1;
        Some(cpu)
    }
}
