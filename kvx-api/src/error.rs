//! MMU error taxonomy
//!
//! The TLB layer distinguishes two kinds of failures:
//!
//! - [`FatalMmuError`]: the hardware disagrees with what software just wrote,
//!   or a collaborator broke a contract (misaligned mapping, removal of a
//!   mapping that was never added, ...). The kernel stops on these.
//! - [`MmuError`]: recoverable outcomes such as a probe that found nothing.
//!   A fatal error can travel through `MmuError::Fatal` so `?` keeps working.

use core::fmt;

use crate::types::{CpuId, TlbBuffer};

/// Conditions after which no safe continuation exists
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatalMmuError {
    /// Writing a refilled entry into the JTLB raised MMC.E
    JtlbWriteFailed {
        /// Virtual address being mapped
        addr: u64,
        /// JTLB set
        set: usize,
        /// JTLB way
        way: usize,
    },
    /// Invalidating a JTLB slot during a full flush raised MMC.E
    JtlbResetFailed {
        /// JTLB set
        set: usize,
        /// JTLB way
        way: usize,
    },
    /// Writing a locked entry raised MMC.E
    LtlbWriteFailed {
        /// Virtual address being mapped
        vaddr: u64,
        /// LTLB slot
        slot: usize,
    },
    /// A probed entry could not be invalidated
    ClearFailed {
        /// Probed address
        addr: u64,
        /// ASN used for the probe
        asn: u32,
    },
    /// LTLB mapping not aligned on its page size
    MisalignedMapping {
        /// Virtual address
        vaddr: u64,
        /// Physical address
        paddr: u64,
        /// Page size of the mapping
        size: u64,
    },
    /// New LTLB mapping overlaps an existing locked mapping
    LtlbOverlap {
        /// Virtual address of the new mapping
        vaddr: u64,
    },
    /// JTLB refill overlaps an existing locked mapping
    RefillOverlapsLtlb {
        /// Virtual address of the refilled entry
        addr: u64,
    },
    /// Every non-fixed LTLB slot is in use
    LtlbFull {
        /// Virtual address that could not be mapped
        vaddr: u64,
    },
    /// Removal of a locked mapping that was never added
    LtlbEntryNotFound {
        /// Virtual address requested
        vaddr: u64,
    },
    /// Locked mapping found in the shadow table but not removable from hardware
    LtlbRemoveFailed {
        /// Virtual address requested
        vaddr: u64,
    },
    /// User refill without an assigned ASN
    MissingAsn {
        /// Faulting address
        addr: u64,
        /// CPU running the refill
        cpu: CpuId,
    },
    /// ASN of the refilled mm does not match MMC.ASN
    AsnOutOfSync {
        /// ASN tag of the mm
        asn: u32,
        /// ASN currently programmed in MMC
        mmc_asn: u32,
    },
    /// CPU id outside of the managed CPUs
    InvalidCpu {
        /// Offending CPU id
        cpu: CpuId,
    },
}

impl fmt::Display for FatalMmuError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FatalMmuError::JtlbWriteFailed { addr, set, way } => write!(
                f,
                "Failed to write entry to the JTLB (addr {:#x}, set {}, way {})",
                addr, set, way
            ),
            FatalMmuError::JtlbResetFailed { set, way } => {
                write!(f, "Failed to initialize JTLB[s:{:02} w:{}]", set, way)
            }
            FatalMmuError::LtlbWriteFailed { vaddr, slot } => write!(
                f,
                "Failed to write entry to the LTLB (vaddr {:#x}, slot {})",
                vaddr, slot
            ),
            FatalMmuError::ClearFailed { addr, asn } => {
                write!(f, "Failed to clear entry (addr {:#x}, asn {})", addr, asn)
            }
            FatalMmuError::MisalignedMapping { vaddr, paddr, size } => write!(
                f,
                "LTLB mapping {:#x} -> {:#x} is not aligned on {:#x}",
                vaddr, paddr, size
            ),
            FatalMmuError::LtlbOverlap { vaddr } => {
                write!(f, "VA {:#x} overlaps with an existing LTLB mapping", vaddr)
            }
            FatalMmuError::RefillOverlapsLtlb { addr } => write!(
                f,
                "Refill of VA {:#x} overlaps with an existing LTLB mapping",
                addr
            ),
            FatalMmuError::LtlbFull { vaddr } => {
                write!(f, "No free LTLB slot to map VA {:#x}", vaddr)
            }
            FatalMmuError::LtlbEntryNotFound { vaddr } => write!(
                f,
                "Trying to remove non-existent LTLB entry for addr {:#x}",
                vaddr
            ),
            FatalMmuError::LtlbRemoveFailed { vaddr } => {
                write!(f, "Failed to remove LTLB entry for addr {:#x}", vaddr)
            }
            FatalMmuError::MissingAsn { addr, cpu } => write!(
                f,
                "ASN is not properly set for address {:#x} on CPU {}",
                addr, cpu
            ),
            FatalMmuError::AsnOutOfSync { asn, mmc_asn } => write!(
                f,
                "ASN not synchronized with MMC: asn:{} != mmc.asn:{}",
                asn, mmc_asn
            ),
            FatalMmuError::InvalidCpu { cpu } => write!(f, "CPU {} is not managed", cpu),
        }
    }
}

/// Error returned by TLB operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MmuError {
    /// Probe found no matching entry
    NotFound,
    /// Probe found the entry in the other TLB buffer
    WrongBuffer {
        /// Buffer the entry was found in
        found: TlbBuffer,
    },
    /// An identical locked mapping already exists
    AlreadyMapped {
        /// Virtual address of the mapping
        vaddr: u64,
    },
    /// Unrecoverable condition
    Fatal(FatalMmuError),
}

impl MmuError {
    /// Whether this error must stop the machine
    pub const fn is_fatal(&self) -> bool {
        matches!(self, MmuError::Fatal(_))
    }

    /// Keep only the fatal part of the error
    ///
    /// Expected races (entry already evicted, entry living in the other
    /// buffer) map to `None`.
    pub const fn into_fatal(self) -> Option<FatalMmuError> {
        match self {
            MmuError::Fatal(err) => Some(err),
            _ => None,
        }
    }
}

impl From<FatalMmuError> for MmuError {
    fn from(err: FatalMmuError) -> Self {
        MmuError::Fatal(err)
    }
}

impl fmt::Display for MmuError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MmuError::NotFound => write!(f, "No matching TLB entry"),
            MmuError::WrongBuffer { found } => write!(f, "Entry found in {}", found),
            MmuError::AlreadyMapped { vaddr } => {
                write!(f, "VA {:#x} is already mapped in the LTLB", vaddr)
            }
            MmuError::Fatal(err) => write!(f, "Fatal MMU error: {}", err),
        }
    }
}

impl core::error::Error for FatalMmuError {}
impl core::error::Error for MmuError {}
