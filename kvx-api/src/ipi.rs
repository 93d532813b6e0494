//! Inter-processor interrupt doorbell
//!
//! The KVX IPI controller is fixed-function: software writes a CPU mask and
//! every CPU in it takes an interrupt. The payload travels separately, through
//! per-CPU mailboxes owned by the TLB layer.

use crate::types::CpuMask;

/// Capability to interrupt a set of CPUs
pub trait IpiDoorbell: Send + Sync {
    /// Raise the TLB shootdown IPI on every CPU of `targets`
    fn raise(&self, targets: CpuMask);
}

/// Doorbell for uniprocessor or polled configurations
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopDoorbell;

impl IpiDoorbell for NoopDoorbell {
    fn raise(&self, _targets: CpuMask) {}
}
