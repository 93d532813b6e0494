//! Local interrupt masking
//!
//! TLB register sequences (select, load TEL/TEH, probe/write, check MMC)
//! are not atomic. A nested trap touching the same registers would corrupt
//! them, so every sequence runs between `local_irq_save` and
//! `local_irq_restore` on the executing CPU.

use core::sync::atomic::{AtomicUsize, Ordering};

/// Saved interrupt state, as returned by `local_irq_save`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(transparent)]
pub struct IrqFlags(pub u64);

/// Capability to mask interrupts on the executing CPU
pub trait IrqControl: Send + Sync {
    /// Disable local interrupts and return the previous state
    fn local_irq_save(&self) -> IrqFlags;

    /// Restore the state saved by [`IrqControl::local_irq_save`]
    fn local_irq_restore(&self, flags: IrqFlags);
}

/// Interrupts disabled for the lifetime of the guard
pub struct IrqGuard<'a> {
    irq: &'a dyn IrqControl,
    flags: IrqFlags,
}

impl<'a> IrqGuard<'a> {
    /// Save and disable local interrupts
    pub fn new(irq: &'a dyn IrqControl) -> Self {
        let flags = irq.local_irq_save();
        Self { irq, flags }
    }
}

impl Drop for IrqGuard<'_> {
    fn drop(&mut self) {
        self.irq.local_irq_restore(self.flags);
    }
}

/// Interrupt control for hosted builds where there is nothing to mask
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopIrq;

impl IrqControl for NoopIrq {
    fn local_irq_save(&self) -> IrqFlags {
        IrqFlags(0)
    }

    fn local_irq_restore(&self, _flags: IrqFlags) {}
}

/// Interrupt control that counts nested critical sections
///
/// Lets tests check that TLB sequences run masked.
#[derive(Debug, Default)]
pub struct CountingIrq {
    depth: AtomicUsize,
    sections: AtomicUsize,
}

impl CountingIrq {
    /// Create a counter with interrupts enabled
    pub const fn new() -> Self {
        Self {
            depth: AtomicUsize::new(0),
            sections: AtomicUsize::new(0),
        }
    }

    /// Current nesting depth (0 means interrupts enabled)
    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::Acquire)
    }

    /// Number of critical sections entered so far
    pub fn sections(&self) -> usize {
        self.sections.load(Ordering::Acquire)
    }
}

impl IrqControl for CountingIrq {
    fn local_irq_save(&self) -> IrqFlags {
        self.sections.fetch_add(1, Ordering::AcqRel);
        let previous = self.depth.fetch_add(1, Ordering::AcqRel);
        IrqFlags(previous as u64)
    }

    fn local_irq_restore(&self, flags: IrqFlags) {
        self.depth.store(flags.0 as usize, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guard_restores_depth() {
        let irq = CountingIrq::new();
        {
            let _outer = IrqGuard::new(&irq);
            assert_eq!(irq.depth(), 1);
            {
                let _inner = IrqGuard::new(&irq);
                assert_eq!(irq.depth(), 2);
            }
            assert_eq!(irq.depth(), 1);
        }
        assert_eq!(irq.depth(), 0);
        assert_eq!(irq.sections(), 2);
    }
}
