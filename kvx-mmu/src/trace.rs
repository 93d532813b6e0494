//! TLB access trace
//!
//! When enabled, every `tlbread`, `tlbwrite` and `tlbprobe` issued by the
//! management code is recorded, together with the entry registers and
//! `$mmc` at the time of the access, in a small per-CPU ring buffer. It is
//! meant to be inspected after a fatal TLB error.

use heapless::HistoryBuffer;

use crate::entry::TlbEntry;
use crate::hw::TlbHardware;
use crate::sfr::Mmc;

/// Number of accesses kept per CPU
pub const TLB_ACCESS_SIZE: usize = 1 << 7;

/// Kind of TLB instruction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlbAccessKind {
    /// `tlbread`
    Read,
    /// `tlbwrite`
    Write,
    /// `tlbprobe`
    Probe,
}

/// One recorded TLB instruction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TlbAccess {
    pub kind: TlbAccessKind,
    pub entry: TlbEntry,
    pub mmc: Mmc,
}

/// Ring buffer of the last TLB accesses of a CPU
pub struct TlbAccessLog {
    ring: HistoryBuffer<TlbAccess, TLB_ACCESS_SIZE>,
    total: u64,
}

impl Default for TlbAccessLog {
    fn default() -> Self {
        Self::new()
    }
}

impl TlbAccessLog {
    pub const fn new() -> Self {
        Self {
            ring: HistoryBuffer::new(),
            total: 0,
        }
    }

    fn record(&mut self, kind: TlbAccessKind, entry: TlbEntry, mmc: Mmc) {
        self.ring.write(TlbAccess { kind, entry, mmc });
        self.total += 1;
    }

    /// Most recent access
    pub fn last(&self) -> Option<&TlbAccess> {
        self.ring.recent()
    }

    /// Number of accesses currently held
    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.len() == 0
    }

    /// Number of accesses recorded since boot, including overwritten ones
    pub fn total(&self) -> u64 {
        self.total
    }

    /// Held accesses, oldest first
    pub fn iter(&self) -> impl Iterator<Item = &TlbAccess> + '_ {
        self.ring.oldest_ordered()
    }
}

/// TLB hardware recording each instruction into an optional log
pub(crate) struct TracedTlb<'a, H: TlbHardware> {
    hw: &'a mut H,
    log: Option<&'a mut TlbAccessLog>,
}

impl<'a, H: TlbHardware> TracedTlb<'a, H> {
    pub(crate) fn new(hw: &'a mut H, log: Option<&'a mut TlbAccessLog>) -> Self {
        Self { hw, log }
    }

    fn trace(&mut self, kind: TlbAccessKind) {
        if let Some(log) = self.log.as_deref_mut() {
            log.record(kind, self.hw.entry(), self.hw.mmc());
        }
    }
}

impl<H: TlbHardware> TlbHardware for TracedTlb<'_, H> {
    fn mmc(&self) -> Mmc {
        self.hw.mmc()
    }

    fn set_mmc(&mut self, mmc: Mmc) {
        self.hw.set_mmc(mmc);
    }

    fn entry(&self) -> TlbEntry {
        self.hw.entry()
    }

    fn set_entry(&mut self, entry: TlbEntry) {
        self.hw.set_entry(entry);
    }

    fn tlbread(&mut self) {
        self.trace(TlbAccessKind::Read);
        self.hw.tlbread();
    }

    fn tlbwrite(&mut self) {
        self.trace(TlbAccessKind::Write);
        self.hw.tlbwrite();
    }

    fn tlbprobe(&mut self) {
        self.trace(TlbAccessKind::Probe);
        self.hw.tlbprobe();
    }
}
