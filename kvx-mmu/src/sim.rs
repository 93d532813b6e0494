//! Software TLB
//!
//! Behaves like the KVX TLB controller as seen through `$mmc`/`$tel`/`$teh`:
//!
//! - a JTLB write goes to the set derived from TEH.PN and TEL.PS, in the
//!   way selected by MMC.SW
//! - an LTLB write goes to the slot selected by MMC.SW
//! - a probe scans the LTLB then the JTLB for a valid entry containing
//!   TEH.PN that is either global or tagged with MMC.ASN
//!
//! Faults can be injected to exercise the error paths.

use kvx_api::TlbBuffer;

use crate::entry::TlbEntry;
use crate::hw::TlbHardware;
use crate::sfr::{MMC_E, MMC_PAR, MMC_SB, MMC_SS, MMC_SW, Mmc};
use crate::tlb_defs::{MMU_JTLB_SET_MASK, MMU_JTLB_SETS, MMU_JTLB_WAYS, MMU_LTLB_WAYS};

/// Simulated TLB controller of one CPU
#[derive(Debug, Clone)]
pub struct SimulatedTlb {
    mmc: Mmc,
    regs: TlbEntry,
    jtlb: [[TlbEntry; MMU_JTLB_WAYS]; MMU_JTLB_SETS],
    ltlb: [TlbEntry; MMU_LTLB_WAYS],
    failing_writes: usize,
    parity_pending: bool,
    writes: usize,
    probes: usize,
}

impl Default for SimulatedTlb {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedTlb {
    /// Empty TLB, every slot invalid
    pub const fn new() -> Self {
        Self {
            mmc: Mmc(0),
            regs: TlbEntry::EMPTY,
            jtlb: [[TlbEntry::EMPTY; MMU_JTLB_WAYS]; MMU_JTLB_SETS],
            ltlb: [TlbEntry::EMPTY; MMU_LTLB_WAYS],
            failing_writes: 0,
            parity_pending: false,
            writes: 0,
            probes: 0,
        }
    }

    /// Make the next `count` writes report an error
    pub fn fail_next_writes(&mut self, count: usize) {
        self.failing_writes = count;
    }

    /// Make the next probe report a parity error
    pub fn inject_parity_error(&mut self) {
        self.parity_pending = true;
    }

    /// Content of a JTLB slot
    pub fn jtlb_entry(&self, set: usize, way: usize) -> TlbEntry {
        self.jtlb[set][way]
    }

    /// Content of an LTLB slot
    pub fn ltlb_entry(&self, slot: usize) -> TlbEntry {
        self.ltlb[slot]
    }

    /// Preload an LTLB slot, as the boot code does before the MMU is set up
    pub fn preload_ltlb(&mut self, slot: usize, entry: TlbEntry) {
        self.ltlb[slot] = entry;
    }

    /// Number of valid JTLB entries
    pub fn jtlb_valid_count(&self) -> usize {
        self.jtlb.iter().flatten().filter(|e| e.is_valid()).count()
    }

    /// Number of `tlbwrite` issued so far
    pub fn writes(&self) -> usize {
        self.writes
    }

    /// Number of `tlbprobe` issued so far
    pub fn probes(&self) -> usize {
        self.probes
    }

    /// Translate `vaddr` under `asn` without touching the registers
    pub fn lookup(&self, vaddr: u64, asn: u32) -> Option<(TlbBuffer, TlbEntry)> {
        self.find(vaddr, asn).map(|(buffer, set, way)| {
            let entry = match buffer {
                TlbBuffer::Ltlb => self.ltlb[way],
                TlbBuffer::Jtlb => self.jtlb[set][way],
            };
            (buffer, entry)
        })
    }

    fn find(&self, vaddr: u64, asn: u32) -> Option<(TlbBuffer, usize, usize)> {
        let hit = |e: &TlbEntry| e.is_valid() && e.contains(vaddr) && (e.global().is_global() || e.asn() == asn);

        if let Some(way) = self.ltlb.iter().position(hit) {
            return Some((TlbBuffer::Ltlb, 0, way));
        }

        self.jtlb.iter().enumerate().find_map(|(set, ways)| {
            ways.iter().position(hit).map(|way| (TlbBuffer::Jtlb, set, way))
        })
    }

    fn raise_error(&mut self, error: bool) {
        self.mmc = self.mmc.with(MMC_E, error as u64);
    }
}

impl TlbHardware for SimulatedTlb {
    fn mmc(&self) -> Mmc {
        self.mmc
    }

    fn set_mmc(&mut self, mmc: Mmc) {
        self.mmc = mmc;
    }

    fn entry(&self) -> TlbEntry {
        self.regs
    }

    fn set_entry(&mut self, entry: TlbEntry) {
        self.regs = entry;
    }

    fn tlbread(&mut self) {
        let way = self.mmc.way();
        let entry = match self.mmc.buffer() {
            TlbBuffer::Ltlb => self.ltlb.get(way).copied(),
            TlbBuffer::Jtlb => self
                .jtlb
                .get(self.mmc.set())
                .and_then(|ways| ways.get(way))
                .copied(),
        };

        match entry {
            Some(entry) => {
                self.regs = entry;
                self.raise_error(false);
            }
            None => self.raise_error(true),
        }
    }

    fn tlbwrite(&mut self) {
        self.writes += 1;

        if self.failing_writes > 0 {
            self.failing_writes -= 1;
            self.raise_error(true);
            return;
        }

        let way = self.mmc.way();
        let entry = self.regs;
        let slot = match self.mmc.buffer() {
            TlbBuffer::Ltlb => self.ltlb.get_mut(way),
            TlbBuffer::Jtlb => {
                let set = (entry.virt() >> entry.page_size().shift()) as usize & MMU_JTLB_SET_MASK;
                self.jtlb[set].get_mut(way)
            }
        };

        match slot {
            Some(slot) => {
                *slot = entry;
                self.raise_error(false);
            }
            None => self.raise_error(true),
        }
    }

    fn tlbprobe(&mut self) {
        self.probes += 1;

        if self.parity_pending {
            self.parity_pending = false;
            self.mmc = self.mmc.with(MMC_PAR, 1).with(MMC_E, 1);
            return;
        }

        match self.find(self.regs.virt(), self.mmc.asn()) {
            Some((buffer, set, way)) => {
                self.regs = match buffer {
                    TlbBuffer::Ltlb => self.ltlb[way],
                    TlbBuffer::Jtlb => self.jtlb[set][way],
                };
                self.mmc = self
                    .mmc
                    .with(MMC_SB, buffer.bit())
                    .with(MMC_SS, set as u64)
                    .with(MMC_SW, way as u64)
                    .with(MMC_E, 0);
            }
            None => self.raise_error(true),
        }
    }
}
