//! Hardware TLB interface
//!
//! The TLB is driven through three registers (`$mmc`, `$tel`, `$teh`) and
//! three instructions (`tlbread`, `tlbwrite`, `tlbprobe`). Everything above
//! this trait is plain software and can run against [`crate::sim::SimulatedTlb`].
//!
//! Every sequence built from these primitives must run with local
//! interrupts disabled.

use kvx_api::TlbBuffer;

use crate::entry::TlbEntry;
use crate::sfr::{MMC_ASN, MMC_E, MMC_PAR, MMC_SB, MMC_SS, MMC_SW, Mmc, SfrField};

/// TLB registers and instructions of one CPU
pub trait TlbHardware {
    /// Read `$mmc`
    fn mmc(&self) -> Mmc;

    /// Write `$mmc`
    fn set_mmc(&mut self, mmc: Mmc);

    /// Read `$tel` and `$teh`
    fn entry(&self) -> TlbEntry;

    /// Write `$tel` and `$teh`
    fn set_entry(&mut self, entry: TlbEntry);

    /// `tlbread`: load the slot selected by MMC.SB/SS/SW into TEL/TEH
    fn tlbread(&mut self);

    /// `tlbwrite`: store TEL/TEH into the selected buffer and way
    ///
    /// For the JTLB the set is derived from TEH.PN and TEL.PS.
    fn tlbwrite(&mut self);

    /// `tlbprobe`: look up TEH.PN under MMC.ASN
    ///
    /// On a hit TEL/TEH hold the entry and MMC.SB/SS/SW locate it. On a
    /// miss MMC.E is raised.
    fn tlbprobe(&mut self);

    /// Update one `$mmc` field (`sfr_set_field`)
    fn set_mmc_field(&mut self, field: SfrField, value: u64) {
        let mmc = self.mmc().with(field, value);
        self.set_mmc(mmc);
    }

    /// Select the buffer targeted by the next TLB instruction
    fn select_buffer(&mut self, buffer: TlbBuffer) {
        self.set_mmc_field(MMC_SB, buffer.bit());
    }

    /// Select the way targeted by the next TLB instruction
    fn select_way(&mut self, way: usize) {
        self.set_mmc_field(MMC_SW, way as u64);
    }

    /// Select the set read by the next `tlbread`
    fn select_set(&mut self, set: usize) {
        self.set_mmc_field(MMC_SS, set as u64);
    }

    /// Program the ASN used by lookups
    fn set_asn(&mut self, asn: u32) {
        self.set_mmc_field(MMC_ASN, asn as u64);
    }

    /// Acknowledge a TLB error
    fn clear_error(&mut self) {
        self.set_mmc_field(MMC_E, 0);
    }

    /// Acknowledge a parity error
    fn clear_parity(&mut self) {
        self.set_mmc_field(MMC_PAR, 0);
    }

    /// Whether the last TLB instruction failed
    fn error(&self) -> bool {
        self.mmc().error()
    }

    /// Write `entry` into `way` of `buffer` (`kvx_mmu_add_entry`)
    ///
    /// The caller checks MMC.E afterwards.
    fn add_entry(&mut self, buffer: TlbBuffer, way: usize, entry: TlbEntry) {
        self.select_buffer(buffer);
        self.select_way(way);
        self.set_entry(entry);
        self.tlbwrite();
    }
}
