//! MMU special function registers
//!
//! Field layout of `$mmc`, plus the generic field helpers mirroring the
//! `sfr_get`/`sfr_set_field` accessors of the hardware.

use core::fmt;

use kvx_api::TlbBuffer;

/// Description of a register field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SfrField {
    /// Position of the least significant bit
    pub shift: u32,
    /// Width in bits
    pub width: u32,
}

impl SfrField {
    /// Field of `width` bits starting at `shift`
    pub const fn new(shift: u32, width: u32) -> Self {
        Self { shift, width }
    }

    /// In-place mask of the field
    pub const fn mask(self) -> u64 {
        ((1u64 << self.width) - 1) << self.shift
    }

    /// Extract the field from a register value
    pub const fn get(self, reg: u64) -> u64 {
        (reg & self.mask()) >> self.shift
    }

    /// Replace the field in a register value
    pub const fn set(self, reg: u64, value: u64) -> u64 {
        (reg & !self.mask()) | ((value << self.shift) & self.mask())
    }
}

/// MMC.ASN: current address space number
pub const MMC_ASN: SfrField = SfrField::new(0, 9);
/// MMC.S: speculative access enable
pub const MMC_S: SfrField = SfrField::new(9, 1);
/// MMC.SNE: speculative NOMAPPING enable
pub const MMC_SNE: SfrField = SfrField::new(14, 1);
/// MMC.SPE: speculative protection enable
pub const MMC_SPE: SfrField = SfrField::new(15, 1);
/// MMC.PTC: protection trap cause
pub const MMC_PTC: SfrField = SfrField::new(16, 2);
/// MMC.SW: selected way
pub const MMC_SW: SfrField = SfrField::new(18, 4);
/// MMC.SS: selected set
pub const MMC_SS: SfrField = SfrField::new(22, 6);
/// MMC.SB: selected buffer
pub const MMC_SB: SfrField = SfrField::new(28, 1);
/// MMC.PAR: parity error
pub const MMC_PAR: SfrField = SfrField::new(30, 1);
/// MMC.E: error on the last TLB instruction
pub const MMC_E: SfrField = SfrField::new(31, 1);

/// Width of the ASN field
pub const MMC_ASN_WIDTH: u32 = MMC_ASN.width;

/// Value of the `$mmc` register
#[derive(Clone, Copy, PartialEq, Eq, Default)]
#[repr(transparent)]
pub struct Mmc(pub u64);

impl Mmc {
    /// Raw register value
    pub const fn bits(self) -> u64 {
        self.0
    }

    /// Current ASN
    pub const fn asn(self) -> u32 {
        MMC_ASN.get(self.0) as u32
    }

    /// Selected way
    pub const fn way(self) -> usize {
        MMC_SW.get(self.0) as usize
    }

    /// Selected set
    pub const fn set(self) -> usize {
        MMC_SS.get(self.0) as usize
    }

    /// Selected buffer
    pub const fn buffer(self) -> TlbBuffer {
        TlbBuffer::from_bit(MMC_SB.get(self.0))
    }

    /// Whether the last TLB instruction failed
    pub const fn error(self) -> bool {
        MMC_E.get(self.0) != 0
    }

    /// Whether the last lookup hit a parity error
    pub const fn parity(self) -> bool {
        MMC_PAR.get(self.0) != 0
    }

    /// Copy with `field` replaced by `value`
    pub const fn with(self, field: SfrField, value: u64) -> Self {
        Self(field.set(self.0, value))
    }
}

impl fmt::Debug for Mmc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mmc")
            .field("asn", &self.asn())
            .field("sb", &self.buffer())
            .field("ss", &self.set())
            .field("sw", &self.way())
            .field("par", &self.parity())
            .field("e", &self.error())
            .finish()
    }
}
