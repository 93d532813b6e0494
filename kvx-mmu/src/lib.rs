//! KVX MMU
//!
//! This crate provides the TLB management layer of the KVX/K1C cores: a
//! software-refilled set-associative JTLB, a small locked LTLB, 9-bit
//! address space numbers with generation-based invalidation, and cross-CPU
//! TLB shootdown.
//!
//! # Architecture
//!
//! - **Codec** ([`entry`], [`tlb_defs`], [`sfr`], [`pte`]): bit-exact TLB
//!   entry, `$mmc` and page table entry formats
//! - **Hardware** ([`hw`], [`sim`]): the TLB register and instruction
//!   interface, and a software TLB implementing it
//! - **ASN** ([`asn`]): per-CPU counters and per-mm contexts
//! - **Per-CPU layer** ([`local`]): refill, probe/clear, local flushes and
//!   context switch for one CPU
//! - **LTLB** ([`ltlb`]): bookkeeping of the locked mappings
//! - **System** ([`smp`]): per-CPU arena, LTLB manager and shootdown
//!   through mailboxes and the IPI doorbell
//!
//! # Usage
//!
//! ```rust
//! use kvx_mmu::{CachePolicy, MmuConfig, MmuSystem, PageSize, Pte, PteFlags, Refill};
//!
//! let mmu = MmuSystem::simulated(MmuConfig::with_cpus(2)).unwrap();
//! let mm = mmu.init_new_context();
//! mmu.switch_mm(0, &mm).unwrap();
//!
//! let mut pte = Pte::new(
//!     0x2,
//!     PteFlags::PRESENT | PteFlags::READ | PteFlags::WRITE,
//!     PageSize::Size4K,
//!     CachePolicy::WriteThroughCached,
//! );
//! let refill = mmu.update_mmu_cache(0, &mm, 0x1000, &mut pte).unwrap();
//! assert!(matches!(refill, Refill::Installed { set: 1, .. }));
//!
//! mmu.smp_flush_tlb_page(0, &mm, 0x1000).unwrap();
//! ```

#![cfg_attr(not(any(test, feature = "std")), no_std)]

pub mod asn;
pub mod config;
pub mod entry;
pub mod hw;
pub mod local;
pub mod ltlb;
pub mod pte;
pub mod sfr;
pub mod sim;
pub mod smp;
pub mod stats;
pub mod tlb_defs;
pub mod trace;

pub use kvx_api::{CpuId, CpuMask, FatalMmuError, MmId, MmuError, TlbBuffer};

pub use crate::asn::{AsnCache, MM_CTXT_NO_ASN, MmContext};
pub use crate::config::MmuConfig;
pub use crate::entry::{TlbEntry, access_permission_from_pte_bits};
pub use crate::hw::TlbHardware;
pub use crate::local::{LocalMmu, Refill};
pub use crate::ltlb::{FixedSlot, LtlbTable};
pub use crate::pte::{PgProt, Pmd, Pte, PteFlags};
pub use crate::sfr::Mmc;
pub use crate::sim::SimulatedTlb;
pub use crate::smp::{FlushRequest, MmuSystem};
pub use crate::stats::{MmuStats, RefillType};
pub use crate::tlb_defs::{CachePolicy, EntryStatus, Global, PageSize, Protection};
pub use crate::trace::{TlbAccess, TlbAccessKind, TlbAccessLog};
