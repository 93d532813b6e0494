//! KVX MMU API - Shared types and interfaces for the KVX TLB layer
//!
//! This crate provides the plain types, the error taxonomy and the
//! collaborator interfaces used between the TLB management layer and the
//! rest of the kernel (scheduler, page-fault handler, device drivers).
//!
//! # Architecture
//!
//! - **Types**: CPU ids, aggregating CPU masks, address-space ids and the
//!   TLB buffer selector
//! - **Memory**: page granularity helpers
//! - **Error**: fatal and recoverable MMU errors
//! - **Irq**: local interrupt masking capability
//! - **Ipi**: fixed-function inter-processor interrupt doorbell
//!
//! # Usage
//!
//! ```rust
//! use kvx_api::{CpuMask, IrqGuard, NoopIrq};
//!
//! let irq = NoopIrq;
//! let _guard = IrqGuard::new(&irq);
//!
//! let mut mask = CpuMask::empty();
//! mask.set(3);
//! assert!(mask.contains(3));
//! ```

#![cfg_attr(not(any(test, feature = "std")), no_std)]

pub mod error;
pub mod ipi;
pub mod irq;
pub mod memory;
pub mod types;

pub use crate::error::{FatalMmuError, MmuError};
pub use crate::ipi::{IpiDoorbell, NoopDoorbell};
pub use crate::irq::{CountingIrq, IrqControl, IrqFlags, IrqGuard, NoopIrq};
pub use crate::memory::{PAGE_MASK, PAGE_SHIFT, PAGE_SIZE, is_aligned, page_round_down};
pub use crate::types::{CpuId, CpuMask, MmId, NR_CPUS, TlbBuffer};
