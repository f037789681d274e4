//! # Typed Translation and Trap Registers
//!
//! Bitfield views of the registers the ring0 core composes or decodes:
//!
//! | Type | Architecture | Role |
//! |------|--------------|------|
//! | [`Satp`] | RISC-V | Translation root (mode, ASID, root PPN) |
//! | [`Sstatus`] | RISC-V | Previous privilege, interrupt enable, FP state |
//! | [`Scause`] | RISC-V | Trap cause (interrupt flag + code) |
//! | [`Cr3`] | x86-64 | Translation root with PCID |
//! | [`Ttbr0`] | ARM64 | Translation root with ASID |
//!
//! Values are plain `u64` words and can be built and inspected on any host.
//! Loading or storing the live `sstatus` is only available with the `asm`
//! feature on `riscv64`.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod cr3;
mod satp;
mod scause;
mod sstatus;
mod ttbr;

pub use crate::cr3::Cr3;
pub use crate::satp::{Satp, SatpMode};
pub use crate::scause::Scause;
pub use crate::sstatus::{FpStatus, Sstatus};
pub use crate::ttbr::Ttbr0;

/// Mask of the in-page offset for 4 KiB frames.
pub(crate) const FRAME_MASK: u64 = 0xfff;

pub trait LoadRegisterUnsafe {
    /// # Safety
    /// The caller must uphold the implementation-specific safety requirements.
    /// Supervisor CSRs such as `sstatus` can only be read in supervisor mode.
    unsafe fn load_unsafe() -> Self;
}

pub trait StoreRegisterUnsafe {
    /// # Safety
    /// The caller must uphold the implementation-specific safety requirements.
    /// Storing `sstatus` can change the interrupt enable and the FPU state of
    /// the running hart.
    unsafe fn store_unsafe(self);
}
