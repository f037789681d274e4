//! Seams to the privileged primitives a [`Cpu`](crate::Cpu) drives.
//!
//! The trusted implementation lives in [`crate::riscv64`]; tests script
//! their own.

use crate::registers::{FpState, Registers};

/// The transition into sandboxed execution and back.
pub trait Hardware {
    /// Run `frame` under the translation root `root` until the next trap.
    ///
    /// On return `frame` holds the trapped context, including `sstatus`,
    /// `scause` and `stval`.
    fn enter_sandboxed(&mut self, root: u64, frame: &mut Registers);

    /// Address of the trap vector that brings control back.
    fn entry_point_address(&self) -> u64;
}

/// Loading and saving the floating-point register file.
pub trait FloatingPoint {
    fn save(&mut self, state: &mut FpState);
    fn load(&mut self, state: &FpState);
}
