//! Register-file records copied verbatim between the supervisor and the
//! hardware transition primitive.

use core::fmt;

use ring0_registers::{Scause, Sstatus};

/// Number of 64-bit slots in a [`Registers`] frame.
pub const REGISTER_SLOTS: usize = 36;

/// Size in bytes of an [`FpState`] record.
pub const FP_STATE_SIZE: usize = 0x210;

/// RISC-V trap frame.
///
/// | Slot  | Content |
/// |-------|---------|
/// | 0     | `epc` (program counter) |
/// | 1–31  | `x1`–`x31` |
/// | 32    | `sstatus` |
/// | 33    | `stval` (fault address) |
/// | 34    | `scause` |
/// | 35    | `a0` as it was on entry to a syscall |
#[derive(Copy, Clone, PartialEq, Eq)]
#[repr(C)]
pub struct Registers {
    pub regs: [u64; REGISTER_SLOTS],
}

impl Registers {
    pub const EPC: usize = 0;
    pub const RA: usize = 1;
    pub const SP: usize = 2;
    pub const GP: usize = 3;
    pub const TP: usize = 4;
    pub const A0: usize = 10;
    pub const A7: usize = 17;
    pub const STATUS: usize = 32;
    pub const BADADDR: usize = 33;
    pub const CAUSE: usize = 34;
    pub const ORIG_A0: usize = 35;

    #[must_use]
    pub const fn new() -> Self {
        Self {
            regs: [0; REGISTER_SLOTS],
        }
    }

    #[inline]
    #[must_use]
    pub const fn ip(&self) -> u64 {
        self.regs[Self::EPC]
    }

    #[inline]
    pub const fn set_ip(&mut self, ip: u64) {
        self.regs[Self::EPC] = ip;
    }

    #[inline]
    #[must_use]
    pub const fn stack(&self) -> u64 {
        self.regs[Self::SP]
    }

    #[inline]
    pub const fn set_stack(&mut self, sp: u64) {
        self.regs[Self::SP] = sp;
    }

    /// Thread pointer.
    #[inline]
    #[must_use]
    pub const fn tls(&self) -> u64 {
        self.regs[Self::TP]
    }

    #[inline]
    pub const fn set_tls(&mut self, tp: u64) {
        self.regs[Self::TP] = tp;
    }

    #[inline]
    #[must_use]
    pub const fn syscall_number(&self) -> u64 {
        self.regs[Self::A7]
    }

    /// `a0`–`a5`, with `a0` taken from the value it had at the trap.
    #[must_use]
    pub const fn syscall_args(&self) -> [u64; 6] {
        let r = &self.regs;
        [r[Self::ORIG_A0], r[11], r[12], r[13], r[14], r[15]]
    }

    #[inline]
    #[must_use]
    pub const fn return_value(&self) -> u64 {
        self.regs[Self::A0]
    }

    #[inline]
    pub const fn set_return_value(&mut self, value: u64) {
        self.regs[Self::A0] = value;
    }

    #[inline]
    #[must_use]
    pub const fn status(&self) -> Sstatus {
        Sstatus::from_bits(self.regs[Self::STATUS])
    }

    #[inline]
    pub const fn set_status(&mut self, status: Sstatus) {
        self.regs[Self::STATUS] = status.into_bits();
    }

    #[inline]
    #[must_use]
    pub const fn cause(&self) -> Scause {
        Scause::from_bits(self.regs[Self::CAUSE])
    }

    /// Faulting address of the last trap.
    #[inline]
    #[must_use]
    pub const fn bad_addr(&self) -> u64 {
        self.regs[Self::BADADDR]
    }
}

impl Default for Registers {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Registers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registers")
            .field("epc", &format_args!("{:#x}", self.ip()))
            .field("sp", &format_args!("{:#x}", self.stack()))
            .field("a0", &format_args!("{:#x}", self.return_value()))
            .field("a7", &self.syscall_number())
            .field("status", &self.status())
            .field("cause", &self.cause())
            .field("stval", &format_args!("{:#x}", self.bad_addr()))
            .finish_non_exhaustive()
    }
}

/// Floating-point register file of one context.
///
/// `f0`–`f31` are stored as 64-bit values from offset 0, followed by `fcsr`
/// at offset `0x100`. The remainder is reserved for the Q extension layout.
#[derive(Clone, PartialEq, Eq)]
#[repr(C, align(16))]
pub struct FpState {
    data: [u8; FP_STATE_SIZE],
}

impl FpState {
    const FCSR_OFFSET: usize = 0x100;

    #[must_use]
    pub const fn new() -> Self {
        Self {
            data: [0; FP_STATE_SIZE],
        }
    }

    /// An independent copy for a forked context.
    #[must_use]
    pub fn fork(&self) -> Self {
        self.clone()
    }

    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; FP_STATE_SIZE] {
        &self.data
    }

    pub const fn as_mut_bytes(&mut self) -> &mut [u8; FP_STATE_SIZE] {
        &mut self.data
    }

    /// Raw bits of register `f{index}`.
    #[must_use]
    pub fn f(&self, index: usize) -> u64 {
        let offset = index * 8;
        let mut bytes = [0; 8];
        bytes.copy_from_slice(&self.data[offset..offset + 8]);
        u64::from_le_bytes(bytes)
    }

    pub fn set_f(&mut self, index: usize, value: u64) {
        let offset = index * 8;
        self.data[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
    }

    #[must_use]
    pub fn fcsr(&self) -> u32 {
        let mut bytes = [0; 4];
        bytes.copy_from_slice(&self.data[Self::FCSR_OFFSET..Self::FCSR_OFFSET + 4]);
        u32::from_le_bytes(bytes)
    }

    pub fn set_fcsr(&mut self, value: u32) {
        self.data[Self::FCSR_OFFSET..Self::FCSR_OFFSET + 4].copy_from_slice(&value.to_le_bytes());
    }
}

impl Default for FpState {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for FpState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FpState")
            .field("fcsr", &format_args!("{:#x}", self.fcsr()))
            .finish_non_exhaustive()
    }
}
