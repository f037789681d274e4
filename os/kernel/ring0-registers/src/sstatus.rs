use bitfield_struct::bitfield;

/// Floating-point unit state as tracked by `sstatus.FS`.
///
/// Software uses `Off` to trap the first FP instruction and `Dirty` to learn
/// whether the register file must be saved.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[repr(u8)]
pub enum FpStatus {
    /// Any FP instruction raises an illegal-instruction exception.
    Off = 0,
    /// FP registers hold their initial values.
    Initial = 1,
    /// FP registers match the last saved state.
    Clean = 2,
    /// FP registers were modified since the last save.
    Dirty = 3,
}

impl FpStatus {
    const fn into_bits(self) -> u8 {
        self as u8
    }

    const fn from_bits(value: u8) -> Self {
        match value & 0b11 {
            0 => Self::Off,
            1 => Self::Initial,
            2 => Self::Clean,
            _ => Self::Dirty,
        }
    }
}

/// `sstatus`: Supervisor Status Register (RV64).
#[bitfield(u64)]
pub struct Sstatus {
    #[bits(1)]
    __: u8,

    /// Bit 1: SIE: supervisor interrupts enabled.
    pub sie: bool,

    #[bits(3)]
    __: u8,

    /// Bit 5: SPIE: SIE value before the trap was taken.
    pub spie: bool,

    /// Bit 6: UBE: big-endian user memory accesses.
    pub ube: bool,

    #[bits(1)]
    __: u8,

    /// Bit 8: SPP: privilege the trap was taken from (`true` = supervisor).
    ///
    /// `sret` returns to user mode when this bit is clear.
    pub spp: bool,

    /// Bits 9–10: VS: vector unit state.
    #[bits(2)]
    pub vs: u8,

    #[bits(2)]
    __: u8,

    /// Bits 13–14: FS: floating-point unit state.
    #[bits(2)]
    pub fs: FpStatus,

    /// Bits 15–16: XS: summary of additional user extension state.
    #[bits(2)]
    pub xs: u8,

    #[bits(1)]
    __: u8,

    /// Bit 18: SUM: permit supervisor access to user pages.
    pub sum: bool,

    /// Bit 19: MXR: make executable pages readable.
    pub mxr: bool,

    #[bits(12)]
    __: u16,

    /// Bits 32–33: UXL: user XLEN (2 = 64-bit).
    #[bits(2)]
    pub uxl: u8,

    #[bits(29)]
    __: u32,

    /// Bit 63: SD: FS, VS or XS is dirty.
    pub sd: bool,
}

impl Sstatus {
    /// Status word for entering user mode with interrupts enabled on return.
    ///
    /// Clears `SPP` so that `sret` drops to user mode and sets `SPIE` so that
    /// supervisor interrupts are taken while user code runs.
    #[must_use]
    pub const fn for_user_entry(self) -> Self {
        self.with_spp(false).with_spie(true).with_sum(false)
    }

    /// Returns `true` if the trap was taken from user mode.
    #[must_use]
    pub const fn from_user(&self) -> bool {
        !self.spp()
    }
}

#[cfg(all(feature = "asm", target_arch = "riscv64"))]
impl crate::LoadRegisterUnsafe for Sstatus {
    unsafe fn load_unsafe() -> Self {
        let sstatus: u64;
        unsafe {
            core::arch::asm!("csrr {}, sstatus", out(reg) sstatus, options(nomem, nostack));
        }
        Self::from_bits(sstatus)
    }
}

#[cfg(all(feature = "asm", target_arch = "riscv64"))]
impl crate::StoreRegisterUnsafe for Sstatus {
    unsafe fn store_unsafe(self) {
        let sstatus = self.into_bits();
        unsafe {
            core::arch::asm!("csrw sstatus, {}", in(reg) sstatus, options(nostack));
        }
    }
}
