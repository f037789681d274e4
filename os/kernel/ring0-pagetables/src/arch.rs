//! Architecture descriptors.
//!
//! An [`Arch`] ties an entry codec to the translation-root register that
//! consumes it. [`HostArch`] is the build-time selection for the target.

use ring0_registers::{Cr3, Satp, SatpMode, Ttbr0};

use crate::addresses::PhysicalAddress;
use crate::entry::{Arm64Entry, PageTableEntry, Sv48Entry, X86Entry};

pub trait Arch: Send + Sync + 'static {
    /// Entry codec of every level.
    type Entry: PageTableEntry;

    const NAME: &'static str;

    /// Largest usable address-space tag.
    const ASID_LIMIT: u16;

    /// Value for the translation-base register.
    ///
    /// `no_flush` asks hardware that supports it to keep cached translations
    /// for `asid`; it is ignored elsewhere.
    fn translation_root(root: PhysicalAddress, asid: u16, no_flush: bool) -> u64;
}

/// RISC-V with Sv48 translation.
#[derive(Debug, Copy, Clone, Default)]
pub struct Riscv64;

/// x86-64 with 4-level paging and PCIDs.
#[derive(Debug, Copy, Clone, Default)]
pub struct X86_64;

/// ARMv8-A with a 4 KiB granule and 48-bit input addresses.
#[derive(Debug, Copy, Clone, Default)]
pub struct Arm64;

impl Arch for Riscv64 {
    type Entry = Sv48Entry;

    const NAME: &'static str = "riscv64";
    const ASID_LIMIT: u16 = 4095;

    fn translation_root(root: PhysicalAddress, asid: u16, _no_flush: bool) -> u64 {
        Satp::from_root(root.as_u64(), asid, SatpMode::Sv48).into_bits()
    }
}

impl Arch for X86_64 {
    type Entry = X86Entry;

    const NAME: &'static str = "x86_64";
    const ASID_LIMIT: u16 = 4095;

    fn translation_root(root: PhysicalAddress, asid: u16, no_flush: bool) -> u64 {
        Cr3::from_pml4_phys(root.as_u64(), asid, no_flush).into_bits()
    }
}

impl Arch for Arm64 {
    type Entry = Arm64Entry;

    const NAME: &'static str = "arm64";
    const ASID_LIMIT: u16 = 255;

    fn translation_root(root: PhysicalAddress, asid: u16, _no_flush: bool) -> u64 {
        Ttbr0::from_table(root.as_u64(), asid).into_bits()
    }
}

#[cfg(target_arch = "x86_64")]
pub type HostArch = X86_64;

#[cfg(target_arch = "aarch64")]
pub type HostArch = Arm64;

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
pub type HostArch = Riscv64;
