//! ARMv8-A stage-1 descriptors, 4 KiB granule.
//!
//! Level-3 page descriptors and level-0..2 table descriptors share the
//! `0b11` type encoding. Software bit 56 marks table descriptors so that a
//! descriptor can be classified without knowing its level.

use bitfield_struct::bitfield;
use core::sync::atomic::{AtomicU64, Ordering};

use super::{PageTableEntry, assert_frame_aligned};
use crate::addresses::PhysicalAddress;
use crate::options::{AccessType, MapOpts};

/// MAIR slot holding normal write-back memory attributes.
const MAIR_NORMAL: u8 = 4;

/// Inner shareable.
const SH_INNER: u8 = 0b11;

#[bitfield(u64)]
pub struct Arm64Bits {
    pub valid: bool,
    /// Bit 1: set for table and page descriptors.
    pub descriptor: bool,
    #[bits(3)]
    pub attr_index: u8,
    pub non_secure: bool,
    /// Bit 6: AP\[1\]: EL0 accessible.
    pub user: bool,
    /// Bit 7: AP\[2\]: read-only.
    pub read_only: bool,
    #[bits(2)]
    pub shareability: u8,
    /// Bit 10: AF.
    pub accessed: bool,
    /// Bit 11: nG.
    pub not_global: bool,
    #[bits(36)]
    pub output: u64,
    #[bits(3)]
    __: u8,
    pub dirty_bit_modifier: bool,
    pub contiguous: bool,
    /// Bit 53: PXN.
    pub privileged_execute_never: bool,
    /// Bit 54: UXN.
    pub user_execute_never: bool,
    pub software0: bool,
    /// Bit 56: software: table descriptor.
    pub table: bool,
    #[bits(7)]
    __: u8,
}

/// A single ARM64 descriptor.
#[doc(alias = "PTE")]
#[repr(transparent)]
pub struct Arm64Entry(AtomicU64);

impl Arm64Entry {
    #[inline]
    fn bits(&self) -> Arm64Bits {
        Arm64Bits::from_bits(self.raw())
    }

    #[inline]
    fn store(&self, bits: Arm64Bits) {
        self.0.store(bits.into_bits(), Ordering::Release);
    }
}

impl PageTableEntry for Arm64Entry {
    const OPTION_MASK: u64 = 0xfff | (0xffff << 48);

    #[inline]
    fn from_raw(value: u64) -> Self {
        Self(AtomicU64::new(value))
    }

    #[inline]
    fn word(&self) -> &AtomicU64 {
        &self.0
    }

    #[inline]
    fn valid(&self) -> bool {
        self.bits().valid()
    }

    #[inline]
    fn is_intermediate(&self) -> bool {
        let bits = self.bits();
        bits.valid() && bits.table()
    }

    #[inline]
    fn address(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.bits().output() << 12)
    }

    fn set(&self, physical: PhysicalAddress, opts: MapOpts) {
        assert_frame_aligned(physical);
        if !opts.access.any() {
            self.clear();
            return;
        }
        let execute = opts.access.execute;
        let bits = Arm64Bits::new()
            .with_valid(true)
            .with_descriptor(true)
            .with_attr_index(MAIR_NORMAL)
            .with_shareability(SH_INNER)
            .with_accessed(true)
            .with_read_only(!opts.access.write)
            .with_user(opts.user)
            .with_not_global(!opts.global)
            .with_user_execute_never(!(execute && opts.user))
            .with_privileged_execute_never(!execute || opts.user)
            .with_output(physical.as_u64() >> 12);
        self.store(bits);
    }

    fn options(&self) -> MapOpts {
        let bits = self.bits();
        let execute = if bits.user() {
            !bits.user_execute_never()
        } else {
            !bits.privileged_execute_never()
        };
        MapOpts {
            access: AccessType::new(true, !bits.read_only(), execute),
            global: !bits.not_global(),
            user: bits.user(),
        }
    }

    fn set_intermediate(&self, child: PhysicalAddress) {
        assert!(!self.valid(), "set_intermediate on a valid entry");
        assert_frame_aligned(child);
        self.store(
            Arm64Bits::new()
                .with_valid(true)
                .with_descriptor(true)
                .with_table(true)
                .with_output(child.as_u64() >> 12),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_pages_are_never_privileged_executable() {
        let e = Arm64Entry::zeroed();
        e.set(PhysicalAddress::new(0x9000), MapOpts::user(AccessType::ANY));
        let bits = Arm64Bits::from_bits(e.raw());
        assert!(!bits.user_execute_never());
        assert!(bits.privileged_execute_never());
        assert!(bits.not_global());
        assert!(e.options().access.execute);
    }
}
