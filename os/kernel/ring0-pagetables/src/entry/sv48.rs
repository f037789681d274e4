//! RISC-V Sv48 page-table entries.
//!
//! | Bits  | Field |
//! |-------|-------|
//! | 0     | V: valid |
//! | 1–3   | R, W, X: permissions; all clear marks a non-leaf entry |
//! | 4     | U: user accessible |
//! | 5     | G: global |
//! | 6–7   | A, D: accessed, dirty |
//! | 8–9   | RSW: reserved for software |
//! | 10–53 | PPN: physical page number (`pa >> 12`) |
//! | 54–60 | reserved |
//! | 61–62 | PBMT: page-based memory type |
//! | 63    | N: NAPOT |
//!
//! The option bits are the low ten bits (`0x3ff`), flags plus RSW. The address
//! is not stored in place; the PPN starts at bit 10.
//!
//! Hardware without A/D management faults on a clear A (or a clear D on
//! write), so leaves are installed with A set and with D set when writable.
//! Non-leaf entries must keep U, A and D clear.

use bitfield_struct::bitfield;
use core::sync::atomic::{AtomicU64, Ordering};

use super::{PageTableEntry, assert_frame_aligned};
use crate::addresses::PhysicalAddress;
use crate::options::{AccessType, MapOpts};

#[bitfield(u64)]
pub struct Sv48Bits {
    pub valid: bool,
    pub readable: bool,
    pub writable: bool,
    pub executable: bool,
    pub user: bool,
    pub global: bool,
    pub accessed: bool,
    pub dirty: bool,

    /// Ignored by hardware.
    #[bits(2)]
    pub rsw: u8,

    #[bits(44)]
    pub ppn: u64,

    #[bits(7)]
    __: u8,

    #[bits(2)]
    pub pbmt: u8,

    pub napot: bool,
}

impl Sv48Bits {
    #[inline]
    const fn is_leaf(self) -> bool {
        self.readable() || self.writable() || self.executable()
    }

    #[inline]
    const fn physical_address(self) -> PhysicalAddress {
        PhysicalAddress::new(self.ppn() << 12)
    }
}

/// A single Sv48 entry.
#[doc(alias = "PTE")]
#[repr(transparent)]
pub struct Sv48Entry(AtomicU64);

impl Sv48Entry {
    #[inline]
    fn bits(&self) -> Sv48Bits {
        Sv48Bits::from_bits(self.raw())
    }

    #[inline]
    fn store(&self, bits: Sv48Bits) {
        self.0.store(bits.into_bits(), Ordering::Release);
    }
}

impl PageTableEntry for Sv48Entry {
    const OPTION_MASK: u64 = 0x3ff;

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
        bits.valid() && !bits.is_leaf()
    }

    #[inline]
    fn address(&self) -> PhysicalAddress {
        self.bits().physical_address()
    }

    fn set(&self, physical: PhysicalAddress, opts: MapOpts) {
        assert_frame_aligned(physical);
        if !opts.access.any() {
            self.clear();
            return;
        }
        let bits = Sv48Bits::new()
            .with_valid(true)
            .with_readable(true)
            .with_writable(opts.access.write)
            .with_executable(opts.access.execute)
            .with_user(opts.user)
            .with_global(opts.global)
            .with_accessed(true)
            .with_dirty(opts.access.write)
            .with_ppn(physical.as_u64() >> 12);
        self.store(bits);
    }

    fn options(&self) -> MapOpts {
        let bits = self.bits();
        MapOpts {
            access: AccessType::new(true, bits.writable(), bits.executable()),
            global: bits.global(),
            user: bits.user(),
        }
    }

    fn set_intermediate(&self, child: PhysicalAddress) {
        assert!(!self.valid(), "set_intermediate on a valid entry");
        assert_frame_aligned(child);
        self.store(
            Sv48Bits::new()
                .with_valid(true)
                .with_ppn(child.as_u64() >> 12),
        );
    }
}
