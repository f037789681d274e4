//! x86-64 4-level paging entries (4 KiB leaves only).
//!
//! Leaf and non-leaf 4 KiB entries look identical to hardware, so the first
//! OS-available bit (9) records which one was installed.

use bitfield_struct::bitfield;
use core::sync::atomic::{AtomicU64, Ordering};

use super::{PageTableEntry, assert_frame_aligned};
use crate::addresses::PhysicalAddress;
use crate::options::{AccessType, MapOpts};

#[bitfield(u64)]
pub struct X86Bits {
    /// Bit 0: P.
    pub present: bool,
    /// Bit 1: R/W.
    pub writable: bool,
    /// Bit 2: U/S.
    pub user: bool,
    /// Bit 3: PWT.
    pub write_through: bool,
    /// Bit 4: PCD.
    pub cache_disable: bool,
    /// Bit 5: A.
    pub accessed: bool,
    /// Bit 6: D.
    pub dirty: bool,
    /// Bit 7: PS. Always clear here.
    pub large_page: bool,
    /// Bit 8: G.
    pub global: bool,
    /// Bit 9: OS-available; set on entries pointing at a deeper table.
    pub table: bool,
    #[bits(2)]
    pub os_available: u8,
    /// Bits 12–51: frame number.
    #[bits(40)]
    pub frame: u64,
    #[bits(11)]
    __: u16,
    /// Bit 63: XD.
    pub no_execute: bool,
}

/// A single x86-64 entry.
#[doc(alias = "PTE")]
#[repr(transparent)]
pub struct X86Entry(AtomicU64);

impl X86Entry {
    #[inline]
    fn bits(&self) -> X86Bits {
        X86Bits::from_bits(self.raw())
    }

    #[inline]
    fn store(&self, bits: X86Bits) {
        self.0.store(bits.into_bits(), Ordering::Release);
    }
}

impl PageTableEntry for X86Entry {
    const OPTION_MASK: u64 = 0xfff | (1 << 63);

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
        self.bits().present()
    }

    #[inline]
    fn is_intermediate(&self) -> bool {
        let bits = self.bits();
        bits.present() && bits.table()
    }

    #[inline]
    fn address(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.bits().frame() << 12)
    }

    fn set(&self, physical: PhysicalAddress, opts: MapOpts) {
        assert_frame_aligned(physical);
        if !opts.access.any() {
            self.clear();
            return;
        }
        let bits = X86Bits::new()
            .with_present(true)
            .with_accessed(true)
            .with_writable(opts.access.write)
            .with_dirty(opts.access.write)
            .with_user(opts.user)
            .with_global(opts.global)
            .with_no_execute(!opts.access.execute)
            .with_frame(physical.as_u64() >> 12);
        self.store(bits);
    }

    fn options(&self) -> MapOpts {
        let bits = self.bits();
        MapOpts {
            access: AccessType::new(true, bits.writable(), !bits.no_execute()),
            global: bits.global(),
            user: bits.user(),
        }
    }

    fn set_intermediate(&self, child: PhysicalAddress) {
        assert!(!self.valid(), "set_intermediate on a valid entry");
        assert_frame_aligned(child);
        self.store(
            X86Bits::new()
                .with_present(true)
                .with_writable(true)
                .with_user(true)
                .with_accessed(true)
                .with_table(true)
                .with_frame(child.as_u64() >> 12),
        );
    }
}
