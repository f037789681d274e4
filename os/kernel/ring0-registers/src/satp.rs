use crate::FRAME_MASK;
use bitfield_struct::bitfield;

/// Translation scheme selected by [`Satp::mode`].
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[repr(u8)]
pub enum SatpMode {
    /// No translation.
    Bare = 0,
    /// Three-level, 39-bit virtual addresses.
    Sv39 = 8,
    /// Four-level, 48-bit virtual addresses.
    Sv48 = 9,
    /// Five-level, 57-bit virtual addresses.
    Sv57 = 10,
}

impl SatpMode {
    const fn into_bits(self) -> u8 {
        self as u8
    }

    const fn from_bits(value: u8) -> Self {
        match value {
            8 => Self::Sv39,
            9 => Self::Sv48,
            10 => Self::Sv57,
            _ => Self::Bare,
        }
    }
}

/// `satp`: Supervisor Address Translation and Protection (RV64).
///
/// | Bits  | Field |
/// |-------|-------|
/// | 0–43  | PPN of the root page table |
/// | 44–59 | ASID |
/// | 60–63 | MODE |
///
/// Writing `satp` does not order page-table updates; software issues an
/// `sfence.vma` for the affected ASID when stale translations may exist.
#[bitfield(u64)]
pub struct Satp {
    /// Bits 0–43: root page table physical address >> 12.
    #[bits(44)]
    ppn: u64,

    /// Bits 44–59: address-space identifier tagging TLB entries.
    #[bits(16)]
    pub asid: u16,

    /// Bits 60–63: translation mode.
    #[bits(4)]
    pub mode: SatpMode,
}

impl Satp {
    /// Compose a `satp` value for a root table at `root_phys`.
    ///
    /// `root_phys` must be 4 KiB-aligned.
    #[must_use]
    pub fn from_root(root_phys: u64, asid: u16, mode: SatpMode) -> Self {
        assert_eq!(
            root_phys & FRAME_MASK,
            0,
            "root table {root_phys:#x} is not 4K-aligned"
        );
        Self::new()
            .with_ppn(root_phys >> 12)
            .with_asid(asid)
            .with_mode(mode)
    }

    /// Physical address of the root page table.
    #[must_use]
    pub const fn root_phys(&self) -> u64 {
        self.ppn() << 12
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sv48_layout() {
        let satp = Satp::from_root(0x8020_3000, 7, SatpMode::Sv48);
        assert_eq!(satp.into_bits(), (9 << 60) | (7 << 44) | (0x8020_3000 >> 12));
        assert_eq!(satp.root_phys(), 0x8020_3000);
        assert_eq!(satp.mode(), SatpMode::Sv48);
        assert_eq!(satp.asid(), 7);
    }

    #[test]
    fn max_asid_does_not_leak_into_mode() {
        let satp = Satp::from_root(0x1000, u16::MAX, SatpMode::Sv48);
        assert_eq!(satp.mode(), SatpMode::Sv48);
        assert_eq!(satp.asid(), u16::MAX);
    }

    #[test]
    #[should_panic(expected = "not 4K-aligned")]
    fn unaligned_root_aborts() {
        let _ = Satp::from_root(0x8020_3008, 1, SatpMode::Sv48);
    }
}
