use crate::FRAME_MASK;
use bitfield_struct::bitfield;

/// `TTBR0_EL1`: Translation Table Base Register 0 (EL1, 4 KiB granule).
#[bitfield(u64)]
pub struct Ttbr0 {
    /// Bit 0: CnP: common-not-private translations.
    pub cnp: bool,

    /// Bits 1–47: BADDR: table base address bits `[47:1]`.
    #[bits(47)]
    baddr: u64,

    /// Bits 48–63: ASID.
    #[bits(16)]
    pub asid: u16,
}

impl Ttbr0 {
    /// Compose a `TTBR0_EL1` value for a level-0 table at `table_phys`.
    #[must_use]
    pub fn from_table(table_phys: u64, asid: u16) -> Self {
        assert_eq!(table_phys & FRAME_MASK, 0, "table base must be 4K-aligned");
        Self::new().with_baddr(table_phys >> 1).with_asid(asid)
    }

    /// Physical address of the level-0 table.
    #[must_use]
    pub const fn table_phys(&self) -> u64 {
        self.baddr() << 1
    }
}
