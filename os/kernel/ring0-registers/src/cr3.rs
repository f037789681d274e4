use crate::FRAME_MASK;
use bitfield_struct::bitfield;

/// CR3: Page-Map Level-4 Base Register with PCIDs enabled (CR4.PCIDE = 1).
///
/// Holds the physical base address of the PML4 table and the process-context
/// identifier tagging TLB entries created under it.
#[bitfield(u64)]
pub struct Cr3 {
    /// Bits 0–11: PCID of the address space.
    #[bits(12)]
    pub pcid: u16,

    /// Bits 12–51: PML4 physical base >> 12.
    ///
    /// To get the full physical address: `pml4_base_phys = pml4_base_4k << 12`.
    #[bits(40)]
    pml4_base_4k: u64,

    /// Bits 52–62: Reserved.
    #[bits(11)]
    pub reserved: u16,

    /// Bit 63: NOFLUSH: keep TLB entries tagged with `pcid` on load.
    ///
    /// Only meaningful on the value written; reads always return 0 here.
    pub no_flush: bool,
}

impl Cr3 {
    /// Create a `Cr3` value from a PML4 physical base address and a PCID.
    ///
    /// `pml4_phys` must be 4 KiB-aligned and `pcid` must fit in 12 bits.
    #[must_use]
    pub fn from_pml4_phys(pml4_phys: u64, pcid: u16, no_flush: bool) -> Self {
        assert_eq!(pml4_phys & FRAME_MASK, 0, "PML4 base must be 4K-aligned");
        debug_assert!(pcid < 4096, "PCID {pcid} exceeds 12 bits");
        Self::new()
            .with_pcid(pcid)
            .with_pml4_base_4k(pml4_phys >> 12)
            .with_no_flush(no_flush)
    }

    /// Return the full physical address of the PML4 base.
    #[must_use]
    pub const fn pml4_phys(&self) -> u64 {
        self.pml4_base_4k() << 12
    }
}
