//! Four-level layout constants shared by every entry codec.
//!
//! ```text
//! | 63‒48  | 47‒39 | 38‒30 | 29‒21 | 20‒12 | 11‒0   |
//! | sign   |  PGD  |  PUD  |  PMD  |  PTE  | Offset |
//! ```
//!
//! Bits 63‒48 must equal bit 47. This splits the space into a lower half
//! `[0, LOWER_TOP]` and an upper half `[UPPER_BOTTOM, 2⁶⁴)`; everything in
//! between is non-canonical.

/// Number of entries in one entry array.
pub const ENTRIES_PER_ARRAY: usize = 512;

pub const PTE_SHIFT: u32 = 12;
pub const PMD_SHIFT: u32 = 21;
pub const PUD_SHIFT: u32 = 30;
pub const PGD_SHIFT: u32 = 39;

pub const PTE_SIZE: u64 = 1 << PTE_SHIFT;
pub const PMD_SIZE: u64 = 1 << PMD_SHIFT;
pub const PUD_SIZE: u64 = 1 << PUD_SHIFT;
pub const PGD_SIZE: u64 = 1 << PGD_SHIFT;

pub const PTE_MASK: u64 = 0x1ff << PTE_SHIFT;
pub const PMD_MASK: u64 = 0x1ff << PMD_SHIFT;
pub const PUD_MASK: u64 = 0x1ff << PUD_SHIFT;
pub const PGD_MASK: u64 = 0x1ff << PGD_SHIFT;

/// Highest canonical address of the lower half (inclusive).
pub const LOWER_TOP: u64 = 0x0000_7fff_ffff_ffff;

/// Lowest canonical address of the upper half.
pub const UPPER_BOTTOM: u64 = 0xffff_8000_0000_0000;

/// Exclusive end of the highest walkable range.
///
/// The final page of the address space cannot be expressed as `[start, end)`
/// without overflow and is never walked.
pub const MAX_END: u64 = !(PTE_SIZE - 1);

/// Returns `true` if `addr` lies in one of the two canonical halves.
///
/// ```
/// # use ring0_pagetables::layout::is_canonical;
/// assert!(is_canonical(0x0000_7fff_ffff_f000));
/// assert!(!is_canonical(0x0000_8000_0000_0000));
/// assert!(is_canonical(0xffff_8000_0000_0000));
/// ```
#[inline]
#[must_use]
pub const fn is_canonical(addr: u64) -> bool {
    addr <= LOWER_TOP || addr >= UPPER_BOTTOM
}

/// Returns `true` if every address of `[start, end)` is canonical.
///
/// An empty range is canonical iff its start is.
#[inline]
#[must_use]
pub const fn is_canonical_range(start: u64, end: u64) -> bool {
    if end <= start {
        return is_canonical(start);
    }
    let last = end - 1;
    (last <= LOWER_TOP) || (start >= UPPER_BOTTOM)
}

/// Start of the next `size`-aligned block after `start`.
///
/// Saturates to `u64::MAX` at the top of the address space so that range
/// loops terminate.
///
/// ```
/// # use ring0_pagetables::layout::{next, PMD_SIZE};
/// assert_eq!(next(0x1000, PMD_SIZE), PMD_SIZE);
/// assert_eq!(next(PMD_SIZE, PMD_SIZE), 2 * PMD_SIZE);
/// assert_eq!(next(u64::MAX - 5, PMD_SIZE), u64::MAX);
/// ```
#[inline]
#[must_use]
pub const fn next(start: u64, size: u64) -> u64 {
    match start.checked_add(size) {
        Some(v) => v & !(size - 1),
        None => u64::MAX,
    }
}

/// Index of the root slot covering `addr`.
///
/// Upper-half addresses land in slots `256..512`. Aborts if `addr` is not
/// canonical or not aligned to a root slot.
#[must_use]
pub fn pgd_index(addr: u64) -> usize {
    assert!(
        addr & (PGD_SIZE - 1) == 0,
        "address {addr:#x} is not aligned to a root slot"
    );
    assert!(is_canonical(addr), "address {addr:#x} is not canonical");
    #[allow(clippy::cast_possible_truncation)]
    let index = ((addr & PGD_MASK) >> PGD_SHIFT) as usize;
    index
}

/// Canonical sub-ranges of `[start, end)`, lower half first.
///
/// Used by whole-space scans that must step over the non-canonical hole.
#[must_use]
pub fn canonical_segments(start: u64, end: u64) -> [Option<(u64, u64)>; 2] {
    let lower = (start <= LOWER_TOP && start < end).then(|| (start, end.min(LOWER_TOP + 1)));
    let upper_start = start.max(UPPER_BOTTOM);
    let upper = (upper_start < end).then_some((upper_start, end));
    [lower, upper]
}
