//! # Entry Codecs
//!
//! One page-table entry is a single 64-bit word. Its layout is architecture
//! specific, but every layout answers the same questions: is the entry valid,
//! where does it point, does it point at a deeper table, and which
//! permissions does a leaf grant. [`PageTableEntry`] is that capability; the
//! walker and the manager never touch a concrete layout.
//!
//! | Variant | Architecture |
//! |---------|--------------|
//! | [`Sv48Entry`] | RISC-V Sv48 |
//! | [`X86Entry`] | x86-64 4-level paging |
//! | [`Arm64Entry`] | ARMv8-A, 4 KiB granule |
//!
//! ## Atomicity
//!
//! Every load and store of the entry word is atomic so that a concurrent
//! reader (for example a fault handler) observes either the old or the new
//! entry, never a torn mix. The codec does **not** serialize writers; that is
//! the responsibility of whoever owns the page tables.

use core::ops::Index;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::addresses::PhysicalAddress;
use crate::layout::ENTRIES_PER_ARRAY;
use crate::options::MapOpts;

mod arm64;
mod sv48;
mod x86_64;

pub use arm64::{Arm64Bits, Arm64Entry};
pub use sv48::{Sv48Bits, Sv48Entry};
pub use x86_64::{X86Bits, X86Entry};

/// Bit-level codec for one translation entry.
///
/// An entry is in exactly one of three states:
///
/// - **invalid**: the whole word is zero,
/// - **leaf**: maps one 4 KiB page with permissions ([`set`](Self::set)),
/// - **intermediate**: points at a deeper [`EntryArray`]
///   ([`set_intermediate`](Self::set_intermediate)).
pub trait PageTableEntry: Send + Sync + Sized + 'static {
    /// Bits below the address field that carry options.
    const OPTION_MASK: u64;

    /// Wrap a raw word.
    fn from_raw(value: u64) -> Self;

    /// The atomic word backing this entry.
    fn word(&self) -> &AtomicU64;

    /// Returns `true` if the entry is a leaf or an intermediate entry.
    fn valid(&self) -> bool;

    /// Returns `true` if the entry points at a deeper entry array.
    fn is_intermediate(&self) -> bool;

    /// Physical address the entry points to.
    ///
    /// Only meaningful if [`valid`](Self::valid) returns `true`.
    fn address(&self) -> PhysicalAddress;

    /// Install a leaf mapping `physical` with `opts`.
    ///
    /// An empty access set produces an invalid entry; "no access" and
    /// "unmapped" share one representation.
    ///
    /// # Panics
    /// If `physical` is not 4 KiB-aligned.
    fn set(&self, physical: PhysicalAddress, opts: MapOpts);

    /// Permissions of a valid leaf entry.
    fn options(&self) -> MapOpts;

    /// Point this entry at the entry array at `child`.
    ///
    /// # Panics
    /// If the entry is already valid; a live leaf would otherwise be
    /// orphaned. Also if `child` is not 4 KiB-aligned.
    fn set_intermediate(&self, child: PhysicalAddress);

    /// A fresh invalid entry.
    #[inline]
    fn zeroed() -> Self {
        Self::from_raw(0)
    }

    /// Raw word.
    #[inline]
    fn raw(&self) -> u64 {
        self.word().load(Ordering::Acquire)
    }

    /// Zero the whole word, including any software bits.
    #[inline]
    fn clear(&self) {
        self.word().store(0, Ordering::Release);
    }

    /// Copy the raw word of `other` into this entry.
    #[inline]
    fn copy_from(&self, other: &Self) {
        self.word().store(other.raw(), Ordering::Release);
    }
}

/// Shared precondition of every `set`/`set_intermediate`.
#[inline]
pub(crate) fn assert_frame_aligned(physical: PhysicalAddress) {
    assert!(
        physical.is_page_aligned(),
        "physical address {physical} is not 4K-aligned"
    );
}

/// One level's table: 512 entries, 4 KiB-aligned.
#[repr(C, align(4096))]
pub struct EntryArray<E> {
    entries: [E; ENTRIES_PER_ARRAY],
}

impl<E: PageTableEntry> EntryArray<E> {
    /// An array of invalid entries.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: core::array::from_fn(|_| E::zeroed()),
        }
    }

    /// Returns `true` if no entry is valid.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.iter().all(|e| !e.valid())
    }

    /// Number of valid entries.
    #[must_use]
    pub fn valid_count(&self) -> usize {
        self.entries.iter().filter(|e| e.valid()).count()
    }

    /// Invalidate every entry.
    pub fn clear(&self) {
        for e in &self.entries {
            e.clear();
        }
    }

    pub fn iter(&self) -> core::slice::Iter<'_, E> {
        self.entries.iter()
    }
}

impl<E: PageTableEntry> Default for EntryArray<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> Index<usize> for EntryArray<E> {
    type Output = E;

    #[inline]
    fn index(&self, index: usize) -> &E {
        &self.entries[index]
    }
}
