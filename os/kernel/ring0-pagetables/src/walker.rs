//! # Range Walker
//!
//! Applies a [`Visitor`] to every leaf slot of `[start, end)` in ascending
//! order, descending through the four levels:
//!
//! ```text
//!  root (PGD) ─► PUD ─► PMD ─► PTE ─► visit(start, entry, PTE_SIZE - 1)
//! ```
//!
//! - An invalid intermediate entry is either skipped as a whole (the visitor
//!   does not allocate) or backed by a fresh array from the allocator.
//! - After a child array has been walked, it is released if it holds no valid
//!   entry any more and was not allocated by this pass. The root is never
//!   released.
//! - A visitor returning `false` stops the whole walk. Mutations done so far
//!   stay in place.

use core::marker::PhantomData;

use crate::addresses::PhysicalAddress;
use crate::allocator::EntryAllocator;
use crate::entry::{EntryArray, PageTableEntry};
use crate::error::PageTablesError;
use crate::layout::{
    ENTRIES_PER_ARRAY, MAX_END, PGD_SHIFT, PMD_SHIFT, PTE_SHIFT, PTE_SIZE, PUD_SHIFT,
    is_canonical_range, next,
};

/// Per-leaf callback of a walk.
pub(crate) trait Visitor<E: PageTableEntry> {
    /// Whether missing intermediate arrays are allocated.
    ///
    /// A visitor that requires allocation must leave every visited entry
    /// valid; otherwise only valid leaves are visited.
    fn requires_alloc(&self) -> bool;

    /// Visit the leaf covering `[start, start + align]`.
    ///
    /// Returns `false` to stop the walk.
    fn visit(&mut self, start: u64, entry: &E, align: u64) -> bool;
}

/// What the walker may do with arrays that become empty.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum Reclaim {
    /// Release empty child arrays.
    Yes,
    /// Never release; the walk must not mutate the tree.
    No,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Level {
    Pgd,
    Pud,
    Pmd,
    Pte,
}

impl Level {
    const fn shift(self) -> u32 {
        match self {
            Self::Pgd => PGD_SHIFT,
            Self::Pud => PUD_SHIFT,
            Self::Pmd => PMD_SHIFT,
            Self::Pte => PTE_SHIFT,
        }
    }

    const fn size(self) -> u64 {
        1 << self.shift()
    }

    #[allow(clippy::cast_possible_truncation)]
    const fn index(self, addr: u64) -> usize {
        ((addr >> self.shift()) & 0x1ff) as usize
    }

    const fn child(self) -> Option<Self> {
        match self {
            Self::Pgd => Some(Self::Pud),
            Self::Pud => Some(Self::Pmd),
            Self::Pmd => Some(Self::Pte),
            Self::Pte => None,
        }
    }
}

pub(crate) struct Walker<'a, E, M, V>
where
    E: PageTableEntry,
    M: EntryAllocator<E>,
    V: Visitor<E>,
{
    allocator: &'a M,
    root: &'a EntryArray<E>,
    reclaim: Reclaim,
    pub(crate) visitor: V,
    _entry: PhantomData<E>,
}

impl<'a, E, M, V> Walker<'a, E, M, V>
where
    E: PageTableEntry,
    M: EntryAllocator<E>,
    V: Visitor<E>,
{
    pub(crate) const fn new(
        allocator: &'a M,
        root: &'a EntryArray<E>,
        visitor: V,
        reclaim: Reclaim,
    ) -> Self {
        Self {
            allocator,
            root,
            reclaim,
            visitor,
            _entry: PhantomData,
        }
    }

    /// Walk `[start, end)`.
    ///
    /// Returns `Ok(false)` if the visitor stopped the walk.
    ///
    /// # Panics
    /// If `start` is not page-aligned, if `end` precedes `start` or exceeds
    /// [`MAX_END`], or if the range contains a non-canonical address.
    pub(crate) fn iterate_range(&mut self, start: u64, end: u64) -> Result<bool, PageTablesError> {
        assert!(start % PTE_SIZE == 0, "unaligned range start {start:#x}");
        assert!(end >= start, "range end {end:#x} precedes start {start:#x}");
        assert!(end <= MAX_END, "range end {end:#x} is past the last walkable page");
        assert!(
            is_canonical_range(start, end),
            "range [{start:#x}, {end:#x}) is not canonical"
        );

        let mut cursor = start;
        self.iterate_array(self.root, Level::Pgd, &mut cursor, end)
    }

    /// Like [`iterate_range`](Self::iterate_range) for visitors that never
    /// allocate.
    pub(crate) fn iterate_range_no_alloc(&mut self, start: u64, end: u64) -> bool {
        debug_assert!(!self.visitor.requires_alloc());
        match self.iterate_range(start, end) {
            Ok(complete) => complete,
            Err(e) => unreachable!("walk without allocation failed: {e}"),
        }
    }

    fn iterate_array(
        &mut self,
        array: &EntryArray<E>,
        level: Level,
        cursor: &mut u64,
        end: u64,
    ) -> Result<bool, PageTablesError> {
        let mut index = level.index(*cursor);
        while *cursor < end && index < ENTRIES_PER_ARRAY {
            let entry = &array[index];
            index += 1;

            let Some(child_level) = level.child() else {
                if entry.valid() || self.visitor.requires_alloc() {
                    if !self.visitor.visit(*cursor, entry, PTE_SIZE - 1) {
                        return Ok(false);
                    }
                    assert!(
                        entry.valid() || !self.visitor.requires_alloc(),
                        "leaf at {:#x} still invalid after an allocating visit",
                        *cursor
                    );
                }
                *cursor += PTE_SIZE;
                continue;
            };

            let mut allocated = false;
            if entry.valid() {
                assert!(
                    entry.is_intermediate(),
                    "unexpected leaf at {level:?} level covering {:#x}",
                    *cursor
                );
            } else if self.visitor.requires_alloc() {
                let child = self
                    .allocator
                    .new_entry_array()
                    .ok_or(PageTablesError::OutOfMemory)?;
                let physical = self.allocator.physical_address_of(child);
                entry.set_intermediate(physical);
                log::trace!("allocated {child_level:?} array at {physical} for {:#x}", *cursor);
                allocated = true;
            } else {
                *cursor = next(*cursor, level.size());
                continue;
            }

            let physical = entry.address();
            // SAFETY: `physical` was stored by `set_intermediate` from an
            // array of this allocator's physical space, and only walks with
            // `Reclaim::Yes` (serialized by the owner) release arrays.
            let child = unsafe { self.allocator.lookup_by_physical_address(physical) };
            // SAFETY: see above; entries are only mutated through atomics.
            let child_ref = unsafe { child.as_ref() };

            if !self.iterate_array(child_ref, child_level, cursor, end)? {
                return Ok(false);
            }

            if self.reclaim == Reclaim::Yes && !allocated && child_ref.is_empty() {
                entry.clear();
                self.release(child, physical, child_level);
            }
        }
        Ok(true)
    }

    fn release(
        &self,
        child: core::ptr::NonNull<EntryArray<E>>,
        physical: PhysicalAddress,
        level: Level,
    ) {
        log::trace!("released empty {level:?} array at {physical}");
        // SAFETY: the only entry pointing at `child` was cleared above.
        unsafe { self.allocator.free(child) };
    }
}
