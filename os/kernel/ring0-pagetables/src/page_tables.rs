//! # Page Tables
//!
//! [`PageTables`] owns one address space's translation tree and exposes the
//! range operations built on the walker:
//!
//! | Operation | Allocates | Reclaims | Result |
//! |-----------|-----------|----------|--------|
//! | [`map`](PageTables::map) | yes | yes | previous mapping changed (flush needed) |
//! | [`unmap`](PageTables::unmap) | no | yes | anything cleared |
//! | [`protect`](PageTables::protect) | no | yes | anything changed |
//! | [`lookup`](PageTables::lookup) | no | no | translation of one page |
//! | [`lookup_first`](PageTables::lookup_first) | no | no | first translation at or above |
//! | [`is_empty`](PageTables::is_empty) | no | no | no valid leaf in range |
//!
//! ## Shared upper half
//!
//! A kernel mapping common to every address space lives in one instance that
//! is populated once and then [marked read-only](PageTables::mark_read_only_shared).
//! Every other instance is created with
//! [`new_with_upper`](PageTables::new_with_upper), which copies the shared
//! root slots from `upper_start` upward. The copied slots point into arrays
//! owned by the shared instance; the borrow `'u` keeps that instance alive
//! for as long as any copy exists.
//!
//! ## Synchronization
//!
//! Mutating operations take `&mut self`. Lookups take `&self` and may run on
//! other CPUs concurrently with nothing but the atomic entry loads.

mod visitors;

use core::fmt;
use core::marker::PhantomData;
use core::ptr::NonNull;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::addresses::{PhysicalAddress, VirtualAddress};
use crate::allocator::EntryAllocator;
use crate::arch::Arch;
use crate::asids::AsidSlot;
use crate::entry::{EntryArray, PageTableEntry};
use crate::error::PageTablesError;
use crate::layout::{self, ENTRIES_PER_ARRAY, MAX_END, PTE_SIZE};
use crate::options::MapOpts;
use crate::walker::{Reclaim, Visitor, Walker};
use visitors::{EmptyVisitor, LookupVisitor, MapVisitor, ProtectVisitor, UnmapVisitor};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of a [`PageTables`] instance.
///
/// Used by the ASID allocator to recognize owners without holding
/// references to them.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PageTablesId(u64);

impl PageTablesId {
    pub(crate) fn next() -> Self {
        Self(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }

    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

/// A resolved leaf translation.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Translation {
    /// First virtual address covered by the leaf.
    pub virtual_base: VirtualAddress,
    /// Physical address the leaf maps `virtual_base` to.
    pub physical_base: PhysicalAddress,
    /// Bytes covered by the leaf.
    pub size: u64,
    pub opts: MapOpts,
}

impl Translation {
    /// Physical address of `addr`, which must lie inside the leaf.
    #[must_use]
    pub fn physical(&self, addr: VirtualAddress) -> PhysicalAddress {
        let offset = addr.as_u64() - self.virtual_base.as_u64();
        debug_assert!(offset < self.size, "{addr} lies outside {self:?}");
        self.physical_base + offset
    }
}

/// Translation tree of one isolated address space.
pub struct PageTables<'u, A: Arch, M: EntryAllocator<A::Entry>> {
    allocator: M,
    root: NonNull<EntryArray<A::Entry>>,
    root_physical: PhysicalAddress,
    upper_shared: Option<&'u PageTables<'u, A, M>>,
    upper_start: u64,
    read_only_shared: bool,
    asid: Arc<AsidSlot>,
    _arch: PhantomData<A>,
}

// SAFETY: the tree is only reachable through `root`; entries are atomic and
// tree-shaping mutation requires `&mut self`.
unsafe impl<A: Arch, M: EntryAllocator<A::Entry> + Send + Sync> Send for PageTables<'_, A, M> {}
// SAFETY: see above.
unsafe impl<A: Arch, M: EntryAllocator<A::Entry> + Sync> Sync for PageTables<'_, A, M> {}

impl<'u, A: Arch, M: EntryAllocator<A::Entry>> PageTables<'u, A, M> {
    /// Page tables with a fresh, empty root.
    pub fn new(allocator: M) -> Result<Self, PageTablesError> {
        Self::init(allocator, None, MAX_END)
    }

    /// Page tables sharing the root slots at and above `upper_start` with
    /// `upper`.
    ///
    /// Mappings `upper` holds at that point become visible in the new
    /// instance. Ranges reaching `upper_start` can no longer be mutated
    /// through it.
    ///
    /// # Panics
    /// If `upper_start` is not canonical or not aligned to a root slot.
    pub fn new_with_upper(
        allocator: M,
        upper: &'u PageTables<'u, A, M>,
        upper_start: VirtualAddress,
    ) -> Result<Self, PageTablesError> {
        Self::init(allocator, Some(upper), upper_start.as_u64())
    }

    fn init(
        allocator: M,
        upper_shared: Option<&'u PageTables<'u, A, M>>,
        upper_start: u64,
    ) -> Result<Self, PageTablesError> {
        if upper_shared.is_some() {
            // Abort on a bad split before anything is allocated.
            let _ = layout::pgd_index(upper_start);
        }
        let root = allocator
            .new_entry_array()
            .ok_or(PageTablesError::OutOfMemory)?;
        let root_physical = allocator.physical_address_of(root);
        let tables = Self {
            allocator,
            root,
            root_physical,
            upper_shared,
            upper_start,
            read_only_shared: false,
            asid: Arc::new(AsidSlot::new()),
            _arch: PhantomData,
        };
        tables.init_arch();
        log::trace!(
            "{} page tables {:?} with root at {root_physical}",
            A::NAME,
            tables.id()
        );
        Ok(tables)
    }

    /// Copy the shared upper root slots, if any.
    fn init_arch(&self) {
        let Some(upper) = self.upper_shared else {
            return;
        };
        let first = layout::pgd_index(self.upper_start);
        let (root, shared) = (self.root(), upper.root());
        for index in first..ENTRIES_PER_ARRAY {
            root[index].copy_from(&shared[index]);
        }
    }

    #[inline]
    fn root(&self) -> &EntryArray<A::Entry> {
        // SAFETY: the root is live until `drop`.
        unsafe { self.root.as_ref() }
    }

    #[inline]
    fn walker<V: Visitor<A::Entry>>(
        &self,
        visitor: V,
        reclaim: Reclaim,
    ) -> Walker<'_, A::Entry, M, V> {
        Walker::new(&self.allocator, self.root(), visitor, reclaim)
    }

    /// Map `[addr, addr + length)` to `[physical, physical + length)`.
    ///
    /// Returns `true` if a previously valid translation in the range was
    /// replaced by a different one, in which case cached translations must
    /// be flushed. An empty access set unmaps the range instead.
    ///
    /// Allocation failure leaves the slots mapped so far in place.
    ///
    /// # Panics
    /// On unaligned or non-canonical ranges, on read-only shared tables, on
    /// ranges reaching into a shared upper half, and if the physical range
    /// wraps around.
    pub fn map(
        &mut self,
        addr: VirtualAddress,
        length: u64,
        opts: MapOpts,
        physical: PhysicalAddress,
    ) -> Result<bool, PageTablesError> {
        let (start, end) = self.mutable_range(addr, length);
        if !opts.access.any() {
            return Ok(self.unmap(addr, length));
        }
        assert!(
            physical.as_u64().checked_add(length.saturating_sub(1)).is_some(),
            "physical range at {physical} with length {length:#x} overflows"
        );

        let visitor = MapVisitor {
            target: start,
            physical: physical.as_u64(),
            opts: opts.normalized(),
            changed: false,
        };
        let mut walker = self.walker(visitor, Reclaim::Yes);
        walker.iterate_range(start, end)?;
        Ok(walker.visitor.changed)
    }

    /// Clear every leaf in `[addr, addr + length)` and release emptied
    /// arrays. Never allocates.
    ///
    /// Returns `true` if anything was mapped.
    pub fn unmap(&mut self, addr: VirtualAddress, length: u64) -> bool {
        let (start, end) = self.mutable_range(addr, length);
        let mut walker = self.walker(UnmapVisitor::default(), Reclaim::Yes);
        walker.iterate_range_no_alloc(start, end);
        walker.visitor.count > 0
    }

    /// Change the permissions of the leaves present in `[addr, addr + length)`.
    ///
    /// Unmapped slots stay unmapped. An empty access set unmaps.
    ///
    /// Returns `true` if any leaf changed.
    pub fn protect(&mut self, addr: VirtualAddress, length: u64, opts: MapOpts) -> bool {
        let (start, end) = self.mutable_range(addr, length);
        if !opts.access.any() {
            return self.unmap(addr, length);
        }
        let visitor = ProtectVisitor {
            opts: opts.normalized(),
            changed: false,
        };
        let mut walker = self.walker(visitor, Reclaim::Yes);
        walker.iterate_range_no_alloc(start, end);
        walker.visitor.changed
    }

    /// Translation of the page containing `addr`.
    ///
    /// # Panics
    /// If `addr` is not canonical.
    #[must_use]
    pub fn lookup(&self, addr: VirtualAddress) -> Option<Translation> {
        let start = addr.page_base().as_u64();
        let end = start.checked_add(PTE_SIZE)?.min(MAX_END);
        let mut walker = self.walker(LookupVisitor::default(), Reclaim::No);
        walker.iterate_range_no_alloc(start, end);
        walker.visitor.found
    }

    /// First translation at or above `addr`, stepping over the
    /// non-canonical hole.
    #[must_use]
    pub fn lookup_first(&self, addr: VirtualAddress) -> Option<Translation> {
        let start = addr.page_base().as_u64();
        layout::canonical_segments(start, MAX_END)
            .into_iter()
            .flatten()
            .find_map(|(start, end)| {
                let mut walker = self.walker(LookupVisitor::default(), Reclaim::No);
                walker.iterate_range_no_alloc(start, end);
                walker.visitor.found
            })
    }

    /// Returns `true` if no page of `[addr, addr + length)` is mapped.
    #[must_use]
    pub fn is_empty(&self, addr: VirtualAddress, length: u64) -> bool {
        let (start, end) = range(addr, length);
        let mut walker = self.walker(EmptyVisitor::default(), Reclaim::No);
        walker.iterate_range_no_alloc(start, end);
        !walker.visitor.found
    }

    /// Freeze these tables; any later mutation aborts.
    ///
    /// Used for the instance whose upper half other instances share.
    pub fn mark_read_only_shared(&mut self) {
        self.read_only_shared = true;
    }

    #[must_use]
    pub const fn is_read_only_shared(&self) -> bool {
        self.read_only_shared
    }

    /// Value for the translation-base register with the current ASID.
    #[must_use]
    pub fn translation_root(&self, no_flush: bool) -> u64 {
        A::translation_root(self.root_physical, self.asid(), no_flush)
    }

    #[must_use]
    pub fn asid(&self) -> u16 {
        self.asid.asid()
    }

    /// Slot the ASID allocator binds this instance's tag through.
    #[must_use]
    pub const fn asid_slot(&self) -> &Arc<AsidSlot> {
        &self.asid
    }

    #[must_use]
    pub fn id(&self) -> PageTablesId {
        self.asid.owner()
    }

    #[must_use]
    pub const fn root_physical(&self) -> PhysicalAddress {
        self.root_physical
    }

    /// Number of valid root slots, including shared ones.
    #[must_use]
    pub fn root_valid_count(&self) -> usize {
        self.root().valid_count()
    }

    #[must_use]
    pub const fn allocator(&self) -> &M {
        &self.allocator
    }

    fn mutable_range(&self, addr: VirtualAddress, length: u64) -> (u64, u64) {
        assert!(
            !self.read_only_shared,
            "mutating read-only shared page tables {:?}",
            self.id()
        );
        let (start, end) = range(addr, length);
        if self.upper_shared.is_some() {
            assert!(
                end <= self.upper_start,
                "range [{start:#x}, {end:#x}) reaches the shared upper half at {:#x}",
                self.upper_start
            );
        }
        (start, end)
    }
}

fn range(addr: VirtualAddress, length: u64) -> (u64, u64) {
    let start = addr.as_u64();
    let Some(end) = start.checked_add(length) else {
        panic!("range at {addr} with length {length:#x} overflows");
    };
    (start, end)
}

impl<A: Arch, M: EntryAllocator<A::Entry>> Drop for PageTables<'_, A, M> {
    fn drop(&mut self) {
        let owned_end = if self.upper_shared.is_some() {
            self.upper_start
        } else {
            MAX_END
        };
        for (start, end) in layout::canonical_segments(0, owned_end).into_iter().flatten() {
            let mut walker = self.walker(UnmapVisitor::default(), Reclaim::Yes);
            walker.iterate_range_no_alloc(start, end);
        }

        let root = self.root();
        if self.upper_shared.is_some() {
            for entry in root.iter().skip(layout::pgd_index(self.upper_start)) {
                entry.clear();
            }
        }
        debug_assert!(root.is_empty(), "root of {:?} not empty on teardown", self.id());

        // SAFETY: every entry pointing into the tree has been cleared and the
        // root itself is referenced by nothing else.
        unsafe { self.allocator.free(self.root) };
        log::trace!("released page tables {:?}", self.id());
    }
}

impl<A: Arch, M: EntryAllocator<A::Entry>> fmt::Debug for PageTables<'_, A, M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageTables")
            .field("arch", &A::NAME)
            .field("id", &self.id())
            .field("root", &self.root_physical)
            .field("asid", &self.asid())
            .field("shared_upper", &self.upper_shared.map(|upper| upper.id()))
            .field("read_only_shared", &self.read_only_shared)
            .finish_non_exhaustive()
    }
}
