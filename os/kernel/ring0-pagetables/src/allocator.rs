//! Entry-array allocation.
//!
//! The page-table core never owns memory directly. Every entry array comes
//! from an [`EntryAllocator`], which also translates between an array and the
//! physical address that intermediate entries store.

use alloc::boxed::Box;
use alloc::collections::BTreeSet;
use alloc::vec::Vec;
use core::ptr::NonNull;

use crate::addresses::PhysicalAddress;
use crate::entry::{EntryArray, PageTableEntry};

/// Supplier of zeroed entry arrays.
///
/// Implementations must hand out 4 KiB-aligned arrays whose physical address
/// is stable for as long as the array is live.
pub trait EntryAllocator<E: PageTableEntry> {
    /// Allocate a zeroed entry array. Returns `None` when out of memory.
    fn new_entry_array(&self) -> Option<NonNull<EntryArray<E>>>;

    /// Physical address of a live array, as stored in intermediate entries.
    fn physical_address_of(&self, array: NonNull<EntryArray<E>>) -> PhysicalAddress;

    /// Resolve a physical address taken from an intermediate entry.
    ///
    /// # Safety
    /// `physical` must be the address of a live array obtained through
    /// [`physical_address_of`](Self::physical_address_of) of an allocator
    /// sharing this allocator's physical address space.
    unsafe fn lookup_by_physical_address(&self, physical: PhysicalAddress)
    -> NonNull<EntryArray<E>>;

    /// Return an array.
    ///
    /// # Safety
    /// `array` must have come from [`new_entry_array`](Self::new_entry_array)
    /// on this allocator, and no entry may still point at it.
    unsafe fn free(&self, array: NonNull<EntryArray<E>>);
}

impl<E: PageTableEntry, T: EntryAllocator<E> + ?Sized> EntryAllocator<E> for &T {
    #[inline]
    fn new_entry_array(&self) -> Option<NonNull<EntryArray<E>>> {
        (**self).new_entry_array()
    }

    #[inline]
    fn physical_address_of(&self, array: NonNull<EntryArray<E>>) -> PhysicalAddress {
        (**self).physical_address_of(array)
    }

    #[inline]
    unsafe fn lookup_by_physical_address(
        &self,
        physical: PhysicalAddress,
    ) -> NonNull<EntryArray<E>> {
        unsafe { (**self).lookup_by_physical_address(physical) }
    }

    #[inline]
    unsafe fn free(&self, array: NonNull<EntryArray<E>>) {
        unsafe { (**self).free(array) }
    }
}

/// Heap-backed allocator for backends whose page tables are walked in the
/// supervisor's own address space.
///
/// Physical addresses are the arrays' host addresses. Freed arrays are kept in
/// a pool and zeroed again when handed out; [`drain`](Self::drain) releases
/// the pool.
pub struct RuntimeAllocator<E: PageTableEntry> {
    state: spin::Mutex<State<E>>,
}

struct State<E: PageTableEntry> {
    live: BTreeSet<usize>,
    pool: Vec<NonNull<EntryArray<E>>>,
    limit: Option<usize>,
    allocations: usize,
    frees: usize,
}

// SAFETY: the raw arrays are only reachable through the mutex-guarded state
// and through page-table entries, whose words are atomic.
unsafe impl<E: PageTableEntry> Send for RuntimeAllocator<E> {}
// SAFETY: see above.
unsafe impl<E: PageTableEntry> Sync for RuntimeAllocator<E> {}

impl<E: PageTableEntry> RuntimeAllocator<E> {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            state: spin::Mutex::new(State {
                live: BTreeSet::new(),
                pool: Vec::new(),
                limit: None,
                allocations: 0,
                frees: 0,
            }),
        }
    }

    /// An allocator that refuses to keep more than `limit` arrays live.
    #[must_use]
    pub fn with_limit(limit: usize) -> Self {
        let allocator = Self::new();
        allocator.state.lock().limit = Some(limit);
        allocator
    }

    /// Number of successful [`new_entry_array`](EntryAllocator::new_entry_array) calls.
    pub fn allocations(&self) -> usize {
        self.state.lock().allocations
    }

    /// Number of [`free`](EntryAllocator::free) calls.
    pub fn frees(&self) -> usize {
        self.state.lock().frees
    }

    /// Arrays currently handed out.
    pub fn live(&self) -> usize {
        self.state.lock().live.len()
    }

    /// Release every pooled array back to the heap.
    pub fn drain(&self) {
        let pool = core::mem::take(&mut self.state.lock().pool);
        for array in pool {
            // SAFETY: pooled arrays came from `Box::into_raw` and are not live.
            drop(unsafe { Box::from_raw(array.as_ptr()) });
        }
    }
}

impl<E: PageTableEntry> Default for RuntimeAllocator<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: PageTableEntry> EntryAllocator<E> for RuntimeAllocator<E> {
    fn new_entry_array(&self) -> Option<NonNull<EntryArray<E>>> {
        let mut state = self.state.lock();
        if state.limit.is_some_and(|limit| state.live.len() >= limit) {
            log::warn!("entry array limit of {} reached", state.live.len());
            return None;
        }

        let array = if let Some(array) = state.pool.pop() {
            // SAFETY: pooled arrays are valid and unreferenced.
            unsafe { array.as_ref() }.clear();
            array
        } else {
            NonNull::from(Box::leak(Box::new(EntryArray::<E>::new())))
        };

        state.live.insert(array.as_ptr() as usize);
        state.allocations += 1;
        Some(array)
    }

    #[inline]
    fn physical_address_of(&self, array: NonNull<EntryArray<E>>) -> PhysicalAddress {
        PhysicalAddress::from_nonnull(array)
    }

    #[inline]
    unsafe fn lookup_by_physical_address(
        &self,
        physical: PhysicalAddress,
    ) -> NonNull<EntryArray<E>> {
        #[allow(clippy::cast_possible_truncation)]
        let ptr = physical.as_u64() as usize as *mut EntryArray<E>;
        let Some(array) = NonNull::new(ptr) else {
            panic!("intermediate entry points at physical address zero");
        };
        array
    }

    unsafe fn free(&self, array: NonNull<EntryArray<E>>) {
        let mut state = self.state.lock();
        assert!(
            state.live.remove(&(array.as_ptr() as usize)),
            "freeing entry array {:p} that is not live",
            array.as_ptr()
        );
        state.frees += 1;
        state.pool.push(array);
    }
}

impl<E: PageTableEntry> Drop for RuntimeAllocator<E> {
    fn drop(&mut self) {
        self.drain();
        let state = self.state.get_mut();
        if !state.live.is_empty() {
            log::warn!("dropping allocator with {} live entry arrays", state.live.len());
        }
        for addr in core::mem::take(&mut state.live) {
            // SAFETY: live arrays came from `Box::into_raw`; borrowers of this
            // allocator are gone, so nothing references them any more.
            drop(unsafe { Box::from_raw(addr as *mut EntryArray<E>) });
        }
    }
}
