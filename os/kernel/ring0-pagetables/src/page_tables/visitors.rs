use crate::addresses::{PhysicalAddress, VirtualAddress};
use crate::entry::PageTableEntry;
use crate::options::MapOpts;
use crate::page_tables::Translation;
use crate::walker::Visitor;

/// Installs `physical + (start - target)` at every slot.
pub(super) struct MapVisitor {
    pub target: u64,
    pub physical: u64,
    pub opts: MapOpts,
    /// A previously valid entry now points elsewhere or grants other rights.
    pub changed: bool,
}

impl<E: PageTableEntry> Visitor<E> for MapVisitor {
    fn requires_alloc(&self) -> bool {
        true
    }

    fn visit(&mut self, start: u64, entry: &E, _align: u64) -> bool {
        let offset = start - self.target;
        let Some(physical) = self.physical.checked_add(offset) else {
            panic!("physical {:#x} + {offset:#x} overflows", self.physical);
        };
        let physical = PhysicalAddress::new(physical);
        if entry.valid() && (entry.address() != physical || entry.options() != self.opts) {
            self.changed = true;
        }
        entry.set(physical, self.opts);
        true
    }
}

/// Clears every valid leaf.
#[derive(Default)]
pub(super) struct UnmapVisitor {
    pub count: usize,
}

impl<E: PageTableEntry> Visitor<E> for UnmapVisitor {
    fn requires_alloc(&self) -> bool {
        false
    }

    fn visit(&mut self, _start: u64, entry: &E, _align: u64) -> bool {
        entry.clear();
        self.count += 1;
        true
    }
}

/// Rewrites the permissions of every valid leaf in place.
pub(super) struct ProtectVisitor {
    pub opts: MapOpts,
    pub changed: bool,
}

impl<E: PageTableEntry> Visitor<E> for ProtectVisitor {
    fn requires_alloc(&self) -> bool {
        false
    }

    fn visit(&mut self, _start: u64, entry: &E, _align: u64) -> bool {
        if entry.options() != self.opts {
            entry.set(entry.address(), self.opts);
            self.changed = true;
        }
        true
    }
}

/// Captures the first valid leaf and stops.
#[derive(Default)]
pub(super) struct LookupVisitor {
    pub found: Option<Translation>,
}

impl<E: PageTableEntry> Visitor<E> for LookupVisitor {
    fn requires_alloc(&self) -> bool {
        false
    }

    fn visit(&mut self, start: u64, entry: &E, align: u64) -> bool {
        self.found = Some(Translation {
            virtual_base: VirtualAddress::new(start),
            physical_base: entry.address(),
            size: align + 1,
            opts: entry.options(),
        });
        false
    }
}

/// Stops at the first valid leaf.
#[derive(Default)]
pub(super) struct EmptyVisitor {
    pub found: bool,
}

impl<E: PageTableEntry> Visitor<E> for EmptyVisitor {
    fn requires_alloc(&self) -> bool {
        false
    }

    fn visit(&mut self, _start: u64, _entry: &E, _align: u64) -> bool {
        self.found = true;
        false
    }
}
