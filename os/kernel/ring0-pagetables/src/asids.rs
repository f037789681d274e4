//! # Address-Space Identifiers
//!
//! Hardware tags translations with a small identifier (ASID on RISC-V and
//! ARM64, PCID on x86-64) so that switching address spaces need not flush
//! everything. [`Asids`] multiplexes a bounded range of tags over any number
//! of [`PageTables`](crate::PageTables):
//!
//! - a tag stays bound to its owner until released, evicted or the owner's
//!   [`AsidSlot`] is dropped,
//! - an exhausted pool evicts the least recently assigned owner,
//! - a tag that may still hold translations is flushed on every CPU
//!   **before** it is handed to a different owner.
//!
//! Release does not flush. The tag is marked dirty and flushed on its next
//! assignment.
//!
//! The allocator is plain data; callers share it behind a lock.

use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU16, Ordering};

use crate::page_tables::PageTablesId;
use crate::tlb::TranslationCache;

/// Tag reserved for the supervisor's own address space.
pub const FIXED_KERNEL_ASID: u16 = 1;

/// Default number of tags handed out to sandboxed address spaces.
pub const POOL_ASIDS: u16 = 128;

#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AsidError {
    #[error("ASID range {start}..{start}+{size} exceeds the limit of {limit}")]
    RangeTooLarge { start: u16, size: u16, limit: u16 },
    #[error("ASID pool is empty")]
    EmptyPool,
    #[error("ASID 0 is never handed out")]
    ReservedZero,
}

/// An owner's view of its tag.
///
/// Shared between the owner and the pool; the pool writes the tag on
/// assignment and resets it to 0 on release or eviction. A slot whose owner
/// is gone frees its tag.
#[derive(Debug)]
pub struct AsidSlot {
    owner: PageTablesId,
    asid: AtomicU16,
}

impl AsidSlot {
    #[must_use]
    pub fn new() -> Self {
        Self {
            owner: PageTablesId::next(),
            asid: AtomicU16::new(0),
        }
    }

    #[must_use]
    pub const fn owner(&self) -> PageTablesId {
        self.owner
    }

    /// Bound tag, or 0 if none.
    #[must_use]
    pub fn asid(&self) -> u16 {
        self.asid.load(Ordering::Acquire)
    }

    fn bind(&self, asid: u16) {
        self.asid.store(asid, Ordering::Release);
    }
}

impl Default for AsidSlot {
    fn default() -> Self {
        Self::new()
    }
}

/// Result of [`Asids::assign`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Assignment {
    pub asid: u16,
    /// Number of global flushes of `asid` so far.
    ///
    /// A CPU that last loaded `asid` at an older epoch may still cache
    /// another owner's translations under it.
    pub epoch: u64,
    /// The owner already held this tag; its cached translations are intact.
    pub reused: bool,
    /// The tag was flushed on every CPU before being bound.
    pub flushed: bool,
}

#[derive(Debug, Clone)]
struct AsidRecord {
    asid: u16,
    owner: Option<Weak<AsidSlot>>,
    /// Number of global flushes of this tag.
    epoch: u64,
    /// Translations may be cached since the last flush.
    dirty: bool,
    last_assigned: u64,
}

impl AsidRecord {
    fn owner(&self) -> Option<Arc<AsidSlot>> {
        self.owner.as_ref().and_then(Weak::upgrade)
    }

    fn is_owned_by(&self, owner: PageTablesId) -> bool {
        self.owner().is_some_and(|slot| slot.owner == owner)
    }

    fn unbind(&mut self) {
        if let Some(slot) = self.owner.take().and_then(|weak| weak.upgrade()) {
            slot.bind(0);
        }
    }
}

/// Bounded tag pool with least-recently-assigned eviction.
#[derive(Debug)]
pub struct Asids {
    records: Vec<AsidRecord>,
    clock: u64,
}

impl Asids {
    /// Pool of tags `start..start + size`, all at most `limit`.
    pub fn new(start: u16, size: u16, limit: u16) -> Result<Self, AsidError> {
        if size == 0 {
            return Err(AsidError::EmptyPool);
        }
        if start == 0 {
            return Err(AsidError::ReservedZero);
        }
        if u32::from(start) + u32::from(size) > u32::from(limit) + 1 {
            return Err(AsidError::RangeTooLarge { start, size, limit });
        }
        let records = (start..=start + (size - 1))
            .map(|asid| AsidRecord {
                asid,
                owner: None,
                epoch: 0,
                dirty: false,
                last_assigned: 0,
            })
            .collect();
        Ok(Self { records, clock: 0 })
    }

    /// Bind a tag to the owner of `slot` and record it there.
    ///
    /// Never fails: an exhausted pool evicts, resetting the evicted owner's
    /// slot. Any flush happens through `cache.flush_global` before this
    /// returns the tag.
    pub fn assign<C: TranslationCache>(&mut self, slot: &Arc<AsidSlot>, cache: &C) -> Assignment {
        self.clock += 1;
        let clock = self.clock;

        if let Some(record) = self.records.iter_mut().find(|r| r.is_owned_by(slot.owner)) {
            record.last_assigned = clock;
            slot.bind(record.asid);
            return Assignment {
                asid: record.asid,
                epoch: record.epoch,
                reused: true,
                flushed: false,
            };
        }

        let index = match self.records.iter().position(|r| r.owner().is_none()) {
            Some(index) => index,
            None => self.evict(),
        };

        let record = &mut self.records[index];
        record.owner = None;
        let flushed = record.dirty;
        if flushed {
            cache.flush_global(record.asid);
            record.epoch += 1;
            log::debug!("flushed ASID {} (epoch {})", record.asid, record.epoch);
        }
        record.owner = Some(Arc::downgrade(slot));
        record.dirty = true;
        record.last_assigned = clock;
        slot.bind(record.asid);

        Assignment {
            asid: record.asid,
            epoch: record.epoch,
            reused: false,
            flushed,
        }
    }

    fn evict(&mut self) -> usize {
        let (index, victim) = self
            .records
            .iter_mut()
            .enumerate()
            .min_by_key(|(_, r)| r.last_assigned)
            .unwrap_or_else(|| unreachable!("ASID pool is never empty"));
        log::debug!(
            "evicting ASID {} from {:?}",
            victim.asid,
            victim.owner().map(|slot| slot.owner)
        );
        victim.unbind();
        index
    }

    /// Return the tag of `slot` to the pool without flushing.
    pub fn release(&mut self, slot: &AsidSlot) -> Option<u16> {
        let Some(record) = self.records.iter_mut().find(|r| r.is_owned_by(slot.owner)) else {
            log::warn!("{:?} released without holding an ASID", slot.owner);
            return None;
        };
        record.unbind();
        Some(record.asid)
    }

    /// Tag currently bound to `owner`.
    #[must_use]
    pub fn lookup(&self, owner: PageTablesId) -> Option<u16> {
        self.records
            .iter()
            .find(|r| r.is_owned_by(owner))
            .map(|r| r.asid)
    }

    /// Number of global flushes `asid` has gone through.
    #[must_use]
    pub fn epoch(&self, asid: u16) -> Option<u64> {
        self.records.iter().find(|r| r.asid == asid).map(|r| r.epoch)
    }

    /// Number of tags bound to a live owner.
    #[must_use]
    pub fn bound(&self) -> usize {
        self.records.iter().filter(|r| r.owner().is_some()).count()
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.records.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::cell::RefCell;

    #[derive(Default)]
    struct Flushes(RefCell<alloc::vec::Vec<u16>>);

    impl TranslationCache for Flushes {
        fn flush_local(&self, _asid: u16) {
            unreachable!("the allocator only flushes globally");
        }

        fn flush_global(&self, asid: u16) {
            self.0.borrow_mut().push(asid);
        }
    }

    fn slots(n: usize) -> alloc::vec::Vec<Arc<AsidSlot>> {
        (0..n).map(|_| Arc::new(AsidSlot::new())).collect()
    }

    #[test]
    fn range_is_checked() {
        assert_eq!(
            Asids::new(4000, 128, 4095).unwrap_err(),
            AsidError::RangeTooLarge {
                start: 4000,
                size: 128,
                limit: 4095
            }
        );
        assert_eq!(Asids::new(2, 0, 4095).unwrap_err(), AsidError::EmptyPool);
        assert_eq!(Asids::new(0, 4, 4095).unwrap_err(), AsidError::ReservedZero);
    }

    #[test]
    fn pool_may_end_on_the_limit() {
        let asids = Asids::new(1, 255, 255).unwrap();
        assert_eq!(asids.capacity(), 255);
        assert_eq!(asids.epoch(255), Some(0));
        assert_eq!(asids.epoch(256), None);
        assert!(Asids::new(1, 256, 255).is_err());
    }

    #[test]
    fn repeated_assign_is_a_hit() {
        let flushes = Flushes::default();
        let mut asids = Asids::new(2, 4, 4095).unwrap();
        let a = Arc::new(AsidSlot::new());

        let first = asids.assign(&a, &flushes);
        let again = asids.assign(&a, &flushes);
        assert_eq!(first.asid, again.asid);
        assert_eq!(a.asid(), first.asid);
        assert!(!first.reused);
        assert!(again.reused);
        assert!(flushes.0.borrow().is_empty());
    }

    #[test]
    fn released_tag_is_flushed_before_reuse() {
        let flushes = Flushes::default();
        let mut asids = Asids::new(2, 1, 4095).unwrap();
        let owners = slots(2);

        let a = asids.assign(&owners[0], &flushes);
        assert_eq!(asids.release(&owners[0]), Some(a.asid));
        assert_eq!(owners[0].asid(), 0);
        assert!(flushes.0.borrow().is_empty(), "release must not flush");

        let b = asids.assign(&owners[1], &flushes);
        assert_eq!(b.asid, a.asid);
        assert!(b.flushed);
        assert_eq!(b.epoch, a.epoch + 1);
        assert_eq!(*flushes.0.borrow(), [a.asid]);
        assert_eq!(asids.epoch(a.asid), Some(1));
    }

    #[test]
    fn eviction_is_least_recently_assigned() {
        let flushes = Flushes::default();
        let mut asids = Asids::new(2, 2, 4095).unwrap();
        let owners = slots(3);

        let a = asids.assign(&owners[0], &flushes);
        let b = asids.assign(&owners[1], &flushes);
        // touch `a`, making `b` the oldest
        asids.assign(&owners[0], &flushes);

        let c = asids.assign(&owners[2], &flushes);
        assert_eq!(c.asid, b.asid);
        assert_eq!(asids.lookup(owners[1].owner()), None);
        assert_eq!(owners[1].asid(), 0, "evicted owner keeps a stale tag");
        assert_eq!(asids.lookup(owners[0].owner()), Some(a.asid));
        assert_eq!(*flushes.0.borrow(), [b.asid]);
    }

    #[test]
    fn dropped_owner_frees_its_tag() {
        let flushes = Flushes::default();
        let mut asids = Asids::new(2, 1, 4095).unwrap();
        let owners = slots(2);
        let mut owners = owners.into_iter();
        let first = owners.next().unwrap();
        let second = owners.next().unwrap();

        let a = asids.assign(&first, &flushes);
        drop(first);
        assert_eq!(asids.bound(), 0);

        let b = asids.assign(&second, &flushes);
        assert_eq!(b.asid, a.asid);
        assert!(b.flushed);
    }

    #[test]
    fn unknown_release_is_harmless() {
        let mut asids = Asids::new(2, 2, 4095).unwrap();
        assert_eq!(asids.release(&AsidSlot::new()), None);
        assert_eq!(asids.bound(), 0);
    }
}
