use std::cell::RefCell;
use std::collections::HashMap;

use ring0_pagetables::{
    Arch, Asids, PageTables, PageTablesId, Riscv64, RuntimeAllocator, Sv48Entry,
    TranslationCache, FIXED_KERNEL_ASID, POOL_ASIDS,
};

/// Records every flush and the binding state at the time it happened.
#[derive(Default)]
struct RecordingCache {
    global: RefCell<Vec<u16>>,
}

impl TranslationCache for RecordingCache {
    fn flush_local(&self, _asid: u16) {
        panic!("unexpected local flush");
    }

    fn flush_global(&self, asid: u16) {
        self.global.borrow_mut().push(asid);
    }
}

fn pool() -> Asids {
    Asids::new(FIXED_KERNEL_ASID + 1, POOL_ASIDS, Riscv64::ASID_LIMIT).unwrap()
}

#[test]
fn the_129th_assignment_evicts_the_first_tag_with_one_flush() {
    let alloc = RuntimeAllocator::<Sv48Entry>::new();
    let tables: Vec<_> = (0..=POOL_ASIDS)
        .map(|_| PageTables::<Riscv64, _>::new(&alloc).unwrap())
        .collect();
    let cache = RecordingCache::default();
    let mut asids = pool();

    let mut assigned = Vec::new();
    for pt in &tables[..usize::from(POOL_ASIDS)] {
        let a = asids.assign(pt.asid_slot(), &cache);
        assert!(!a.flushed);
        assert_eq!(pt.asid(), a.asid);
        assigned.push(a.asid);
    }
    assert!(cache.global.borrow().is_empty());
    assert_eq!(assigned[0], FIXED_KERNEL_ASID + 1);

    let last = &tables[usize::from(POOL_ASIDS)];
    let a = asids.assign(last.asid_slot(), &cache);
    assert_eq!(a.asid, assigned[0]);
    assert!(a.flushed);
    assert_eq!(*cache.global.borrow(), [assigned[0]]);
    assert_eq!(asids.lookup(tables[0].id()), None);
    assert_eq!(tables[0].asid(), 0);
    assert_eq!(asids.lookup(last.id()), Some(assigned[0]));
}

#[test]
fn bound_tags_are_unique_and_reuse_always_flushes() {
    let cache = RecordingCache::default();
    let mut asids = Asids::new(2, 8, Riscv64::ASID_LIMIT).unwrap();
    let alloc = RuntimeAllocator::<Sv48Entry>::new();
    let tables: Vec<_> = (0..20)
        .map(|_| PageTables::<Riscv64, _>::new(&alloc).unwrap())
        .collect();
    let ids: Vec<PageTablesId> = tables.iter().map(PageTables::id).collect();

    // tag -> number of distinct owners it has served
    let mut owners_per_tag: HashMap<u16, usize> = HashMap::new();
    let mut seed = 0x2545_f491_u32;
    for step in 0..500 {
        seed ^= seed << 13;
        seed ^= seed >> 17;
        seed ^= seed << 5;
        let owner = &tables[(seed as usize) % tables.len()];

        if step % 7 == 0 {
            asids.release(owner.asid_slot());
            continue;
        }

        let flushes_before = cache.global.borrow().len();
        let a = asids.assign(owner.asid_slot(), &cache);
        if !a.reused {
            let served = owners_per_tag.entry(a.asid).or_default();
            if *served > 0 {
                assert!(a.flushed, "tag {} reused without a flush", a.asid);
                assert_eq!(cache.global.borrow().len(), flushes_before + 1);
            }
            *served += 1;
        }

        let mut bound: Vec<u16> = ids.iter().filter_map(|id| asids.lookup(*id)).collect();
        let count = bound.len();
        bound.sort_unstable();
        bound.dedup();
        assert_eq!(bound.len(), count, "a tag is bound twice");
        assert_eq!(count, asids.bound());
        for pt in &tables {
            assert_eq!(asids.lookup(pt.id()).unwrap_or(0), pt.asid());
        }
    }
}
