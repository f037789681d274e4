use alloc::vec;
use alloc::vec::Vec;
use core::marker::PhantomData;

use ring0_pagetables::{
    Arch, AsidError, Asids, Assignment, EntryAllocator, PageTables, POOL_ASIDS, TranslationCache,
};
use spin::Mutex;

/// Default supervisor stack size per CPU.
pub const DEFAULT_STACK_SIZE: usize = 16 * 1024;

/// Default CPU count limit.
pub const DEFAULT_MAX_CPUS: usize = 64;

/// First tag of the default sandbox pool. Tag 0 is unused and 1 is the
/// supervisor's.
pub const DEFAULT_ASID_START: u16 = 2;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct KernelOpts {
    pub max_cpus: usize,
    /// Supervisor stack size of each CPU; a non-zero multiple of 16.
    pub stack_size: usize,
    pub asid_start: u16,
    pub asid_pool: u16,
}

impl Default for KernelOpts {
    fn default() -> Self {
        Self {
            max_cpus: DEFAULT_MAX_CPUS,
            stack_size: DEFAULT_STACK_SIZE,
            asid_start: DEFAULT_ASID_START,
            asid_pool: POOL_ASIDS,
        }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum KernelError {
    #[error(transparent)]
    Asid(#[from] AsidError),
    #[error("stack size {0} is not a non-zero multiple of 16")]
    InvalidStackSize(usize),
    #[error("CPU {id} exceeds the limit of {max} CPUs")]
    CpuOutOfRange { id: usize, max: usize },
    #[error("CPU {0} is already online")]
    CpuOnline(usize),
}

/// State shared by every [`Cpu`](crate::Cpu) of one supervisor.
pub struct Kernel<A: Arch> {
    opts: KernelOpts,
    asids: Mutex<Asids>,
    /// One bit per online CPU id.
    online: Mutex<Vec<u64>>,
    _arch: PhantomData<A>,
}

impl<A: Arch> Kernel<A> {
    pub fn new(opts: KernelOpts) -> Result<Self, KernelError> {
        if opts.stack_size == 0 || opts.stack_size % 16 != 0 {
            return Err(KernelError::InvalidStackSize(opts.stack_size));
        }
        let asids = Asids::new(opts.asid_start, opts.asid_pool, A::ASID_LIMIT)?;
        log::debug!(
            "{} kernel: {} CPUs max, ASIDs {}..{}",
            A::NAME,
            opts.max_cpus,
            opts.asid_start,
            u32::from(opts.asid_start) + u32::from(opts.asid_pool)
        );
        Ok(Self {
            opts,
            asids: Mutex::new(asids),
            online: Mutex::new(vec![0; opts.max_cpus.div_ceil(64)]),
            _arch: PhantomData,
        })
    }

    #[must_use]
    pub const fn opts(&self) -> &KernelOpts {
        &self.opts
    }

    /// Bind a tag to `tables` and record it there.
    ///
    /// The tables that lose their tag to eviction have it reset to 0.
    pub fn assign_asid<M, C>(&self, tables: &PageTables<'_, A, M>, cache: &C) -> Assignment
    where
        M: EntryAllocator<A::Entry>,
        C: TranslationCache,
    {
        self.asids.lock().assign(tables.asid_slot(), cache)
    }

    /// Return the tag of `tables` to the pool. It is flushed before its
    /// next owner runs.
    pub fn release_asid<M: EntryAllocator<A::Entry>>(&self, tables: &PageTables<'_, A, M>) {
        self.asids.lock().release(tables.asid_slot());
    }

    /// Tags currently bound.
    pub fn bound_asids(&self) -> usize {
        self.asids.lock().bound()
    }

    /// Number of global flushes `asid` has gone through.
    pub fn asid_epoch(&self, asid: u16) -> Option<u64> {
        self.asids.lock().epoch(asid)
    }

    /// CPUs currently online.
    pub fn cpus(&self) -> usize {
        self.online
            .lock()
            .iter()
            .map(|word| word.count_ones() as usize)
            .sum()
    }

    pub(crate) fn register_cpu(&self, id: usize) -> Result<(), KernelError> {
        if id >= self.opts.max_cpus {
            return Err(KernelError::CpuOutOfRange {
                id,
                max: self.opts.max_cpus,
            });
        }
        let mut online = self.online.lock();
        let (word, bit) = (id / 64, 1 << (id % 64));
        if online[word] & bit != 0 {
            return Err(KernelError::CpuOnline(id));
        }
        online[word] |= bit;
        Ok(())
    }

    pub(crate) fn unregister_cpu(&self, id: usize) {
        self.online.lock()[id / 64] &= !(1 << (id % 64));
    }
}

impl<A: Arch> core::fmt::Debug for Kernel<A> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Kernel")
            .field("arch", &A::NAME)
            .field("opts", &self.opts)
            .field("cpus", &self.cpus())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ring0_pagetables::Riscv64;

    #[test]
    fn stack_size_is_validated() {
        for stack_size in [0, 24, 4097] {
            let err = Kernel::<Riscv64>::new(KernelOpts {
                stack_size,
                ..KernelOpts::default()
            })
            .unwrap_err();
            assert_eq!(err, KernelError::InvalidStackSize(stack_size));
        }
    }

    #[test]
    fn asid_range_is_validated() {
        let err = Kernel::<Riscv64>::new(KernelOpts {
            asid_start: 4000,
            asid_pool: 200,
            ..KernelOpts::default()
        })
        .unwrap_err();
        assert!(matches!(err, KernelError::Asid(AsidError::RangeTooLarge { .. })));
    }

    #[test]
    fn cpu_limit() {
        let kernel = Kernel::<Riscv64>::new(KernelOpts {
            max_cpus: 2,
            ..KernelOpts::default()
        })
        .unwrap();
        assert!(kernel.register_cpu(1).is_ok());
        assert_eq!(
            kernel.register_cpu(2),
            Err(KernelError::CpuOutOfRange { id: 2, max: 2 })
        );
        assert_eq!(kernel.cpus(), 1);
    }

    #[test]
    fn cpu_ids_are_unique() {
        let kernel = Kernel::<Riscv64>::new(KernelOpts {
            max_cpus: 130,
            ..KernelOpts::default()
        })
        .unwrap();
        assert!(kernel.register_cpu(129).is_ok());
        assert_eq!(kernel.register_cpu(129), Err(KernelError::CpuOnline(129)));
        assert!(kernel.register_cpu(65).is_ok());
        assert_eq!(kernel.cpus(), 2);

        kernel.unregister_cpu(129);
        assert!(kernel.register_cpu(129).is_ok());
    }
}
