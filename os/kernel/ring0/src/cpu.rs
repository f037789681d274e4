use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::vec;

use ring0_pagetables::{Arch, EntryAllocator, PageTables, TranslationCache, VirtualAddress};
use ring0_registers::FpStatus;

use crate::hardware::{FloatingPoint, Hardware};
use crate::kernel::{Kernel, KernelError};
use crate::registers::{FpState, Registers};
use crate::vector::{Exit, Vector, classify};

/// Privilege level a [`Cpu`] is currently running at.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Mode {
    Supervisor,
    Sandboxed,
}

/// One request to run a sandboxed context.
pub struct SwitchOpts<'a, 'u, A: Arch, M: EntryAllocator<A::Entry>> {
    /// Context to run; updated with the trapped state on return.
    pub registers: &'a mut Registers,
    /// Floating-point file of the context; loaded on first use and saved
    /// on return if it was used.
    pub fp_state: &'a mut FpState,
    pub page_tables: &'a PageTables<'u, A, M>,
    /// Drop this CPU's cached translations for the tables' tag first.
    pub flush: bool,
}

/// A physical CPU driven by the supervisor.
pub struct Cpu<'k, A: Arch, H> {
    kernel: &'k Kernel<A>,
    id: usize,
    machine: H,
    mode: Mode,
    stack: Box<[u8]>,
    supervisor: Registers,
    frame: Registers,
    vectors: u64,
    loaded_root: Option<u64>,
    loaded_asid: Option<u16>,
    /// Flush epoch each tag had when this CPU last loaded it.
    loaded_epochs: BTreeMap<u16, u64>,
    /// The FP file holds the sandboxed context's values.
    fp_dirty: bool,
    last_exit: Option<Exit>,
}

impl<'k, A, H> Cpu<'k, A, H>
where
    A: Arch,
    H: Hardware + FloatingPoint + TranslationCache,
{
    pub fn new(kernel: &'k Kernel<A>, id: usize, machine: H) -> Result<Self, KernelError> {
        kernel.register_cpu(id)?;

        let stack = vec![0u8; kernel.opts().stack_size].into_boxed_slice();
        let mut supervisor = Registers::new();
        supervisor.set_stack(stack_top(&stack));
        let vectors = machine.entry_point_address();
        log::debug!(
            "CPU {id}: stack top {:#x}, vectors at {vectors:#x}",
            supervisor.stack()
        );

        Ok(Self {
            kernel,
            id,
            machine,
            mode: Mode::Supervisor,
            stack,
            supervisor,
            frame: Registers::new(),
            vectors,
            loaded_root: None,
            loaded_asid: None,
            loaded_epochs: BTreeMap::new(),
            fp_dirty: false,
            last_exit: None,
        })
    }

    /// Run `opts.registers` under `opts.page_tables` until it traps.
    ///
    /// The first floating-point instruction of the run traps back here; the
    /// context's FP file is loaded and the instruction restarted. A file that
    /// was loaded is saved before returning, one that was not is left alone.
    ///
    /// The tables' tag is flushed on this CPU first if `opts.flush` is set or
    /// if this CPU has not loaded the tag since its last global flush.
    ///
    /// # Panics
    /// If the CPU is not in supervisor mode.
    pub fn switch_to_user<M: EntryAllocator<A::Entry>>(
        &mut self,
        opts: SwitchOpts<'_, '_, A, M>,
    ) -> Exit {
        assert_eq!(
            self.mode,
            Mode::Supervisor,
            "CPU {} is already in sandboxed mode",
            self.id
        );
        let SwitchOpts {
            registers,
            fp_state,
            page_tables,
            flush,
        } = opts;

        let assignment = self.kernel.assign_asid(page_tables, &self.machine);
        let asid = assignment.asid;
        // A tag last loaded here at an older epoch (or never) may still hold
        // another owner's translations on this CPU.
        let seen = self.loaded_epochs.insert(asid, assignment.epoch);
        if flush || seen != Some(assignment.epoch) {
            self.machine.flush_local(asid);
        }
        let root = page_tables.translation_root(!flush);
        self.loaded_root = Some(root);
        self.loaded_asid = Some(asid);

        self.frame = *registers;
        self.arm_entry(FpStatus::Off);

        loop {
            self.mode = Mode::Sandboxed;
            self.machine.enter_sandboxed(root, &mut self.frame);
            self.mode = Mode::Supervisor;

            if !self.is_first_fp_use() {
                break;
            }
            log::trace!("CPU {}: first FP use at {:#x}", self.id, self.frame.ip());
            self.machine.load(fp_state);
            self.fp_dirty = true;
            self.arm_entry(FpStatus::Clean);
        }

        if self.fp_dirty {
            self.machine.save(fp_state);
            self.fp_dirty = false;
        }

        *registers = self.frame;
        let exit = classify(&self.frame);
        if exit == Exit::Syscall {
            registers.set_ip(registers.ip().wrapping_add(4));
        }
        log::trace!("CPU {}: {exit:?} at {:#x}", self.id, self.frame.ip());
        self.last_exit = Some(exit);
        exit
    }

    fn arm_entry(&mut self, fs: FpStatus) {
        let status = self.frame.status().for_user_entry().with_sie(false).with_fs(fs);
        self.frame.set_status(status);
    }

    fn is_first_fp_use(&self) -> bool {
        !self.fp_dirty
            && self.frame.status().fs() == FpStatus::Off
            && Vector::from_cause(self.frame.cause()) == Vector::IllegalInstruction
    }
}

impl<A: Arch, H> Cpu<'_, A, H> {
    #[must_use]
    pub const fn id(&self) -> usize {
        self.id
    }

    #[must_use]
    pub const fn mode(&self) -> Mode {
        self.mode
    }

    #[must_use]
    pub const fn last_exit(&self) -> Option<Exit> {
        self.last_exit
    }

    /// Address of the last memory fault, if the last exit was one.
    #[must_use]
    pub const fn fault_addr(&self) -> Option<VirtualAddress> {
        match self.last_exit {
            Some(Exit::Fault(fault)) => Some(fault.addr),
            _ => None,
        }
    }

    /// Translation root used by the last switch.
    #[must_use]
    pub const fn loaded_root(&self) -> Option<u64> {
        self.loaded_root
    }

    #[must_use]
    pub const fn loaded_asid(&self) -> Option<u16> {
        self.loaded_asid
    }

    /// Initial supervisor stack pointer, 16-byte aligned.
    #[must_use]
    pub const fn stack_top(&self) -> u64 {
        self.supervisor.stack()
    }

    #[must_use]
    pub fn stack_size(&self) -> usize {
        self.stack.len()
    }

    /// Trap vector address of the machine.
    #[must_use]
    pub const fn vectors(&self) -> u64 {
        self.vectors
    }

    #[must_use]
    pub const fn machine(&self) -> &H {
        &self.machine
    }

    pub const fn machine_mut(&mut self) -> &mut H {
        &mut self.machine
    }
}

impl<A: Arch, H> Drop for Cpu<'_, A, H> {
    fn drop(&mut self) {
        self.kernel.unregister_cpu(self.id);
    }
}

impl<A: Arch, H> core::fmt::Debug for Cpu<'_, A, H> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Cpu")
            .field("id", &self.id)
            .field("mode", &self.mode)
            .field("loaded_asid", &self.loaded_asid)
            .field("last_exit", &self.last_exit)
            .finish_non_exhaustive()
    }
}

fn stack_top(stack: &[u8]) -> u64 {
    let end = stack.as_ptr_range().end.addr() as u64;
    end & !0xf
}
