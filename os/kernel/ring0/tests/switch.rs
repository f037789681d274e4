use std::cell::RefCell;
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};

use ring0::{
    Cpu, Exit, FaultKind, FloatingPoint, FpState, Hardware, Kernel, KernelError, KernelOpts, Mode,
    Registers, SwitchOpts, TranslationCache, Vector,
};
use ring0_pagetables::layout::PTE_SIZE;
use ring0_pagetables::{
    AccessType, Arch, MapOpts, PageTables, PhysicalAddress, Riscv64, RuntimeAllocator, Sv48Entry,
    VirtualAddress,
};
use ring0_registers::{FpStatus, Sstatus};

const ENTRY: u64 = 0x1000;
const VECTORS: u64 = 0xffff_ffff_8000_4000;

/// What the sandboxed code does next.
#[derive(Debug, Copy, Clone)]
enum Step {
    /// Write `f0`; traps while the FP unit is off.
    FpWrite(u64),
    Ecall,
    Exception { cause: u64, addr: u64 },
    Interrupt(u64),
    Crash,
}

#[derive(Debug)]
struct Entry {
    root: u64,
    status: Sstatus,
}

#[derive(Default)]
struct FakeMachine {
    script: VecDeque<Step>,
    entries: Vec<Entry>,
    fp: FpState,
    loads: usize,
    saves: usize,
    local_flushes: RefCell<Vec<u16>>,
    global_flushes: RefCell<Vec<u16>>,
}

impl FakeMachine {
    fn scripted(steps: &[Step]) -> Self {
        Self {
            script: steps.iter().copied().collect(),
            ..Self::default()
        }
    }

    fn push(&mut self, steps: &[Step]) {
        self.script.extend(steps.iter().copied());
    }
}

fn raise(frame: &mut Registers, cause: u64, addr: u64) {
    frame.regs[Registers::CAUSE] = cause;
    frame.regs[Registers::BADADDR] = addr;
    frame.regs[Registers::ORIG_A0] = frame.return_value();
    frame.set_status(frame.status().with_spp(false));
}

impl Hardware for FakeMachine {
    fn enter_sandboxed(&mut self, root: u64, frame: &mut Registers) {
        self.entries.push(Entry {
            root,
            status: frame.status(),
        });
        loop {
            let step = self.script.pop_front().expect("script exhausted");
            match step {
                Step::FpWrite(value) => {
                    if frame.status().fs() == FpStatus::Off {
                        self.script.push_front(step);
                        raise(frame, 2, 0);
                        return;
                    }
                    self.fp.set_f(0, value);
                    frame.set_status(frame.status().with_fs(FpStatus::Dirty));
                    frame.set_ip(frame.ip() + 4);
                }
                Step::Ecall => return raise(frame, 8, 0),
                Step::Exception { cause, addr } => return raise(frame, cause, addr),
                Step::Interrupt(code) => return raise(frame, (1 << 63) | code, 0),
                Step::Crash => panic!("machine crashed"),
            }
        }
    }

    fn entry_point_address(&self) -> u64 {
        VECTORS
    }
}

impl FloatingPoint for FakeMachine {
    fn save(&mut self, state: &mut FpState) {
        self.saves += 1;
        *state = self.fp.clone();
    }

    fn load(&mut self, state: &FpState) {
        self.loads += 1;
        self.fp = state.clone();
    }
}

impl TranslationCache for FakeMachine {
    fn flush_local(&self, asid: u16) {
        self.local_flushes.borrow_mut().push(asid);
    }

    fn flush_global(&self, asid: u16) {
        self.global_flushes.borrow_mut().push(asid);
    }
}

type Tables<'a> = PageTables<'a, Riscv64, &'a RuntimeAllocator<Sv48Entry>>;

fn kernel() -> Kernel<Riscv64> {
    Kernel::new(KernelOpts::default()).unwrap()
}

fn user_tables(alloc: &RuntimeAllocator<Sv48Entry>) -> Tables<'_> {
    let mut pt = PageTables::new(alloc).unwrap();
    pt.map(
        VirtualAddress::new(ENTRY),
        PTE_SIZE,
        MapOpts::user(AccessType::READ_EXECUTE),
        PhysicalAddress::new(0x8000_0000),
    )
    .unwrap();
    pt
}

fn context() -> (Registers, FpState) {
    let mut regs = Registers::new();
    regs.set_ip(ENTRY);
    regs.set_stack(0x7fff_f000);
    (regs, FpState::new())
}

fn run(
    cpu: &mut Cpu<'_, Riscv64, FakeMachine>,
    registers: &mut Registers,
    fp_state: &mut FpState,
    page_tables: &Tables<'_>,
    flush: bool,
) -> Exit {
    cpu.switch_to_user(SwitchOpts {
        registers,
        fp_state,
        page_tables,
        flush,
    })
}

#[test]
fn syscall_resumes_after_the_ecall() {
    let kernel = kernel();
    let alloc = RuntimeAllocator::new();
    let pt = user_tables(&alloc);
    let mut cpu = Cpu::new(&kernel, 0, FakeMachine::scripted(&[Step::Ecall])).unwrap();
    let (mut regs, mut fp) = context();
    regs.regs[Registers::A7] = 64;
    regs.set_return_value(1);

    assert_eq!(run(&mut cpu, &mut regs, &mut fp, &pt, false), Exit::Syscall);
    assert_eq!(regs.ip(), ENTRY + 4);
    assert_eq!(regs.syscall_number(), 64);
    assert_eq!(regs.syscall_args()[0], 1);
    assert_eq!(cpu.last_exit(), Some(Exit::Syscall));
    assert_eq!(cpu.mode(), Mode::Supervisor);
    assert_eq!(cpu.fault_addr(), None);
}

#[test]
fn store_page_fault_reports_a_write() {
    let kernel = kernel();
    let alloc = RuntimeAllocator::new();
    let pt = user_tables(&alloc);
    let machine = FakeMachine::scripted(&[Step::Exception {
        cause: 15,
        addr: 0x5008,
    }]);
    let mut cpu = Cpu::new(&kernel, 0, machine).unwrap();
    let (mut regs, mut fp) = context();

    let Exit::Fault(fault) = run(&mut cpu, &mut regs, &mut fp, &pt, false) else {
        panic!("expected a fault");
    };
    assert_eq!(fault.vector, Vector::StorePageFault);
    assert_eq!(fault.kind, FaultKind::Page);
    assert!(fault.access.write);
    assert!(fault.user);
    assert_eq!(cpu.fault_addr(), Some(VirtualAddress::new(0x5008)));
    // faults do not advance the instruction pointer
    assert_eq!(regs.ip(), ENTRY);
}

#[test]
fn non_canonical_fault() {
    let kernel = kernel();
    let alloc = RuntimeAllocator::new();
    let pt = user_tables(&alloc);
    let machine = FakeMachine::scripted(&[Step::Exception {
        cause: 13,
        addr: 0x0001_0000_0000_0000,
    }]);
    let mut cpu = Cpu::new(&kernel, 0, machine).unwrap();
    let (mut regs, mut fp) = context();

    let Exit::Fault(fault) = run(&mut cpu, &mut regs, &mut fp, &pt, false) else {
        panic!("expected a fault");
    };
    assert_eq!(fault.kind, FaultKind::NonCanonical);
    assert!(fault.access.read);
}

#[test]
fn interrupts_leave_the_context_untouched() {
    let kernel = kernel();
    let alloc = RuntimeAllocator::new();
    let pt = user_tables(&alloc);
    let mut cpu = Cpu::new(&kernel, 0, FakeMachine::scripted(&[Step::Interrupt(5)])).unwrap();
    let (mut regs, mut fp) = context();

    assert_eq!(
        run(&mut cpu, &mut regs, &mut fp, &pt, false),
        Exit::Interrupt(Vector::TimerInterrupt)
    );
    assert_eq!(regs.ip(), ENTRY);
}

#[test]
fn first_fp_use_loads_once_and_saves_on_exit() {
    let kernel = kernel();
    let alloc = RuntimeAllocator::new();
    let pt = user_tables(&alloc);
    let machine = FakeMachine::scripted(&[Step::FpWrite(7), Step::FpWrite(8), Step::Ecall]);
    let mut cpu = Cpu::new(&kernel, 0, machine).unwrap();
    let (mut regs, mut fp) = context();
    fp.set_f(1, 3);

    assert_eq!(run(&mut cpu, &mut regs, &mut fp, &pt, false), Exit::Syscall);

    let machine = cpu.machine();
    assert_eq!(machine.loads, 1);
    assert_eq!(machine.saves, 1);
    assert_eq!(machine.entries.len(), 2);
    assert_eq!(machine.entries[0].status.fs(), FpStatus::Off);
    assert_ne!(machine.entries[1].status.fs(), FpStatus::Off);
    assert_eq!(fp.f(0), 8);
    assert_eq!(fp.f(1), 3);
    // two FP instructions, then the ecall
    assert_eq!(regs.ip(), ENTRY + 12);
}

#[test]
fn untouched_fp_state_is_never_saved() {
    let kernel = kernel();
    let alloc = RuntimeAllocator::new();
    let pt = user_tables(&alloc);
    let mut cpu = Cpu::new(&kernel, 0, FakeMachine::scripted(&[Step::Ecall])).unwrap();
    let (mut regs, mut fp) = context();
    fp.set_fcsr(0x5);
    cpu.machine_mut().fp.set_f(0, 99);

    run(&mut cpu, &mut regs, &mut fp, &pt, false);

    assert_eq!(cpu.machine().loads, 0);
    assert_eq!(cpu.machine().saves, 0);
    assert_eq!(fp.f(0), 0);
    assert_eq!(fp.fcsr(), 0x5);
}

#[test]
fn fp_is_rearmed_on_every_switch() {
    let kernel = kernel();
    let alloc = RuntimeAllocator::new();
    let pt = user_tables(&alloc);
    let mut cpu = Cpu::new(&kernel, 0, FakeMachine::scripted(&[Step::FpWrite(1), Step::Ecall]))
        .unwrap();
    let (mut regs, mut fp) = context();

    run(&mut cpu, &mut regs, &mut fp, &pt, false);
    cpu.machine_mut().push(&[Step::FpWrite(2), Step::Ecall]);
    run(&mut cpu, &mut regs, &mut fp, &pt, false);

    assert_eq!(cpu.machine().loads, 2);
    assert_eq!(cpu.machine().saves, 2);
    assert_eq!(fp.f(0), 2);
}

#[test]
fn switch_binds_an_asid_and_loads_its_root() {
    let kernel = kernel();
    let alloc = RuntimeAllocator::new();
    let a = user_tables(&alloc);
    let b = user_tables(&alloc);
    let machine = FakeMachine::scripted(&[Step::Ecall, Step::Ecall, Step::Ecall]);
    let mut cpu = Cpu::new(&kernel, 0, machine).unwrap();
    let (mut regs, mut fp) = context();

    run(&mut cpu, &mut regs, &mut fp, &a, false);
    assert_eq!(a.asid(), 2);
    assert_eq!(cpu.loaded_asid(), Some(2));
    let root = Riscv64::translation_root(a.root_physical(), 2, true);
    assert_eq!(cpu.loaded_root(), Some(root));
    assert_eq!(cpu.machine().entries[0].root, root);

    run(&mut cpu, &mut regs, &mut fp, &b, false);
    assert_eq!(b.asid(), 3);
    run(&mut cpu, &mut regs, &mut fp, &a, false);
    assert_eq!(cpu.loaded_asid(), Some(2));

    assert_eq!(kernel.bound_asids(), 2);
    assert!(cpu.machine().global_flushes.borrow().is_empty());
    // first load of each tag on this CPU only
    assert_eq!(*cpu.machine().local_flushes.borrow(), [2, 3]);

    kernel.release_asid(&b);
    assert_eq!(kernel.bound_asids(), 1);
    assert_eq!(b.asid(), 0);
}

#[test]
fn flush_request_flushes_the_tag_locally() {
    let kernel = kernel();
    let alloc = RuntimeAllocator::new();
    let pt = user_tables(&alloc);
    let mut cpu = Cpu::new(&kernel, 0, FakeMachine::scripted(&[Step::Ecall, Step::Ecall]))
        .unwrap();
    let (mut regs, mut fp) = context();

    run(&mut cpu, &mut regs, &mut fp, &pt, true);
    run(&mut cpu, &mut regs, &mut fp, &pt, false);

    assert_eq!(*cpu.machine().local_flushes.borrow(), [2]);
}

#[test]
fn evicted_tags_are_flushed_before_reuse() {
    let kernel = Kernel::<Riscv64>::new(KernelOpts {
        asid_pool: 2,
        ..KernelOpts::default()
    })
    .unwrap();
    let alloc = RuntimeAllocator::new();
    let tables = [user_tables(&alloc), user_tables(&alloc), user_tables(&alloc)];
    let mut cpu = Cpu::new(&kernel, 0, FakeMachine::scripted(&[Step::Ecall; 3])).unwrap();
    let (mut regs, mut fp) = context();

    for pt in &tables {
        run(&mut cpu, &mut regs, &mut fp, pt, false);
    }

    assert_eq!(tables[2].asid(), 2);
    assert_eq!(tables[0].asid(), 0);
    assert_eq!(*cpu.machine().global_flushes.borrow(), [2]);
    assert_eq!(kernel.asid_epoch(2), Some(1));
}

#[test]
fn rebound_tag_is_flushed_on_the_cpu_that_ran_the_old_owner() {
    let kernel = Kernel::<Riscv64>::new(KernelOpts {
        asid_pool: 1,
        ..KernelOpts::default()
    })
    .unwrap();
    let alloc = RuntimeAllocator::new();
    let a = user_tables(&alloc);
    let b = user_tables(&alloc);
    let mut cpu0 = Cpu::new(&kernel, 0, FakeMachine::scripted(&[Step::Ecall; 2])).unwrap();
    let mut cpu1 = Cpu::new(&kernel, 1, FakeMachine::scripted(&[Step::Ecall])).unwrap();
    let (mut regs, mut fp) = context();

    run(&mut cpu0, &mut regs, &mut fp, &a, false);
    assert_eq!(a.asid(), 2);
    assert_eq!(*cpu0.machine().local_flushes.borrow(), [2]);

    // cpu1 takes the only tag while cpu0 may still cache `a` under it
    run(&mut cpu1, &mut regs, &mut fp, &b, false);
    assert_eq!(b.asid(), 2);
    assert_eq!(a.asid(), 0);
    assert_eq!(*cpu1.machine().global_flushes.borrow(), [2]);
    assert_eq!(kernel.asid_epoch(2), Some(1));

    // same owner, same tag, but cpu0 last loaded it an epoch ago
    run(&mut cpu0, &mut regs, &mut fp, &b, false);
    assert_eq!(cpu0.loaded_asid(), Some(2));
    assert_eq!(*cpu0.machine().local_flushes.borrow(), [2, 2]);
    assert!(cpu0.machine().global_flushes.borrow().is_empty());
}

#[test]
#[should_panic(expected = "already in sandboxed mode")]
fn entering_twice_panics() {
    let kernel = kernel();
    let alloc = RuntimeAllocator::new();
    let pt = user_tables(&alloc);
    let mut cpu = Cpu::new(&kernel, 0, FakeMachine::scripted(&[Step::Crash])).unwrap();
    let (mut regs, mut fp) = context();

    let crashed = panic::catch_unwind(AssertUnwindSafe(|| {
        run(&mut cpu, &mut regs, &mut fp, &pt, false);
    }));
    assert!(crashed.is_err());
    assert_eq!(cpu.mode(), Mode::Sandboxed);

    cpu.machine_mut().push(&[Step::Ecall]);
    run(&mut cpu, &mut regs, &mut fp, &pt, false);
}

#[test]
fn cpu_setup() {
    let kernel = Kernel::<Riscv64>::new(KernelOpts {
        max_cpus: 2,
        stack_size: 8192,
        ..KernelOpts::default()
    })
    .unwrap();

    {
        let cpu = Cpu::new(&kernel, 1, FakeMachine::default()).unwrap();
        assert_eq!(cpu.stack_top() % 16, 0);
        assert_eq!(cpu.stack_size(), 8192);
        assert_eq!(cpu.vectors(), VECTORS);
        assert_eq!(cpu.id(), 1);
        assert_eq!(kernel.cpus(), 1);
        assert_eq!(
            Cpu::new(&kernel, 1, FakeMachine::default()).unwrap_err(),
            KernelError::CpuOnline(1)
        );
        assert_eq!(kernel.cpus(), 1);
    }
    assert_eq!(kernel.cpus(), 0);

    let err = Cpu::new(&kernel, 2, FakeMachine::default()).unwrap_err();
    assert_eq!(err, KernelError::CpuOutOfRange { id: 2, max: 2 });
}
