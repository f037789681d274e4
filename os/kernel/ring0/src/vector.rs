//! Trap causes and the classification of a sandbox exit.

use ring0_pagetables::{AccessType, VirtualAddress, layout};
use ring0_registers::Scause;

use crate::registers::Registers;

/// RISC-V trap cause, decoded from `scause`.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Vector {
    InstructionMisaligned,
    InstructionAccessFault,
    IllegalInstruction,
    Breakpoint,
    LoadMisaligned,
    LoadAccessFault,
    StoreMisaligned,
    StoreAccessFault,
    UserEcall,
    SupervisorEcall,
    InstructionPageFault,
    LoadPageFault,
    StorePageFault,
    SoftwareInterrupt,
    TimerInterrupt,
    ExternalInterrupt,
    UnknownException(u64),
    UnknownInterrupt(u64),
}

impl Vector {
    #[must_use]
    pub const fn from_cause(cause: Scause) -> Self {
        let code = cause.code();
        if cause.interrupt() {
            return match code {
                1 => Self::SoftwareInterrupt,
                5 => Self::TimerInterrupt,
                9 => Self::ExternalInterrupt,
                other => Self::UnknownInterrupt(other),
            };
        }
        match code {
            0 => Self::InstructionMisaligned,
            1 => Self::InstructionAccessFault,
            2 => Self::IllegalInstruction,
            3 => Self::Breakpoint,
            4 => Self::LoadMisaligned,
            5 => Self::LoadAccessFault,
            6 => Self::StoreMisaligned,
            7 => Self::StoreAccessFault,
            8 => Self::UserEcall,
            9 => Self::SupervisorEcall,
            12 => Self::InstructionPageFault,
            13 => Self::LoadPageFault,
            15 => Self::StorePageFault,
            other => Self::UnknownException(other),
        }
    }

    #[must_use]
    pub const fn is_interrupt(self) -> bool {
        matches!(
            self,
            Self::SoftwareInterrupt
                | Self::TimerInterrupt
                | Self::ExternalInterrupt
                | Self::UnknownInterrupt(_)
        )
    }

    /// Access that caused a memory fault, or `None` for other causes.
    #[must_use]
    pub const fn fault_access(self) -> Option<AccessType> {
        match self {
            Self::InstructionPageFault | Self::InstructionAccessFault => {
                Some(AccessType::new(false, false, true))
            }
            Self::LoadPageFault | Self::LoadAccessFault => Some(AccessType::READ),
            Self::StorePageFault | Self::StoreAccessFault => {
                Some(AccessType::new(false, true, false))
            }
            _ => None,
        }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum FaultKind {
    /// No valid translation, or the translation forbids the access.
    Page,
    /// Physical memory protection or a bus error rejected the access.
    Access,
    /// The address lies in the non-canonical hole.
    NonCanonical,
}

/// Memory fault reported by a sandbox exit.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Fault {
    pub vector: Vector,
    pub addr: VirtualAddress,
    pub access: AccessType,
    pub kind: FaultKind,
    /// The faulting access was made from user mode.
    pub user: bool,
}

/// Why control came back from sandboxed execution.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Exit {
    /// System call; the saved instruction pointer is already past the `ecall`.
    Syscall,
    Fault(Fault),
    /// Any other synchronous exception.
    Exception(Vector),
    Interrupt(Vector),
}

/// Decode the trap recorded in `frame`.
#[must_use]
pub fn classify(frame: &Registers) -> Exit {
    let vector = Vector::from_cause(frame.cause());
    if vector == Vector::UserEcall {
        return Exit::Syscall;
    }
    if vector.is_interrupt() {
        return Exit::Interrupt(vector);
    }
    let Some(access) = vector.fault_access() else {
        return Exit::Exception(vector);
    };

    let addr = frame.bad_addr();
    let kind = if !layout::is_canonical(addr) {
        FaultKind::NonCanonical
    } else if matches!(
        vector,
        Vector::InstructionPageFault | Vector::LoadPageFault | Vector::StorePageFault
    ) {
        FaultKind::Page
    } else {
        FaultKind::Access
    };

    Exit::Fault(Fault {
        vector,
        addr: VirtualAddress::new(addr),
        access,
        kind,
        user: frame.status().from_user(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ring0_registers::Sstatus;

    fn frame(cause: u64, stval: u64) -> Registers {
        let mut r = Registers::new();
        r.regs[Registers::CAUSE] = cause;
        r.regs[Registers::BADADDR] = stval;
        r
    }

    #[test]
    fn store_page_fault_is_a_write_fault() {
        let Exit::Fault(fault) = classify(&frame(15, 0x4000_1000)) else {
            panic!("expected a fault");
        };
        assert_eq!(fault.kind, FaultKind::Page);
        assert!(fault.access.write && !fault.access.read && !fault.access.execute);
        assert_eq!(fault.addr, VirtualAddress::new(0x4000_1000));
        assert!(fault.user);
    }

    #[test]
    fn instruction_access_fault_is_an_execute_fault() {
        let Exit::Fault(fault) = classify(&frame(1, 0x1000)) else {
            panic!("expected a fault");
        };
        assert_eq!(fault.kind, FaultKind::Access);
        assert!(fault.access.execute);
    }

    #[test]
    fn non_canonical_wins_over_the_cause() {
        for cause in [1, 5, 7, 12, 13, 15] {
            let Exit::Fault(fault) = classify(&frame(cause, 0x0000_8000_0000_0000)) else {
                panic!("expected a fault");
            };
            assert_eq!(fault.kind, FaultKind::NonCanonical);
        }
    }

    #[test]
    fn supervisor_fault_is_flagged() {
        let mut r = frame(13, 0x10);
        r.set_status(Sstatus::new().with_spp(true));
        let Exit::Fault(fault) = classify(&r) else {
            panic!("expected a fault");
        };
        assert!(!fault.user);
    }

    #[test]
    fn interrupts_and_exceptions() {
        assert_eq!(classify(&frame((1 << 63) | 5, 0)), Exit::Interrupt(Vector::TimerInterrupt));
        assert_eq!(
            classify(&frame((1 << 63) | 13, 0)),
            Exit::Interrupt(Vector::UnknownInterrupt(13))
        );
        assert_eq!(classify(&frame(3, 0)), Exit::Exception(Vector::Breakpoint));
        assert_eq!(classify(&frame(6, 0x11)), Exit::Exception(Vector::StoreMisaligned));
        assert_eq!(classify(&frame(24, 0)), Exit::Exception(Vector::UnknownException(24)));
        assert_eq!(classify(&frame(8, 0)), Exit::Syscall);
    }
}
