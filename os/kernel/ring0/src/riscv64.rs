//! Trusted transition primitives for RISC-V supervisors.
//!
//! [`Sret`] enters user mode with `sret` through a small trampoline and
//! takes the next trap on a dedicated vector that switches back to the
//! supervisor's translation root before returning to Rust.
//!
//! ```text
//!  enter_sandboxed ──► ring0_sandbox_enter ──sret──► user code
//!        ▲                                              │ trap
//!        └──────── ret ◄── ring0_sandbox_trap ◄─────────┘
//! ```

use core::arch::{asm, global_asm};
use core::mem::offset_of;

use ring0_pagetables::TranslationCache;
use ring0_registers::{FpStatus, LoadRegisterUnsafe, Sstatus, StoreRegisterUnsafe};

use crate::hardware::{FloatingPoint, Hardware};
use crate::registers::{FpState, Registers};

/// SBI "RFNC" extension.
const SBI_EXT_RFENCE: u64 = 0x5246_4E43;

/// `sbi_remote_sfence_vma_asid`.
const SBI_RFENCE_SFENCE_VMA_ASID: u64 = 2;

/// Context handed to the trampoline through `sscratch`.
#[repr(C)]
struct Trampoline {
    frame: Registers,
    kernel_sp: u64,
    kernel_satp: u64,
    kernel_stvec: u64,
}

// Offsets hard-coded in the assembly below.
const _: () = {
    assert!(offset_of!(Trampoline, frame) == 0);
    assert!(offset_of!(Trampoline, kernel_sp) == 288);
    assert!(offset_of!(Trampoline, kernel_satp) == 296);
    assert!(offset_of!(Trampoline, kernel_stvec) == 304);
    assert!(Registers::STATUS * 8 == 256);
    assert!(Registers::ORIG_A0 * 8 == 280);
};

unsafe extern "C" {
    fn ring0_sandbox_enter(trampoline: *mut Trampoline, satp: u64);
    fn ring0_sandbox_trap();
}

// ring0_sandbox_enter(a0 = trampoline, a1 = satp)
//
// Saves the callee-saved registers on the supervisor stack, installs the
// sandbox trap vector, loads the user frame and returns to user mode.
//
// ring0_sandbox_trap
//
// Stores the user frame and the trap CSRs into the trampoline, restores the
// supervisor's satp and stvec, and returns from ring0_sandbox_enter.
global_asm!(
    ".pushsection .text.ring0_sandbox, \"ax\"",
    ".balign 4",
    ".global ring0_sandbox_enter",
    "ring0_sandbox_enter:",
    // no interrupts until sret
    "csrci sstatus, 2",
    "addi sp, sp, -128",
    "sd ra, 0(sp)",
    "sd s0, 8(sp)",
    "sd s1, 16(sp)",
    "sd s2, 24(sp)",
    "sd s3, 32(sp)",
    "sd s4, 40(sp)",
    "sd s5, 48(sp)",
    "sd s6, 56(sp)",
    "sd s7, 64(sp)",
    "sd s8, 72(sp)",
    "sd s9, 80(sp)",
    "sd s10, 88(sp)",
    "sd s11, 96(sp)",
    "sd gp, 104(sp)",
    "sd tp, 112(sp)",
    "sd sp, 288(a0)",
    "csrr t0, satp",
    "sd t0, 296(a0)",
    "csrr t0, stvec",
    "sd t0, 304(a0)",
    "csrw sscratch, a0",
    "la t0, ring0_sandbox_trap",
    "csrw stvec, t0",
    "ld t0, 0(a0)",
    "csrw sepc, t0",
    "ld t0, 256(a0)",
    "csrw sstatus, t0",
    "csrw satp, a1",
    "ld x1, 8(a0)",
    "ld x2, 16(a0)",
    "ld x3, 24(a0)",
    "ld x4, 32(a0)",
    "ld x5, 40(a0)",
    "ld x6, 48(a0)",
    "ld x7, 56(a0)",
    "ld x8, 64(a0)",
    "ld x9, 72(a0)",
    "ld x11, 88(a0)",
    "ld x12, 96(a0)",
    "ld x13, 104(a0)",
    "ld x14, 112(a0)",
    "ld x15, 120(a0)",
    "ld x16, 128(a0)",
    "ld x17, 136(a0)",
    "ld x18, 144(a0)",
    "ld x19, 152(a0)",
    "ld x20, 160(a0)",
    "ld x21, 168(a0)",
    "ld x22, 176(a0)",
    "ld x23, 184(a0)",
    "ld x24, 192(a0)",
    "ld x25, 200(a0)",
    "ld x26, 208(a0)",
    "ld x27, 216(a0)",
    "ld x28, 224(a0)",
    "ld x29, 232(a0)",
    "ld x30, 240(a0)",
    "ld x31, 248(a0)",
    "ld x10, 80(a0)",
    "sret",
    ".balign 4",
    ".global ring0_sandbox_trap",
    "ring0_sandbox_trap:",
    // t6 <-> trampoline
    "csrrw t6, sscratch, t6",
    "sd x1, 8(t6)",
    "sd x2, 16(t6)",
    "sd x3, 24(t6)",
    "sd x4, 32(t6)",
    "sd x5, 40(t6)",
    "sd x6, 48(t6)",
    "sd x7, 56(t6)",
    "sd x8, 64(t6)",
    "sd x9, 72(t6)",
    "sd x10, 80(t6)",
    "sd x11, 88(t6)",
    "sd x12, 96(t6)",
    "sd x13, 104(t6)",
    "sd x14, 112(t6)",
    "sd x15, 120(t6)",
    "sd x16, 128(t6)",
    "sd x17, 136(t6)",
    "sd x18, 144(t6)",
    "sd x19, 152(t6)",
    "sd x20, 160(t6)",
    "sd x21, 168(t6)",
    "sd x22, 176(t6)",
    "sd x23, 184(t6)",
    "sd x24, 192(t6)",
    "sd x25, 200(t6)",
    "sd x26, 208(t6)",
    "sd x27, 216(t6)",
    "sd x28, 224(t6)",
    "sd x29, 232(t6)",
    "sd x30, 240(t6)",
    "csrr t5, sscratch",
    "sd t5, 248(t6)",
    "sd a0, 280(t6)",
    "csrr t5, sepc",
    "sd t5, 0(t6)",
    "csrr t5, sstatus",
    "sd t5, 256(t6)",
    "csrr t5, stval",
    "sd t5, 264(t6)",
    "csrr t5, scause",
    "sd t5, 272(t6)",
    "ld t5, 296(t6)",
    "csrw satp, t5",
    "ld t5, 304(t6)",
    "csrw stvec, t5",
    "ld sp, 288(t6)",
    "ld ra, 0(sp)",
    "ld s0, 8(sp)",
    "ld s1, 16(sp)",
    "ld s2, 24(sp)",
    "ld s3, 32(sp)",
    "ld s4, 40(sp)",
    "ld s5, 48(sp)",
    "ld s6, 56(sp)",
    "ld s7, 64(sp)",
    "ld s8, 72(sp)",
    "ld s9, 80(sp)",
    "ld s10, 88(sp)",
    "ld s11, 96(sp)",
    "ld gp, 104(sp)",
    "ld tp, 112(sp)",
    "addi sp, sp, 128",
    "ret",
    ".popsection",
);

/// [`Hardware`] backed by `sret` and a private trap vector.
///
/// The supervisor must not use the floating-point registers itself: between
/// [`FloatingPoint::load`] and [`FloatingPoint::save`] they hold the
/// sandboxed context's values.
pub struct Sret {
    trampoline: Trampoline,
}

impl Sret {
    /// # Safety
    /// The caller must be running in supervisor mode. The trampoline code,
    /// the `Sret` value and the supervisor stack must be mapped at the same
    /// addresses in every translation root passed to
    /// [`enter_sandboxed`](Hardware::enter_sandboxed), which holds when they
    /// live in the shared upper half.
    #[must_use]
    pub const unsafe fn new() -> Self {
        Self {
            trampoline: Trampoline {
                frame: Registers::new(),
                kernel_sp: 0,
                kernel_satp: 0,
                kernel_stvec: 0,
            },
        }
    }
}

impl Hardware for Sret {
    /// Returns with supervisor interrupts disabled.
    fn enter_sandboxed(&mut self, root: u64, frame: &mut Registers) {
        self.trampoline.frame = *frame;
        let status = frame.status().with_sie(false);
        self.trampoline.frame.set_status(status);
        unsafe {
            ring0_sandbox_enter(&raw mut self.trampoline, root);
        }
        *frame = self.trampoline.frame;
    }

    fn entry_point_address(&self) -> u64 {
        ring0_sandbox_trap as usize as u64
    }
}

/// Turns the FPU on if `sstatus.FS` is `Off`; FP instructions trap otherwise.
fn enable_fp() {
    let status = unsafe { Sstatus::load_unsafe() };
    if status.fs() == FpStatus::Off {
        unsafe { status.with_fs(FpStatus::Initial).store_unsafe() };
    }
}

impl FloatingPoint for Sret {
    fn save(&mut self, state: &mut FpState) {
        enable_fp();
        unsafe {
            asm!(
                ".option push",
                ".option arch, +d",
                "fsd f0, 0({state})",
                "fsd f1, 8({state})",
                "fsd f2, 16({state})",
                "fsd f3, 24({state})",
                "fsd f4, 32({state})",
                "fsd f5, 40({state})",
                "fsd f6, 48({state})",
                "fsd f7, 56({state})",
                "fsd f8, 64({state})",
                "fsd f9, 72({state})",
                "fsd f10, 80({state})",
                "fsd f11, 88({state})",
                "fsd f12, 96({state})",
                "fsd f13, 104({state})",
                "fsd f14, 112({state})",
                "fsd f15, 120({state})",
                "fsd f16, 128({state})",
                "fsd f17, 136({state})",
                "fsd f18, 144({state})",
                "fsd f19, 152({state})",
                "fsd f20, 160({state})",
                "fsd f21, 168({state})",
                "fsd f22, 176({state})",
                "fsd f23, 184({state})",
                "fsd f24, 192({state})",
                "fsd f25, 200({state})",
                "fsd f26, 208({state})",
                "fsd f27, 216({state})",
                "fsd f28, 224({state})",
                "fsd f29, 232({state})",
                "fsd f30, 240({state})",
                "fsd f31, 248({state})",
                "frcsr t0",
                "sw t0, 256({state})",
                ".option pop",
                state = in(reg) state.as_mut_bytes().as_mut_ptr(),
                out("t0") _,
                options(nostack),
            );
        }
    }

    fn load(&mut self, state: &FpState) {
        enable_fp();
        unsafe {
            asm!(
                ".option push",
                ".option arch, +d",
                "fld f0, 0({state})",
                "fld f1, 8({state})",
                "fld f2, 16({state})",
                "fld f3, 24({state})",
                "fld f4, 32({state})",
                "fld f5, 40({state})",
                "fld f6, 48({state})",
                "fld f7, 56({state})",
                "fld f8, 64({state})",
                "fld f9, 72({state})",
                "fld f10, 80({state})",
                "fld f11, 88({state})",
                "fld f12, 96({state})",
                "fld f13, 104({state})",
                "fld f14, 112({state})",
                "fld f15, 120({state})",
                "fld f16, 128({state})",
                "fld f17, 136({state})",
                "fld f18, 144({state})",
                "fld f19, 152({state})",
                "fld f20, 160({state})",
                "fld f21, 168({state})",
                "fld f22, 176({state})",
                "fld f23, 184({state})",
                "fld f24, 192({state})",
                "fld f25, 200({state})",
                "fld f26, 208({state})",
                "fld f27, 216({state})",
                "fld f28, 224({state})",
                "fld f29, 232({state})",
                "fld f30, 240({state})",
                "fld f31, 248({state})",
                "lw t0, 256({state})",
                "fscsr t0",
                ".option pop",
                state = in(reg) state.as_bytes().as_ptr(),
                out("t0") _,
                options(nostack),
            );
        }
    }
}

impl TranslationCache for Sret {
    fn flush_local(&self, asid: u16) {
        unsafe {
            asm!("sfence.vma zero, {}", in(reg) u64::from(asid), options(nostack));
        }
    }

    /// Remote fence through the SBI; covers the calling hart as well.
    ///
    /// # Panics
    /// If the firmware rejects the fence.
    fn flush_global(&self, asid: u16) {
        let error: u64;
        unsafe {
            asm!(
                "ecall",
                inlateout("a0") 0u64 => error,
                inlateout("a1") u64::MAX => _,
                in("a2") 0u64,
                in("a3") u64::MAX,
                in("a4") u64::from(asid),
                in("a6") SBI_RFENCE_SFENCE_VMA_ASID,
                in("a7") SBI_EXT_RFENCE,
                options(nostack),
            );
        }
        assert_eq!(
            error,
            0,
            "remote fence for ASID {asid} failed with SBI error {}",
            error.cast_signed()
        );
    }
}
