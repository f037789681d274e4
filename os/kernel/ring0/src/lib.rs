//! # Ring0
//!
//! Supervisor core for running untrusted code in its own address space on a
//! physical CPU.
//!
//! ```text
//!  Kernel ── ASID pool, options (shared by all CPUs)
//!    │
//!  Cpu ──switch_to_user(SwitchOpts)──► Hardware::enter_sandboxed ──► trap
//!    ▲                                                                 │
//!    └──────────────────────── Exit ◄── classify(Registers) ◄──────────┘
//! ```
//!
//! - A [`Cpu`] is in [`Mode::Supervisor`] or [`Mode::Sandboxed`]; entering
//!   sandboxed execution twice is a bug and panics.
//! - Each switch binds an address-space tag to the page tables through the
//!   [`Kernel`] and loads the matching translation root.
//! - Floating-point state is switched lazily: the first FP instruction traps
//!   and loads the context's [`FpState`], which is then saved on exit.
//! - Every return is decoded into an [`Exit`].
//!
//! The privileged primitives sit behind [`Hardware`], [`FloatingPoint`] and
//! [`TranslationCache`]. With the `asm` feature on `riscv64`, [`riscv64::Sret`]
//! implements all three.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

extern crate alloc;

mod cpu;
mod hardware;
mod kernel;
pub mod registers;
#[cfg(all(feature = "asm", target_arch = "riscv64"))]
pub mod riscv64;
pub mod vector;

pub use crate::cpu::{Cpu, Mode, SwitchOpts};
pub use crate::hardware::{FloatingPoint, Hardware};
pub use crate::kernel::{
    DEFAULT_ASID_START, DEFAULT_MAX_CPUS, DEFAULT_STACK_SIZE, Kernel, KernelError, KernelOpts,
};
pub use crate::registers::{FP_STATE_SIZE, FpState, REGISTER_SLOTS, Registers};
pub use crate::vector::{Exit, Fault, FaultKind, Vector, classify};
pub use ring0_pagetables::TranslationCache;
