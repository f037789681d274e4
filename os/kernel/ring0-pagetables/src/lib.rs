//! # Ring0 Page Tables
//!
//! Architecture-neutral management of four-level translation trees for
//! sandboxed address spaces, plus the address-space identifier pool that
//! lets many of them share the translation cache.
//!
//! ## Layers
//!
//! ```text
//!  PageTables ──map/unmap/protect/lookup──► Walker ──visit──► PageTableEntry
//!      │                                      │
//!      │ translation_root(asid)               └─ new/free arrays ─► EntryAllocator
//!      ▼
//!  Arch (satp / CR3 / TTBR0)            Asids ──flush before reuse──► TranslationCache
//! ```
//!
//! - [`PageTableEntry`] is the bit-level codec of one entry. Three layouts
//!   are provided: [`Sv48Entry`], [`X86Entry`] and [`Arm64Entry`].
//! - [`Arch`] pairs a codec with its translation-root register;
//!   [`HostArch`] is the one selected for the build target.
//! - The walker visits `[start, end)` leaf by leaf, allocating missing
//!   intermediate arrays on demand and releasing arrays that become empty.
//! - [`PageTables`] owns one tree and can share the upper root slots of
//!   another.
//! - [`Asids`] hands out tags and flushes them before reuse.
//!
//! ## Failure model
//!
//! Running out of entry arrays is a [`PageTablesError`]. Everything that can
//! only be caused by a defect in the caller (non-canonical ranges, live
//! leaves turned into tables, unaligned frames, mutating shared tables)
//! panics.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

extern crate alloc;

pub mod addresses;
pub mod allocator;
pub mod arch;
pub mod asids;
pub mod entry;
mod error;
pub mod layout;
mod options;
pub mod page_tables;
mod tlb;
mod walker;

pub use crate::addresses::{PhysicalAddress, VirtualAddress};
pub use crate::allocator::{EntryAllocator, RuntimeAllocator};
pub use crate::arch::{Arch, Arm64, HostArch, Riscv64, X86_64};
pub use crate::asids::{
    AsidError, AsidSlot, Asids, Assignment, FIXED_KERNEL_ASID, POOL_ASIDS,
};
pub use crate::entry::{Arm64Entry, EntryArray, PageTableEntry, Sv48Entry, X86Entry};
pub use crate::error::PageTablesError;
pub use crate::options::{AccessType, MapOpts};
pub use crate::page_tables::{PageTables, PageTablesId, Translation};
pub use crate::tlb::TranslationCache;
