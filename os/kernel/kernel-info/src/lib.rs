//! # Kernel Configuration and Boot Interface
//!
//! Memory layout constants and the boot-time contract shared by the memory
//! core and the code that starts it.
//!
//! ## Virtual Memory Architecture
//!
//! The 32-bit address space is split at [`ULIM`](memory::ULIM). Everything
//! below is translated through the per-process two-level page table; the
//! region above is the unmapped KSEG0/KSEG1 window the kernel runs in.
//!
//! ```text
//! Virtual Address Space Layout (32-bit):
//!
//! 0xFFFF_FFFF ┌─────────────────────────────────┐
//!             │   KSEG0 / KSEG1 (unmapped)      │
//!             │   kernel text, data, frames     │
//! ULIM        ├─────────────────────────────────┤ 0x8000_0000
//!             │   UVPT  (page table self-map)   │
//! UVPT        ├─────────────────────────────────┤ 0x7fc0_0000
//!             │   UPAGES (frame array, RO)      │
//! UPAGES      ├─────────────────────────────────┤ 0x7f80_0000
//!             │   UENVS (env table, RO)         │
//! UENVS/UTOP  ├─────────────────────────────────┤ 0x7f40_0000
//!             │   user stack (grows down)       │
//!             │            ...                  │
//! UTEXT       ├─────────────────────────────────┤ 0x0040_0000
//!             │   unmapped guard                │
//! 0x0000_0000 └─────────────────────────────────┘
//! ```
//!
//! ## Boot Protocol
//!
//! The early boot code hands the memory core a [`BootInfo`](boot::BootInfo):
//! how much RAM the machine has, where the kernel image ends physically and
//! how large the environment table is. [`MemoryLayout::detect`](boot::MemoryLayout::detect)
//! turns that into the page counts the allocators are sized by.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![deny(unsafe_code)]

pub mod boot;
pub mod memory;
