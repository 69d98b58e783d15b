//! # Memory Layout

use kernel_memory_addresses::{PAGE_SIZE, PDMAP};

/// Base of the unmapped, cached kernel window. The kernel reaches physical
/// address `pa` at `KSEG0 + pa`.
pub const KSEG0: u32 = 0x8000_0000;

/// Base of the unmapped, uncached window.
pub const KSEG1: u32 = 0xA000_0000;

/// End of the translated user range; everything at or above is kernel space.
pub const ULIM: u32 = 0x8000_0000;

/// Window through which a process sees its own page tables.
pub const UVPT: u32 = ULIM - PDMAP;

/// Read-only view of the frame descriptor array.
pub const UPAGES: u32 = UVPT - PDMAP;

/// Read-only view of the environment table.
pub const UENVS: u32 = UPAGES - PDMAP;

/// Highest address (exclusive) user code may map freely.
pub const UTOP: u32 = UENVS;

/// Top of the user stack, two pages below [`UTOP`].
pub const USTACKTOP: u32 = UTOP - 2 * PAGE_SIZE;

/// Where user program text is loaded.
pub const UTEXT: u32 = 0x0040_0000;

/// Faults below this address are null-pointer dereferences, never paged in.
pub const LOW_GUARD: u32 = 0x0001_0000;

/// Physical memory assumed when the boot code does not report a size (64 MiB).
pub const DEFAULT_MEMORY_SIZE: u32 = 64 * 1024 * 1024;

/// Largest physical memory the KSEG0 window can reach (512 MiB).
pub const MAX_MEMORY_SIZE: u32 = KSEG1 - KSEG0;

const _: () = {
    assert!(UVPT == 0x7fc0_0000);
    assert!(UPAGES == 0x7f80_0000);
    assert!(UENVS == 0x7f40_0000);
    assert!(USTACKTOP.is_multiple_of(PAGE_SIZE));
    assert!(UTEXT > LOW_GUARD);
    assert!(DEFAULT_MEMORY_SIZE <= MAX_MEMORY_SIZE);
};
