//! # Virtual and Physical Memory Address Types
//!
//! Strongly typed wrappers for raw 32-bit memory addresses and 4 KiB page
//! bases used by the paging code.
//!
//! ## Overview
//!
//! The target is a 32-bit MIPS-style machine with a single page size. Every
//! translation goes through a two-level table: the upper 10 bits of a virtual
//! address select a page-directory slot, the next 10 bits select a page-table
//! slot and the low 12 bits are the offset inside the page.
//!
//! ```text
//!  31        22 21        12 11          0
//! +------------+------------+-------------+
//! |  PD index  |  PT index  | page offset |
//! +------------+------------+-------------+
//! ```
//!
//! | Wrapper | Meaning |
//! |----------|----------|
//! | [`VirtualAddress`] / [`VirtualPage`] | Refer to virtual (page-table translated) memory. |
//! | [`PhysicalAddress`] / [`PhysicalPage`] | Refer to physical memory. |
//!
//! Pages carry their page-aligned base; the page *number* (the base shifted
//! right by [`PAGE_SHIFT`]) is what page-table entries and the frame
//! descriptor array are indexed by.
//!
//! ## Typical Usage
//!
//! ```rust
//! # use kernel_memory_addresses::*;
//! let va = VirtualAddress::new(0x0040_1234);
//! let page = va.page();
//! assert_eq!(page.base().as_u32(), 0x0040_1000);
//! assert_eq!(va.offset(), 0x234);
//! assert_eq!(page.number(), 0x401);
//! assert_eq!(page.join(va.offset()), va);
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]

mod physical_address;
mod physical_page;
mod virtual_address;
mod virtual_page;

pub use physical_address::PhysicalAddress;
pub use physical_page::PhysicalPage;
pub use virtual_address::VirtualAddress;
pub use virtual_page::VirtualPage;

/// Bytes per page (and per physical frame).
pub const PAGE_SIZE: u32 = 4096;

/// log2([`PAGE_SIZE`]).
pub const PAGE_SHIFT: u32 = 12;

/// Shift that extracts the page-directory index from a virtual address.
pub const PDSHIFT: u32 = 22;

/// Bytes of virtual address space covered by one page-directory entry (4 MiB).
pub const PDMAP: u32 = 1 << PDSHIFT;

/// Entries in a page directory and in a page table.
pub const ENTRIES_PER_TABLE: usize = 1024;

const PAGE_MASK: u32 = PAGE_SIZE - 1;

const _: () = assert!(PAGE_SIZE == 1 << PAGE_SHIFT);
const _: () = assert!(PDMAP as usize == PAGE_SIZE as usize * ENTRIES_PER_TABLE);

/// Rounds `value` down to a multiple of `align` (a power of two).
#[inline]
#[must_use]
pub const fn align_down(value: u32, align: u32) -> u32 {
    debug_assert!(align.is_power_of_two());
    value & !(align - 1)
}

/// Rounds `value` up to a multiple of `align` (a power of two).
///
/// Wraps to `0` when the result does not fit into 32 bits, matching the
/// modular arithmetic of the target.
#[inline]
#[must_use]
pub const fn align_up(value: u32, align: u32) -> u32 {
    debug_assert!(align.is_power_of_two());
    value.wrapping_add(align - 1) & !(align - 1)
}

/// Rounds a byte count up to whole pages and returns the page count.
#[inline]
#[must_use]
pub const fn pages_for(bytes: u32) -> u32 {
    bytes.div_ceil(PAGE_SIZE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_and_join_virtual() {
        let va = VirtualAddress::new(0x7f3f_fabc);
        let page = va.page();
        assert_eq!(page.base().as_u32(), 0x7f3f_f000);
        assert_eq!(va.offset(), 0xabc);
        assert_eq!(page.join(va.offset()), va);
    }

    #[test]
    fn split_and_join_physical() {
        let pa = PhysicalAddress::new(0x0320_0042);
        let page = pa.page();
        assert_eq!(page.base().as_u32(), 0x0320_0000);
        assert_eq!(pa.offset(), 0x42);
        assert_eq!(page.join(pa.offset()), pa);
    }

    #[test]
    fn alignment_helpers() {
        assert_eq!(align_down(0x12345, PAGE_SIZE), 0x12000);
        assert_eq!(align_up(0x12345, PAGE_SIZE), 0x13000);
        assert_eq!(align_up(0x13000, PAGE_SIZE), 0x13000);
        assert_eq!(align_up(0xffff_f001, PAGE_SIZE), 0);
        assert_eq!(pages_for(0), 0);
        assert_eq!(pages_for(1), 1);
        assert_eq!(pages_for(PAGE_SIZE + 1), 2);
    }

    #[test]
    fn directory_and_table_indices() {
        let va = VirtualAddress::new(0x7fc0_3000);
        assert_eq!(va.pd_index(), 0x1ff);
        assert_eq!(va.pt_index(), 3);
        assert_eq!(va.vpn(), 0x7fc03);
    }
}
