//! # Two-Level Page Table
//!
//! A virtual address is translated by a page directory (1024 entries, each
//! covering 4 MiB) whose valid entries point at page tables (1024 entries,
//! each mapping one 4 KiB page).

pub mod pd;
pub mod pt;

use crate::page_table::pd::PdIndex;
use crate::page_table::pt::PtIndex;
use kernel_memory_addresses::VirtualAddress;

#[inline]
#[must_use]
pub const fn split_indices(va: VirtualAddress) -> (PdIndex, PtIndex) {
    (PdIndex::from(va), PtIndex::from(va))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn indices_ok() {
        let (pd, pt) = split_indices(VirtualAddress::new(0x7f80_5123));
        assert_eq!(pd.as_usize(), 0x1fe);
        assert_eq!(pt.as_usize(), 5);

        let (pd, pt) = split_indices(VirtualAddress::new(0xffff_ffff));
        assert_eq!(pd.as_usize(), 1023);
        assert_eq!(pt.as_usize(), 1023);
    }
}
