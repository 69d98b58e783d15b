//! # Page Directory
//!
//! - [`PdIndex`]: index type for virtual-address bits `[31:22]`.
//! - [`PdEntry`]: either empty or a link to a page table frame.
//! - [`PageDirectory`]: a 4 KiB-aligned array of 1024 directory entries.
//!
//! A directory entry never maps memory directly; there are no large pages.

use crate::PageEntryBits;
use kernel_memory_addresses::{ENTRIES_PER_TABLE, PhysicalPage, VirtualAddress};

/// Index into the page directory (virtual-address bits `[31:22]`).
#[repr(transparent)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PdIndex(u16);

/// A page directory entry (PDE).
#[doc(alias = "PDE")]
#[repr(transparent)]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct PdEntry(PageEntryBits);

/// The page directory: 1024 entries, 4 KiB-aligned.
#[doc(alias = "PGDIR")]
#[repr(C, align(4096))]
pub struct PageDirectory {
    entries: [PdEntry; ENTRIES_PER_TABLE],
}

impl PdIndex {
    #[inline]
    #[must_use]
    pub const fn from(va: VirtualAddress) -> Self {
        Self::new(va.pd_index() as u16)
    }

    /// ### Debug assertions
    /// - Asserts `v < 1024` in debug builds.
    #[inline]
    #[must_use]
    pub const fn new(v: u16) -> Self {
        debug_assert!((v as usize) < ENTRIES_PER_TABLE);
        Self(v)
    }

    #[inline]
    #[must_use]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl PdEntry {
    #[inline]
    #[must_use]
    pub const fn zero() -> Self {
        Self(PageEntryBits::new())
    }

    #[inline]
    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.0.valid()
    }

    /// Link to a page table in `page`.
    ///
    /// Table links are always valid and writable.
    #[inline]
    #[must_use]
    pub const fn make_table(page: PhysicalPage) -> Self {
        Self(
            PageEntryBits::new()
                .with_valid(true)
                .with_writable(true)
                .with_page(page),
        )
    }

    /// The page table this entry links to, if valid.
    #[inline]
    #[must_use]
    pub const fn next_table(self) -> Option<PhysicalPage> {
        if self.is_valid() {
            Some(self.0.page())
        } else {
            None
        }
    }

    #[inline]
    #[must_use]
    pub const fn flags(self) -> PageEntryBits {
        self.0
    }
}

impl PageDirectory {
    #[inline]
    #[must_use]
    pub const fn zeroed() -> Self {
        Self {
            entries: [PdEntry::zero(); ENTRIES_PER_TABLE],
        }
    }

    #[inline]
    #[must_use]
    pub const fn get(&self, i: PdIndex) -> PdEntry {
        self.entries[i.as_usize()]
    }

    #[inline]
    pub const fn set(&mut self, i: PdIndex, e: PdEntry) {
        self.entries[i.as_usize()] = e;
    }

    /// Iterate over the page tables linked from this directory.
    pub fn tables(&self) -> impl Iterator<Item = (PdIndex, PhysicalPage)> + '_ {
        self.entries.iter().enumerate().filter_map(|(i, e)| {
            e.next_table()
                .map(|page| (PdIndex::new(i as u16), page))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_link_roundtrip() {
        let pt = PhysicalPage::from_number(0x42);
        let e = PdEntry::make_table(pt);
        assert!(e.is_valid());
        assert!(e.flags().writable());
        assert_eq!(e.next_table(), Some(pt));
        assert_eq!(PdEntry::zero().next_table(), None);
    }

    #[test]
    fn tables_lists_only_valid_links() {
        let mut pd = PageDirectory::zeroed();
        pd.set(PdIndex::new(3), PdEntry::make_table(PhysicalPage::from_number(9)));
        let links: Vec<_> = pd.tables().collect();
        assert_eq!(links, vec![(PdIndex::new(3), PhysicalPage::from_number(9))]);
    }
}
