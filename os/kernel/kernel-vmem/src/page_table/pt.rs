//! # Page Table
//!
//! - [`PtIndex`]: index type for virtual-address bits `[21:12]`.
//! - [`PtEntry`]: a leaf entry mapping one 4 KiB page.
//! - [`PageTable`]: a 4 KiB-aligned array of 1024 entries.
//!
//! After modifying entries of a live address space, the caller must
//! invalidate the matching TLB entry.

use crate::PageEntryBits;
use kernel_memory_addresses::{ENTRIES_PER_TABLE, PhysicalPage, VirtualAddress};

/// Index into a page table (virtual-address bits `[21:12]`).
#[repr(transparent)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PtIndex(u16);

/// A single page table entry (PTE).
///
/// A valid PTE maps exactly one 4 KiB frame. The encoding doubles as the
/// TLB `EntryLo` value.
#[doc(alias = "PTE")]
#[repr(transparent)]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct PtEntry(PageEntryBits);

/// A page table: 1024 entries, 4 KiB-aligned.
#[doc(alias = "PT")]
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [PtEntry; ENTRIES_PER_TABLE],
}

impl PtIndex {
    #[inline]
    #[must_use]
    pub const fn from(va: VirtualAddress) -> Self {
        Self::new(va.pt_index() as u16)
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

impl PtEntry {
    /// Create a zero (invalid) entry.
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

    /// Create a leaf mapping `page` with the permission bits of `perm`.
    ///
    /// Any frame number carried in `perm` is discarded; `valid` is forced on.
    #[inline]
    #[must_use]
    pub const fn make(page: PhysicalPage, perm: PageEntryBits) -> Self {
        Self(perm.permissions().with_valid(true).with_page(page))
    }

    /// If valid, the mapped frame.
    #[inline]
    #[must_use]
    pub const fn page(self) -> Option<PhysicalPage> {
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

    #[inline]
    #[must_use]
    pub const fn raw(self) -> u32 {
        self.0.into_bits()
    }

    /// No validation is performed.
    #[inline]
    #[must_use]
    pub const fn from_raw(v: u32) -> Self {
        Self(PageEntryBits::from_bits(v))
    }
}

impl PageTable {
    #[inline]
    #[must_use]
    pub const fn zeroed() -> Self {
        Self {
            entries: [PtEntry::zero(); ENTRIES_PER_TABLE],
        }
    }

    #[inline]
    #[must_use]
    pub const fn get(&self, i: PtIndex) -> PtEntry {
        self.entries[i.as_usize()]
    }

    /// Caller must handle any required TLB invalidation when changing active mappings.
    #[inline]
    pub const fn set(&mut self, i: PtIndex, e: PtEntry) {
        self.entries[i.as_usize()] = e;
    }

    /// Number of valid entries.
    #[must_use]
    pub fn mapped(&self) -> usize {
        self.entries.iter().filter(|e| e.is_valid()).count()
    }
}
