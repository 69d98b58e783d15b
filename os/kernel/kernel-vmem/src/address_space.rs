//! # Address Space (two-level, page-directory rooted)
//!
//! Helpers to build and manipulate a **single** virtual address space: the
//! tree rooted at one [`PageDirectory`](crate::PageDirectory).
//!
//! ## Highlights
//!
//! - [`AddressSpace::walk`] to find (and optionally create) the page-table
//!   slot for an address.
//! - [`AddressSpace::map`] / [`AddressSpace::unmap`] to install and remove
//!   reference-counted mappings, vetoed on pinned frames.
//! - [`AddressSpace::map_segment`] for boot-time ranges without reference
//!   counting.
//! - [`AddressSpace::lookup`] / [`AddressSpace::query`] for reverse and full
//!   translation.
//!
//! ## TLB maintenance
//!
//! Every install, replacement and removal invalidates the entry tagged with
//! this space's ASID through the supplied [`Tlb`].

use crate::page_table::pd::{PdEntry, PdIndex};
use crate::page_table::pt::{PtEntry, PtIndex};
use crate::tlb::{Asid, EntryHi, Tlb};
use crate::{FrameAlloc, PageDirectory, PageEntryBits, PageTable, PhysMapper, split_indices};
use kernel_memory_addresses::{
    PAGE_SIZE, PhysicalAddress, PhysicalPage, VirtualAddress, align_up,
};

/// The page-directory root page of an [`AddressSpace`].
pub type RootPage = PhysicalPage;

/// Errors from installing mappings.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum MapError {
    #[error("out of memory while creating a page table")]
    OutOfMemory,
    #[error("frame {0} is pinned")]
    Pinned(PhysicalPage),
}

/// An address space as a process owns it: its page directory and its ASID.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct VSpace {
    root: RootPage,
    asid: Option<Asid>,
}

impl VSpace {
    #[inline]
    #[must_use]
    pub const fn new(root: RootPage, asid: Option<Asid>) -> Self {
        Self { root, asid }
    }

    /// Physical page of the page directory.
    #[inline]
    #[must_use]
    pub const fn root(&self) -> RootPage {
        self.root
    }

    #[inline]
    #[must_use]
    pub const fn asid(&self) -> Option<Asid> {
        self.asid
    }
}

/// Location of one page-table entry: the table frame and the index in it.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct PteSlot {
    table: PhysicalPage,
    index: PtIndex,
}

impl PteSlot {
    #[inline]
    #[must_use]
    pub const fn table(&self) -> PhysicalPage {
        self.table
    }

    #[inline]
    #[must_use]
    pub const fn index(&self) -> PtIndex {
        self.index
    }

    /// Physical address of the entry itself.
    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn address(&self) -> PhysicalAddress {
        self.table.join(self.index.as_usize() as u32 * 4)
    }
}

/// Handle to a single, concrete address space.
pub struct AddressSpace<'m, M: PhysMapper> {
    space: VSpace,
    mapper: &'m M,
}

impl<'m, M: PhysMapper> AddressSpace<'m, M> {
    #[inline]
    #[must_use]
    pub const fn new(mapper: &'m M, space: VSpace) -> Self {
        Self { space, mapper }
    }

    #[inline]
    #[must_use]
    pub const fn space(&self) -> VSpace {
        self.space
    }

    #[inline]
    #[must_use]
    pub const fn root_page(&self) -> RootPage {
        self.space.root
    }

    #[inline]
    fn pgdir_mut(&self) -> &mut PageDirectory {
        self.mapper.page_directory_mut(self.space.root)
    }

    #[inline]
    fn pt_mut(&self, page: PhysicalPage) -> &mut PageTable {
        self.mapper.page_table_mut(page)
    }

    /// Read the entry at `slot`.
    #[inline]
    #[must_use]
    pub fn read(&self, slot: PteSlot) -> PtEntry {
        self.pt_mut(slot.table).get(slot.index)
    }

    /// Overwrite the entry at `slot`. No TLB maintenance.
    #[inline]
    pub fn write(&self, slot: PteSlot, entry: PtEntry) {
        self.pt_mut(slot.table).set(slot.index, entry);
    }

    /// The slot for `va` if its page table exists.
    #[must_use]
    pub fn find(&self, va: VirtualAddress) -> Option<PteSlot> {
        let (pdi, pti) = split_indices(va);
        let table = self.pgdir_mut().get(pdi).next_table()?;
        Some(PteSlot { table, index: pti })
    }

    /// The slot for `va`, creating its page table if needed.
    ///
    /// A new table comes zero-filled from `alloc`, is linked valid and
    /// writable and gets one reference for the directory link.
    ///
    /// # Errors
    /// [`MapError::OutOfMemory`] if no frame is left for the table.
    pub fn ensure_table<A: FrameAlloc>(
        &self,
        alloc: &mut A,
        va: VirtualAddress,
    ) -> Result<PteSlot, MapError> {
        if let Some(slot) = self.find(va) {
            return Ok(slot);
        }

        let table = alloc.alloc_4k().ok_or(MapError::OutOfMemory)?;
        alloc.retain(table);
        self.pgdir_mut().set(PdIndex::from(va), PdEntry::make_table(table));
        Ok(PteSlot {
            table,
            index: PtIndex::from(va),
        })
    }

    /// Locate the page-table slot for `va`.
    ///
    /// Without `create` a missing page table yields `Ok(None)`. With it, the
    /// table is created through [`ensure_table`](Self::ensure_table).
    ///
    /// # Errors
    /// [`MapError::OutOfMemory`] if a table has to be created and no frame is left.
    pub fn walk<A: FrameAlloc>(
        &self,
        alloc: &mut A,
        va: VirtualAddress,
        create: bool,
    ) -> Result<Option<PteSlot>, MapError> {
        if create {
            self.ensure_table(alloc, va).map(Some)
        } else {
            Ok(self.find(va))
        }
    }

    /// The frame mapped at `va` and the slot holding the mapping.
    #[must_use]
    pub fn lookup(&self, va: VirtualAddress) -> Option<(PhysicalPage, PteSlot)> {
        let slot = self.find(va)?;
        let page = self.read(slot).page()?;
        Some((page, slot))
    }

    /// The valid leaf entry for `va`, as it would be loaded into the TLB.
    #[must_use]
    pub fn lookup_entry(&self, va: VirtualAddress) -> Option<PtEntry> {
        let slot = self.find(va)?;
        let entry = self.read(slot);
        entry.is_valid().then_some(entry)
    }

    /// Map `page` at `va` with `perm | valid`.
    ///
    /// - A different frame already mapped at `va` is unmapped first.
    /// - Remapping the same frame only rewrites the permissions.
    /// - On success the frame gains one reference.
    ///
    /// # Errors
    /// - [`MapError::Pinned`] if `page`, or the frame it would replace, is pinned.
    /// - [`MapError::OutOfMemory`] if the page table cannot be created.
    pub fn map<A: FrameAlloc, T: Tlb + ?Sized>(
        &self,
        alloc: &mut A,
        tlb: &mut T,
        page: PhysicalPage,
        va: VirtualAddress,
        perm: PageEntryBits,
    ) -> Result<(), MapError> {
        if alloc.is_pinned(page) {
            return Err(MapError::Pinned(page));
        }

        if let Some((current, slot)) = self.lookup(va) {
            if current == page {
                self.invalidate(tlb, va);
                self.write(slot, PtEntry::make(page, perm));
                return Ok(());
            }

            if alloc.is_pinned(current) {
                return Err(MapError::Pinned(current));
            }
            self.unmap(alloc, tlb, va)?;
        }

        self.invalidate(tlb, va);
        let slot = self.ensure_table(alloc, va)?;
        self.write(slot, PtEntry::make(page, perm));
        alloc.retain(page);
        Ok(())
    }

    /// Remove the mapping at `va`.
    ///
    /// Nothing happens if `va` is unmapped.
    ///
    /// # Errors
    /// [`MapError::Pinned`] if the mapped frame is pinned; the mapping stays.
    pub fn unmap<A: FrameAlloc, T: Tlb + ?Sized>(
        &self,
        alloc: &mut A,
        tlb: &mut T,
        va: VirtualAddress,
    ) -> Result<(), MapError> {
        let Some((page, slot)) = self.lookup(va) else {
            return Ok(());
        };
        if alloc.is_pinned(page) {
            return Err(MapError::Pinned(page));
        }

        alloc.release(page);
        self.write(slot, PtEntry::zero());
        self.invalidate(tlb, va);
        Ok(())
    }

    /// Map `[va, va + size)` to `[pa, pa + size)` with `perm | valid`.
    ///
    /// `size` is rounded up to whole pages. The mapped frames are not
    /// reference counted; page tables created on the way are.
    ///
    /// # Errors
    /// [`MapError::OutOfMemory`] if a page table cannot be created. Pages
    /// mapped before the failure stay mapped.
    pub fn map_segment<A: FrameAlloc>(
        &self,
        alloc: &mut A,
        va: VirtualAddress,
        size: u32,
        pa: PhysicalAddress,
        perm: PageEntryBits,
    ) -> Result<(), MapError> {
        let size = align_up(size, PAGE_SIZE);
        for offset in (0..size).step_by(PAGE_SIZE as usize) {
            let slot = self.ensure_table(alloc, va + offset)?;
            self.write(slot, PtEntry::make((pa + offset).page(), perm));
        }
        Ok(())
    }

    /// Translate a `VirtualAddress` to `PhysicalAddress` if mapped.
    #[must_use]
    pub fn query(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        let (page, _) = self.lookup(va)?;
        Some(page.join(va.offset()))
    }

    /// The TLB tag for `va` in this space.
    #[inline]
    #[must_use]
    pub const fn tlb_tag(&self, va: VirtualAddress) -> EntryHi {
        EntryHi::tag(va, self.space.asid)
    }

    /// Drop any cached translation of `va` in this space.
    #[inline]
    pub fn invalidate<T: Tlb + ?Sized>(&self, tlb: &mut T, va: VirtualAddress) {
        tlb.invalidate(self.tlb_tag(va));
    }

    /// Page tables linked from the directory.
    pub fn tables(&self) -> impl Iterator<Item = PhysicalPage> + '_ {
        let pgdir: &'m PageDirectory = self.mapper.page_directory_mut(self.space.root);
        pgdir.tables().map(|(_, page)| page)
    }
}
