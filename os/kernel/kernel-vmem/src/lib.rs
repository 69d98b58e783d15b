//! # Virtual Memory Support
//!
//! Two-level paging for a 32-bit MIPS-style kernel.
//!
//! ## What you get
//! - An [`AddressSpace`] view over one page directory: walk, map, unmap,
//!   lookup and translate, with reference counting and pin checks delegated to
//!   a [`FrameAlloc`].
//! - The entry format [`PageEntryBits`] and the typed [`PageDirectory`] /
//!   [`PageTable`] wrappers.
//! - TLB consistency through the [`Tlb`](tlb::Tlb) trait, ASID-tagged
//!   [`EntryHi`](tlb::EntryHi) values and a software TLB model.
//! - The [`PhysMapper`] seam for touching physical frames.
//!
//! ## Virtual Address → Physical Address Walk
//!
//! ```text
//! | 31‒22 | 21‒12 | 11‒0   |
//! |  PD   |   PT  | Offset |
//! ```
//!
//! ```text
//!  PGDIR  →  PT  →  Physical Page
//!    │        │
//!    │        └───► PTE  → maps 4 KiB page
//!    └────────────► PDE  → links a page table
//! ```
//!
//! Each table has 1024 entries of 4 bytes and occupies exactly one frame.
//! The leaf entry format is the hardware `EntryLo` format; a TLB miss is
//! served by copying the PTE into the TLB.

#![cfg_attr(not(test), no_std)]
#![allow(unsafe_code)]

pub mod address_space;
mod page_entry_bits;
mod page_table;
pub mod tlb;

pub use crate::address_space::{AddressSpace, MapError, PteSlot, RootPage, VSpace};
pub use crate::page_entry_bits::PageEntryBits;
pub use crate::page_table::pd::{PageDirectory, PdEntry, PdIndex};
pub use crate::page_table::pt::{PageTable, PtEntry, PtIndex};
pub use crate::page_table::split_indices;
pub use kernel_memory_addresses as addresses;

/// Re-export constants as info module.
pub use kernel_info::memory as info;

use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress, PhysicalPage};

/// Source of 4 KiB frames for page tables and the bookkeeping the paging
/// code needs about them.
///
/// The paging code never frees frames directly. It reports new references
/// through [`retain`](Self::retain) and dropped ones through
/// [`release`](Self::release); the allocator decides when a frame goes back
/// to its pool.
pub trait FrameAlloc {
    /// Allocate one zero-filled 4 KiB frame with no references.
    ///
    /// Returns `None` on out-of-memory.
    fn alloc_4k(&mut self) -> Option<PhysicalPage>;

    /// A mapping or table link now references `page`.
    fn retain(&mut self, page: PhysicalPage) {
        let _ = page;
    }

    /// A mapping of `page` was removed.
    fn release(&mut self, page: PhysicalPage) {
        let _ = page;
    }

    /// Whether `page` is pinned against remapping and unmapping.
    fn is_pinned(&self, page: PhysicalPage) -> bool {
        let _ = page;
        false
    }
}

/// Converts physical addresses to *temporarily* usable references in the
/// current virtual address space.
///
/// On the target this is the KSEG0 window; hosted builds back it with a
/// buffer.
///
/// # Safety
/// - `pa` must be reachable and writable through the mapper.
/// - Lifetime `'a` is purely borrow-checked; the mapping must remain valid
///   for `'a`.
/// - Type `T` must match the bytes at `pa` (no aliasing UB).
pub trait PhysMapper {
    /// Convert a *physical* address to a usable mutable reference.
    ///
    /// # Safety
    /// See the trait documentation.
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T;

    /// Fill the frame `page` with zeros.
    fn zero_page(&self, page: PhysicalPage) {
        // SAFETY: every frame handed around is a whole, mapper-reachable page.
        let bytes = unsafe { self.phys_to_mut::<[u8; PAGE_SIZE as usize]>(page.base()) };
        bytes.fill(0);
    }

    /// Borrow the [`PageDirectory`] stored in `page`.
    #[inline]
    fn page_directory_mut<'a>(&self, page: PhysicalPage) -> &'a mut PageDirectory {
        // SAFETY: directory frames are only ever viewed as directories.
        unsafe { self.phys_to_mut::<PageDirectory>(page.base()) }
    }

    /// Borrow the [`PageTable`] stored in `page`.
    #[inline]
    fn page_table_mut<'a>(&self, page: PhysicalPage) -> &'a mut PageTable {
        // SAFETY: table frames are only ever viewed as page tables.
        unsafe { self.phys_to_mut::<PageTable>(page.base()) }
    }

    /// Initialize `len` consecutive values of `T` at `pa` and return them as
    /// a slice.
    ///
    /// # Safety
    /// - `[pa, pa + len * size_of::<T>())` must be reachable through the
    ///   mapper as one contiguous range, suitably aligned for `T`.
    /// - Nothing else may reference that range for `'a`.
    unsafe fn init_slice<'a, T: Copy>(&self, pa: PhysicalAddress, len: usize, value: T) -> &'a mut [T] {
        let first: *mut T = unsafe { self.phys_to_mut::<T>(pa) };
        for i in 0..len {
            unsafe { first.add(i).write(value) };
        }
        unsafe { core::slice::from_raw_parts_mut(first, len) }
    }
}

impl<M: PhysMapper + ?Sized> PhysMapper for &M {
    #[inline]
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
        unsafe { (**self).phys_to_mut(pa) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tlb::{Asid, EntryHi, SoftTlb, Tlb};
    use core::cell::UnsafeCell;
    use kernel_memory_addresses::VirtualAddress;

    /// A trivial **bump** allocator with per-frame reference counts and pin
    /// flags, enough to observe what the paging code reports.
    struct CountingAlloc {
        next: u32,
        end: u32,
        refs: Vec<u32>,
        pinned: Vec<bool>,
    }

    impl CountingAlloc {
        fn new(start: u32, end: u32) -> Self {
            Self {
                next: start,
                end,
                refs: vec![0; end as usize],
                pinned: vec![false; end as usize],
            }
        }

        fn refs(&self, page: PhysicalPage) -> u32 {
            self.refs[page.index()]
        }
    }

    impl FrameAlloc for CountingAlloc {
        fn alloc_4k(&mut self) -> Option<PhysicalPage> {
            if self.next >= self.end {
                return None;
            }
            let p = PhysicalPage::from_number(self.next);
            self.next += 1;
            Some(p)
        }

        fn retain(&mut self, page: PhysicalPage) {
            self.refs[page.index()] += 1;
        }

        fn release(&mut self, page: PhysicalPage) {
            self.refs[page.index()] -= 1;
        }

        fn is_pinned(&self, page: PhysicalPage) -> bool {
            self.pinned[page.index()]
        }
    }

    /// A 4 KiB-aligned raw frame. We use this as our "physical RAM" backing store in tests.
    #[repr(align(4096))]
    struct Aligned4K(UnsafeCell<[u8; 4096]>);

    /// A tiny in-memory "RAM". Physical addresses are byte offsets from 0.
    struct TestPhys {
        frames: Vec<Aligned4K>,
    }

    impl TestPhys {
        fn with_frames(n: usize) -> Self {
            Self {
                frames: (0..n).map(|_| Aligned4K(UnsafeCell::new([0; 4096]))).collect(),
            }
        }
    }

    impl PhysMapper for TestPhys {
        unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
            let page = self.frames[pa.page().index()].0.get().cast::<u8>();
            // SAFETY: The caller promises `T` matches the bytes in the frame.
            unsafe { &mut *page.add(pa.offset() as usize).cast::<T>() }
        }
    }

    const FRAMES: u32 = 64;

    fn setup() -> (CountingAlloc, VSpace) {
        let mut alloc = CountingAlloc::new(1, FRAMES);
        let root = alloc.alloc_4k().unwrap();
        alloc.retain(root);
        (alloc, VSpace::new(root, Asid::new(3)))
    }

    #[test]
    fn map_creates_table_and_leaf() {
        let phys = TestPhys::with_frames(FRAMES as usize);
        let (mut alloc, vs) = setup();
        let mut tlb = SoftTlb::new();
        let aspace = AddressSpace::new(&phys, vs);

        let va = VirtualAddress::new(0x0040_3000);
        let frame = PhysicalPage::from_number(40);
        aspace
            .map(&mut alloc, &mut tlb, frame, va, PageEntryBits::user_rw())
            .unwrap();

        let pd = phys.page_directory_mut(vs.root());
        let pt_page = pd.get(PdIndex::from(va)).next_table().unwrap();
        assert_eq!(alloc.refs(pt_page), 1);

        let pte = phys.page_table_mut(pt_page).get(PtIndex::from(va));
        assert_eq!(pte.page(), Some(frame));
        assert!(pte.flags().writable());
        assert_eq!(alloc.refs(frame), 1);

        let (found, slot) = aspace.lookup(va).unwrap();
        assert_eq!(found, frame);
        assert_eq!(slot.table(), pt_page);
        assert_eq!(aspace.query(va + 0x123).unwrap().as_u32(), (40 << 12) | 0x123);
    }

    #[test]
    fn walk_without_create_is_side_effect_free() {
        let phys = TestPhys::with_frames(FRAMES as usize);
        let (mut alloc, vs) = setup();
        let aspace = AddressSpace::new(&phys, vs);

        let before = alloc.next;
        assert_eq!(aspace.walk(&mut alloc, VirtualAddress::new(0x1000), false), Ok(None));
        assert_eq!(alloc.next, before);
        assert!(aspace.walk(&mut alloc, VirtualAddress::new(0x1000), true).unwrap().is_some());
        assert_eq!(alloc.next, before + 1);
    }

    #[test]
    fn walk_reports_out_of_memory() {
        let phys = TestPhys::with_frames(FRAMES as usize);
        let (mut alloc, vs) = setup();
        alloc.end = alloc.next;
        let aspace = AddressSpace::new(&phys, vs);
        assert_eq!(
            aspace.walk(&mut alloc, VirtualAddress::new(0x1000), true),
            Err(MapError::OutOfMemory)
        );
    }

    #[test]
    fn remap_same_frame_updates_permissions_only() {
        let phys = TestPhys::with_frames(FRAMES as usize);
        let (mut alloc, vs) = setup();
        let mut tlb = SoftTlb::new();
        let aspace = AddressSpace::new(&phys, vs);

        let va = VirtualAddress::new(0x5000);
        let frame = PhysicalPage::from_number(50);
        aspace.map(&mut alloc, &mut tlb, frame, va, PageEntryBits::user_rw()).unwrap();
        tlb.refill(aspace.tlb_tag(va), aspace.lookup_entry(va).unwrap());

        aspace.map(&mut alloc, &mut tlb, frame, va, PageEntryBits::user_ro()).unwrap();
        assert_eq!(alloc.refs(frame), 1);
        assert!(!aspace.lookup_entry(va).unwrap().flags().writable());
        assert_eq!(tlb.probe(aspace.tlb_tag(va)), None);
    }

    #[test]
    fn remap_other_frame_releases_previous() {
        let phys = TestPhys::with_frames(FRAMES as usize);
        let (mut alloc, vs) = setup();
        let mut tlb = SoftTlb::new();
        let aspace = AddressSpace::new(&phys, vs);

        let va = VirtualAddress::new(0x5000);
        let old = PhysicalPage::from_number(50);
        let new = PhysicalPage::from_number(51);
        aspace.map(&mut alloc, &mut tlb, old, va, PageEntryBits::user_rw()).unwrap();
        tlb.refill(aspace.tlb_tag(va), aspace.lookup_entry(va).unwrap());

        aspace.map(&mut alloc, &mut tlb, new, va, PageEntryBits::user_rw()).unwrap();
        assert_eq!(alloc.refs(old), 0);
        assert_eq!(alloc.refs(new), 1);
        assert_eq!(aspace.lookup(va).map(|(p, _)| p), Some(new));
        assert_eq!(tlb.probe(aspace.tlb_tag(va)), None);
    }

    #[test]
    fn pinned_frames_veto_changes() {
        let phys = TestPhys::with_frames(FRAMES as usize);
        let (mut alloc, vs) = setup();
        let mut tlb = SoftTlb::new();
        let aspace = AddressSpace::new(&phys, vs);

        let va = VirtualAddress::new(0x5000);
        let held = PhysicalPage::from_number(50);
        let other = PhysicalPage::from_number(51);
        aspace.map(&mut alloc, &mut tlb, held, va, PageEntryBits::user_rw()).unwrap();
        alloc.pinned[held.index()] = true;

        assert_eq!(
            aspace.map(&mut alloc, &mut tlb, other, va, PageEntryBits::user_rw()),
            Err(MapError::Pinned(held))
        );
        assert_eq!(aspace.unmap(&mut alloc, &mut tlb, va), Err(MapError::Pinned(held)));
        assert_eq!(
            aspace.map(&mut alloc, &mut tlb, held, VirtualAddress::new(0x6000), PageEntryBits::user_rw()),
            Err(MapError::Pinned(held))
        );
        assert_eq!(alloc.refs(held), 1);
        assert_eq!(alloc.refs(other), 0);
    }

    #[test]
    fn unmap_clears_entry_and_tlb() {
        let phys = TestPhys::with_frames(FRAMES as usize);
        let (mut alloc, vs) = setup();
        let mut tlb = SoftTlb::new();
        let aspace = AddressSpace::new(&phys, vs);

        let va = VirtualAddress::new(0x7000);
        let frame = PhysicalPage::from_number(33);
        aspace.map(&mut alloc, &mut tlb, frame, va, PageEntryBits::user_rw()).unwrap();
        tlb.refill(aspace.tlb_tag(va), aspace.lookup_entry(va).unwrap());

        aspace.unmap(&mut alloc, &mut tlb, va).unwrap();
        assert_eq!(alloc.refs(frame), 0);
        assert!(aspace.lookup(va).is_none());
        assert!(tlb.is_empty());

        // Absent mappings are fine.
        aspace.unmap(&mut alloc, &mut tlb, va).unwrap();
        aspace.unmap(&mut alloc, &mut tlb, VirtualAddress::new(0x4000_0000)).unwrap();
    }

    #[test]
    fn map_segment_skips_reference_counts() {
        let phys = TestPhys::with_frames(FRAMES as usize);
        let (mut alloc, vs) = setup();
        let aspace = AddressSpace::new(&phys, vs);

        let va = VirtualAddress::new(0x7f80_0000);
        let pa = PhysicalAddress::new(20 << 12);
        aspace
            .map_segment(&mut alloc, va, 2 * PAGE_SIZE + 1, pa, PageEntryBits::user_ro())
            .unwrap();

        for i in 0..3 {
            let (page, _) = aspace.lookup(va + i * PAGE_SIZE).unwrap();
            assert_eq!(page.number(), 20 + i);
            assert_eq!(alloc.refs(page), 0);
        }
        assert!(aspace.lookup(va + 3 * PAGE_SIZE).is_none());
    }

    #[test]
    fn tlb_tag_carries_asid() {
        let phys = TestPhys::with_frames(4);
        let aspace = AddressSpace::new(&phys, VSpace::new(PhysicalPage::from_number(1), Asid::new(9)));
        let tag = aspace.tlb_tag(VirtualAddress::new(0x0040_0abc));
        assert_eq!(tag, EntryHi::tag(VirtualAddress::new(0x0040_0000), Asid::new(9)));
        assert_eq!(tag.asid(), 9);
    }
}
