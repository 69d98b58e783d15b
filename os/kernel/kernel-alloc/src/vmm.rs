//! Virtual memory manager for the kernel.
//!
//! [`Vmm`] owns every piece of global memory-management state: the frame
//! table, the inverted page table, the TLB and the kernel's own address
//! space. Everything that changes a mapping goes through `&mut Vmm`, so there
//! is exactly one writer at any time.
//!
//! # Example
//! ```ignore
//! use kernel_alloc::{phys_mapper::Kseg0PhysMapper, vmm::Vmm};
//! use kernel_vmem::tlb::MipsTlb;
//!
//! let mut vmm = unsafe { Vmm::bootstrap(Kseg0PhysMapper, MipsTlb, &boot_info)? };
//! let space = vmm.create_vspace(Asid::new(1))?;
//! vmm.handle_tlb_miss(&space, fault_va)?;
//! ```

use crate::boot_alloc::{BootAlloc, BootError};
use crate::frame_alloc::{Frame, FrameTable, OutOfFrames};
use crate::inverted::{InvertedEntry, InvertedPageTable, IptError};
use crate::pinning::PinError;
use core::fmt;
use kernel_info::boot::{BootInfo, MemoryLayout};
use kernel_info::memory::{UENVS, UPAGES};
use kernel_memory_addresses::{PAGE_SIZE, PDMAP, PhysicalAddress, PhysicalPage, VirtualAddress, align_up};
use kernel_vmem::tlb::{Asid, Tlb};
use kernel_vmem::{AddressSpace, FrameAlloc, MapError, PageEntryBits, PdIndex, PhysMapper, PteSlot, VSpace};

/// The three outcomes callers of the memory core distinguish.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum VmmError {
    #[error("out of memory")]
    OutOfMemory,
    #[error("invalid request")]
    Invalid,
    #[error("not found")]
    NotFound,
}

impl From<MapError> for VmmError {
    fn from(e: MapError) -> Self {
        match e {
            MapError::OutOfMemory => Self::OutOfMemory,
            MapError::Pinned(_) => Self::Invalid,
        }
    }
}

impl From<OutOfFrames> for VmmError {
    fn from(_: OutOfFrames) -> Self {
        Self::OutOfMemory
    }
}

impl From<IptError> for VmmError {
    fn from(e: IptError) -> Self {
        match e {
            IptError::OutOfMemory => Self::OutOfMemory,
            IptError::NotFound(_) => Self::NotFound,
            IptError::StillValid(_) => Self::Invalid,
        }
    }
}

impl From<PinError> for VmmError {
    fn from(_: PinError) -> Self {
        Self::Invalid
    }
}

/// Snapshot of frame usage.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct FrameStats {
    pub total: usize,
    pub free: usize,
    pub in_use: usize,
    pub pinned: usize,
}

impl fmt::Display for FrameStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} frames: {} free, {} in use, {} pinned",
            self.total, self.free, self.in_use, self.pinned
        )
    }
}

/// Kernel virtual memory manager.
pub struct Vmm<'a, M: PhysMapper + Copy, T: Tlb> {
    pub(crate) mapper: M,
    pub(crate) frames: FrameTable<'a, M>,
    pub(crate) ipt: InvertedPageTable<'a>,
    pub(crate) tlb: T,
    kernel: VSpace,
    layout: MemoryLayout,
}

impl<'a, M: PhysMapper + Copy, T: Tlb> Vmm<'a, M, T> {
    /// Bring up the memory core from what the boot code reports.
    ///
    /// 1. Size physical memory.
    /// 2. Carve the kernel page directory, the frame descriptors, the
    ///    environment table and the inverted entries out of the memory after
    ///    the kernel image.
    /// 3. Map the descriptors at `UPAGES` and the environment table at
    ///    `UENVS`, both read-only for user space.
    /// 4. Hand every frame above the boot allocations to the frame table.
    /// 5. Pre-insert the frames backing `UPAGES` into the inverted table.
    ///
    /// # Safety
    /// - All of physical memory up to the detected size must be reachable
    ///   through `mapper` and unused beyond `info.kernel_end`.
    /// - Must run once; the returned manager owns that memory for `'a`.
    ///
    /// # Errors
    /// [`BootError`] if memory is too small for the boot structures or a
    /// structure does not fit its window.
    pub unsafe fn bootstrap(mapper: M, tlb: T, info: &BootInfo) -> Result<Self, BootError> {
        let layout = MemoryLayout::detect(info);
        log::info!(
            "Physical memory: {}K available, base = {}K, extended = {}K",
            layout.max_pa / 1024,
            layout.basemem / 1024,
            layout.extmem / 1024
        );

        let max_pa = PhysicalAddress::new(layout.max_pa);
        if info.kernel_end > max_pa {
            return Err(BootError::KernelTooLarge(info.kernel_end));
        }

        let npage = layout.frames();
        let mut boot = BootAlloc::new(info.kernel_end, max_pa, mapper);

        let pgdir = boot.alloc(PAGE_SIZE, PAGE_SIZE, true)?.page();
        let kernel = VSpace::new(pgdir, None);
        log::info!("Kernel page directory at {}", pgdir.base());

        let frames_bytes = window_bytes("frame table", npage, size_of::<Frame>())?;
        let frames_pa = boot.alloc(frames_bytes, PAGE_SIZE, true)?;

        let env_bytes = info.env_table_size;
        if env_bytes > PDMAP {
            return Err(BootError::WindowTooSmall {
                what: "environment table",
                bytes: env_bytes,
            });
        }
        let envs_pa = boot.alloc(env_bytes, PAGE_SIZE, true)?;

        let ipt_bytes = u32::try_from(npage * size_of::<InvertedEntry>()).map_err(|_| BootError::OutOfMemory {
            requested: u32::MAX,
            at: boot.first_free(),
        })?;
        let ipt_pa = boot.alloc(ipt_bytes, PAGE_SIZE, true)?;

        let space = AddressSpace::new(&mapper, kernel);
        space.map_segment(
            &mut boot,
            VirtualAddress::new(UPAGES),
            frames_bytes,
            frames_pa,
            PageEntryBits::user_ro(),
        )?;
        space.map_segment(
            &mut boot,
            VirtualAddress::new(UENVS),
            env_bytes,
            envs_pa,
            PageEntryBits::user_ro(),
        )?;
        log::info!("Mapped {frames_bytes} bytes of frame descriptors at UPAGES, {env_bytes} bytes of environments at UENVS");

        // SAFETY: the range was just carved out of free memory, page aligned.
        let descriptors = unsafe { mapper.init_slice(frames_pa, npage, Frame::UNUSED) };
        let frames = FrameTable::with_reserved(descriptors, mapper, boot.first_free());
        log::info!(
            "Frame table ready: {} frames, {} free, first free at {}",
            frames.len(),
            frames.free_count(),
            boot.first_free()
        );

        // SAFETY: as above.
        let entries = unsafe { mapper.init_slice(ipt_pa, npage, InvertedEntry::UNUSED) };
        let mut ipt = InvertedPageTable::new(entries);
        for offset in (0..align_up(frames_bytes, PAGE_SIZE)).step_by(PAGE_SIZE as usize) {
            let id = ipt.entry_for((frames_pa + offset).page());
            ipt.insert(VirtualAddress::new(UPAGES) + offset, id, PageEntryBits::user_ro());
        }
        log::info!("Inverted page table ready: {} entries, {} free", ipt.len(), ipt.free_count());

        Ok(Self {
            mapper,
            frames,
            ipt,
            tlb,
            kernel,
            layout,
        })
    }

    /// Assemble a manager from already initialized parts.
    ///
    /// A fresh kernel page directory is taken from `frames`.
    ///
    /// # Errors
    /// [`VmmError::OutOfMemory`] if no frame is left for the directory.
    ///
    /// # Panics
    /// If the inverted pool has fewer entries than there are frames.
    pub fn new(mut frames: FrameTable<'a, M>, ipt: InvertedPageTable<'a>, tlb: T) -> Result<Self, VmmError> {
        assert!(
            ipt.len() >= frames.len(),
            "inverted pool of {} entries cannot cover {} frames",
            ipt.len(),
            frames.len()
        );

        let mapper = *frames.mapper();
        let pgdir = frames.alloc()?;
        frames.retain(pgdir);

        #[allow(clippy::cast_possible_truncation)]
        let max_pa = (frames.len() as u32).saturating_mul(PAGE_SIZE);
        let layout = MemoryLayout {
            max_pa,
            npage: max_pa / PAGE_SIZE,
            basemem: max_pa,
            extmem: 0,
        };

        Ok(Self {
            mapper,
            frames,
            ipt,
            tlb,
            kernel: VSpace::new(pgdir, None),
            layout,
        })
    }

    /// Create an empty user address space tagged with `asid`.
    ///
    /// The directory shares the kernel's page tables for the read-only
    /// `UPAGES` and `UENVS` windows.
    ///
    /// # Errors
    /// [`VmmError::OutOfMemory`] if no frame is left for the directory.
    pub fn create_vspace(&mut self, asid: Option<Asid>) -> Result<VSpace, VmmError> {
        let root = self.frames.alloc()?;
        self.frames.retain(root);

        let kernel = self.mapper.page_directory_mut(self.kernel.root());
        let pgdir = self.mapper.page_directory_mut(root);
        for va in [UENVS, UPAGES] {
            let index = PdIndex::from(VirtualAddress::new(va));
            pgdir.set(index, kernel.get(index));
        }

        log::debug!("Created address space {root} with ASID {asid:?}");
        Ok(VSpace::new(root, asid))
    }

    /// The kernel's own address space.
    #[inline]
    #[must_use]
    pub const fn kernel_space(&self) -> VSpace {
        self.kernel
    }

    /// Locate the page-table slot for `va`, creating the table if `create` is set.
    ///
    /// # Errors
    /// [`VmmError::OutOfMemory`] if a table has to be created and no frame is left.
    pub fn walk(&mut self, vs: &VSpace, va: VirtualAddress, create: bool) -> Result<Option<PteSlot>, VmmError> {
        let mapper = self.mapper;
        Ok(AddressSpace::new(&mapper, *vs).walk(&mut self.frames, va, create)?)
    }

    /// Map `page` at `va` in `vs`.
    ///
    /// # Errors
    /// - [`VmmError::Invalid`] if `page` or the frame it replaces is pinned.
    /// - [`VmmError::OutOfMemory`] if the page table cannot be created.
    pub fn map(&mut self, vs: &VSpace, page: PhysicalPage, va: VirtualAddress, perm: PageEntryBits) -> Result<(), VmmError> {
        let mapper = self.mapper;
        AddressSpace::new(&mapper, *vs).map(&mut self.frames, &mut self.tlb, page, va, perm)?;
        Ok(())
    }

    /// The frame mapped at `va` in `vs` and its slot.
    #[must_use]
    pub fn lookup(&self, vs: &VSpace, va: VirtualAddress) -> Option<(PhysicalPage, PteSlot)> {
        AddressSpace::new(&self.mapper, *vs).lookup(va)
    }

    /// Remove the mapping at `va` in `vs`; absent mappings are fine.
    ///
    /// # Errors
    /// [`VmmError::Invalid`] if the mapped frame is pinned.
    pub fn unmap(&mut self, vs: &VSpace, va: VirtualAddress) -> Result<(), VmmError> {
        let mapper = self.mapper;
        AddressSpace::new(&mapper, *vs).unmap(&mut self.frames, &mut self.tlb, va)?;
        Ok(())
    }

    /// Map `[va, va + size)` to `[pa, pa + size)` without reference counting the frames.
    ///
    /// # Errors
    /// [`VmmError::OutOfMemory`] if a page table cannot be created.
    pub fn map_segment(
        &mut self,
        vs: &VSpace,
        va: VirtualAddress,
        size: u32,
        pa: PhysicalAddress,
        perm: PageEntryBits,
    ) -> Result<(), VmmError> {
        let mapper = self.mapper;
        AddressSpace::new(&mapper, *vs).map_segment(&mut self.frames, va, size, pa, perm)?;
        Ok(())
    }

    /// Translate `va` through the forward tables of `vs`.
    #[must_use]
    pub fn translate(&self, vs: &VSpace, va: VirtualAddress) -> Option<PhysicalAddress> {
        AddressSpace::new(&self.mapper, *vs).query(va)
    }

    /// Drop the cached translation of `va` in `vs`.
    pub fn invalidate(&mut self, vs: &VSpace, va: VirtualAddress) {
        AddressSpace::new(&self.mapper, *vs).invalidate(&mut self.tlb, va);
    }

    /// [`map`](Self::map) and record the reverse mapping in the inverted table.
    ///
    /// # Errors
    /// As for [`map`](Self::map); the inverted table is untouched on failure.
    pub fn map_tracked(
        &mut self,
        vs: &VSpace,
        page: PhysicalPage,
        va: VirtualAddress,
        perm: PageEntryBits,
    ) -> Result<(), VmmError> {
        self.map(vs, page, va, perm)?;
        let id = self.ipt.entry_for(page);
        self.ipt.map(id, va, perm);
        Ok(())
    }

    /// [`unmap`](Self::unmap) and drop the reverse mapping.
    ///
    /// # Errors
    /// As for [`unmap`](Self::unmap). A page the inverted table never knew
    /// about is not an error.
    pub fn unmap_tracked(&mut self, vs: &VSpace, va: VirtualAddress) -> Result<(), VmmError> {
        self.unmap(vs, va)?;
        match self.ipt.unmap(va) {
            Ok(_) | Err(IptError::NotFound(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    #[must_use]
    pub fn stats(&self) -> FrameStats {
        FrameStats {
            total: self.frames.len(),
            free: self.frames.free_count(),
            in_use: self.frames.in_use_count(),
            pinned: self.frames.frames().iter().filter(|f| f.is_pinned()).count(),
        }
    }

    #[inline]
    #[must_use]
    pub const fn frames(&self) -> &FrameTable<'a, M> {
        &self.frames
    }

    #[inline]
    pub const fn frames_mut(&mut self) -> &mut FrameTable<'a, M> {
        &mut self.frames
    }

    #[inline]
    #[must_use]
    pub const fn ipt(&self) -> &InvertedPageTable<'a> {
        &self.ipt
    }

    #[inline]
    pub const fn ipt_mut(&mut self) -> &mut InvertedPageTable<'a> {
        &mut self.ipt
    }

    #[inline]
    #[must_use]
    pub const fn tlb(&self) -> &T {
        &self.tlb
    }

    #[inline]
    pub const fn tlb_mut(&mut self) -> &mut T {
        &mut self.tlb
    }

    #[inline]
    #[must_use]
    pub const fn layout(&self) -> &MemoryLayout {
        &self.layout
    }
}

fn window_bytes(what: &'static str, count: usize, size: usize) -> Result<u32, BootError> {
    let bytes = count.saturating_mul(size);
    match u32::try_from(bytes) {
        Ok(bytes) if bytes <= PDMAP => Ok(bytes),
        _ => Err(BootError::WindowTooSmall {
            what,
            bytes: u32::try_from(bytes).unwrap_or(u32::MAX),
        }),
    }
}
