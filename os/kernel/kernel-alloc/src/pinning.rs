//! Frame pinning.
//!
//! A pinned frame can be neither unmapped nor replaced; the forward tables
//! refuse both with [`MapError::Pinned`](kernel_vmem::MapError::Pinned).
//! Pinning a range requires every page in it to be mapped and referenced at
//! most once, so that a pin never freezes memory another mapping also sees.

use crate::vmm::Vmm;
use core::ops::Range;
use kernel_memory_addresses::{PAGE_SIZE, VirtualAddress};
use kernel_vmem::tlb::Tlb;
use kernel_vmem::{AddressSpace, PhysMapper, VSpace};

/// Raw flag for [`PinMode::Current`].
pub const MCL_CURRENT: u32 = 1;

/// Raw flag for [`PinMode::Future`].
pub const MCL_FUTURE: u32 = 2;

/// What [`Vmm::pin_all`] pins.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[repr(u32)]
pub enum PinMode {
    /// Every frame referenced right now.
    Current = MCL_CURRENT,
    /// Every frame referenced from now on.
    Future = MCL_FUTURE,
}

impl TryFrom<u32> for PinMode {
    type Error = PinError;

    fn try_from(flags: u32) -> Result<Self, PinError> {
        match flags {
            MCL_CURRENT => Ok(Self::Current),
            MCL_FUTURE => Ok(Self::Future),
            other => Err(PinError::InvalidMode(other)),
        }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum PinError {
    #[error("{0} is not mapped")]
    Unmapped(VirtualAddress),
    #[error("{va} is mapped {refs} times")]
    Shared { va: VirtualAddress, refs: u32 },
    #[error("unknown pin mode {0:#x}")]
    InvalidMode(u32),
}

/// Base addresses of every page `[va, va + len)` touches.
///
/// An empty range touches nothing; a range running past the top of the
/// address space stops there.
#[allow(clippy::cast_possible_truncation)]
pub fn touched_pages(va: VirtualAddress, len: u32) -> impl Iterator<Item = VirtualAddress> + Clone {
    let page = u64::from(PAGE_SIZE);
    let start = u64::from(va.as_u32()) & !(page - 1);
    let end = if len == 0 {
        start
    } else {
        (u64::from(va.as_u32()) + u64::from(len))
            .next_multiple_of(page)
            .min(1 << 32)
    };

    Range { start, end }
        .step_by(PAGE_SIZE as usize)
        .map(|addr| VirtualAddress::new(addr as u32))
}

impl<M: PhysMapper + Copy, T: Tlb> Vmm<'_, M, T> {
    /// Pin the frames behind `[va, va + len)` in `vs`.
    ///
    /// Nothing is pinned unless every page is mapped and its frame has at
    /// most one reference. Untracked segment mappings carry none and pin
    /// fine. Pinning twice is harmless.
    ///
    /// # Errors
    /// - [`PinError::Unmapped`] for the first unmapped page.
    /// - [`PinError::Shared`] for the first page whose frame is referenced
    ///   more than once.
    pub fn pin(&mut self, vs: &VSpace, va: VirtualAddress, len: u32) -> Result<(), PinError> {
        let mapper = self.mapper;
        let space = AddressSpace::new(&mapper, *vs);

        for page in touched_pages(va, len) {
            let (frame, _) = space.lookup(page).ok_or(PinError::Unmapped(page))?;
            let refs = self.frames.ref_count(frame);
            if refs > 1 {
                return Err(PinError::Shared { va: page, refs });
            }
        }

        for page in touched_pages(va, len) {
            if let Some((frame, _)) = space.lookup(page) {
                self.frames.set_pinned(frame, true);
            }
        }
        Ok(())
    }

    /// Unpin the frames behind `[va, va + len)` in `vs`.
    ///
    /// # Errors
    /// [`PinError::Unmapped`] for the first unmapped page; nothing is
    /// unpinned then.
    pub fn unpin(&mut self, vs: &VSpace, va: VirtualAddress, len: u32) -> Result<(), PinError> {
        let mapper = self.mapper;
        let space = AddressSpace::new(&mapper, *vs);

        if let Some(page) = touched_pages(va, len).find(|&page| space.lookup(page).is_none()) {
            return Err(PinError::Unmapped(page));
        }

        for page in touched_pages(va, len) {
            if let Some((frame, _)) = space.lookup(page) {
                self.frames.set_pinned(frame, false);
            }
        }
        Ok(())
    }

    /// Pin by raw `mlockall` flags.
    ///
    /// # Errors
    /// [`PinError::InvalidMode`] unless `flags` is exactly [`MCL_CURRENT`]
    /// or [`MCL_FUTURE`].
    pub fn pin_all(&mut self, flags: u32) -> Result<(), PinError> {
        match PinMode::try_from(flags)? {
            PinMode::Current => {
                self.frames.pin_in_use();
                log::debug!("Pinned all frames in use");
            }
            PinMode::Future => {
                self.frames.set_future_pin(true);
                log::debug!("Pinning every frame mapped from now on");
            }
        }
        Ok(())
    }

    /// Unpin every frame. Future pinning stays on if it was on.
    pub fn unpin_all(&mut self) {
        self.frames.clear_pins();
        log::debug!("Unpinned all frames");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame_alloc::{Frame, FrameTable};
    use crate::inverted::{InvertedEntry, InvertedPageTable};
    use crate::phys_mapper::PhysRam;
    use crate::vmm::VmmError;
    use kernel_vmem::PageEntryBits;
    use kernel_vmem::tlb::{Asid, SoftTlb};

    const FRAMES: usize = 32;

    fn va(addr: u32) -> VirtualAddress {
        VirtualAddress::new(addr)
    }

    fn pages(va: VirtualAddress, len: u32) -> Vec<u32> {
        touched_pages(va, len).map(VirtualAddress::as_u32).collect()
    }

    #[test]
    fn mode_parsing() {
        assert_eq!(PinMode::try_from(1), Ok(PinMode::Current));
        assert_eq!(PinMode::try_from(2), Ok(PinMode::Future));
        assert_eq!(PinMode::try_from(0), Err(PinError::InvalidMode(0)));
        assert_eq!(PinMode::try_from(3), Err(PinError::InvalidMode(3)));
    }

    #[test]
    fn ranges_cover_touched_pages() {
        assert_eq!(pages(va(0x1000), 0x1000), vec![0x1000]);
        assert_eq!(pages(va(0x1ff0), 0x20), vec![0x1000, 0x2000]);
        assert_eq!(pages(va(0x1234), 1), vec![0x1000]);
        assert!(pages(va(0x1234), 0).is_empty());
        assert_eq!(pages(va(0xffff_f000), 0x2000), vec![0xffff_f000]);
    }

    #[test]
    fn pin_and_unpin_range() {
        let ram = PhysRam::new(FRAMES as u32 * PAGE_SIZE);
        let mut frames = vec![Frame::UNUSED; FRAMES];
        let mut entries = vec![InvertedEntry::UNUSED; FRAMES];
        let mut vmm = Vmm::new(
            FrameTable::new(&mut frames, &ram),
            InvertedPageTable::new(&mut entries),
            SoftTlb::new(),
        )
        .unwrap();
        let vs = vmm.create_vspace(Asid::new(2)).unwrap();

        let a = vmm.frames_mut().alloc().unwrap();
        let b = vmm.frames_mut().alloc().unwrap();
        vmm.map(&vs, a, va(0x0040_0000), PageEntryBits::user_rw()).unwrap();
        vmm.map(&vs, b, va(0x0040_1000), PageEntryBits::user_rw()).unwrap();

        vmm.pin(&vs, va(0x0040_0800), 0x1000).unwrap();
        assert!(vmm.frames().is_pinned(a));
        assert!(vmm.frames().is_pinned(b));
        vmm.pin(&vs, va(0x0040_0000), 0x2000).unwrap();

        assert_eq!(vmm.unmap(&vs, va(0x0040_0000)), Err(VmmError::Invalid));
        let c = vmm.frames_mut().alloc().unwrap();
        assert_eq!(
            vmm.map(&vs, c, va(0x0040_1000), PageEntryBits::user_rw()),
            Err(VmmError::Invalid)
        );

        vmm.unpin(&vs, va(0x0040_0000), 0x2000).unwrap();
        vmm.unmap(&vs, va(0x0040_0000)).unwrap();
        vmm.map(&vs, c, va(0x0040_1000), PageEntryBits::user_rw()).unwrap();
    }

    #[test]
    fn pin_fails_without_partial_effect() {
        let ram = PhysRam::new(FRAMES as u32 * PAGE_SIZE);
        let mut frames = vec![Frame::UNUSED; FRAMES];
        let mut entries = vec![InvertedEntry::UNUSED; FRAMES];
        let mut vmm = Vmm::new(
            FrameTable::new(&mut frames, &ram),
            InvertedPageTable::new(&mut entries),
            SoftTlb::new(),
        )
        .unwrap();
        let vs = vmm.create_vspace(Asid::new(2)).unwrap();

        let a = vmm.frames_mut().alloc().unwrap();
        vmm.map(&vs, a, va(0x0040_0000), PageEntryBits::user_rw()).unwrap();

        assert_eq!(
            vmm.pin(&vs, va(0x0040_0000), 0x2000),
            Err(PinError::Unmapped(va(0x0040_1000)))
        );
        assert!(!vmm.frames().is_pinned(a));

        // A second mapping of the same frame makes it shared.
        vmm.map(&vs, a, va(0x0040_1000), PageEntryBits::user_ro()).unwrap();
        assert_eq!(
            vmm.pin(&vs, va(0x0040_0000), 0x2000),
            Err(PinError::Shared {
                va: va(0x0040_0000),
                refs: 2
            })
        );
        assert!(!vmm.frames().is_pinned(a));
    }

    #[test]
    fn segment_mappings_pin_without_references() {
        let ram = PhysRam::new(FRAMES as u32 * PAGE_SIZE);
        let mut frames = vec![Frame::UNUSED; FRAMES];
        let mut entries = vec![InvertedEntry::UNUSED; FRAMES];
        let mut vmm = Vmm::new(
            FrameTable::new(&mut frames, &ram),
            InvertedPageTable::new(&mut entries),
            SoftTlb::new(),
        )
        .unwrap();
        let vs = vmm.create_vspace(Asid::new(3)).unwrap();

        let p = vmm.frames_mut().alloc().unwrap();
        vmm.map_segment(&vs, va(0x0040_0000), PAGE_SIZE, p.base(), PageEntryBits::user_rw())
            .unwrap();
        assert_eq!(vmm.frames().ref_count(p), 0);

        vmm.pin(&vs, va(0x0040_0000), PAGE_SIZE).unwrap();
        assert!(vmm.frames().is_pinned(p));
        assert_eq!(vmm.unmap(&vs, va(0x0040_0000)), Err(VmmError::Invalid));
    }

    #[test]
    fn unpin_requires_mapping() {
        let ram = PhysRam::new(FRAMES as u32 * PAGE_SIZE);
        let mut frames = vec![Frame::UNUSED; FRAMES];
        let mut entries = vec![InvertedEntry::UNUSED; FRAMES];
        let mut vmm = Vmm::new(
            FrameTable::new(&mut frames, &ram),
            InvertedPageTable::new(&mut entries),
            SoftTlb::new(),
        )
        .unwrap();
        let vs = vmm.create_vspace(None).unwrap();

        assert_eq!(
            vmm.unpin(&vs, va(0x0050_0000), 1),
            Err(PinError::Unmapped(va(0x0050_0000)))
        );
    }

    #[test]
    fn pin_all_modes() {
        let ram = PhysRam::new(FRAMES as u32 * PAGE_SIZE);
        let mut frames = vec![Frame::UNUSED; FRAMES];
        let mut entries = vec![InvertedEntry::UNUSED; FRAMES];
        let mut vmm = Vmm::new(
            FrameTable::new(&mut frames, &ram),
            InvertedPageTable::new(&mut entries),
            SoftTlb::new(),
        )
        .unwrap();
        let vs = vmm.create_vspace(None).unwrap();

        assert_eq!(vmm.pin_all(0), Err(PinError::InvalidMode(0)));
        assert_eq!(vmm.pin_all(MCL_CURRENT | MCL_FUTURE), Err(PinError::InvalidMode(3)));

        vmm.pin_all(MCL_CURRENT).unwrap();
        assert!(vmm.frames().is_pinned(vs.root()));
        assert!(!vmm.frames().future_pin());

        vmm.pin_all(MCL_FUTURE).unwrap();
        let d = vmm.frames_mut().alloc().unwrap();
        assert!(!vmm.frames().is_pinned(d));
        vmm.map(&vs, d, va(0x0060_0000), PageEntryBits::user_rw()).unwrap();
        assert!(vmm.frames().is_pinned(d));

        vmm.unpin_all();
        assert!(!vmm.frames().is_pinned(d));
        assert!(!vmm.frames().is_pinned(vs.root()));
        assert!(vmm.frames().future_pin());
    }
}
