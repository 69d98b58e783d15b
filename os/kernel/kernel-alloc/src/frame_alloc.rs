//! Physical frame allocator.
//!
//! One [`Frame`] descriptor per physical page, kept in a flat array indexed by
//! page number. Free frames are chained through the descriptors themselves;
//! allocation pops the head and freeing pushes onto it.
//!
//! Reference counts are owned by the callers: [`FrameTable::alloc`] hands out
//! frames with a count of zero, every mapping and every page-table link adds
//! one, and a frame returns to the free list when its count drops back to
//! zero.

use core::fmt;
use kernel_memory_addresses::{PAGE_SHIFT, PAGE_SIZE, PhysicalAddress, PhysicalPage, align_up};
use kernel_vmem::{FrameAlloc, PhysMapper};

/// No frame is left on the free list.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
#[error("out of physical frames")]
pub struct OutOfFrames;

/// Descriptor of one physical frame.
///
/// The array of descriptors is mapped read-only into every user address space
/// at `UPAGES`, hence the fixed layout.
#[repr(C)]
#[derive(Copy, Clone, Eq, PartialEq)]
pub struct Frame {
    next: Option<u32>,
    refs: u32,
    pinned: bool,
    free: bool,
}

impl Frame {
    /// A descriptor that is neither free nor referenced.
    pub const UNUSED: Self = Self {
        next: None,
        refs: 0,
        pinned: false,
        free: false,
    };

    /// Number of mappings and table links referencing the frame.
    #[inline]
    #[must_use]
    pub const fn refs(&self) -> u32 {
        self.refs
    }

    #[inline]
    #[must_use]
    pub const fn is_pinned(&self) -> bool {
        self.pinned
    }

    /// Whether the frame currently sits on the free list.
    #[inline]
    #[must_use]
    pub const fn is_free(&self) -> bool {
        self.free
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("refs", &self.refs)
            .field("pinned", &self.pinned)
            .field("free", &self.free)
            .finish()
    }
}

#[inline]
#[allow(clippy::cast_possible_truncation)]
const fn page_of(index: usize) -> PhysicalPage {
    PhysicalPage::from_number(index as u32)
}

/// Reference-counted physical frames with a free list.
pub struct FrameTable<'a, M> {
    frames: &'a mut [Frame],
    free_head: Option<u32>,
    free_len: usize,
    future_pin: bool,
    mapper: M,
}

impl<'a, M: PhysMapper> FrameTable<'a, M> {
    /// Manage `frames`, all of them initially free.
    pub fn new(frames: &'a mut [Frame], mapper: M) -> Self {
        Self::with_reserved(frames, mapper, PhysicalAddress::new(0))
    }

    /// Manage `frames`, treating everything below `first_free` as kernel
    /// memory.
    ///
    /// Frames below `first_free` (rounded up to a page) get one reference and
    /// are pinned. All others are pushed onto the free list in ascending
    /// order, so the highest frame is handed out first.
    pub fn with_reserved(frames: &'a mut [Frame], mapper: M, first_free: PhysicalAddress) -> Self {
        let reserved = ((align_up(first_free.as_u32(), PAGE_SIZE) >> PAGE_SHIFT) as usize).min(frames.len());

        let mut table = Self {
            frames,
            free_head: None,
            free_len: 0,
            future_pin: false,
            mapper,
        };

        for frame in &mut table.frames[..reserved] {
            *frame = Frame {
                refs: 1,
                pinned: true,
                ..Frame::UNUSED
            };
        }
        for index in reserved..table.frames.len() {
            table.frames[index] = Frame::UNUSED;
            table.push_free(index);
        }
        table
    }

    fn slot(&self, page: PhysicalPage) -> &Frame {
        let len = self.frames.len();
        self.frames
            .get(page.index())
            .unwrap_or_else(|| panic!("frame {page} outside of {len} managed frames"))
    }

    fn slot_mut(&mut self, page: PhysicalPage) -> &mut Frame {
        let len = self.frames.len();
        self.frames
            .get_mut(page.index())
            .unwrap_or_else(|| panic!("frame {page} outside of {len} managed frames"))
    }

    #[allow(clippy::cast_possible_truncation)]
    fn push_free(&mut self, index: usize) {
        let head = self.free_head;
        let frame = &mut self.frames[index];
        frame.next = head;
        frame.free = true;
        self.free_head = Some(index as u32);
        self.free_len += 1;
    }

    /// Take a frame off the free list and zero it.
    ///
    /// The frame comes back unreferenced and unpinned.
    ///
    /// # Errors
    /// [`OutOfFrames`] if the free list is empty.
    pub fn alloc(&mut self) -> Result<PhysicalPage, OutOfFrames> {
        let index = self.free_head.ok_or(OutOfFrames)? as usize;
        let frame = &mut self.frames[index];
        self.free_head = frame.next.take();
        frame.free = false;
        frame.pinned = false;
        self.free_len -= 1;

        let page = page_of(index);
        self.mapper.zero_page(page);
        Ok(page)
    }

    /// Return `page` to the free list if nothing references it any more.
    ///
    /// # Panics
    /// If `page` is already on the free list.
    pub fn free(&mut self, page: PhysicalPage) {
        let frame = self.slot(page);
        if frame.refs > 0 {
            return;
        }
        assert!(!frame.free, "frame {page} freed twice");
        self.push_free(page.index());
    }

    /// Drop one reference, freeing the frame when none are left.
    ///
    /// # Panics
    /// If the reference count is already zero.
    pub fn decref(&mut self, page: PhysicalPage) {
        let frame = self.slot_mut(page);
        assert!(frame.refs > 0, "frame {page} reference count underflow");
        frame.refs -= 1;
        if frame.refs == 0 {
            self.free(page);
        }
    }

    /// Add one reference.
    pub fn incref(&mut self, page: PhysicalPage) {
        self.slot_mut(page).refs += 1;
    }

    #[must_use]
    pub fn ref_count(&self, page: PhysicalPage) -> u32 {
        self.slot(page).refs
    }

    #[must_use]
    pub fn is_pinned(&self, page: PhysicalPage) -> bool {
        self.slot(page).pinned
    }

    pub fn set_pinned(&mut self, page: PhysicalPage, pinned: bool) {
        self.slot_mut(page).pinned = pinned;
    }

    /// Pin every frame that is referenced at least once.
    pub fn pin_in_use(&mut self) {
        for frame in self.frames.iter_mut().filter(|f| f.refs >= 1) {
            frame.pinned = true;
        }
    }

    /// Unpin every frame.
    pub fn clear_pins(&mut self) {
        for frame in self.frames.iter_mut() {
            frame.pinned = false;
        }
    }

    /// While set, every new reference pins its frame.
    #[inline]
    pub const fn set_future_pin(&mut self, on: bool) {
        self.future_pin = on;
    }

    #[inline]
    #[must_use]
    pub const fn future_pin(&self) -> bool {
        self.future_pin
    }

    /// Number of frames on the free list.
    #[inline]
    #[must_use]
    pub const fn free_count(&self) -> usize {
        self.free_len
    }

    /// Number of frames not on the free list.
    #[inline]
    #[must_use]
    pub const fn in_use_count(&self) -> usize {
        self.frames.len() - self.free_len
    }

    /// Total number of managed frames.
    #[inline]
    #[must_use]
    pub const fn len(&self) -> usize {
        self.frames.len()
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// The descriptor array, for diagnostics.
    #[inline]
    #[must_use]
    pub const fn frames(&self) -> &[Frame] {
        &*self.frames
    }

    /// Frames on the free list, head first.
    pub fn free_frames(&self) -> impl Iterator<Item = PhysicalPage> + '_ {
        let mut cursor = self.free_head;
        core::iter::from_fn(move || {
            let index = cursor? as usize;
            cursor = self.frames[index].next;
            Some(page_of(index))
        })
    }

    #[inline]
    pub const fn mapper(&self) -> &M {
        &self.mapper
    }
}

impl<M: PhysMapper> FrameAlloc for FrameTable<'_, M> {
    fn alloc_4k(&mut self) -> Option<PhysicalPage> {
        self.alloc().ok()
    }

    fn retain(&mut self, page: PhysicalPage) {
        let future_pin = self.future_pin;
        let frame = self.slot_mut(page);
        frame.refs += 1;
        frame.pinned |= future_pin;
    }

    fn release(&mut self, page: PhysicalPage) {
        self.decref(page);
    }

    fn is_pinned(&self, page: PhysicalPage) -> bool {
        Self::is_pinned(self, page)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phys_mapper::PhysRam;

    fn table<'a>(frames: &'a mut [Frame], ram: &'a PhysRam) -> FrameTable<'a, &'a PhysRam> {
        FrameTable::new(frames, ram)
    }

    #[test]
    fn alloc_pops_highest_first_and_zeroes() {
        let ram = PhysRam::new(4 * PAGE_SIZE);
        let mut frames = [Frame::UNUSED; 4];
        let mut t = table(&mut frames, &ram);

        let scribble: &mut [u8; 4096] = unsafe { ram.phys_to_mut(PhysicalAddress::new(3 * PAGE_SIZE)) };
        scribble.fill(0xAA);

        let p = t.alloc().unwrap();
        assert_eq!(p.number(), 3);
        assert_eq!(t.ref_count(p), 0);
        assert_eq!(t.free_count(), 3);
        let bytes: &mut [u8; 4096] = unsafe { ram.phys_to_mut(p.base()) };
        assert!(bytes.iter().all(|&b| b == 0));
    }

    #[test]
    fn exhaustion_reports_out_of_frames() {
        let ram = PhysRam::new(2 * PAGE_SIZE);
        let mut frames = [Frame::UNUSED; 2];
        let mut t = table(&mut frames, &ram);
        t.alloc().unwrap();
        t.alloc().unwrap();
        assert_eq!(t.alloc(), Err(OutOfFrames));
    }

    #[test]
    fn reserved_frames_are_held_and_pinned() {
        let ram = PhysRam::new(8 * PAGE_SIZE);
        let mut frames = [Frame::UNUSED; 8];
        let t = FrameTable::with_reserved(&mut frames, &ram, PhysicalAddress::new(2 * PAGE_SIZE + 1));

        for n in 0..3 {
            let p = PhysicalPage::from_number(n);
            assert_eq!(t.ref_count(p), 1);
            assert!(t.is_pinned(p));
        }
        assert_eq!(t.free_count(), 5);
        let order: Vec<u32> = t.free_frames().map(PhysicalPage::number).collect();
        assert_eq!(order, vec![7, 6, 5, 4, 3]);
    }

    #[test]
    fn decref_frees_at_zero() {
        let ram = PhysRam::new(4 * PAGE_SIZE);
        let mut frames = [Frame::UNUSED; 4];
        let mut t = table(&mut frames, &ram);

        let p = t.alloc().unwrap();
        t.incref(p);
        t.incref(p);
        t.decref(p);
        assert_eq!(t.free_count(), 3);
        t.decref(p);
        assert_eq!(t.free_count(), 4);
        assert_eq!(t.free_frames().next(), Some(p));
    }

    #[test]
    fn free_ignores_referenced_frames() {
        let ram = PhysRam::new(2 * PAGE_SIZE);
        let mut frames = [Frame::UNUSED; 2];
        let mut t = table(&mut frames, &ram);

        let p = t.alloc().unwrap();
        t.incref(p);
        t.free(p);
        assert_eq!(t.free_count(), 1);
        assert!(!t.frames()[p.index()].is_free());
    }

    #[test]
    #[should_panic(expected = "freed twice")]
    fn double_free_panics() {
        let ram = PhysRam::new(2 * PAGE_SIZE);
        let mut frames = [Frame::UNUSED; 2];
        let mut t = table(&mut frames, &ram);
        let p = t.alloc().unwrap();
        t.free(p);
        t.free(p);
    }

    #[test]
    #[should_panic(expected = "underflow")]
    fn decref_underflow_panics() {
        let ram = PhysRam::new(2 * PAGE_SIZE);
        let mut frames = [Frame::UNUSED; 2];
        let mut t = table(&mut frames, &ram);
        let p = t.alloc().unwrap();
        t.decref(p);
    }

    #[test]
    #[should_panic(expected = "outside of")]
    fn out_of_range_frame_panics() {
        let ram = PhysRam::new(2 * PAGE_SIZE);
        let mut frames = [Frame::UNUSED; 2];
        let mut t = table(&mut frames, &ram);
        t.incref(PhysicalPage::from_number(9));
    }

    #[test]
    fn future_pin_applies_to_new_references() {
        let ram = PhysRam::new(4 * PAGE_SIZE);
        let mut frames = [Frame::UNUSED; 4];
        let mut t = table(&mut frames, &ram);

        let before = t.alloc().unwrap();
        t.retain(before);
        t.set_future_pin(true);
        let after = t.alloc().unwrap();
        t.retain(after);

        assert!(!t.is_pinned(before));
        assert!(FrameAlloc::is_pinned(&t, after));
    }

    #[test]
    fn pin_in_use_and_clear() {
        let ram = PhysRam::new(4 * PAGE_SIZE);
        let mut frames = [Frame::UNUSED; 4];
        let mut t = table(&mut frames, &ram);

        let used = t.alloc().unwrap();
        t.incref(used);
        t.incref(used);
        let idle = t.alloc().unwrap();

        t.pin_in_use();
        assert!(t.is_pinned(used));
        assert!(!t.is_pinned(idle));

        t.clear_pins();
        assert!(!t.is_pinned(used));
    }

    #[test]
    fn recycled_frames_start_unpinned() {
        let ram = PhysRam::new(PAGE_SIZE);
        let mut frames = [Frame::UNUSED; 1];
        let mut t = table(&mut frames, &ram);

        let p = t.alloc().unwrap();
        t.set_pinned(p, true);
        t.free(p);
        let again = t.alloc().unwrap();
        assert_eq!(again, p);
        assert!(!t.is_pinned(again));
    }
}
