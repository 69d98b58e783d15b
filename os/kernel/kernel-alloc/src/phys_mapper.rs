//! # Physical Mappers
//!
//! [`PhysMapper`] implementations for the two places this code runs.
//!
//! - [`Kseg0PhysMapper`]: on the target, physical memory is reachable
//!   through the unmapped, cached KSEG0 window at `KSEG0 + pa`. No page
//!   tables are involved.
//! - [`PhysRam`]: hosted simulation; physical memory is a heap buffer of
//!   page-aligned frames and physical address `pa` is the byte offset `pa`
//!   into it.

use alloc::boxed::Box;
use core::cell::UnsafeCell;
use kernel_info::memory::KSEG0;
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress, pages_for};
use kernel_vmem::PhysMapper;

/// [`PhysMapper`] for the KSEG0 window.
///
/// # Safety
/// - The referenced physical range must lie below 512 MiB.
/// - The returned reference must only be used for memory the caller owns.
#[derive(Debug, Default, Copy, Clone)]
pub struct Kseg0PhysMapper;

impl PhysMapper for Kseg0PhysMapper {
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
        let va = (KSEG0 | pa.as_u32()) as usize as *mut T;
        // SAFETY: Caller must ensure the physical address is valid and owned.
        unsafe { &mut *va }
    }
}

#[repr(C, align(4096))]
struct RamFrame(UnsafeCell<[u8; PAGE_SIZE as usize]>);

/// Simulated physical memory.
///
/// All references handed out derive from one allocation, so ranges spanning
/// several frames (such as the frame descriptor array) are valid.
pub struct PhysRam {
    frames: Box<[RamFrame]>,
}

impl PhysRam {
    /// Allocate `bytes` of zeroed memory, rounded up to whole frames.
    #[must_use]
    pub fn new(bytes: u32) -> Self {
        let frames = (0..pages_for(bytes))
            .map(|_| RamFrame(UnsafeCell::new([0; PAGE_SIZE as usize])))
            .collect();
        Self { frames }
    }

    /// Size in bytes.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn size(&self) -> u32 {
        self.frames.len() as u32 * PAGE_SIZE
    }

    /// Size in frames.
    #[must_use]
    pub fn frames(&self) -> usize {
        self.frames.len()
    }
}

impl PhysMapper for PhysRam {
    /// # Panics
    /// If `[pa, pa + size_of::<T>())` does not lie inside the buffer.
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
        let len = self.frames.len() * PAGE_SIZE as usize;
        let end = pa.as_usize() + size_of::<T>();
        assert!(end <= len, "physical address {pa} outside of simulated RAM");

        let base = UnsafeCell::raw_get(self.frames.as_ptr().cast::<UnsafeCell<[u8; PAGE_SIZE as usize]>>());
        // SAFETY: in bounds; the caller promises `T` matches the bytes and
        // that no other reference to them is live.
        unsafe { &mut *base.cast::<u8>().add(pa.as_usize()).cast::<T>() }
    }
}
