//! Bump allocator for early boot.
//!
//! Hands out physical memory directly after the kernel image until the frame
//! table exists. Nothing is ever given back; whatever it handed out ends up
//! reserved when the [`FrameTable`](crate::frame_alloc::FrameTable) takes
//! over at [`first_free`](BootAlloc::first_free).

use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress, PhysicalPage};
use kernel_vmem::{FrameAlloc, MapError, PhysMapper};

/// Errors while setting up the memory core.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum BootError {
    #[error("boot allocator exhausted: {requested} bytes requested at {at}")]
    OutOfMemory { requested: u32, at: PhysicalAddress },
    #[error("kernel image ends at {0}, beyond physical memory")]
    KernelTooLarge(PhysicalAddress),
    #[error("{what} needs {bytes} bytes, more than its 4 MiB window")]
    WindowTooSmall { what: &'static str, bytes: u32 },
    #[error("failed to build boot page tables: {0}")]
    PageTable(#[from] MapError),
}

/// Bump allocator over `[next, end)`.
pub struct BootAlloc<M> {
    next: PhysicalAddress,
    end: PhysicalAddress,
    mapper: M,
}

impl<M: PhysMapper> BootAlloc<M> {
    pub const fn new(start: PhysicalAddress, end: PhysicalAddress, mapper: M) -> Self {
        Self {
            next: start,
            end,
            mapper,
        }
    }

    /// Allocate `n` bytes aligned to `align`, zeroed if `clear` is set.
    ///
    /// # Errors
    /// [`BootError::OutOfMemory`] if the request does not fit below the end
    /// of physical memory.
    pub fn alloc(&mut self, n: u32, align: u32, clear: bool) -> Result<PhysicalAddress, BootError> {
        let exhausted = BootError::OutOfMemory {
            requested: n,
            at: self.next,
        };

        let base = self.next.align_up(align);
        if base < self.next {
            return Err(exhausted);
        }
        let end = base.checked_add(n).ok_or(exhausted)?;
        if end > self.end {
            return Err(exhausted);
        }

        if clear && n > 0 {
            // SAFETY: [base, end) lies inside physical memory and was never handed out.
            unsafe { self.mapper.init_slice(base, n as usize, 0u8) };
        }
        self.next = end;
        Ok(base)
    }

    /// First byte not handed out yet.
    #[inline]
    #[must_use]
    pub const fn first_free(&self) -> PhysicalAddress {
        self.next
    }
}

impl<M: PhysMapper> FrameAlloc for BootAlloc<M> {
    fn alloc_4k(&mut self) -> Option<PhysicalPage> {
        self.alloc(PAGE_SIZE, PAGE_SIZE, true).ok().map(PhysicalAddress::page)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phys_mapper::PhysRam;

    #[test]
    fn aligns_and_bumps() {
        let ram = PhysRam::new(4 * PAGE_SIZE);
        let mut boot = BootAlloc::new(PhysicalAddress::new(0x10), PhysicalAddress::new(ram.size()), &ram);

        let a = boot.alloc(8, 16, false).unwrap();
        assert_eq!(a.as_u32(), 0x10);
        let b = boot.alloc(PAGE_SIZE, PAGE_SIZE, true).unwrap();
        assert_eq!(b.as_u32(), PAGE_SIZE);
        assert_eq!(boot.first_free().as_u32(), 2 * PAGE_SIZE);
    }

    #[test]
    fn clears_on_request() {
        let ram = PhysRam::new(2 * PAGE_SIZE);
        let dirty: &mut [u8; 4096] = unsafe { ram.phys_to_mut(PhysicalAddress::new(0)) };
        dirty.fill(0x5A);

        let mut boot = BootAlloc::new(PhysicalAddress::new(0), PhysicalAddress::new(ram.size()), &ram);
        let page = boot.alloc_4k().unwrap();
        let bytes: &mut [u8; 4096] = unsafe { ram.phys_to_mut(page.base()) };
        assert!(bytes.iter().all(|&b| b == 0));
    }

    #[test]
    fn exhaustion_is_reported() {
        let ram = PhysRam::new(2 * PAGE_SIZE);
        let mut boot = BootAlloc::new(PhysicalAddress::new(PAGE_SIZE), PhysicalAddress::new(ram.size()), &ram);
        assert!(boot.alloc_4k().is_some());
        assert_eq!(
            boot.alloc(1, 1, false),
            Err(BootError::OutOfMemory {
                requested: 1,
                at: PhysicalAddress::new(2 * PAGE_SIZE)
            })
        );
        assert!(boot.alloc_4k().is_none());
    }
}
