//! # Kernel Boot Information

use crate::memory::{DEFAULT_MEMORY_SIZE, MAX_MEMORY_SIZE};
use kernel_memory_addresses::{PAGE_SHIFT, PAGE_SIZE, PhysicalAddress, align_down};

/// What the early boot code tells the memory core.
#[repr(C)]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct BootInfo {
    /// Bytes of installed RAM, or `0` if unknown.
    pub memory_size: u32,

    /// First physical address not occupied by the kernel image.
    pub kernel_end: PhysicalAddress,

    /// Bytes needed for the environment table mapped at
    /// [`UENVS`](crate::memory::UENVS).
    pub env_table_size: u32,
}

impl BootInfo {
    #[must_use]
    pub const fn new(memory_size: u32, kernel_end: PhysicalAddress, env_table_size: u32) -> Self {
        Self {
            memory_size,
            kernel_end,
            env_table_size,
        }
    }
}

/// Physical memory geometry derived from [`BootInfo`].
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct MemoryLayout {
    /// One past the highest usable physical address.
    pub max_pa: u32,
    /// Number of 4 KiB frames (`max_pa >> 12`).
    pub npage: u32,
    /// Bytes of base memory.
    pub basemem: u32,
    /// Bytes of extended memory; always zero on this machine.
    pub extmem: u32,
}

impl MemoryLayout {
    /// Sizes physical memory.
    ///
    /// A zero `memory_size` falls back to [`DEFAULT_MEMORY_SIZE`]. Sizes
    /// beyond what KSEG0 can reach are clamped and partial frames dropped.
    #[must_use]
    pub const fn detect(info: &BootInfo) -> Self {
        let reported = if info.memory_size == 0 {
            DEFAULT_MEMORY_SIZE
        } else if info.memory_size > MAX_MEMORY_SIZE {
            MAX_MEMORY_SIZE
        } else {
            info.memory_size
        };

        let basemem = align_down(reported, PAGE_SIZE);
        Self {
            max_pa: basemem,
            npage: basemem >> PAGE_SHIFT,
            basemem,
            extmem: 0,
        }
    }

    /// Frame count as an index bound.
    #[inline]
    #[must_use]
    pub const fn frames(&self) -> usize {
        self.npage as usize
    }

    #[inline]
    #[must_use]
    pub const fn contains(&self, pa: PhysicalAddress) -> bool {
        pa.as_u32() < self.max_pa
    }
}
