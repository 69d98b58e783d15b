//! # Kernel Memory Allocation and Virtual Memory Management
//!
//! Everything above the raw page-table formats of `kernel-vmem`: who owns
//! which physical frame, how the memory core comes up at boot, and how
//! forward tables, the inverted table and the TLB are kept in step.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                Vmm (vmm, pinning, fault)            │
//! │    • one context object owning all global state     │
//! │    • map / unmap / pin / TLB refill                 │
//! └───────────┬─────────────────────────┬───────────────┘
//!             │                         │
//! ┌───────────▼───────────┐ ┌───────────▼───────────────┐
//! │ FrameTable            │ │ InvertedPageTable         │
//! │ (frame_alloc)         │ │ (inverted)                │
//! │ • refcounted frames   │ │ • vpn → frame, 1031       │
//! │ • free list, pins     │ │   hash buckets            │
//! └───────────┬───────────┘ └───────────────────────────┘
//!             │
//! ┌───────────▼─────────────────────────────────────────┐
//! │ PhysMapper (phys_mapper): KSEG0 window or PhysRam   │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! ## Boot
//!
//! [`Vmm::bootstrap`](vmm::Vmm::bootstrap) sizes memory from
//! [`BootInfo`](kernel_info::boot::BootInfo), carves the boot structures out
//! of the memory after the kernel image with a [`BootAlloc`](boot_alloc::BootAlloc),
//! maps the frame descriptors and the environment table read-only for user
//! space and hands the rest of memory to the [`FrameTable`](frame_alloc::FrameTable).
//!
//! ## Reference counting
//!
//! Frames come off the free list unreferenced. Every mapping and every
//! page-table link adds a reference; dropping the last one puts the frame
//! back on the free list. Pinned frames cannot be unmapped or replaced.
//!
//! ## Hosted use
//!
//! [`PhysRam`](phys_mapper::PhysRam) and [`SoftTlb`](kernel_vmem::tlb::SoftTlb)
//! stand in for physical memory and the TLB, so the whole core runs in
//! ordinary tests:
//!
//! ```
//! use kernel_alloc::frame_alloc::{Frame, FrameTable};
//! use kernel_alloc::inverted::{InvertedEntry, InvertedPageTable};
//! use kernel_alloc::phys_mapper::PhysRam;
//! use kernel_alloc::vmm::Vmm;
//! use kernel_memory_addresses::{PAGE_SIZE, VirtualAddress};
//! use kernel_vmem::PageEntryBits;
//! use kernel_vmem::tlb::{Asid, SoftTlb};
//!
//! let ram = PhysRam::new(16 * PAGE_SIZE);
//! let mut frames = vec![Frame::UNUSED; 16];
//! let mut entries = vec![InvertedEntry::UNUSED; 16];
//! let mut vmm = Vmm::new(
//!     FrameTable::new(&mut frames, &ram),
//!     InvertedPageTable::new(&mut entries),
//!     SoftTlb::new(),
//! )?;
//!
//! let space = vmm.create_vspace(Asid::new(1))?;
//! let page = vmm.frames_mut().alloc()?;
//! vmm.map_tracked(&space, page, VirtualAddress::new(0x0040_0000), PageEntryBits::user_rw())?;
//! assert_eq!(vmm.ipt().walk(VirtualAddress::new(0x0040_0000)), Some(page));
//! # Ok::<(), kernel_alloc::vmm::VmmError>(())
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

extern crate alloc;

pub mod boot_alloc;
pub mod fault;
pub mod frame_alloc;
pub mod inverted;
pub mod phys_mapper;
pub mod pinning;
pub mod vmm;

pub use crate::boot_alloc::{BootAlloc, BootError};
pub use crate::fault::FaultError;
pub use crate::frame_alloc::{Frame, FrameTable, OutOfFrames};
pub use crate::inverted::{EntryId, INVERTED_BUCKETS, InvertedEntry, InvertedPageTable, IptError};
pub use crate::phys_mapper::{Kseg0PhysMapper, PhysRam};
pub use crate::pinning::{MCL_CURRENT, MCL_FUTURE, PinError, PinMode};
pub use crate::vmm::{FrameStats, Vmm, VmmError};
