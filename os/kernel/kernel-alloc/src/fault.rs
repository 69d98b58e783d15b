//! TLB miss handling.
//!
//! The refill handler first looks for a forward mapping and loads it into
//! the TLB. If there is none, the page is faulted in: a fresh zeroed frame is
//! mapped writable at the faulting page, provided the address is one user
//! code may touch at all.

use crate::vmm::Vmm;
use kernel_info::memory::{LOW_GUARD, UENVS, ULIM};
use kernel_memory_addresses::{PAGE_SIZE, PhysicalPage, VirtualAddress};
use kernel_vmem::tlb::Tlb;
use kernel_vmem::{AddressSpace, MapError, PageEntryBits, PhysMapper, PtEntry, VSpace};

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum FaultError {
    #[error("fault at {0} in the low guard region")]
    LowAddress(VirtualAddress),
    #[error("fault at {0} in the read-only kernel window")]
    EnvWindow(VirtualAddress),
    #[error("fault at kernel address {0}")]
    KernelAddress(VirtualAddress),
    #[error("no frame left to back {0}")]
    OutOfMemory(VirtualAddress),
    #[error(transparent)]
    Map(#[from] MapError),
}

/// Reject addresses no user fault may page in.
///
/// # Errors
/// The matching [`FaultError`] for addresses below [`LOW_GUARD`], inside
/// `[UENVS, ULIM)` or at or above [`ULIM`].
pub fn check_fault_address(va: VirtualAddress) -> Result<(), FaultError> {
    let addr = va.as_u32();
    let rejected = if addr < LOW_GUARD {
        FaultError::LowAddress(va)
    } else if addr >= ULIM {
        FaultError::KernelAddress(va)
    } else if addr >= UENVS {
        FaultError::EnvWindow(va)
    } else {
        return Ok(());
    };

    log::warn!("Rejecting page fault: {rejected}");
    Err(rejected)
}

impl<M: PhysMapper + Copy, T: Tlb> Vmm<'_, M, T> {
    /// Service a TLB miss at `va` in `vs`.
    ///
    /// Returns the entry loaded into the TLB.
    ///
    /// # Errors
    /// See [`page_out`](Self::page_out); the TLB is left untouched then.
    pub fn handle_tlb_miss(&mut self, vs: &VSpace, va: VirtualAddress) -> Result<PtEntry, FaultError> {
        let mapper = self.mapper;
        let space = AddressSpace::new(&mapper, *vs);

        let entry = match space.lookup_entry(va) {
            Some(entry) => entry,
            None => PtEntry::make(self.page_out(vs, va)?, PageEntryBits::user_rw()),
        };
        self.tlb.refill(space.tlb_tag(va), entry);
        Ok(entry)
    }

    /// Back the page containing `va` with a fresh, zeroed, writable frame.
    ///
    /// The new mapping is recorded in the inverted table as well.
    ///
    /// # Errors
    /// - [`FaultError::LowAddress`], [`FaultError::EnvWindow`] or
    ///   [`FaultError::KernelAddress`] if user code may not map `va`.
    /// - [`FaultError::OutOfMemory`] if no frame is free.
    /// - [`FaultError::Map`] if the mapping cannot be installed; the frame
    ///   is given back.
    pub fn page_out(&mut self, vs: &VSpace, va: VirtualAddress) -> Result<PhysicalPage, FaultError> {
        check_fault_address(va)?;

        let Ok(page) = self.frames.alloc() else {
            log::warn!("Rejecting page fault at {va}: out of frames");
            return Err(FaultError::OutOfMemory(va));
        };

        let base = va.align_down(PAGE_SIZE);
        let perm = PageEntryBits::user_rw();
        let mapper = self.mapper;
        if let Err(e) = AddressSpace::new(&mapper, *vs).map(&mut self.frames, &mut self.tlb, page, base, perm) {
            self.frames.free(page);
            return Err(e.into());
        }

        let id = self.ipt.entry_for(page);
        self.ipt.map(id, base, perm);
        Ok(page)
    }
}
