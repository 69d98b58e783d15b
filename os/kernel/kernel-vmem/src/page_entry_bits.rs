use bitfield_struct::bitfield;
use kernel_memory_addresses::PhysicalPage;

/// A single 32-bit page-table entry in its raw bitfield form.
///
/// The layout is the one the MIPS R3000 `EntryLo` register uses, so a leaf
/// entry can be handed to the TLB refill path unchanged. Directory entries use
/// the same format with the frame number pointing at a page table.
///
/// ### Bit layout
///
/// | Bits   | Name       | Meaning |
/// |--------|------------|---------|
/// | 0      | `COW`      | Copy-on-write (software) |
/// | 1      | reserved   | |
/// | 2      | `LIBRARY`  | Shared between parent and child on fork (software) |
/// | 3–7    | reserved   | |
/// | 8      | `G`        | Global: matches every ASID |
/// | 9      | `V`        | Valid |
/// | 10     | `D`        | Dirty, i.e. writable |
/// | 11     | `N`        | Non-cacheable |
/// | 12–31  | `PFN`      | Physical frame number |
///
/// ### Example
/// ```rust
/// # use kernel_vmem::PageEntryBits;
/// # use kernel_memory_addresses::PhysicalPage;
/// let e = PageEntryBits::user_rw().with_page(PhysicalPage::from_number(5));
/// assert!(e.writable());
/// assert_eq!(e.page().number(), 5);
/// assert_eq!(e.into_bits(), 0x5000 | 0x400);
/// ```
#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct PageEntryBits {
    /// Copy-on-write (bit 0).
    ///
    /// Set on both sides of a fork for private writable pages. The first
    /// write faults and the fault handler copies the frame.
    pub copy_on_write: bool,

    #[bits(1)]
    __reserved_1: u8,

    /// Shared library page (bit 2).
    ///
    /// Stays shared (and writable) across fork instead of going copy-on-write.
    pub library: bool,

    #[bits(5)]
    __reserved_3_7: u8,

    /// Global (G, bit 8).
    ///
    /// The TLB matches this entry regardless of the current ASID.
    pub global: bool,

    /// Valid (V, bit 9).
    ///
    /// Clear means the entry maps nothing; an access takes a TLB miss.
    pub valid: bool,

    /// Dirty / writable (D, bit 10).
    ///
    /// On this architecture "dirty" is the write-enable bit. Stores to a
    /// page without it raise a TLB modification exception.
    pub writable: bool,

    /// Non-cacheable (N, bit 11).
    pub uncached: bool,

    /// Physical frame number (bits 12..=31).
    #[bits(20)]
    frame_number: u32,
}

impl PageEntryBits {
    /// Mask of all bits that are permissions rather than the frame address.
    pub const PERMISSION_MASK: u32 = 0xFFF;

    #[inline]
    #[must_use]
    pub const fn page(&self) -> PhysicalPage {
        PhysicalPage::from_number(self.frame_number())
    }

    #[inline]
    #[must_use]
    pub const fn with_page(self, page: PhysicalPage) -> Self {
        self.with_frame_number(page.number())
    }

    #[inline]
    pub const fn set_page(&mut self, page: PhysicalPage) {
        self.set_frame_number(page.number());
    }

    /// The permission bits only, with the frame number cleared.
    #[inline]
    #[must_use]
    pub const fn permissions(self) -> Self {
        Self::from_bits(self.into_bits() & Self::PERMISSION_MASK)
    }

    /// Read-only user mapping.
    #[inline]
    #[must_use]
    pub const fn user_ro() -> Self {
        Self::new()
    }

    /// Writable user mapping.
    #[inline]
    #[must_use]
    pub const fn user_rw() -> Self {
        Self::new().with_writable(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bit_positions_match_entry_lo() {
        assert_eq!(PageEntryBits::new().with_copy_on_write(true).into_bits(), 0x001);
        assert_eq!(PageEntryBits::new().with_library(true).into_bits(), 0x004);
        assert_eq!(PageEntryBits::new().with_global(true).into_bits(), 0x100);
        assert_eq!(PageEntryBits::new().with_valid(true).into_bits(), 0x200);
        assert_eq!(PageEntryBits::new().with_writable(true).into_bits(), 0x400);
        assert_eq!(PageEntryBits::new().with_uncached(true).into_bits(), 0x800);
    }

    #[test]
    fn permissions_strip_frame() {
        let e = PageEntryBits::from_bits(0x0123_4600);
        assert_eq!(e.page().number(), 0x01234);
        assert_eq!(e.permissions().into_bits(), 0x600);
        assert!(e.valid() && e.writable());
    }
}
