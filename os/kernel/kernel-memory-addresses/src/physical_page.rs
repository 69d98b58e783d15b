use crate::{PAGE_MASK, PAGE_SHIFT, PhysicalAddress};
use core::fmt;

/// Page-aligned base of a 4 KiB physical frame.
///
/// ### Invariants
/// - The low 12 bits of the base are always zero.
///
/// ### Examples
/// ```rust
/// # use kernel_memory_addresses::*;
/// let pp = PhysicalPage::from_number(3);
/// assert_eq!(pp.base().as_u32(), 0x3000);
/// assert_eq!(PhysicalAddress::new(0x3fff).page(), pp);
/// ```
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PhysicalPage(u32);

impl PhysicalPage {
    /// The frame containing `pa` (the offset is dropped).
    #[inline]
    #[must_use]
    pub const fn from_addr(pa: PhysicalAddress) -> Self {
        Self(pa.as_u32() & !PAGE_MASK)
    }

    /// The frame with physical page number `n`.
    #[inline]
    #[must_use]
    pub const fn from_number(n: u32) -> Self {
        Self(n << PAGE_SHIFT)
    }

    #[inline]
    #[must_use]
    pub const fn base(self) -> PhysicalAddress {
        PhysicalAddress::new(self.0)
    }

    /// Physical page number; also the index into the frame descriptor array.
    #[inline]
    #[must_use]
    pub const fn number(self) -> u32 {
        self.0 >> PAGE_SHIFT
    }

    #[inline]
    #[must_use]
    pub const fn index(self) -> usize {
        self.number() as usize
    }

    /// Combines this base with an in-page offset.
    #[inline]
    #[must_use]
    pub const fn join(self, offset: u32) -> PhysicalAddress {
        PhysicalAddress::new(self.0 | (offset & PAGE_MASK))
    }
}

impl fmt::Display for PhysicalPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.base(), f)
    }
}

impl fmt::Debug for PhysicalPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PhysicalPage({:#010X})", self.0)
    }
}

impl TryFrom<PhysicalAddress> for PhysicalPage {
    type Error = ();

    #[inline]
    fn try_from(pa: PhysicalAddress) -> Result<Self, ()> {
        if pa.is_page_aligned() {
            Ok(pa.page())
        } else {
            Err(())
        }
    }
}
