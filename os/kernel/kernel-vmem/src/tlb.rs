//! # Translation Lookaside Buffer
//!
//! The MIPS TLB is software refilled: a miss traps into the kernel, which
//! walks the page table and writes an `EntryHi`/`EntryLo` pair. Entries are
//! tagged with the 6-bit ASID of the address space that loaded them, so
//! switching address spaces needs no flush. Changing a mapping does: the
//! stale entry must be probed for and dropped ([`Tlb::invalidate`]).
//!
//! [`SoftTlb`] models the hardware on hosted builds and in tests;
//! [`MipsTlb`] forwards to the assembly routines on the real target.

use crate::page_table::pt::PtEntry;
use bitfield_struct::bitfield;
use core::fmt;
use kernel_memory_addresses::VirtualAddress;

/// Number of entries in the R3000 TLB.
pub const TLB_ENTRIES: usize = 64;

/// Number of distinct address-space identifiers.
pub const NASID: u8 = 64;

/// The `EntryHi` register: the tag half of a TLB entry.
///
/// | Bits   | Name  |
/// |--------|-------|
/// | 0–5    | reserved |
/// | 6–11   | `ASID` |
/// | 12–31  | `VPN`  |
#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct EntryHi {
    #[bits(6)]
    __reserved: u8,

    #[bits(6)]
    pub asid: u8,

    #[bits(20)]
    pub vpn: u32,
}

impl EntryHi {
    /// The tag for `va` in the address space identified by `asid`.
    ///
    /// Spaces without an identifier use ASID 0.
    #[inline]
    #[must_use]
    pub const fn tag(va: VirtualAddress, asid: Option<Asid>) -> Self {
        let asid = match asid {
            Some(a) => a.as_u8(),
            None => 0,
        };
        Self::new().with_vpn(va.vpn()).with_asid(asid)
    }
}

/// A 6-bit address-space identifier.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Asid(u8);

impl Asid {
    /// Returns `None` if `v` does not fit into six bits.
    #[inline]
    #[must_use]
    pub const fn new(v: u8) -> Option<Self> {
        if v < NASID { Some(Self(v)) } else { None }
    }

    #[inline]
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self.0
    }
}

impl TryFrom<u8> for Asid {
    type Error = u8;

    fn try_from(v: u8) -> Result<Self, u8> {
        Self::new(v).ok_or(v)
    }
}

impl fmt::Debug for Asid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ASID({})", self.0)
    }
}

impl fmt::Display for Asid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Operations the paging code needs from a translation cache.
pub trait Tlb {
    /// Drop the entry tagged `tag`, if cached.
    ///
    /// Global entries for the same page are dropped regardless of ASID.
    fn invalidate(&mut self, tag: EntryHi);

    /// Load a translation after a miss.
    fn refill(&mut self, hi: EntryHi, lo: PtEntry);
}

/// One cached translation.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct TlbEntry {
    pub hi: EntryHi,
    pub lo: PtEntry,
}

impl TlbEntry {
    /// Hardware match rule: same VPN and either the same ASID or a global entry.
    #[inline]
    #[must_use]
    pub const fn matches(&self, tag: EntryHi) -> bool {
        self.hi.vpn() == tag.vpn() && (self.lo.flags().global() || self.hi.asid() == tag.asid())
    }
}

/// Software model of the 64-entry TLB.
///
/// Refills replace round-robin; a refill for a tag that is already cached
/// overwrites that entry so the model never holds duplicates.
pub struct SoftTlb {
    entries: [Option<TlbEntry>; TLB_ENTRIES],
    next: usize,
}

impl SoftTlb {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            entries: [None; TLB_ENTRIES],
            next: 0,
        }
    }

    /// Look up `tag` the way the hardware would on a memory access.
    #[must_use]
    pub fn probe(&self, tag: EntryHi) -> Option<PtEntry> {
        self.entries
            .iter()
            .flatten()
            .find(|e| e.matches(tag))
            .map(|e| e.lo)
    }

    /// Number of cached translations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.iter().flatten().count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every cached translation.
    pub fn flush(&mut self) {
        self.entries = [None; TLB_ENTRIES];
        self.next = 0;
    }
}

impl Default for SoftTlb {
    fn default() -> Self {
        Self::new()
    }
}

impl Tlb for SoftTlb {
    fn invalidate(&mut self, tag: EntryHi) {
        for slot in &mut self.entries {
            if slot.is_some_and(|e| e.matches(tag)) {
                *slot = None;
            }
        }
    }

    fn refill(&mut self, hi: EntryHi, lo: PtEntry) {
        let entry = TlbEntry { hi, lo };
        if let Some(slot) = self
            .entries
            .iter_mut()
            .find(|s| s.is_some_and(|e| e.hi == hi))
        {
            *slot = Some(entry);
            return;
        }

        self.entries[self.next] = Some(entry);
        self.next = (self.next + 1) % TLB_ENTRIES;
    }
}

#[cfg(target_arch = "mips")]
pub use mips::MipsTlb;

#[cfg(target_arch = "mips")]
mod mips {
    use super::{EntryHi, Tlb};
    use crate::page_table::pt::PtEntry;

    unsafe extern "C" {
        /// Probe for `entryhi` and overwrite the hit with an invalid entry.
        fn tlb_out(entryhi: u32);

        /// Write `entryhi`/`entrylo` into a random TLB slot.
        fn tlb_refill(entryhi: u32, entrylo: u32);
    }

    /// The hardware TLB of the current CPU.
    pub struct MipsTlb;

    impl Tlb for MipsTlb {
        #[inline]
        fn invalidate(&mut self, tag: EntryHi) {
            // SAFETY: tlb_out only touches CP0 registers and restores EntryHi.
            unsafe { tlb_out(tag.into_bits()) }
        }

        #[inline]
        fn refill(&mut self, hi: EntryHi, lo: PtEntry) {
            // SAFETY: runs in the refill handler with interrupts masked.
            unsafe { tlb_refill(hi.into_bits(), lo.raw()) }
        }
    }
}
