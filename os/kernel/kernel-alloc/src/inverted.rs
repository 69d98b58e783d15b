//! # Inverted Page Table
//!
//! A reverse map from virtual page number to physical frame, kept next to
//! the forward tables. Entry *i* of the pool stands for frame *i*; the
//! table answers "which frame backs this page?" with one hash probe instead
//! of a two-level walk.
//!
//! ```text
//!  buckets[vpn % 1031] ──► entry ──► entry ──► ∅
//!  free ─────────────────► entry ──► entry ──► ...
//! ```
//!
//! Every entry is on exactly one chain (the free pool or one bucket) or on
//! none while a caller holds it between [`allocate`](InvertedPageTable::allocate)
//! and [`insert`](InvertedPageTable::insert). Chains are doubly linked
//! through entry indices so an entry can be detached from anywhere in O(1).

use core::fmt;
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, VirtualAddress, VirtualPage};
use kernel_vmem::PageEntryBits;

/// Number of hash buckets (prime).
pub const INVERTED_BUCKETS: usize = 1031;

/// Errors from the inverted page table.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum IptError {
    #[error("no free inverted page table entry")]
    OutOfMemory,
    #[error("no inverted entry maps {0}")]
    NotFound(VirtualAddress),
    #[error("inverted entry {0} is still valid")]
    StillValid(EntryId),
}

/// Index of an entry in the pool; equal to the number of the frame it stands for.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct EntryId(u32);

impl EntryId {
    #[inline]
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }

    /// The frame this entry stands for.
    #[inline]
    #[must_use]
    pub const fn frame(self) -> PhysicalPage {
        PhysicalPage::from_number(self.0)
    }
}

impl fmt::Debug for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EntryId({})", self.0)
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum Chain {
    Free,
    Bucket(u16),
}

/// One reverse-mapping record.
#[repr(C)]
#[derive(Debug, Copy, Clone)]
pub struct InvertedEntry {
    vpn: u32,
    perm: PageEntryBits,
    prev: Option<u32>,
    next: Option<u32>,
    chain: Option<Chain>,
}

impl InvertedEntry {
    pub const UNUSED: Self = Self {
        vpn: 0,
        perm: PageEntryBits::new(),
        prev: None,
        next: None,
        chain: None,
    };

    #[inline]
    #[must_use]
    pub const fn vpn(&self) -> u32 {
        self.vpn
    }

    #[inline]
    #[must_use]
    pub const fn perm(&self) -> PageEntryBits {
        self.perm
    }

    #[inline]
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.perm.valid()
    }
}

/// Hash-indexed reverse page table over a pool of [`InvertedEntry`] records.
pub struct InvertedPageTable<'a> {
    entries: &'a mut [InvertedEntry],
    buckets: [Option<u32>; INVERTED_BUCKETS],
    free_head: Option<u32>,
    free_len: usize,
}

/// Iterator over one chain.
pub struct ChainIter<'t> {
    entries: &'t [InvertedEntry],
    cursor: Option<u32>,
}

impl Iterator for ChainIter<'_> {
    type Item = EntryId;

    fn next(&mut self) -> Option<EntryId> {
        let index = self.cursor?;
        self.cursor = self.entries[index as usize].next;
        Some(EntryId(index))
    }
}

impl<'a> InvertedPageTable<'a> {
    /// Take over `entries`, all of them free.
    ///
    /// The pool is filled by head insertion in ascending order, so the
    /// highest entry is allocated first.
    #[allow(clippy::cast_possible_truncation)]
    pub fn new(entries: &'a mut [InvertedEntry]) -> Self {
        let mut table = Self {
            entries,
            buckets: [None; INVERTED_BUCKETS],
            free_head: None,
            free_len: 0,
        };
        for index in 0..table.entries.len() {
            table.entries[index] = InvertedEntry::UNUSED;
            table.link(index as u32, Chain::Free);
        }
        table
    }

    /// Bucket index for `va`.
    #[inline]
    #[must_use]
    pub const fn hash(va: VirtualAddress) -> usize {
        va.vpn() as usize % INVERTED_BUCKETS
    }

    #[inline]
    fn head_mut(&mut self, chain: Chain) -> &mut Option<u32> {
        match chain {
            Chain::Free => &mut self.free_head,
            Chain::Bucket(b) => &mut self.buckets[b as usize],
        }
    }

    fn link(&mut self, index: u32, chain: Chain) {
        let old = *self.head_mut(chain);
        let entry = &mut self.entries[index as usize];
        entry.prev = None;
        entry.next = old;
        entry.chain = Some(chain);
        if let Some(old) = old {
            self.entries[old as usize].prev = Some(index);
        }
        *self.head_mut(chain) = Some(index);
        if chain == Chain::Free {
            self.free_len += 1;
        }
    }

    fn unlink(&mut self, index: u32) {
        let InvertedEntry { prev, next, chain, .. } = self.entries[index as usize];
        let Some(chain) = chain else {
            return;
        };

        match prev {
            Some(prev) => self.entries[prev as usize].next = next,
            None => *self.head_mut(chain) = next,
        }
        if let Some(next) = next {
            self.entries[next as usize].prev = prev;
        }
        if chain == Chain::Free {
            self.free_len -= 1;
        }

        let entry = &mut self.entries[index as usize];
        entry.prev = None;
        entry.next = None;
        entry.chain = None;
    }

    fn clear(&mut self, id: EntryId) {
        let entry = &mut self.entries[id.index()];
        entry.vpn = 0;
        entry.perm = PageEntryBits::new();
    }

    fn check(&self, id: EntryId) {
        assert!(
            id.index() < self.entries.len(),
            "inverted entry {id} outside of {} entries",
            self.entries.len()
        );
    }

    /// The entry mapping `va`'s page.
    #[must_use]
    pub fn find(&self, va: VirtualAddress) -> Option<EntryId> {
        let vpn = va.vpn();
        self.bucket(va).find(|id| self.entries[id.index()].vpn == vpn)
    }

    /// Install `id` as the mapping for `va`'s page with `perm | valid`.
    ///
    /// A different entry previously mapping the page is removed and returned;
    /// it is left detached for the caller to release. `id` is taken from
    /// wherever it currently is.
    pub fn insert(&mut self, va: VirtualAddress, id: EntryId, perm: PageEntryBits) -> Option<EntryId> {
        self.check(id);
        let displaced = self.remove(va).filter(|&prior| prior != id);
        self.unlink(id.0);

        let entry = &mut self.entries[id.index()];
        entry.vpn = va.vpn();
        entry.perm = perm.permissions().with_valid(true);

        #[allow(clippy::cast_possible_truncation)]
        let bucket = Self::hash(va) as u16;
        self.link(id.0, Chain::Bucket(bucket));
        displaced
    }

    /// Unlink the entry mapping `va`'s page and clear it.
    ///
    /// The entry is left detached, neither in a bucket nor in the pool.
    pub fn remove(&mut self, va: VirtualAddress) -> Option<EntryId> {
        let id = self.find(va)?;
        self.unlink(id.0);
        self.clear(id);
        Some(id)
    }

    /// Take an entry from the pool.
    ///
    /// # Errors
    /// [`IptError::OutOfMemory`] if the pool is empty.
    pub fn allocate(&mut self) -> Result<EntryId, IptError> {
        let index = self.free_head.ok_or(IptError::OutOfMemory)?;
        self.unlink(index);
        let id = EntryId(index);
        self.clear(id);
        Ok(id)
    }

    /// Return `id` to the pool.
    ///
    /// # Errors
    /// [`IptError::StillValid`] if `id` still maps a page.
    ///
    /// # Panics
    /// If `id` is already in the pool.
    pub fn release(&mut self, id: EntryId) -> Result<(), IptError> {
        self.check(id);
        let entry = self.entries[id.index()];
        if entry.is_valid() {
            return Err(IptError::StillValid(id));
        }
        assert!(entry.chain != Some(Chain::Free), "inverted entry {id} released twice");
        self.unlink(id.0);
        self.link(id.0, Chain::Free);
        Ok(())
    }

    /// Translate `va` through the reverse map, keeping the in-page offset.
    #[must_use]
    pub fn translate(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        self.walk(va).map(|page| page.join(va.offset()))
    }

    /// The frame backing `va`'s page.
    #[must_use]
    pub fn walk(&self, va: VirtualAddress) -> Option<PhysicalPage> {
        self.find(va).map(EntryId::frame)
    }

    /// Map `va` to `id` with `perm | valid`, taking over any existing mapping.
    ///
    /// An entry that mapped `va` before goes back to the pool; a page `id`
    /// mapped before is dropped.
    pub fn map(&mut self, id: EntryId, va: VirtualAddress, perm: PageEntryBits) {
        if let Some(displaced) = self.insert(va, id, perm) {
            // Already detached and cleared by `remove`.
            self.link(displaced.0, Chain::Free);
        }
    }

    /// Remove the mapping for `va` and return its entry to the pool.
    ///
    /// # Errors
    /// [`IptError::NotFound`] if nothing maps `va`.
    pub fn unmap(&mut self, va: VirtualAddress) -> Result<EntryId, IptError> {
        let id = self.remove(va).ok_or(IptError::NotFound(va))?;
        self.release(id)?;
        Ok(id)
    }

    /// The entry standing for `page`.
    ///
    /// # Panics
    /// If `page` lies outside the pool.
    #[must_use]
    pub fn entry_for(&self, page: PhysicalPage) -> EntryId {
        let id = EntryId(page.number());
        self.check(id);
        id
    }

    #[must_use]
    pub fn entry(&self, id: EntryId) -> &InvertedEntry {
        &self.entries[id.index()]
    }

    /// The virtual page `id` maps, if valid.
    #[must_use]
    pub fn page_of(&self, id: EntryId) -> Option<VirtualPage> {
        let entry = self.entry(id);
        entry.is_valid().then(|| VirtualPage::from_number(entry.vpn))
    }

    /// The chain `va` hashes to, head first.
    #[must_use]
    pub fn bucket(&self, va: VirtualAddress) -> ChainIter<'_> {
        ChainIter {
            entries: &*self.entries,
            cursor: self.buckets[Self::hash(va)],
        }
    }

    /// Log the chain `va` hashes to.
    pub fn log_bucket(&self, va: VirtualAddress) {
        log::debug!("inverted bucket {} for {va}:", Self::hash(va));
        for id in self.bucket(va) {
            log::debug!("  {id} -> vpn {:#07x}", self.entries[id.index()].vpn);
        }
    }

    /// Entries in the pool.
    #[inline]
    #[must_use]
    pub const fn free_count(&self) -> usize {
        self.free_len
    }

    /// Pool size.
    #[inline]
    #[must_use]
    pub const fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of entries currently mapping a page.
    #[must_use]
    pub fn live_count(&self) -> usize {
        self.entries.iter().filter(|e| e.is_valid()).count()
    }
}
