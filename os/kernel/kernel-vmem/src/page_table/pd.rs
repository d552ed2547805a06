//! # i386 Page Directory (PD)
//!
//! - [`DirectoryIndex`]: index type for virtual-address bits `[31:22]`.
//! - [`PdEntry`]: a PD entry pointing to a page table.
//! - [`PageDirectory`]: a 4 KiB-aligned array of 1024 entries, referenced by CR3.
//!
//! ## Invariants & Notes
//!
//! - Entries are always created with `PS=0`; 4 MiB leaves are not supported.
//! - TLB maintenance is the caller’s responsibility after mutating active mappings.

use crate::PageEntryBits;
use kernel_memory_addresses::{ENTRIES_PER_TABLE, PhysicalPage, VirtualAddress};

/// Index into the Page Directory (derived from VA bits `[31:22]`).
#[repr(transparent)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct DirectoryIndex(u16);

/// A single Page Directory entry (PDE).
#[doc(alias = "PDE")]
#[repr(transparent)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct PdEntry(PageEntryBits);

/// The Page Directory: 1024 entries, 4 KiB-aligned.
#[doc(alias = "PD")]
#[repr(C, align(4096))]
pub struct PageDirectory {
    entries: [PdEntry; ENTRIES_PER_TABLE],
}

impl DirectoryIndex {
    #[inline]
    #[must_use]
    pub const fn from(va: VirtualAddress) -> Self {
        Self(va.directory_index() as u16)
    }

    /// Construct from a raw `u16` (`< 1024`, checked in debug builds).
    #[inline]
    #[must_use]
    pub const fn new(v: u16) -> Self {
        debug_assert!(v < 1024);
        Self(v)
    }

    #[inline]
    #[must_use]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl PdEntry {
    /// Create a zero (non-present) entry.
    #[inline]
    #[must_use]
    pub const fn zero() -> Self {
        Self(PageEntryBits::new())
    }

    #[inline]
    #[must_use]
    pub const fn is_present(self) -> bool {
        self.0.present()
    }

    /// Expose the underlying bitfield.
    #[inline]
    #[must_use]
    pub const fn flags(self) -> PageEntryBits {
        self.0
    }

    /// If present, return the page table this entry points to.
    ///
    /// # Panics
    /// A present entry with `PS=1` (4 MiB page) is never created by this
    /// kernel and is treated as page directory corruption.
    #[inline]
    #[must_use]
    pub fn next_table(self) -> Option<PhysicalPage> {
        if !self.is_present() {
            return None;
        }
        assert!(
            !self.0.large_page(),
            "page directory entry {:#010X} maps a 4 MiB page",
            self.raw()
        );
        Some(self.0.frame())
    }

    /// Create an entry pointing at the page table in `table`.
    ///
    /// Sets `present=1` and forces `PS=0`.
    #[inline]
    #[must_use]
    pub const fn make_next(table: PhysicalPage, mut flags: PageEntryBits) -> Self {
        flags.set_large_page(false);
        flags.set_present(true);
        flags.set_frame(table);
        Self(flags)
    }

    #[inline]
    #[must_use]
    pub const fn raw(self) -> u32 {
        self.0.into_bits()
    }

    /// Construct from a raw 32-bit value. No validation is performed.
    #[inline]
    #[must_use]
    pub const fn from_raw(v: u32) -> Self {
        Self(PageEntryBits::from_bits(v))
    }
}

impl PageDirectory {
    /// Create a fully zeroed Page Directory (all entries non-present).
    #[inline]
    #[must_use]
    pub const fn zeroed() -> Self {
        Self {
            entries: [PdEntry::zero(); ENTRIES_PER_TABLE],
        }
    }

    /// Clear every entry in place.
    #[inline]
    pub fn zero(&mut self) {
        self.entries.fill(PdEntry::zero());
    }

    #[inline]
    #[must_use]
    pub const fn get(&self, i: DirectoryIndex) -> PdEntry {
        self.entries[i.as_usize()]
    }

    /// Write the entry at `i`.
    ///
    /// Caller must handle any required TLB invalidation.
    #[inline]
    pub const fn set(&mut self, i: DirectoryIndex, e: PdEntry) {
        self.entries[i.as_usize()] = e;
    }

    /// Number of present entries.
    #[must_use]
    pub fn present_count(&self) -> usize {
        self.entries.iter().filter(|e| e.is_present()).count()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn pde_points_to_table() {
        let table = PhysicalPage::from_index(0x102);
        let e = PdEntry::make_next(table, PageEntryBits::new_kernel_rw());
        assert_eq!(e.raw(), 0x0010_2003);
        assert_eq!(e.next_table(), Some(table));
        assert_eq!(PdEntry::zero().next_table(), None);
    }

    #[test]
    #[should_panic(expected = "maps a 4 MiB page")]
    fn large_pde_is_rejected() {
        let e = PdEntry::from_raw(0x0040_0083);
        let _ = e.next_table();
    }

    #[test]
    fn directory_is_one_page() {
        assert_eq!(size_of::<PageDirectory>(), 4096);
        assert_eq!(align_of::<PageDirectory>(), 4096);
        assert_eq!(PageDirectory::zeroed().present_count(), 0);
    }
}
