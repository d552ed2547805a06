//! # Virtual Memory Support
//!
//! Two-level i386 paging for the kernel memory core.
//!
//! ## What you get
//! - [`PageEntryBits`]: the 32-bit entry layout shared by directory and table entries.
//! - A 4 KiB-aligned [`PageDirectory`] and [`PageTable`] with typed indices.
//! - A [`PageTableManager`] that maps, unmaps and translates single pages and
//!   brings up the initial kernel address space.
//! - The [`Mmu`] seam over CR0/CR3/EFLAGS and TLB maintenance, with the
//!   scoped [`PagingGuard`].
//! - A tiny allocator/mapper interface ([`FrameAlloc`], [`PhysMapper`]) and
//!   typed loads/stores through the live tables ([`VirtualMemory`]).
//!
//! ## i386 Virtual Address → Physical Address Walk
//!
//! Each 32-bit virtual address is divided into three fields:
//!
//! ```text
//! | 31‒22     | 21‒12 | 11‒0   |
//! | Directory | Table | Offset |
//! ```
//!
//! ```text
//!  CR3 → Page Directory → Page Table → Physical Frame
//!          │                 │
//!          │                 └───► PTE (maps one 4 KiB page)
//!          └─────────────────────► PDE (points to a page table covering 4 MiB)
//! ```
//!
//! | Level | Table name | Entry name | Description |
//! |:------|:-----------|:-----------|:------------|
//! | 2 | **PD** (Page Directory) | **PDE** | Root table referenced by CR3; each entry points to a PT. |
//! | 1 | **PT** (Page Table) | **PTE** | Each entry maps a 4 KiB physical frame (always a leaf). |
//!
//! 4 MiB directory leaves (`PS=1`) are never created. Finding one during a
//! walk is treated as corruption.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code, clippy::inline_always)]

#[cfg(any(test, feature = "sim"))]
extern crate alloc;

mod mmu;
mod page_entry_bits;
pub mod page_table;
mod paging;
#[cfg(any(test, feature = "sim"))]
pub mod sim;

pub use crate::mmu::{Mmu, PagingGuard};
#[cfg(all(feature = "asm", target_arch = "x86"))]
pub use crate::mmu::X86Mmu;
pub use crate::page_entry_bits::PageEntryBits;
pub use crate::page_table::pd::{DirectoryIndex, PageDirectory, PdEntry};
pub use crate::page_table::pt::{PageTable, PtEntry, TableIndex};
pub use crate::paging::{PAGING_SENTINEL, PageTableManager, PagingError};

/// Re-export constants as info module.
pub use kernel_info::memory as info;

pub use kernel_memory_addresses as addresses;

use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, VirtualAddress};

/// Minimal frame allocator used to obtain **physical** 4 KiB frames
/// for page tables.
///
/// The implementation decides where frames come from (bitmap, bump pool in
/// tests, ...). Returned frames are page aligned by construction.
///
/// Returns `None` on out-of-memory.
pub trait FrameAlloc {
    /// Allocate one 4 KiB *physical* frame.
    fn alloc_frame(&mut self) -> Option<PhysicalPage>;

    /// Return a frame obtained from [`alloc_frame`](Self::alloc_frame).
    fn free_frame(&mut self, frame: PhysicalPage);
}

/// Converts physical addresses to *temporarily* usable pointers in the current
/// virtual address space.
///
/// Typical patterns:
/// - **Kernel**: identity map for low memory during bring-up.
/// - **Tests**: an offset into a host buffer simulating RAM.
pub trait PhysMapper {
    /// Convert a *physical* address to a usable mutable reference in the current address space.
    ///
    /// # Safety
    /// - `pa` must be backed by memory that is writable for `&mut T`.
    /// - Lifetime `'a` is purely borrow-checked; the mapping must remain valid
    ///   for `'a`.
    /// - Type `T` must match the bytes at `pa` (no aliasing UB).
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T;
}

/// Typed loads and stores at **virtual** addresses, translated through the
/// currently installed page tables.
///
/// Touching an unmapped page is a page fault and therefore fatal.
/// Accesses must not cross a page boundary.
pub trait VirtualMemory {
    /// Load a `T` from `va`.
    fn read<T: Copy>(&self, va: VirtualAddress) -> T;

    /// Store `value` at `va`.
    fn write<T: Copy>(&mut self, va: VirtualAddress, value: T);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimMmu, SimPhysMemory};

    /// A trivial **bump** allocator: always hands out the next 4 KiB frame.
    ///
    /// There's no free list and no reuse (perfect for tests).
    pub(crate) struct BumpAlloc {
        next: u32,
        end: u32,
        pub(crate) freed: usize,
    }

    impl BumpAlloc {
        pub(crate) fn new(start: u32, end: u32) -> Self {
            Self {
                next: start,
                end,
                freed: 0,
            }
        }
    }

    impl FrameAlloc for BumpAlloc {
        fn alloc_frame(&mut self) -> Option<PhysicalPage> {
            if self.next + 4096 > self.end {
                return None;
            }
            let p = self.next;
            self.next += 4096;
            Some(PhysicalAddress::new(p).frame())
        }

        fn free_frame(&mut self, _frame: PhysicalPage) {
            self.freed += 1;
        }
    }

    #[test]
    fn map_page_creates_table_and_leaf() {
        // 64 frames (= 256 KiB) of simulated "physical memory".
        let phys = SimPhysMemory::new(64 * 4096);
        let mut alloc = BumpAlloc::new(0x1000, 64 * 4096);
        let mut paging = PageTableManager::new(&phys, SimMmu::new());

        let root = alloc.alloc_frame().expect("root");
        unsafe { phys.phys_to_mut::<PageDirectory>(root.base()) }.zero();
        paging.change_page_dir_table(root.base()).expect("cr3");

        let va = VirtualAddress::new(0xE000_0000);
        let pa = PhysicalAddress::new(0x0003_0000);
        paging.map_page(&mut alloc, pa, va).expect("map_page");

        let pd = unsafe { phys.phys_to_mut::<PageDirectory>(root.base()) };
        let pde = pd.get(DirectoryIndex::from(va));
        assert!(pde.is_present());
        assert!(pde.flags().writable());
        let pt_page = pde.next_table().expect("page table");

        let pt = unsafe { phys.phys_to_mut::<PageTable>(pt_page.base()) };
        let pte = pt.get(TableIndex::from(va));
        assert!(pte.is_present());
        assert!(pte.flags().writable());
        assert!(!pte.flags().large_page());
        assert_eq!(pte.page_4k(), Some(pa.frame()));

        assert_eq!(paging.translate(va + 0x123), Some(pa + 0x123));
    }
}
