//! # Page Table Manager
//!
//! Owns the active page directory and the [`Mmu`], and maintains single 4 KiB
//! mappings inside it.
//!
//! ## Highlights
//!
//! - [`PageTableManager::map_page`] installs one mapping, creating the page
//!   table on demand inside a [`PagingGuard`].
//! - [`PageTableManager::unmap_page`] clears one mapping and invalidates it.
//! - [`PageTableManager::walk`] / [`PageTableManager::translate`] resolve a VA.
//! - [`PageTableManager::init_kernel_address_space`] builds the identity and
//!   higher-half mappings of the first 4 MiB and switches paging on.
//!
//! Page tables are reached through the [`PhysMapper`], so the same code runs
//! against real RAM and against the simulated machine in tests.

use crate::info::{KERNEL_IDENTITY_BYTES, KERNEL_VIRT_START};
use crate::page_table::pd::{DirectoryIndex, PageDirectory, PdEntry};
use crate::page_table::pt::{PageTable, PtEntry, TableIndex};
use crate::{FrameAlloc, Mmu, PageEntryBits, PagingGuard, PhysMapper, VirtualMemory};
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress, PhysicalPage, VirtualAddress};
use log::{debug, info, trace};

/// Value written through one mapping and read back through the other while
/// verifying the bring-up mappings.
pub const PAGING_SENTINEL: u32 = 0x0BAD_CAFE;

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum PagingError {
    #[error("out of physical frames for a page table")]
    OutOfFrames,
    #[error("no page directory is installed")]
    NoDirectory,
    #[error("null page directory")]
    NullDirectory,
    #[error("no page table covers {0}")]
    TableNotPresent(VirtualAddress),
    #[error("page {0} is not mapped")]
    PageNotPresent(VirtualAddress),
}

/// Handle to the kernel's single address space.
pub struct PageTableManager<'m, M: PhysMapper, U: Mmu> {
    mapper: &'m M,
    mmu: U,
    directory: Option<PhysicalPage>,
}

impl<'m, M: PhysMapper, U: Mmu> PageTableManager<'m, M, U> {
    /// A manager with no directory installed yet.
    #[inline]
    pub const fn new(mapper: &'m M, mmu: U) -> Self {
        Self {
            mapper,
            mmu,
            directory: None,
        }
    }

    #[inline]
    pub const fn mmu(&self) -> &U {
        &self.mmu
    }

    #[inline]
    pub const fn mapper(&self) -> &'m M {
        self.mapper
    }

    /// Physical address of the installed page directory, if any.
    #[inline]
    #[must_use]
    pub fn current_page_dir_table(&self) -> Option<PhysicalAddress> {
        self.directory.map(PhysicalPage::base)
    }

    /// Install `table` as the page directory (load CR3).
    ///
    /// # Errors
    /// [`PagingError::NullDirectory`] if `table` is zero.
    ///
    /// # Panics
    /// If `table` is not page aligned.
    pub fn change_page_dir_table(&mut self, table: PhysicalAddress) -> Result<(), PagingError> {
        if table.is_null() {
            return Err(PagingError::NullDirectory);
        }
        assert!(
            table.is_page_aligned(),
            "page directory {table} is not page aligned"
        );
        let frame = table.frame();
        self.directory = Some(frame);
        self.mmu.load_page_directory(frame);
        debug!("Page directory installed at {table}");
        Ok(())
    }

    #[inline]
    #[must_use]
    pub fn paging_enabled(&self) -> bool {
        self.mmu.paging_enabled()
    }

    /// Turn paging on or off. A no-op if already in the requested state.
    ///
    /// # Panics
    /// When enabling paging without an installed page directory.
    pub fn set_paging_enabled(&mut self, enabled: bool) {
        if self.mmu.paging_enabled() == enabled {
            return;
        }
        if enabled {
            assert!(
                self.directory.is_some(),
                "enabling paging without a page directory"
            );
        }
        self.mmu.set_paging_enabled(enabled);
        debug!("Paging {}", if enabled { "enabled" } else { "disabled" });
    }

    #[inline]
    pub fn flush_tlb(&mut self) {
        self.mmu.flush_tlb();
    }

    #[inline]
    pub fn flush_page(&mut self, va: VirtualAddress) {
        self.mmu.flush_page(va.page());
    }

    #[inline]
    fn directory_mut(&self) -> Result<&'m mut PageDirectory, PagingError> {
        let frame = self.directory.ok_or(PagingError::NoDirectory)?;
        Ok(unsafe { self.mapper.phys_to_mut::<PageDirectory>(frame.base()) })
    }

    #[inline]
    fn table_mut(&self, frame: PhysicalPage) -> &'m mut PageTable {
        unsafe { self.mapper.phys_to_mut::<PageTable>(frame.base()) }
    }

    /// Map the page containing `va` to the frame containing `pa`.
    ///
    /// If no page table covers `va` yet, one is allocated from `frames`, then
    /// zeroed, filled with the new entry and hooked into the directory, all
    /// with interrupts and paging off. An existing mapping for `va` is
    /// overwritten.
    ///
    /// # Errors
    /// - [`PagingError::NoDirectory`] before a directory is installed.
    /// - [`PagingError::OutOfFrames`] if a page table cannot be allocated.
    pub fn map_page<A: FrameAlloc>(
        &mut self,
        frames: &mut A,
        pa: PhysicalAddress,
        va: VirtualAddress,
    ) -> Result<(), PagingError> {
        debug_assert!(pa.is_page_aligned(), "physical address not aligned");
        debug_assert!(va.is_page_aligned(), "virtual address not aligned");

        let directory = self.directory_mut()?;
        let di = DirectoryIndex::from(va);
        let ti = TableIndex::from(va);
        let leaf = PtEntry::make_4k(pa.frame(), PageEntryBits::new_kernel_rw());

        if let Some(table) = directory.get(di).next_table() {
            self.table_mut(table).set(ti, leaf);
            self.mmu.flush_page(va.page());
        } else {
            // The new table is only reachable through its physical address
            // until the directory entry is live, so all of it stays unpaged.
            let mut guard = PagingGuard::new(&mut self.mmu);
            let table = frames.alloc_frame().ok_or(PagingError::OutOfFrames)?;
            let pt = unsafe { self.mapper.phys_to_mut::<PageTable>(table.base()) };
            pt.zero();
            pt.set(ti, leaf);
            directory.set(di, PdEntry::make_next(table, PageEntryBits::new_kernel_rw()));
            guard.mmu().flush_page(va.page());
            trace!("Page table for {va} at {table}");
        }
        trace!("Mapped {va} -> {pa}");
        Ok(())
    }

    /// Remove the mapping of the page containing `va` and invalidate it.
    ///
    /// Returns the frame that was mapped. Page tables are kept even when empty.
    ///
    /// # Errors
    /// The walk error if `va` is not mapped.
    pub fn unmap_page(&mut self, va: VirtualAddress) -> Result<PhysicalPage, PagingError> {
        let table = self.table_for(va)?;
        let pt = self.table_mut(table);
        let ti = TableIndex::from(va);
        let frame = pt.get(ti).page_4k().ok_or(PagingError::PageNotPresent(va))?;
        pt.set(ti, PtEntry::zero());
        self.mmu.flush_page(va.page());
        trace!("Unmapped {va} (was {frame})");
        Ok(frame)
    }

    fn table_for(&self, va: VirtualAddress) -> Result<PhysicalPage, PagingError> {
        self.directory_mut()?
            .get(DirectoryIndex::from(va))
            .next_table()
            .ok_or(PagingError::TableNotPresent(va))
    }

    /// Resolve `va`, reporting which level of the walk is missing.
    ///
    /// # Errors
    /// [`PagingError::NoDirectory`], [`PagingError::TableNotPresent`] or
    /// [`PagingError::PageNotPresent`].
    pub fn walk(&self, va: VirtualAddress) -> Result<PhysicalAddress, PagingError> {
        let table = self.table_for(va)?;
        let frame = self
            .table_mut(table)
            .get(TableIndex::from(va))
            .page_4k()
            .ok_or(PagingError::PageNotPresent(va))?;
        Ok(frame.join(va.page_offset()))
    }

    /// Translate `va` to a physical address if mapped.
    #[inline]
    #[must_use]
    pub fn translate(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        self.walk(va).ok()
    }

    /// Allocate a page-sized frame and clear it for use as a directory or table.
    fn alloc_zeroed_table<A: FrameAlloc>(
        &self,
        frames: &mut A,
    ) -> Result<PhysicalPage, PagingError> {
        let frame = frames.alloc_frame().ok_or(PagingError::OutOfFrames)?;
        self.table_mut(frame).zero();
        Ok(frame)
    }

    /// Build the initial address space and enable paging.
    ///
    /// Physical `[0, 4 MiB)` is mapped both 1:1 and at `KERNEL_VIRT_START`
    /// through two page tables installed in a fresh directory. Afterwards the
    /// mappings are verified with [`self_test`](Self::self_test) on a scratch
    /// frame.
    ///
    /// # Errors
    /// [`PagingError::OutOfFrames`] if the tables cannot be allocated.
    ///
    /// # Panics
    /// If paging is already enabled, or if the self test fails.
    pub fn init_kernel_address_space<A: FrameAlloc>(
        &mut self,
        frames: &mut A,
    ) -> Result<(), PagingError> {
        assert!(
            !self.mmu.paging_enabled(),
            "paging bring-up requires paging to be disabled"
        );

        let identity = self.alloc_zeroed_table(frames)?;
        let kernel = self.alloc_zeroed_table(frames)?;
        let directory = self.alloc_zeroed_table(frames)?;

        let identity_pt = self.table_mut(identity);
        let kernel_pt = self.table_mut(kernel);
        for index in 0..KERNEL_IDENTITY_BYTES / PAGE_SIZE {
            let frame = PhysicalPage::from_index(index);
            let entry = PtEntry::make_4k(frame, PageEntryBits::new_kernel_rw());
            let ti = TableIndex::from(VirtualAddress::new(frame.base().as_u32()));
            identity_pt.set(ti, entry);
            kernel_pt.set(ti, entry);
        }

        let pd = unsafe { self.mapper.phys_to_mut::<PageDirectory>(directory.base()) };
        pd.set(
            DirectoryIndex::from(VirtualAddress::zero()),
            PdEntry::make_next(identity, PageEntryBits::new_kernel_rw()),
        );
        pd.set(
            DirectoryIndex::from(VirtualAddress::new(KERNEL_VIRT_START)),
            PdEntry::make_next(kernel, PageEntryBits::new_kernel_rw()),
        );

        self.change_page_dir_table(directory.base())?;
        self.set_paging_enabled(true);

        let scratch = frames.alloc_frame().ok_or(PagingError::OutOfFrames)?;
        self.self_test(scratch);
        frames.free_frame(scratch);

        info!(
            "Paging enabled: first {} MiB identity mapped and mapped at {}",
            KERNEL_IDENTITY_BYTES >> 20,
            VirtualAddress::new(KERNEL_VIRT_START)
        );
        Ok(())
    }

    /// Verify that `scratch` is reachable through both bring-up mappings.
    ///
    /// Writes [`PAGING_SENTINEL`] through the identity mapping and reads it
    /// back through the higher-half mapping, then the reverse.
    ///
    /// # Panics
    /// If `scratch` lies outside the bring-up window or either read-back
    /// mismatches.
    pub fn self_test(&mut self, scratch: PhysicalPage) {
        let pa = scratch.base().as_u32();
        assert!(
            pa < KERNEL_IDENTITY_BYTES,
            "paging self test frame {scratch} is outside the identity window"
        );
        let low = VirtualAddress::new(pa);
        let high = VirtualAddress::new(KERNEL_VIRT_START + pa);

        self.write(low, PAGING_SENTINEL);
        let seen = self.read::<u32>(high);
        assert_eq!(
            seen, PAGING_SENTINEL,
            "paging self test: wrote via {low}, read {seen:#010X} via {high}"
        );

        self.write(high, !PAGING_SENTINEL);
        let seen = self.read::<u32>(low);
        assert_eq!(
            seen, !PAGING_SENTINEL,
            "paging self test: wrote via {high}, read {seen:#010X} via {low}"
        );
        debug!("Paging self test passed on {scratch}");
    }

    /// Resolve a typed access at `va`, faulting if it is not mapped.
    fn fault_in<T>(&self, va: VirtualAddress) -> PhysicalAddress {
        assert!(
            va.page_offset() as usize + size_of::<T>() <= PAGE_SIZE as usize,
            "access of {} bytes at {va} crosses a page boundary",
            size_of::<T>()
        );
        debug_assert!(va.is_aligned(align_of::<T>() as u32), "misaligned access at {va}");
        match self.walk(va) {
            Ok(pa) => pa,
            Err(e) => panic!("page fault at {va}: {e}"),
        }
    }
}

impl<M: PhysMapper, U: Mmu> VirtualMemory for PageTableManager<'_, M, U> {
    fn read<T: Copy>(&self, va: VirtualAddress) -> T {
        let pa = self.fault_in::<T>(va);
        unsafe { *self.mapper.phys_to_mut::<T>(pa) }
    }

    fn write<T: Copy>(&mut self, va: VirtualAddress, value: T) {
        let pa = self.fault_in::<T>(va);
        unsafe {
            *self.mapper.phys_to_mut::<T>(pa) = value;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimMmu, SimPhysMemory};
    use crate::tests::BumpAlloc;

    const RAM: u32 = 8 * 1024 * 1024;

    fn manager(phys: &SimPhysMemory) -> (PageTableManager<'_, SimPhysMemory, SimMmu>, BumpAlloc) {
        let mut frames = BumpAlloc::new(0x10_0000, RAM);
        let mut paging = PageTableManager::new(phys, SimMmu::new());
        paging
            .init_kernel_address_space(&mut frames)
            .expect("bring-up");
        (paging, frames)
    }

    #[test]
    fn bring_up_maps_low_memory_twice() {
        let phys = SimPhysMemory::new(RAM);
        let (paging, frames) = manager(&phys);

        assert!(paging.paging_enabled());
        assert_eq!(frames.freed, 1, "scratch frame is returned");
        assert_eq!(
            paging.current_page_dir_table(),
            Some(PhysicalAddress::new(0x10_2000))
        );
        assert_eq!(paging.mmu().page_directory().base(), PhysicalAddress::new(0x10_2000));

        for pa in [0u32, 0x1234, 0x3F_F000] {
            assert_eq!(
                paging.translate(VirtualAddress::new(pa)),
                Some(PhysicalAddress::new(pa))
            );
            assert_eq!(
                paging.translate(VirtualAddress::new(KERNEL_VIRT_START + pa)),
                Some(PhysicalAddress::new(pa))
            );
        }
        assert_eq!(paging.translate(VirtualAddress::new(0x40_0000)), None);
        assert_eq!(
            paging.translate(VirtualAddress::new(KERNEL_VIRT_START + 0x40_0000)),
            None
        );
    }

    #[test]
    fn map_page_is_idempotent() {
        let phys = SimPhysMemory::new(RAM);
        let (mut paging, mut frames) = manager(&phys);
        let va = VirtualAddress::new(0xE000_0000);
        let pa = PhysicalAddress::new(0x50_0000);

        paging.map_page(&mut frames, pa, va).expect("first map");
        let pd = unsafe {
            phys.phys_to_mut::<PageDirectory>(paging.current_page_dir_table().expect("cr3"))
        };
        let tables = pd.present_count();
        let next_frame = frames.alloc_frame();

        let mut again = BumpAlloc::new(next_frame.expect("frame").base().as_u32(), RAM);
        paging.map_page(&mut again, pa, va).expect("second map");

        assert_eq!(pd.present_count(), tables);
        assert_eq!(again.alloc_frame(), next_frame, "no page table was allocated");
        assert_eq!(paging.translate(va), Some(pa));
    }

    #[test]
    fn map_page_toggles_paging_only_for_new_tables() {
        let phys = SimPhysMemory::new(RAM);
        let (mut paging, mut frames) = manager(&phys);
        let toggles = paging.mmu().paging_toggles();

        let (pa, va) = (PhysicalAddress::new(0x50_0000), VirtualAddress::new(0xE000_0000));
        paging.map_page(&mut frames, pa, va).expect("map");
        assert_eq!(paging.mmu().paging_toggles(), toggles + 2);
        assert!(paging.paging_enabled());
        assert!(paging.mmu().interrupts_enabled());

        let (pa, va) = (PhysicalAddress::new(0x50_1000), VirtualAddress::new(0xE000_1000));
        paging.map_page(&mut frames, pa, va).expect("map");
        assert_eq!(paging.mmu().paging_toggles(), toggles + 2);
    }

    #[test]
    fn new_table_entry_is_written_before_paging_returns() {
        let phys = SimPhysMemory::new(RAM);
        let (mut paging, mut frames) = manager(&phys);
        let unpaged = paging.mmu().unpaged_page_flushes();
        let va = VirtualAddress::new(0xE000_0000);

        paging
            .map_page(&mut frames, PhysicalAddress::new(0x50_0000), va)
            .expect("map");
        // The leaf is set and invalidated inside the paging-off window.
        assert_eq!(paging.mmu().unpaged_page_flushes(), unpaged + 1);
        assert_eq!(paging.translate(va), Some(PhysicalAddress::new(0x50_0000)));

        paging
            .map_page(&mut frames, PhysicalAddress::new(0x50_1000), va + PAGE_SIZE)
            .expect("map");
        assert_eq!(paging.mmu().unpaged_page_flushes(), unpaged + 1);
    }

    #[test]
    fn map_page_restores_paging_when_out_of_frames() {
        let phys = SimPhysMemory::new(RAM);
        let (mut paging, _) = manager(&phys);
        let mut empty = BumpAlloc::new(RAM, RAM);

        let err = paging.map_page(
            &mut empty,
            PhysicalAddress::new(0x50_0000),
            VirtualAddress::new(0xE000_0000),
        );
        assert_eq!(err, Err(PagingError::OutOfFrames));
        assert!(paging.paging_enabled());
        assert!(paging.mmu().interrupts_enabled());
    }

    #[test]
    fn unmap_page_clears_and_reports() {
        let phys = SimPhysMemory::new(RAM);
        let (mut paging, mut frames) = manager(&phys);
        let va = VirtualAddress::new(0xE000_3000);
        let pa = PhysicalAddress::new(0x60_0000);
        paging.map_page(&mut frames, pa, va).expect("map");

        let flushes = paging.mmu().page_flushes();
        assert_eq!(paging.unmap_page(va), Ok(pa.frame()));
        assert_eq!(paging.mmu().page_flushes(), flushes + 1);
        assert_eq!(paging.walk(va), Err(PagingError::PageNotPresent(va)));
        assert_eq!(paging.unmap_page(va), Err(PagingError::PageNotPresent(va)));

        let far = VirtualAddress::new(0x8000_0000);
        assert_eq!(paging.walk(far), Err(PagingError::TableNotPresent(far)));
    }

    #[test]
    fn virtual_memory_reads_back_writes() {
        let phys = SimPhysMemory::new(RAM);
        let (mut paging, mut frames) = manager(&phys);
        let va = VirtualAddress::new(0xE000_0000);
        paging
            .map_page(&mut frames, PhysicalAddress::new(0x70_0000), va)
            .expect("map");

        paging.write(va + 8, 0x1122_3344_u32);
        assert_eq!(paging.read::<u32>(va + 8), 0x1122_3344);
        let raw = unsafe { phys.phys_to_mut::<u32>(PhysicalAddress::new(0x70_0008)) };
        assert_eq!(*raw, 0x1122_3344);
    }

    #[test]
    #[should_panic(expected = "page fault")]
    fn reading_unmapped_memory_faults() {
        let phys = SimPhysMemory::new(RAM);
        let (paging, _) = manager(&phys);
        let _ = paging.read::<u32>(VirtualAddress::new(0xE000_0000));
    }

    #[test]
    #[should_panic(expected = "not page aligned")]
    fn misaligned_directory_is_fatal() {
        let phys = SimPhysMemory::new(RAM);
        let mut paging = PageTableManager::new(&phys, SimMmu::new());
        let _ = paging.change_page_dir_table(PhysicalAddress::new(0x10_0010));
    }

    #[test]
    fn null_directory_is_rejected() {
        let phys = SimPhysMemory::new(RAM);
        let mut paging = PageTableManager::new(&phys, SimMmu::new());
        assert_eq!(
            paging.change_page_dir_table(PhysicalAddress::zero()),
            Err(PagingError::NullDirectory)
        );
        assert_eq!(paging.current_page_dir_table(), None);
    }

    #[test]
    fn set_paging_enabled_is_a_no_op_when_unchanged() {
        let phys = SimPhysMemory::new(RAM);
        let (mut paging, _) = manager(&phys);
        let toggles = paging.mmu().paging_toggles();
        paging.set_paging_enabled(true);
        assert_eq!(paging.mmu().paging_toggles(), toggles);
        paging.set_paging_enabled(false);
        assert!(!paging.paging_enabled());
    }

    #[test]
    #[should_panic(expected = "without a page directory")]
    fn enabling_paging_without_directory_is_fatal() {
        let phys = SimPhysMemory::new(RAM);
        let mut paging = PageTableManager::new(&phys, SimMmu::new());
        paging.set_paging_enabled(true);
    }

    #[test]
    #[should_panic(expected = "paging self test")]
    fn self_test_detects_broken_high_mapping() {
        let phys = SimPhysMemory::new(RAM);
        let (mut paging, mut frames) = manager(&phys);
        let scratch = PhysicalPage::from_index(0x200);
        let high = VirtualAddress::new(KERNEL_VIRT_START + scratch.base().as_u32());
        paging
            .map_page(&mut frames, PhysicalAddress::new(0x30_0000), high)
            .expect("remap");
        paging.self_test(scratch);
    }

    #[test]
    fn flush_tlb_reaches_the_mmu() {
        let phys = SimPhysMemory::new(RAM);
        let (mut paging, _) = manager(&phys);
        let before = paging.mmu().tlb_flushes();
        paging.flush_tlb();
        paging.flush_page(VirtualAddress::new(0xC000_0000));
        assert_eq!(paging.mmu().tlb_flushes(), before + 1);
    }
}
