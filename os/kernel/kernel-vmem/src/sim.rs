//! # Simulated Machine
//!
//! Hosted stand-ins for physical RAM and the MMU so page tables can be built,
//! walked and torn down in ordinary `#[test]`s.
//!
//! - [`SimPhysMemory`]: page-aligned frames; a physical address is a byte
//!   offset into the buffer.
//! - [`SimMmu`]: CR0/CR3/EFLAGS as register values plus TLB flush counters.

use crate::{Mmu, PhysMapper};
use alloc::boxed::Box;
use alloc::vec::Vec;
use core::cell::UnsafeCell;
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress, PhysicalPage, VirtualPage};
use kernel_registers::{Cr0, Cr3, Eflags};

/// A 4 KiB-aligned raw frame.
#[repr(C, align(4096))]
struct Frame([u8; PAGE_SIZE as usize]);

/// Simulated physical memory starting at physical address 0.
pub struct SimPhysMemory {
    frames: Box<[UnsafeCell<Frame>]>,
}

impl SimPhysMemory {
    /// Zero-filled RAM of `bytes` bytes (rounded down to whole frames).
    #[must_use]
    pub fn new(bytes: u32) -> Self {
        let count = usize::try_from(bytes / PAGE_SIZE).unwrap_or(usize::MAX);
        let frames: Vec<UnsafeCell<Frame>> = (0..count)
            .map(|_| UnsafeCell::new(Frame([0; PAGE_SIZE as usize])))
            .collect();
        Self {
            frames: frames.into_boxed_slice(),
        }
    }

    /// Size of the simulated RAM in bytes.
    #[must_use]
    pub fn size(&self) -> u32 {
        self.frame_count() * PAGE_SIZE
    }

    /// Number of frames.
    #[must_use]
    pub fn frame_count(&self) -> u32 {
        u32::try_from(self.frames.len()).unwrap_or(u32::MAX)
    }
}

impl PhysMapper for SimPhysMemory {
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
        let end = pa.as_usize() + size_of::<T>();
        assert!(
            end <= self.size() as usize,
            "physical access at {pa} beyond simulated RAM ({} bytes)",
            self.size()
        );
        // The pointer is derived from the whole buffer, so accesses may span frames.
        let base = UnsafeCell::raw_get(self.frames.as_ptr()).cast::<u8>();
        unsafe { &mut *base.add(pa.as_usize()).cast::<T>() }
    }
}

/// Register-level MMU model.
#[derive(Debug)]
pub struct SimMmu {
    cr0: Cr0,
    cr3: Cr3,
    eflags: Eflags,
    tlb_flushes: usize,
    page_flushes: usize,
    unpaged_page_flushes: usize,
    paging_toggles: usize,
}

impl Default for SimMmu {
    fn default() -> Self {
        Self::new()
    }
}

impl SimMmu {
    /// Protected mode, paging off, interrupts on.
    #[must_use]
    pub fn new() -> Self {
        Self {
            cr0: Cr0::new().with_pe_protection_enable(true),
            cr3: Cr3::new(),
            eflags: Eflags::new().with_if_interrupt_enable(true),
            tlb_flushes: 0,
            page_flushes: 0,
            unpaged_page_flushes: 0,
            paging_toggles: 0,
        }
    }

    #[must_use]
    pub const fn cr0(&self) -> Cr0 {
        self.cr0
    }

    #[must_use]
    pub const fn cr3(&self) -> Cr3 {
        self.cr3
    }

    /// Full TLB flushes issued so far.
    #[must_use]
    pub const fn tlb_flushes(&self) -> usize {
        self.tlb_flushes
    }

    /// Single-page invalidations issued so far.
    #[must_use]
    pub const fn page_flushes(&self) -> usize {
        self.page_flushes
    }

    /// Single-page invalidations issued while paging was off.
    #[must_use]
    pub const fn unpaged_page_flushes(&self) -> usize {
        self.unpaged_page_flushes
    }

    /// Writes to CR0.PG that changed its value.
    #[must_use]
    pub const fn paging_toggles(&self) -> usize {
        self.paging_toggles
    }
}

impl Mmu for SimMmu {
    fn paging_enabled(&self) -> bool {
        self.cr0.pg_paging()
    }

    fn set_paging_enabled(&mut self, enabled: bool) {
        if self.cr0.pg_paging() != enabled {
            self.paging_toggles += 1;
        }
        self.cr0.set_pg_paging(enabled);
    }

    fn load_page_directory(&mut self, directory: PhysicalPage) {
        self.cr3 = Cr3::from_directory(directory);
        self.tlb_flushes += 1;
    }

    fn page_directory(&self) -> PhysicalPage {
        self.cr3.directory_phys().frame()
    }

    fn flush_tlb(&mut self) {
        self.tlb_flushes += 1;
    }

    fn flush_page(&mut self, _page: VirtualPage) {
        self.page_flushes += 1;
        if !self.cr0.pg_paging() {
            self.unpaged_page_flushes += 1;
        }
    }

    fn interrupts_enabled(&self) -> bool {
        self.eflags.if_interrupt_enable()
    }

    fn set_interrupts_enabled(&mut self, enabled: bool) {
        self.eflags.set_if_interrupt_enable(enabled);
    }
}
