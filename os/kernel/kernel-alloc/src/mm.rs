//! # Memory Manager
//!
//! Owns the frame allocator, the page tables and the kernel break, and brings
//! them up in order from the boot memory description.

use crate::brk::{Break, KernelBreak};
use crate::frame_alloc::BitmapFrameAllocator;
use crate::{AllocError, InitError};
use kernel_info::boot::{BootMemoryInfo, KernelImage};
use kernel_memory_addresses::VirtualAddress;
use kernel_vmem::{Mmu, PageTableManager, PhysMapper, VirtualMemory};
use log::info;

/// Physical frames, paging and the kernel break of the single address space.
pub struct MemoryManager<'m, M: PhysMapper, U: Mmu> {
    pub frames: BitmapFrameAllocator<'m>,
    pub paging: PageTableManager<'m, M, U>,
    kbrk: KernelBreak,
}

impl<'m, M: PhysMapper, U: Mmu> MemoryManager<'m, M, U> {
    /// Initialize the frame allocator, build the kernel address space and
    /// enable paging.
    ///
    /// `mapper` must reach physical memory both before and after paging is
    /// enabled (the low 4 MiB stay identity mapped).
    ///
    /// # Errors
    /// [`InitError::Paging`] if the bring-up page tables cannot be allocated.
    ///
    /// # Panics
    /// On an invalid boot memory map or a failed paging self test.
    pub fn new(
        mapper: &'m M,
        mmu: U,
        boot: &BootMemoryInfo<'_>,
        kernel: KernelImage,
    ) -> Result<Self, InitError> {
        let mut frames = BitmapFrameAllocator::init(mapper, boot, kernel);
        let mut paging = PageTableManager::new(mapper, mmu);
        paging.init_kernel_address_space(&mut frames)?;

        info!(
            "Memory initialized: {} of {} frames used",
            frames.used_frames(),
            frames.total_frames()
        );
        Ok(Self {
            frames,
            paging,
            kbrk: KernelBreak::new(),
        })
    }
}

impl<M: PhysMapper, U: Mmu> Break for MemoryManager<'_, M, U> {
    fn brk(&self) -> VirtualAddress {
        self.kbrk.brk()
    }

    fn sbrk(&mut self, increment: u32) -> Result<VirtualAddress, AllocError> {
        self.kbrk.sbrk(&mut self.frames, &mut self.paging, increment)
    }
}

impl<M: PhysMapper, U: Mmu> VirtualMemory for MemoryManager<'_, M, U> {
    #[inline]
    fn read<T: Copy>(&self, va: VirtualAddress) -> T {
        self.paging.read(va)
    }

    #[inline]
    fn write<T: Copy>(&mut self, va: VirtualAddress, value: T) {
        self.paging.write(va, value);
    }
}
