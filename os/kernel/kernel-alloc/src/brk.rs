//! # Kernel Break
//!
//! The kernel's linearly growing heap region. Virtual `KERNEL_VIRT_START + pa`
//! is backed by physical `pa`, so growing the break claims exactly the frames
//! below it and maps them at the break.
//!
//! ```text
//! KERNEL_VIRT_START   KERNEL_BRK_START          brk                 LINEAR_MAPPING_END
//!        ├── bring-up 4 MiB ──┼──── claimed & mapped ──┼──── unclaimed ───────┤
//! ```

use crate::AllocError;
use crate::frame_alloc::BitmapFrameAllocator;
use kernel_info::memory::{KERNEL_BRK_START, KERNEL_VIRT_LINEAR_MAPPING_END, KERNEL_VIRT_START};
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress, VirtualAddress, align_up};
use kernel_vmem::{Mmu, PageTableManager, PhysMapper};
use log::{debug, warn};

/// A region that grows by moving its break upward.
pub trait Break {
    /// The current break.
    fn brk(&self) -> VirtualAddress;

    /// Move the break up by `increment` bytes (rounded up to whole pages).
    ///
    /// Returns the previous break, i.e. the start of the new space.
    ///
    /// # Errors
    /// The break cannot be moved; nothing changes in that case.
    fn sbrk(&mut self, increment: u32) -> Result<VirtualAddress, AllocError>;
}

/// Break state of the kernel's linear mapping window.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct KernelBreak {
    brk: VirtualAddress,
}

impl Default for KernelBreak {
    fn default() -> Self {
        Self::new()
    }
}

impl KernelBreak {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            brk: VirtualAddress::new(KERNEL_BRK_START),
        }
    }

    #[inline]
    #[must_use]
    pub const fn brk(&self) -> VirtualAddress {
        self.brk
    }

    /// Grow the break by `increment` bytes, claiming and mapping the frames
    /// that back the new pages.
    ///
    /// # Errors
    /// - [`AllocError::BreakOutOfRange`] past the end of the linear window.
    /// - [`AllocError::OutOfPhysicalMemory`] if the backing frames are not
    ///   free or a page table cannot be allocated. Claimed frames and mappings
    ///   are rolled back.
    ///
    /// # Panics
    /// If a page mapped during the call cannot be unmapped on rollback.
    pub fn sbrk<M: PhysMapper, U: Mmu>(
        &mut self,
        frames: &mut BitmapFrameAllocator<'_>,
        paging: &mut PageTableManager<'_, M, U>,
        increment: u32,
    ) -> Result<VirtualAddress, AllocError> {
        let old = self.brk;
        if increment == 0 {
            return Ok(old);
        }

        let bytes = align_up(increment, PAGE_SIZE).ok_or(AllocError::BreakOutOfRange)?;
        let new = old
            .checked_add(bytes)
            .filter(|new| new.as_u32() <= KERNEL_VIRT_LINEAR_MAPPING_END)
            .ok_or(AllocError::BreakOutOfRange)?;

        let phys = PhysicalAddress::new(old.as_u32() - KERNEL_VIRT_START);
        if u64::from(phys.as_u32()) + u64::from(bytes) > frames.total_memory() {
            warn!("Kernel break cannot grow past physical memory ({increment} bytes requested)");
            return Err(AllocError::OutOfPhysicalMemory);
        }
        let pages = bytes / PAGE_SIZE;
        if frames.alloc_frames_at(phys, pages).is_none() {
            warn!("Frames behind the kernel break at {phys} are in use");
            return Err(AllocError::OutOfPhysicalMemory);
        }

        for page in 0..pages {
            let offset = page * PAGE_SIZE;
            if paging.map_page(frames, phys + offset, old + offset).is_err() {
                for mapped in 0..page {
                    let va = old + mapped * PAGE_SIZE;
                    if let Err(e) = paging.unmap_page(va) {
                        panic!("kbrk: page {va} mapped by this call is gone: {e}");
                    }
                }
                frames.free_frames(phys, pages);
                warn!("Out of frames for page tables while growing the kernel break");
                return Err(AllocError::OutOfPhysicalMemory);
            }
        }

        self.brk = new;
        debug!("Kernel break moved {old} -> {new}");
        Ok(old)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MIB, boot_16m, kernel_1m};
    use kernel_memory_addresses::PhysicalPage;
    use kernel_vmem::sim::{SimMmu, SimPhysMemory};

    fn bring_up(
        phys: &SimPhysMemory,
    ) -> (BitmapFrameAllocator<'_>, PageTableManager<'_, SimPhysMemory, SimMmu>) {
        let mut frames = BitmapFrameAllocator::init(phys, &boot_16m(), kernel_1m());
        let mut paging = PageTableManager::new(phys, SimMmu::new());
        paging
            .init_kernel_address_space(&mut frames)
            .expect("paging");
        (frames, paging)
    }

    #[test]
    fn sbrk_maps_the_linear_frames() {
        let phys = SimPhysMemory::new(16 * MIB);
        let (mut frames, mut paging) = bring_up(&phys);
        let mut brk = KernelBreak::new();

        let old = brk.sbrk(&mut frames, &mut paging, 5000).expect("sbrk");
        assert_eq!(old, VirtualAddress::new(KERNEL_BRK_START));
        assert_eq!(brk.brk(), old + 2 * PAGE_SIZE);
        assert_eq!(paging.translate(old), Some(PhysicalAddress::new(0x40_0000)));
        assert_eq!(
            paging.translate(old + 0x1FFF),
            Some(PhysicalAddress::new(0x40_1FFF))
        );
        assert!(!frames.is_frame_free(0x401));
        assert_eq!(brk.sbrk(&mut frames, &mut paging, 0), Ok(brk.brk()));
    }

    #[test]
    fn sbrk_stops_at_physical_memory() {
        let phys = SimPhysMemory::new(16 * MIB);
        let (mut frames, mut paging) = bring_up(&phys);
        let mut brk = KernelBreak::new();
        let used = frames.used_frames();

        assert_eq!(
            brk.sbrk(&mut frames, &mut paging, 12 * MIB + 1),
            Err(AllocError::OutOfPhysicalMemory)
        );
        assert_eq!(brk.brk(), VirtualAddress::new(KERNEL_BRK_START));
        assert_eq!(frames.used_frames(), used);
        assert!(brk.sbrk(&mut frames, &mut paging, 12 * MIB).is_ok());
    }

    #[test]
    fn sbrk_stops_at_the_linear_window() {
        let phys = SimPhysMemory::new(16 * MIB);
        let (mut frames, mut paging) = bring_up(&phys);
        let mut brk = KernelBreak::new();

        let window = KERNEL_VIRT_LINEAR_MAPPING_END - KERNEL_BRK_START;
        assert_eq!(
            brk.sbrk(&mut frames, &mut paging, window + 1),
            Err(AllocError::BreakOutOfRange)
        );
        assert_eq!(
            brk.sbrk(&mut frames, &mut paging, u32::MAX),
            Err(AllocError::BreakOutOfRange)
        );
    }

    #[test]
    fn sbrk_rolls_back_when_page_tables_run_out() {
        let phys = SimPhysMemory::new(16 * MIB);
        let (mut frames, mut paging) = bring_up(&phys);
        let mut brk = KernelBreak::new();

        // One spare frame below the break for the first page table, none
        // for the second one at 0xC080_0000.
        let mut low: Vec<u32> = (1..0x400).filter(|&i| frames.is_frame_free(i)).collect();
        low.pop();
        for index in low {
            frames
                .alloc_frames_at(PhysicalPage::from_index(index).base(), 1)
                .expect("low frame");
        }
        frames
            .alloc_frames_at(PhysicalAddress::new(0x80_1000), frames.total_frames() - 0x801)
            .expect("high frames");
        let used = frames.used_frames();

        assert_eq!(
            brk.sbrk(&mut frames, &mut paging, 4 * MIB + PAGE_SIZE),
            Err(AllocError::OutOfPhysicalMemory)
        );
        assert_eq!(brk.brk(), VirtualAddress::new(KERNEL_BRK_START));
        assert_eq!(paging.translate(VirtualAddress::new(KERNEL_BRK_START)), None);
        assert_eq!(paging.translate(VirtualAddress::new(0xC07F_F000)), None);
        assert!(frames.is_frame_free(0x400));
        assert!(frames.is_frame_free(0x800));
        assert_eq!(frames.used_frames(), used + 1, "only the first page table is kept");
    }

    #[test]
    fn sbrk_fails_when_backing_frames_are_taken() {
        let phys = SimPhysMemory::new(16 * MIB);
        let (mut frames, mut paging) = bring_up(&phys);
        let mut brk = KernelBreak::new();
        let taken = frames
            .alloc_frames_at(PhysicalAddress::new(0x40_1000), 1)
            .expect("frame");

        assert_eq!(
            brk.sbrk(&mut frames, &mut paging, 3 * PAGE_SIZE),
            Err(AllocError::OutOfPhysicalMemory)
        );
        assert!(frames.is_frame_free(0x400));
        frames.free_frames(taken, 1);
        assert!(brk.sbrk(&mut frames, &mut paging, 3 * PAGE_SIZE).is_ok());
    }
}
