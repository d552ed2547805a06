//! # Memory Core
//!
//! The kernel's allocation entry points behind one object: bring-up from the
//! boot memory description, the two heaps, frame statistics and the dump
//! commands.

use crate::kmalloc::{Kmalloc, KmallocStats};
use crate::mm::MemoryManager;
use crate::vmalloc::{Vmalloc, VmallocStats};
use crate::{AllocError, InitError};
use core::fmt;
use kernel_info::boot::{BootMemoryInfo, KernelImage};
use kernel_memory_addresses::VirtualAddress;
use kernel_vmem::{Mmu, PhysMapper};
use log::info;

pub struct MemoryCore<'m, M: PhysMapper, U: Mmu> {
    mm: MemoryManager<'m, M, U>,
    kmalloc: Kmalloc,
    vmalloc: Vmalloc,
}

impl<'m, M: PhysMapper, U: Mmu> MemoryCore<'m, M, U> {
    /// Frames, paging, kmalloc and vmalloc, in that order.
    ///
    /// # Errors
    /// [`InitError`] if paging or the kmalloc window cannot be set up.
    ///
    /// # Panics
    /// On an invalid boot memory map or a failed paging self test.
    pub fn new(
        mapper: &'m M,
        mmu: U,
        boot: &BootMemoryInfo<'_>,
        kernel: KernelImage,
    ) -> Result<Self, InitError> {
        let mut mm = MemoryManager::new(mapper, mmu, boot, kernel)?;
        let kmalloc = Kmalloc::new(&mut mm)?;
        let vmalloc = Vmalloc::new();
        info!(
            "Memory core ready: {} KiB of {} KiB free",
            mm.frames.remaining_memory() / 1024,
            mm.frames.total_memory() / 1024
        );
        Ok(Self {
            mm,
            kmalloc,
            vmalloc,
        })
    }

    #[inline]
    pub const fn manager(&self) -> &MemoryManager<'m, M, U> {
        &self.mm
    }

    #[inline]
    pub const fn manager_mut(&mut self) -> &mut MemoryManager<'m, M, U> {
        &mut self.mm
    }

    /// # Errors
    /// See [`Kmalloc::alloc`].
    pub fn kmalloc(&mut self, size: u32) -> Result<VirtualAddress, AllocError> {
        self.kmalloc.alloc(&mut self.mm, size)
    }

    /// # Panics
    /// See [`Kmalloc::free`].
    pub fn kfree(&mut self, ptr: VirtualAddress) {
        self.kmalloc.free(&mut self.mm, ptr);
    }

    /// # Panics
    /// See [`Kmalloc::size`].
    #[must_use]
    pub fn ksize(&self, ptr: VirtualAddress) -> u32 {
        self.kmalloc.size(&self.mm, ptr)
    }

    /// # Errors
    /// See [`Vmalloc::alloc`].
    pub fn vmalloc(&mut self, size: u32) -> Result<VirtualAddress, AllocError> {
        self.vmalloc.alloc(&mut self.mm, size)
    }

    /// # Panics
    /// See [`Vmalloc::free`].
    pub fn vfree(&mut self, ptr: VirtualAddress) {
        self.vmalloc.free(&mut self.mm, ptr);
    }

    /// # Panics
    /// See [`Vmalloc::size`].
    #[must_use]
    pub fn vsize(&self, ptr: VirtualAddress) -> u32 {
        self.vmalloc.size(&self.mm, ptr)
    }

    /// # Errors
    /// See [`Vmalloc::brk`].
    pub fn vbrk(&mut self, increment: i32) -> Result<VirtualAddress, AllocError> {
        self.vmalloc.brk(increment)
    }

    #[inline]
    #[must_use]
    pub const fn used_frames(&self) -> u32 {
        self.mm.frames.used_frames()
    }

    #[inline]
    #[must_use]
    pub const fn total_frames(&self) -> u32 {
        self.mm.frames.total_frames()
    }

    #[inline]
    #[must_use]
    pub const fn total_memory(&self) -> u64 {
        self.mm.frames.total_memory()
    }

    #[inline]
    #[must_use]
    pub const fn remaining_memory(&self) -> u64 {
        self.mm.frames.remaining_memory()
    }

    #[must_use]
    pub fn kmalloc_stats(&self) -> KmallocStats {
        self.kmalloc.stats(&self.mm)
    }

    #[must_use]
    pub fn vmalloc_stats(&self) -> VmallocStats {
        self.vmalloc.stats()
    }

    /// # Errors
    /// Propagates errors of the writer.
    pub fn dump_physical_memory(&self, w: &mut impl fmt::Write) -> fmt::Result {
        self.mm.frames.dump(w)
    }

    /// # Errors
    /// Propagates errors of the writer.
    pub fn dump_kmalloc(&self, w: &mut impl fmt::Write) -> fmt::Result {
        self.kmalloc.dump(&self.mm, w)
    }

    /// # Errors
    /// Propagates errors of the writer.
    pub fn dump_vmalloc(&self, w: &mut impl fmt::Write) -> fmt::Result {
        self.vmalloc.dump(w)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MIB, boot_16m, kernel_1m};
    use kernel_vmem::sim::{SimMmu, SimPhysMemory};

    #[test]
    fn heaps_share_the_frame_pool() {
        let phys = SimPhysMemory::new(16 * MIB);
        let mut core =
            MemoryCore::new(&phys, SimMmu::new(), &boot_16m(), kernel_1m()).expect("core");
        assert_eq!(core.total_frames(), 4096);
        assert_eq!(core.total_memory(), u64::from(16 * MIB));

        let used = core.used_frames();
        let v = core.vmalloc(3 * 4096).expect("vmalloc");
        let k = core.kmalloc(10).expect("kmalloc");
        assert_eq!(core.ksize(k), 64);
        assert_eq!(core.vsize(v), 3 * 4096);
        assert_eq!(core.used_frames(), used + 4 + 1);
        assert_eq!(
            core.remaining_memory(),
            u64::from(core.total_frames() - core.used_frames()) * 4096
        );

        core.vfree(v);
        core.kfree(k);
        assert_eq!(core.used_frames(), used + 1);
    }

    #[test]
    fn kmalloc_failure_is_an_init_error() {
        let phys = SimPhysMemory::new(4 * MIB);
        let map = [kernel_info::boot::MemoryMapEntry::new(
            0,
            u64::from(4 * MIB),
            kernel_info::boot::MemoryKind::Available,
        )];
        // Physical memory ends where the kernel break starts.
        let boot = BootMemoryInfo::from_memory_map(&map);
        let err = MemoryCore::new(&phys, SimMmu::new(), &boot, kernel_1m()).err();
        assert!(matches!(err, Some(InitError::KmallocHeap(_))));
    }

    #[test]
    fn dumps_cover_all_three_allocators() {
        let phys = SimPhysMemory::new(16 * MIB);
        let core = MemoryCore::new(&phys, SimMmu::new(), &boot_16m(), kernel_1m()).expect("core");

        let mut out = String::new();
        core.dump_physical_memory(&mut out).expect("frames");
        core.dump_kmalloc(&mut out).expect("kmalloc");
        core.dump_vmalloc(&mut out).expect("vmalloc");
        assert!(out.starts_with("Memory map (4096 frames"));
        assert!(out.contains("Kmalloc heap info:"));
        assert!(out.contains("Vmalloc heap info:"));
    }
}
