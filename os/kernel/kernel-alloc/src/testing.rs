//! Shared fixtures for the unit tests.

use crate::mm::MemoryManager;
use kernel_info::boot::{BootMemoryInfo, KernelImage, MemoryKind, MemoryMapEntry};
use kernel_memory_addresses::PhysicalAddress;
use kernel_vmem::sim::{SimMmu, SimPhysMemory};

pub const MIB: u32 = 1024 * 1024;

static MAP_16M: [MemoryMapEntry; 1] = [MemoryMapEntry::new(
    0,
    16 * MIB as u64,
    MemoryKind::Available,
)];

pub type SimManager<'m> = MemoryManager<'m, SimPhysMemory, SimMmu>;

/// 16 MiB of RAM starting at 0, described by a memory map.
pub fn boot_16m() -> BootMemoryInfo<'static> {
    BootMemoryInfo::from_memory_map(&MAP_16M)
}

pub fn kernel_image(start: u32, end: u32) -> KernelImage {
    KernelImage::new(PhysicalAddress::new(start), PhysicalAddress::new(end))
}

/// A 1 MiB kernel loaded at physical 0.
pub fn kernel_1m() -> KernelImage {
    kernel_image(0, MIB)
}

/// Frames, paging and the kernel break brought up on `phys` (16 MiB).
pub fn memory_manager(phys: &SimPhysMemory) -> SimManager<'_> {
    MemoryManager::new(phys, SimMmu::new(), &boot_16m(), kernel_1m()).expect("memory manager")
}
