use kernel_alloc::{AllocError, BitmapFrameAllocator, MemoryCore};
use kernel_info::boot::{BootMemoryInfo, KernelImage, MemoryKind, MemoryMapEntry};
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};
use kernel_vmem::sim::{SimMmu, SimPhysMemory};

const MIB: u32 = 1024 * 1024;

static MAP: [MemoryMapEntry; 2] = [
    MemoryMapEntry::new(0, 0x9_F000, MemoryKind::Available),
    MemoryMapEntry::new(0x10_0000, 15 * MIB as u64, MemoryKind::Available),
];

fn boot() -> BootMemoryInfo<'static> {
    BootMemoryInfo::from_memory_map(&MAP)
}

fn kernel() -> KernelImage {
    KernelImage::new(PhysicalAddress::new(0), PhysicalAddress::new(MIB))
}

fn core(phys: &SimPhysMemory) -> MemoryCore<'_, SimPhysMemory, SimMmu> {
    MemoryCore::new(phys, SimMmu::new(), &boot(), kernel()).expect("memory core")
}

#[test]
fn frame_allocator_bring_up() {
    let phys = SimPhysMemory::new(16 * MIB);
    let mut frames = BitmapFrameAllocator::init(&phys, &boot(), kernel());

    assert_eq!(frames.total_frames(), 4096);
    assert_eq!(frames.used_frames(), 257);
    assert!(!frames.is_frame_free(0));

    let first = frames.alloc_frames(1).expect("frame");
    assert_eq!(first, PhysicalAddress::new(0x10_1000));
    assert!(!frames.is_frame_free(0x101));

    let second = frames.alloc_frames(1).expect("frame");
    assert_ne!(first, second);

    frames.free_frames(first, 1);
    assert!(frames.is_frame_free(0x101));
    assert_eq!(frames.alloc_frames(1), Some(first));
}

#[test]
fn kmalloc_reuses_the_freed_slot() {
    let phys = SimPhysMemory::new(16 * MIB);
    let mut core = core(&phys);

    let a = core.kmalloc(10).expect("a");
    let b = core.kmalloc(10).expect("b");
    assert_ne!(a, b);
    core.kfree(a);
    assert_eq!(core.kmalloc(10), Ok(a));
}

#[test]
fn kmalloc_sizes_are_aligned_and_sufficient() {
    let phys = SimPhysMemory::new(16 * MIB);
    let mut core = core(&phys);

    let mut ptrs = Vec::new();
    for size in [1, 15, 64, 65, 500, 1024, 1025, 4064, 4065, 20_000, 131_040] {
        let ptr = core.kmalloc(size).expect("kmalloc");
        assert!(ptr.is_aligned(16), "{ptr} for {size} bytes");
        assert!(core.ksize(ptr) >= size);
        ptrs.push(ptr);
    }
    assert!(matches!(
        core.kmalloc(131_041),
        Err(AllocError::TooLarge { .. })
    ));
    assert_eq!(core.kmalloc(0), Err(AllocError::ZeroSize));

    for ptr in ptrs.into_iter().rev() {
        core.kfree(ptr);
    }
    let stats = core.kmalloc_stats();
    assert!(stats.small.iter().chain(&stats.big).all(|class| class.occupied == 0));
}

#[test]
fn vmalloc_returns_its_frames() {
    let phys = SimPhysMemory::new(16 * MIB);
    let mut core = core(&phys);

    let ptr = core.vmalloc(5000).expect("vmalloc");
    assert_eq!(core.vsize(ptr), 5000);
    let used = core.used_frames();
    core.vfree(ptr);

    assert_eq!(used - core.used_frames(), 2);
    let stats = core.vmalloc_stats();
    assert_eq!((stats.free_extents, stats.occupied_extents), (1, 0));
    assert_eq!(stats.free_bytes, 0x2000_0000);
}

/// Allocate a mix of sizes from both heaps and free them out of order.
fn workload(core: &mut MemoryCore<'_, SimPhysMemory, SimMmu>) -> u32 {
    let sizes = [100, 9000, 4080, 1, 70_000, 300, 12_288];
    let small: Vec<_> = sizes
        .iter()
        .map(|&size| core.kmalloc(size.min(5000)).expect("kmalloc"))
        .collect();
    let large: Vec<_> = sizes
        .iter()
        .map(|&size| core.vmalloc(size).expect("vmalloc"))
        .collect();

    for (i, &ptr) in large.iter().enumerate().skip(1).step_by(2) {
        assert_eq!(core.vsize(ptr), sizes[i]);
        core.vfree(ptr);
    }
    for &ptr in large.iter().step_by(2) {
        core.vfree(ptr);
    }
    for ptr in small {
        core.kfree(ptr);
    }
    core.used_frames()
}

#[test]
fn mixed_workload_is_stable() {
    let phys = SimPhysMemory::new(16 * MIB);
    let mut core = core(&phys);

    let after_first = workload(&mut core);
    let after_second = workload(&mut core);
    assert_eq!(after_first, after_second, "frames leaked between rounds");
    assert_eq!(core.vmalloc_stats().free_extents, 1);
    assert_eq!(core.vmalloc_stats().occupied_extents, 0);
}

#[test]
fn vbrk_extends_the_vmalloc_window() {
    let phys = SimPhysMemory::new(16 * MIB);
    let mut core = core(&phys);

    assert_eq!(core.vbrk(0), Ok(VirtualAddress::new(0xE000_0000)));
    assert_eq!(core.vbrk(0x1000), Ok(VirtualAddress::new(0xDFFF_F000)));

    let ptr = core.vmalloc(10).expect("vmalloc");
    assert_eq!(ptr, VirtualAddress::new(0xDFFF_F010));
    assert_eq!(core.vbrk(-0x1000), Err(AllocError::BreakOutOfRange));

    core.vfree(ptr);
    assert_eq!(core.vbrk(-0x1000), Ok(VirtualAddress::new(0xE000_0000)));
}

#[test]
fn null_pointers_are_ignored() {
    let phys = SimPhysMemory::new(16 * MIB);
    let mut core = core(&phys);
    let used = core.used_frames();
    core.kfree(VirtualAddress::zero());
    core.vfree(VirtualAddress::zero());
    assert_eq!(core.used_frames(), used);
}

#[test]
#[should_panic(expected = "double free")]
fn kfree_twice_is_fatal() {
    let phys = SimPhysMemory::new(16 * MIB);
    let mut core = core(&phys);
    let ptr = core.kmalloc(32).expect("kmalloc");
    core.kfree(ptr);
    core.kfree(ptr);
}

#[test]
#[should_panic(expected = "memory map is not present")]
fn boot_info_without_memory_map_is_fatal() {
    let phys = SimPhysMemory::new(16 * MIB);
    let boot = BootMemoryInfo {
        flags: 0,
        mem_lower_kib: 639,
        mem_upper_kib: 15 * 1024,
        memory_map: &[],
    };
    let _ = MemoryCore::new(&phys, SimMmu::new(), &boot, kernel());
}
