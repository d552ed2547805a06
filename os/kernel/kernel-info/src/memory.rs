//! # Memory Layout

/// Where the kernel executes (VMA). The first 4 MiB of physical memory are
/// mapped here during paging bring-up.
pub const KERNEL_VIRT_START: u32 = 0xC000_0000;

/// Bytes of low physical memory mapped both 1:1 and at [`KERNEL_VIRT_START`]
/// during paging bring-up (one page table).
pub const KERNEL_IDENTITY_BYTES: u32 = 4 * 1024 * 1024;

/// Initial kernel break: the linear break region begins right after the
/// bring-up mapping.
pub const KERNEL_BRK_START: u32 = KERNEL_VIRT_START + KERNEL_IDENTITY_BYTES;

/// End (exclusive) of the kernel's physically-linear mapping window.
///
/// Virtual `KERNEL_VIRT_START + pa` maps physical `pa` inside this window.
pub const KERNEL_VIRT_LINEAR_MAPPING_END: u32 = 0xD000_0000;

/// Lowest address the vmalloc arena may grow down to via its break.
pub const VMALLOC_VIRT_MIN: u32 = KERNEL_VIRT_LINEAR_MAPPING_END;

/// Initial low end of the vmalloc arena.
pub const VMALLOC_VIRT_START: u32 = 0xE000_0000;

/// Highest address (inclusive) managed by vmalloc.
pub const VMALLOC_VIRT_END: u32 = 0xFFFF_FFFF;

/// Bytes reserved through the kernel break when kmalloc initializes.
pub const KMALLOC_TOTAL_CAPACITY: u32 = 4 * 1024 * 1024;

/// Bins created up front for every small kmalloc size class.
pub const KMALLOC_DEFAULT_BINS: usize = 3;

/// Alignment of the frame bitmap placed after the kernel image.
pub const FRAME_BITMAP_ALIGN: u32 = 16;

const _: () = {
    assert!(KERNEL_VIRT_START.is_multiple_of(KERNEL_IDENTITY_BYTES));
    assert!(KERNEL_BRK_START < KERNEL_VIRT_LINEAR_MAPPING_END);
    assert!(VMALLOC_VIRT_MIN <= VMALLOC_VIRT_START);
    assert!(VMALLOC_VIRT_START < VMALLOC_VIRT_END);
    assert!(KMALLOC_TOTAL_CAPACITY.is_multiple_of(4096));
    assert!(KMALLOC_TOTAL_CAPACITY <= KERNEL_VIRT_LINEAR_MAPPING_END - KERNEL_BRK_START);
};
