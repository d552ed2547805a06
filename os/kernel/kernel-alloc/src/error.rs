use kernel_vmem::PagingError;

/// Recoverable allocation failures.
///
/// Corruption (double free, bad headers, unmapped pages inside a live
/// allocation) is never reported here; it panics.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum AllocError {
    #[error("zero-sized allocation")]
    ZeroSize,
    #[error("allocation of {size} bytes exceeds the largest size class ({max} bytes)")]
    TooLarge { size: u32, max: u32 },
    #[error("out of physical memory")]
    OutOfPhysicalMemory,
    #[error("out of virtual address space")]
    OutOfAddressSpace,
    #[error("out of extent nodes")]
    OutOfExtentNodes,
    #[error("break request out of range")]
    BreakOutOfRange,
}

/// Failures while bringing up the memory core.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum InitError {
    #[error("paging bring-up failed: {0}")]
    Paging(#[from] PagingError),
    #[error("kmalloc could not reserve its heap: {0}")]
    KmallocHeap(AllocError),
}
