use bitfield_struct::bitfield;
use kernel_memory_addresses::PhysicalPage;

/// Represents a single 32-bit i386 page directory or page table entry in its
/// raw bitfield form.
///
/// This structure models the **common superset** of fields found in both
/// paging levels (PDE, PTE).
///
/// ### Bit layout
///
/// | Bits      | Name / Mnemonic   | Meaning |
/// |-----------|-------------------|----------|
/// | 0         | `P` (present)     | Valid entry if set |
/// | 1         | `RW`              | Writable if set |
/// | 2         | `US`              | User-mode accessible if set |
/// | 3         | `PWT`             | Write-through caching |
/// | 4         | `PCD`             | Disable caching |
/// | 5         | `A`               | Accessed |
/// | 6         | `D`               | Dirty (leaf only) |
/// | 7         | `PS` / `PAT`      | 4 MiB page in a PDE, PAT in a PTE |
/// | 8         | `G`               | Global (leaf only) |
/// | 9–11      | OS avail          | Reserved for OS use |
/// | 12–31     | `frame`           | Physical frame index |
///
/// ### Example
/// ```rust
/// # use kernel_vmem::PageEntryBits;
/// # use kernel_vmem::addresses::PhysicalPage;
/// let e = PageEntryBits::new_kernel_rw().with_frame(PhysicalPage::from_index(0x123));
/// assert!(e.present());
/// assert_eq!(e.into_bits(), 0x0012_3003);
/// ```
#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct PageEntryBits {
    /// Present (P, bit 0).
    ///
    /// Set if the entry points to a valid page table (PDE) or frame (PTE).
    pub present: bool,

    /// Writable (RW, bit 1).
    ///
    /// Supervisor writes ignore this bit unless CR0.WP is set.
    pub writable: bool,

    /// User/Supervisor (US, bit 2).
    pub user_access: bool,

    /// Page Write-Through (PWT, bit 3).
    pub write_through: bool,

    /// Page Cache Disable (PCD, bit 4).
    pub cache_disabled: bool,

    /// Accessed (A, bit 5). Set by the CPU on first access.
    pub accessed: bool,

    /// Dirty (D, bit 6): **leaf only**. Set by the CPU on first write.
    pub dirty: bool,

    /// Page Size (PS, bit 7) in a PDE; PAT in a PTE.
    ///
    /// This kernel never sets it.
    pub large_page: bool,

    /// Global (G, bit 8): **leaf only**.
    pub global_translation: bool,

    /// OS-available (bits 9..=11).
    #[bits(3)]
    pub os_available: u8,

    /// Physical frame index (bits 12..=31).
    #[bits(20)]
    frame_index: u32,
}

impl PageEntryBits {
    #[inline]
    pub const fn set_frame(&mut self, frame: PhysicalPage) {
        self.set_frame_index(frame.index());
    }

    #[inline]
    #[must_use]
    pub const fn with_frame(mut self, frame: PhysicalPage) -> Self {
        self.set_frame(frame);
        self
    }

    #[inline]
    #[must_use]
    pub const fn frame(&self) -> PhysicalPage {
        PhysicalPage::from_index(self.frame_index())
    }

    /// Present, writable, supervisor-only.
    #[inline]
    #[must_use]
    pub const fn new_kernel_rw() -> Self {
        Self::new().with_present(true).with_writable(true)
    }
}
