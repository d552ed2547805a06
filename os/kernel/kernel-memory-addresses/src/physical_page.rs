use crate::{PAGE_SHIFT, PhysicalAddress};
use core::fmt;

/// A 4 KiB physical frame, identified by its index (`address / 4096`).
///
/// ### Invariants
/// - The base address is always page aligned.
///
/// ### Examples
/// ```rust
/// # use kernel_memory_addresses::*;
/// let frame = PhysicalPage::from_index(3);
/// assert_eq!(frame.base(), PhysicalAddress::new(0x3000));
/// assert_eq!(frame.next(), PhysicalPage::from_index(4));
/// ```
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PhysicalPage(u32);

impl PhysicalPage {
    /// Frame by index. The index must address a frame below 4 GiB.
    #[inline]
    #[must_use]
    pub const fn from_index(index: u32) -> Self {
        debug_assert!(index < (1 << 20));
        Self(index)
    }

    /// Frame starting at `pa`, which must be page aligned.
    #[inline]
    #[must_use]
    pub const fn from_addr(pa: PhysicalAddress) -> Self {
        debug_assert!(pa.is_page_aligned());
        pa.frame()
    }

    #[inline]
    #[must_use]
    pub const fn index(self) -> u32 {
        self.0
    }

    #[inline]
    #[must_use]
    pub const fn base(self) -> PhysicalAddress {
        PhysicalAddress::new(self.0 << PAGE_SHIFT)
    }

    /// Address `offset` bytes into this frame.
    #[inline]
    #[must_use]
    pub const fn join(self, offset: u32) -> PhysicalAddress {
        debug_assert!(offset < crate::PAGE_SIZE);
        PhysicalAddress::new((self.0 << PAGE_SHIFT) | offset)
    }

    #[inline]
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for PhysicalPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.base(), f)
    }
}

impl fmt::Debug for PhysicalPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PhysicalPage(#{}, {:#010X})", self.0, self.base().as_u32())
    }
}
