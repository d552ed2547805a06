use crate::{PAGE_SIZE, VirtualAddress};
use core::fmt;

/// Page-aligned base of a 4 KiB virtual page.
///
/// ### Examples
/// ```rust
/// # use kernel_memory_addresses::*;
/// let vp = VirtualPage::containing(VirtualAddress::new(0xE000_1FFF));
/// assert_eq!(vp.base().as_u32(), 0xE000_1000);
/// assert_eq!(vp.join(0x10).as_u32(), 0xE000_1010);
/// ```
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct VirtualPage(VirtualAddress);

impl VirtualPage {
    /// Page starting at `va`, which must be page aligned.
    #[inline]
    #[must_use]
    pub const fn from_addr(va: VirtualAddress) -> Self {
        debug_assert!(va.is_page_aligned());
        Self(va)
    }

    /// Page containing `va`.
    #[inline]
    #[must_use]
    pub const fn containing(va: VirtualAddress) -> Self {
        Self(VirtualAddress::new(va.as_u32() & !(PAGE_SIZE - 1)))
    }

    #[inline]
    #[must_use]
    pub const fn base(self) -> VirtualAddress {
        self.0
    }

    #[inline]
    #[must_use]
    pub const fn join(self, offset: u32) -> VirtualAddress {
        debug_assert!(offset < PAGE_SIZE);
        VirtualAddress::new(self.0.as_u32() | offset)
    }
}

impl fmt::Display for VirtualPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl fmt::Debug for VirtualPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VirtualPage({:#010X})", self.0.as_u32())
    }
}
