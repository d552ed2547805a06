//! # Virtual and Physical Memory Address Types (i386)
//!
//! Strongly typed wrappers for raw 32-bit memory addresses and 4 KiB page
//! bases used by the paging layer and the kernel allocators.
//!
//! ## Overview
//!
//! | Wrapper | Meaning |
//! |----------|----------|
//! | [`VirtualAddress`] / [`VirtualPage`] | Refer to virtual (page-table translated) memory. |
//! | [`PhysicalAddress`] / [`PhysicalPage`] | Refer to physical memory (frames). |
//!
//! A virtual address decomposes into a two-level walk:
//!
//! ```text
//! | 31‒22     | 21‒12      | 11‒0   |
//! | Directory | Table      | Offset |
//! ```
//!
//! Each page table covers 4 MiB, and a page directory holds 1024 tables.
//!
//! ## Typical Usage
//!
//! ```rust
//! # use kernel_memory_addresses::*;
//! let va = VirtualAddress::new(0xC040_1234);
//! assert_eq!(va.directory_index(), 0x301);
//! assert_eq!(va.table_index(), 0x001);
//! assert_eq!(va.page_offset(), 0x234);
//!
//! let pa = PhysicalAddress::new(0x0010_1000);
//! assert_eq!(pa.frame().index(), 0x101);
//! ```
//!
//! ## Design Notes
//!
//! - The types are `#[repr(transparent)]` over `u32` and implement `Copy`, `Eq`,
//!   `Ord`, and `Hash`.
//! - All alignment and offset calculations are `const fn`.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(clippy::inline_always)]

mod physical_address;
mod physical_page;
mod virtual_address;
mod virtual_page;

pub use crate::physical_address::PhysicalAddress;
pub use crate::physical_page::PhysicalPage;
pub use crate::virtual_address::VirtualAddress;
pub use crate::virtual_page::VirtualPage;

/// Size of a page (and of a physical frame) in bytes.
pub const PAGE_SIZE: u32 = 4096;

/// log2 of [`PAGE_SIZE`].
pub const PAGE_SHIFT: u32 = 12;

/// Number of entries in a page directory or a page table.
pub const ENTRIES_PER_TABLE: usize = 1024;

/// Bytes covered by one page table (one directory entry).
pub const TABLE_SPAN: u32 = PAGE_SIZE * ENTRIES_PER_TABLE as u32;

/// Align `x` down to the nearest multiple of `a`.
///
/// `a` must be a non-zero power of two.
///
/// ```rust
/// # use kernel_memory_addresses::align_down;
/// assert_eq!(align_down(0, 4096), 0);
/// assert_eq!(align_down(4095, 4096), 0);
/// assert_eq!(align_down(8191, 4096), 4096);
/// assert_eq!(align_down(0x12345, 16), 0x12340);
/// ```
#[inline(always)]
#[must_use]
pub const fn align_down(x: u32, a: u32) -> u32 {
    x & !(a - 1)
}

/// Align `x` up to the nearest multiple of `a`.
///
/// `a` must be a non-zero power of two. Returns `None` if the result does
/// not fit into 32 bits.
///
/// ```rust
/// # use kernel_memory_addresses::align_up;
/// assert_eq!(align_up(0, 4096), Some(0));
/// assert_eq!(align_up(1, 4096), Some(4096));
/// assert_eq!(align_up(4097, 4096), Some(8192));
/// assert_eq!(align_up(0x12345, 16), Some(0x12350));
/// assert_eq!(align_up(u32::MAX, 4096), None);
/// ```
#[inline(always)]
#[must_use]
pub const fn align_up(x: u32, a: u32) -> Option<u32> {
    match x.checked_add(a - 1) {
        Some(v) => Some(v & !(a - 1)),
        None => None,
    }
}

/// Number of pages needed to hold `bytes` bytes.
#[inline]
#[must_use]
pub const fn pages_for(bytes: u32) -> u32 {
    bytes.div_ceil(PAGE_SIZE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn virtual_address_decomposes_into_walk_indices() {
        let va = VirtualAddress::new(0xE000_5ABC);
        assert_eq!(va.directory_index(), 0x380);
        assert_eq!(va.table_index(), 0x005);
        assert_eq!(va.page_offset(), 0xABC);
        assert_eq!(VirtualAddress::from_indices(0x380, 0x005, 0xABC), va);
    }

    #[test]
    fn highest_address_has_maximal_indices() {
        let va = VirtualAddress::new(0xFFFF_FFFF);
        assert_eq!(va.directory_index(), 1023);
        assert_eq!(va.table_index(), 1023);
        assert_eq!(va.page_offset(), 4095);
    }

    #[test]
    fn frame_index_round_trips_through_address() {
        let frame = PhysicalPage::from_index(257);
        assert_eq!(frame.base().as_u32(), 0x0010_1000);
        assert_eq!(PhysicalAddress::new(0x0010_1FFF).frame(), frame);
    }

    #[test]
    fn page_alignment_checks() {
        assert!(PhysicalAddress::new(0x2000).is_page_aligned());
        assert!(!PhysicalAddress::new(0x2010).is_page_aligned());
        assert!(VirtualAddress::new(0xC000_0000).is_page_aligned());
        assert!(!VirtualAddress::new(0xC000_0001).is_page_aligned());
    }

    #[test]
    fn pages_for_rounds_up() {
        assert_eq!(pages_for(0), 0);
        assert_eq!(pages_for(1), 1);
        assert_eq!(pages_for(4096), 1);
        assert_eq!(pages_for(5016), 2);
    }

    #[test]
    fn debug_format_is_tagged() {
        assert_eq!(format!("{:?}", PhysicalAddress::new(0x1000)), "PA(0x00001000)");
        assert_eq!(format!("{:?}", VirtualAddress::new(0xC000_0000)), "VA(0xC0000000)");
        assert_eq!(format!("{}", VirtualAddress::new(0xC000_0000)), "0xC0000000");
    }
}
