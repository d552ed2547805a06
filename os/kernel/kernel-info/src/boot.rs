//! # Kernel Boot Information
//!
//! The subset of the multiboot handoff the memory core consumes: a flags word,
//! the legacy lower/upper memory totals, and the detailed memory map.

use kernel_memory_addresses::PhysicalAddress;

/// `mem_lower`/`mem_upper` are valid.
pub const BOOT_FLAG_MEMORY: u32 = 1 << 0;

/// The detailed memory map is valid.
pub const BOOT_FLAG_MEM_MAP: u32 = 1 << 6;

/// Kind of a physical memory range, numbered as in the multiboot map.
#[repr(u32)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum MemoryKind {
    /// Usable RAM.
    Available = 1,
    /// Reserved by firmware or hardware.
    Reserved = 2,
    /// ACPI tables; reusable after parsing.
    AcpiReclaimable = 3,
    /// Must be preserved across hibernation.
    Nvs = 4,
    /// Defective RAM.
    BadRam = 5,
}

impl MemoryKind {
    /// Decode a raw multiboot type. Unknown values are treated as reserved.
    #[must_use]
    pub const fn from_raw(v: u32) -> Self {
        match v {
            1 => Self::Available,
            3 => Self::AcpiReclaimable,
            4 => Self::Nvs,
            5 => Self::BadRam,
            _ => Self::Reserved,
        }
    }

    #[must_use]
    pub const fn is_available(self) -> bool {
        matches!(self, Self::Available)
    }
}

/// One entry of the boot memory map.
///
/// Base and length are 64-bit as reported by firmware; the kernel only
/// accepts ranges that lie entirely below 4 GiB.
#[repr(C)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct MemoryMapEntry {
    pub base: u64,
    pub length: u64,
    pub kind: MemoryKind,
}

impl MemoryMapEntry {
    #[must_use]
    pub const fn new(base: u64, length: u64, kind: MemoryKind) -> Self {
        Self { base, length, kind }
    }

    /// Exclusive end of the range.
    #[must_use]
    pub const fn end(&self) -> u64 {
        self.base.saturating_add(self.length)
    }
}

/// Memory description handed over by the boot loader.
#[derive(Copy, Clone, Debug)]
pub struct BootMemoryInfo<'a> {
    /// Multiboot flags word ([`BOOT_FLAG_MEMORY`], [`BOOT_FLAG_MEM_MAP`], ...).
    pub flags: u32,
    /// KiB of memory below 1 MiB.
    pub mem_lower_kib: u32,
    /// KiB of memory above 1 MiB.
    pub mem_upper_kib: u32,
    /// Detailed map, in the order reported.
    pub memory_map: &'a [MemoryMapEntry],
}

impl<'a> BootMemoryInfo<'a> {
    /// Boot info carrying only a detailed memory map.
    #[must_use]
    pub const fn from_memory_map(memory_map: &'a [MemoryMapEntry]) -> Self {
        Self {
            flags: BOOT_FLAG_MEM_MAP,
            mem_lower_kib: 0,
            mem_upper_kib: 0,
            memory_map,
        }
    }

    #[must_use]
    pub const fn has_memory_map(&self) -> bool {
        self.flags & BOOT_FLAG_MEM_MAP != 0
    }

    /// Top of memory according to the legacy fields, if present.
    ///
    /// `mem_upper` counts from 1 MiB, so the lower field does not add to it.
    #[must_use]
    pub const fn legacy_total_bytes(&self) -> Option<u64> {
        if self.flags & BOOT_FLAG_MEMORY == 0 {
            return None;
        }
        Some(self.mem_upper_kib as u64 * 1024 + 1024 * 1024)
    }
}

/// Physical extent of the loaded kernel image.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct KernelImage {
    pub start: PhysicalAddress,
    /// Exclusive end.
    pub end: PhysicalAddress,
}

impl KernelImage {
    #[must_use]
    pub const fn new(start: PhysicalAddress, end: PhysicalAddress) -> Self {
        Self { start, end }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_kinds_are_reserved() {
        assert_eq!(MemoryKind::from_raw(1), MemoryKind::Available);
        assert_eq!(MemoryKind::from_raw(5), MemoryKind::BadRam);
        assert_eq!(MemoryKind::from_raw(0), MemoryKind::Reserved);
        assert_eq!(MemoryKind::from_raw(42), MemoryKind::Reserved);
    }

    #[test]
    fn legacy_total_requires_memory_flag() {
        let info = BootMemoryInfo::from_memory_map(&[]);
        assert!(info.has_memory_map());
        assert_eq!(info.legacy_total_bytes(), None);

        let info = BootMemoryInfo {
            flags: BOOT_FLAG_MEMORY,
            mem_lower_kib: 639,
            mem_upper_kib: 15 * 1024,
            memory_map: &[],
        };
        assert!(!info.has_memory_map());
        assert_eq!(info.legacy_total_bytes(), Some(16 * 1024 * 1024));
    }
}
