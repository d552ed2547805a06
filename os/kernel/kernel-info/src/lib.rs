//! # Kernel Configuration and Boot Interface
//!
//! This crate defines the memory layout constants and boot interface types
//! shared by the paging layer and the kernel allocators. It is the single
//! source of truth for where things live in the 32-bit address space.
//!
//! ## Architecture
//!
//! ### Boot Information ([`boot`])
//! * **Memory Map**: multiboot-style `(base, length, kind)` ranges
//! * **Legacy Totals**: lower/upper memory in KiB
//! * **Kernel Image**: physical extent of the loaded kernel
//!
//! ### Memory Layout ([`memory`])
//! * **Higher Half Design**: kernel execution at `0xC000_0000`
//! * **Linear Window**: physically contiguous kernel break region
//! * **vmalloc Arena**: page-by-page backed virtual allocations
//!
//! ## Virtual Memory Architecture
//!
//! ```text
//! Virtual Address Space Layout (32-bit):
//!
//! 0x0000_0000 ┌─────────────────────────────────┐
//!             │  Identity map (first 4 MiB)     │
//! 0x0040_0000 ├─────────────────────────────────┤
//!             │         Unused                  │
//! 0xC000_0000 ├─────────────────────────────────┤ KERNEL_VIRT_START
//!             │  Kernel image (first 4 MiB)     │
//! 0xC040_0000 ├─────────────────────────────────┤ KERNEL_BRK_START
//!             │  Kernel break (kmalloc slabs)   │
//! 0xD000_0000 ├─────────────────────────────────┤ KERNEL_VIRT_LINEAR_MAPPING_END
//!             │  vmalloc break growth room      │   = VMALLOC_VIRT_MIN
//! 0xE000_0000 ├─────────────────────────────────┤ VMALLOC_VIRT_START
//!             │  vmalloc arena                  │
//! 0xFFFF_FFFF └─────────────────────────────────┘ VMALLOC_VIRT_END
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]

pub mod boot;
pub mod memory;
