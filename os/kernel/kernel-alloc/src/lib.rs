//! # Kernel Memory Allocation
//!
//! Physical frame management and the two kernel heaps of the 32-bit kernel,
//! layered on the page tables of `kernel-vmem`.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌────────────────────────────┐   ┌────────────────────────────┐
//! │   kmalloc ([`kmalloc`])    │   │   vmalloc ([`vmalloc`])    │
//! │ • size-class bins + big    │   │ • best-fit extents         │
//! │   classes, 32-byte headers │   │ • coalescing, own break    │
//! └─────────────┬──────────────┘   └─────────────┬──────────────┘
//!               │ kernel break                   │ single frames + map_page
//! ┌─────────────▼────────────────────────────────▼──────────────┐
//! │                 MemoryManager                               │
//! │   BitmapFrameAllocator  +  PageTableManager  +  KernelBreak │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! [`MemoryCore`] ties everything together and is what the kernel holds on to
//! after boot.
//!
//! ## Virtual Address Space
//!
//! ```text
//! 0x0000_0000 ┌──────────────────────────────┐
//!             │ identity map of [0, 4 MiB)   │ (bring-up only)
//! 0xC000_0000 ├──────────────────────────────┤ KERNEL_VIRT_START
//!             │ kernel image, low memory     │
//! 0xC040_0000 ├──────────────────────────────┤ KERNEL_BRK_START
//!             │ kernel break (kmalloc)  ↓    │ linear: va - 0xC000_0000 = pa
//! 0xD000_0000 ├──────────────────────────────┤ VMALLOC_VIRT_MIN
//!             │ ↑ vmalloc break              │
//! 0xE000_0000 ├──────────────────────────────┤ VMALLOC_VIRT_START
//!             │ vmalloc extents              │
//! 0xFFFF_FFFF └──────────────────────────────┘ VMALLOC_VIRT_END
//! ```
//!
//! All heap memory is touched through [`VirtualMemory`](kernel_vmem::VirtualMemory),
//! which resolves addresses through the live page tables. On the target this
//! is a plain pointer access; in hosted tests it runs against the simulated
//! machine of `kernel_vmem::sim`.

#![cfg_attr(not(any(test, doctest)), no_std)]

mod brk;
mod error;
pub mod extent;
pub mod frame_alloc;
pub mod kmalloc;
mod memory;
mod mm;
pub mod vmalloc;

#[cfg(test)]
mod testing;

pub use crate::brk::{Break, KernelBreak};
pub use crate::error::{AllocError, InitError};
pub use crate::frame_alloc::BitmapFrameAllocator;
pub use crate::kmalloc::{Kmalloc, KmallocStats};
pub use crate::memory::MemoryCore;
pub use crate::mm::MemoryManager;
pub use crate::vmalloc::{Vmalloc, VmallocStats};
