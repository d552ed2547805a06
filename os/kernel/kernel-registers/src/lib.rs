//! # Typed i386 Control Registers
//!
//! Bitfield models of the registers the paging layer touches: [`Cr0`]
//! (paging enable), [`Cr3`] (page directory base) and [`Eflags`] (interrupt
//! flag). Hardware access is only compiled for `target_arch = "x86"` with the
//! `asm` feature; elsewhere the types are plain values.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

pub mod cr0;
pub mod cr3;
pub mod eflags;

pub use crate::cr0::Cr0;
pub use crate::cr3::Cr3;
pub use crate::eflags::Eflags;

pub trait LoadRegisterUnsafe {
    /// # Safety
    /// The caller must uphold the implementation-specific safety requirements.
    /// For example, the register access might be privileged and require kernel mode (Ring 0).
    unsafe fn load_unsafe() -> Self;
}

pub trait StoreRegisterUnsafe {
    /// # Safety
    /// The caller must uphold the implementation-specific safety requirements.
    /// For example, the register access might be privileged and require kernel mode (Ring 0).
    unsafe fn store_unsafe(self);
}
