//! # MMU Control
//!
//! The [`Mmu`] trait is the single seam between the paging logic and the
//! processor: the CR0 paging bit, the CR3 directory base, TLB invalidation
//! and the EFLAGS interrupt flag.
//!
//! [`PagingGuard`] scopes a window in which interrupts and paging are both
//! off, e.g. while a freshly allocated page table is initialized through its
//! physical address.

use kernel_memory_addresses::{PhysicalPage, VirtualPage};

/// Processor-side paging controls.
pub trait Mmu {
    /// `true` if CR0.PG is set.
    fn paging_enabled(&self) -> bool;

    /// Set or clear CR0.PG.
    fn set_paging_enabled(&mut self, enabled: bool);

    /// Load CR3 with the given page directory.
    fn load_page_directory(&mut self, directory: PhysicalPage);

    /// The page directory CR3 currently points at.
    fn page_directory(&self) -> PhysicalPage;

    /// Invalidate every non-global TLB entry.
    fn flush_tlb(&mut self);

    /// Invalidate the TLB entry for one page (`invlpg`).
    fn flush_page(&mut self, page: VirtualPage);

    /// `true` if EFLAGS.IF is set.
    fn interrupts_enabled(&self) -> bool;

    /// Set or clear EFLAGS.IF (`sti` / `cli`).
    fn set_interrupts_enabled(&mut self, enabled: bool);
}

/// RAII guard that disables interrupts and paging on creation and restores
/// both on drop.
///
/// Interrupts go off first and come back last, so no handler ever observes
/// the paging-off window. Each state is only restored if it was on when the
/// guard was created, so guards nest.
pub struct PagingGuard<'a, U: Mmu> {
    mmu: &'a mut U,
    paging_was_enabled: bool,
    interrupts_were_enabled: bool,
}

impl<'a, U: Mmu> PagingGuard<'a, U> {
    #[inline]
    #[must_use]
    pub fn new(mmu: &'a mut U) -> Self {
        let interrupts_were_enabled = mmu.interrupts_enabled();
        if interrupts_were_enabled {
            mmu.set_interrupts_enabled(false);
        }
        let paging_was_enabled = mmu.paging_enabled();
        if paging_was_enabled {
            mmu.set_paging_enabled(false);
        }
        Self {
            mmu,
            paging_was_enabled,
            interrupts_were_enabled,
        }
    }

    /// Access the MMU while the guard is held.
    #[inline]
    pub fn mmu(&mut self) -> &mut U {
        &mut *self.mmu
    }
}

impl<U: Mmu> Drop for PagingGuard<'_, U> {
    fn drop(&mut self) {
        if self.paging_was_enabled {
            self.mmu.set_paging_enabled(true);
        }
        if self.interrupts_were_enabled {
            self.mmu.set_interrupts_enabled(true);
        }
    }
}

/// The real processor.
///
/// # Safety
/// Every method executes privileged instructions; the kernel must run at CPL0.
#[cfg(all(feature = "asm", target_arch = "x86"))]
#[derive(Debug, Default)]
pub struct X86Mmu;

#[cfg(all(feature = "asm", target_arch = "x86"))]
impl Mmu for X86Mmu {
    fn paging_enabled(&self) -> bool {
        use kernel_registers::{Cr0, LoadRegisterUnsafe};
        unsafe { Cr0::load_unsafe() }.pg_paging()
    }

    fn set_paging_enabled(&mut self, enabled: bool) {
        use kernel_registers::{Cr0, LoadRegisterUnsafe, StoreRegisterUnsafe};
        unsafe {
            Cr0::load_unsafe().with_pg_paging(enabled).store_unsafe();
        }
    }

    fn load_page_directory(&mut self, directory: PhysicalPage) {
        use kernel_registers::{Cr3, StoreRegisterUnsafe};
        unsafe { Cr3::from_directory(directory).store_unsafe() }
    }

    fn page_directory(&self) -> PhysicalPage {
        use kernel_registers::{Cr3, LoadRegisterUnsafe};
        unsafe { Cr3::load_unsafe() }.directory_phys().frame()
    }

    fn flush_tlb(&mut self) {
        use kernel_registers::{Cr3, LoadRegisterUnsafe, StoreRegisterUnsafe};
        unsafe { Cr3::load_unsafe().store_unsafe() }
    }

    fn flush_page(&mut self, page: VirtualPage) {
        let va = page.base().as_u32();
        unsafe {
            core::arch::asm!("invlpg [{}]", in(reg) va, options(nostack, preserves_flags));
        }
    }

    fn interrupts_enabled(&self) -> bool {
        use kernel_registers::{Eflags, LoadRegisterUnsafe};
        unsafe { Eflags::load_unsafe() }.if_interrupt_enable()
    }

    fn set_interrupts_enabled(&mut self, enabled: bool) {
        use kernel_registers::eflags::{cli_stop_interrupts, sti_enable_interrupts};
        unsafe {
            if enabled {
                sti_enable_interrupts();
            } else {
                cli_stop_interrupts();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimMmu;

    #[test]
    fn guard_disables_and_restores() {
        let mut mmu = SimMmu::new();
        mmu.set_paging_enabled(true);
        assert!(mmu.interrupts_enabled());

        {
            let mut guard = PagingGuard::new(&mut mmu);
            assert!(!guard.mmu().paging_enabled());
            assert!(!guard.mmu().interrupts_enabled());
        }

        assert!(mmu.paging_enabled());
        assert!(mmu.interrupts_enabled());
    }

    #[test]
    fn guard_keeps_disabled_state_disabled() {
        let mut mmu = SimMmu::new();
        mmu.set_interrupts_enabled(false);
        let toggles = mmu.paging_toggles();

        drop(PagingGuard::new(&mut mmu));

        assert!(!mmu.paging_enabled());
        assert!(!mmu.interrupts_enabled());
        assert_eq!(mmu.paging_toggles(), toggles);
    }

    #[test]
    fn nested_guards_restore_outer_state() {
        let mut mmu = SimMmu::new();
        mmu.set_paging_enabled(true);
        {
            let mut outer = PagingGuard::new(&mut mmu);
            {
                let inner = PagingGuard::new(outer.mmu());
                drop(inner);
            }
            assert!(!outer.mmu().paging_enabled());
        }
        assert!(mmu.paging_enabled());
    }
}
