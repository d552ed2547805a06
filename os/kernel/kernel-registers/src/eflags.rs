#[cfg(all(feature = "asm", target_arch = "x86"))]
use crate::LoadRegisterUnsafe;
use bitfield_struct::bitfield;

/// Architectural EFLAGS model for i386.
///
/// Only the interrupt flag matters to the memory core; the remaining bits
/// are modeled so a loaded value round-trips unchanged.
#[bitfield(u32, order = Lsb)]
#[derive(PartialEq, Eq)]
pub struct Eflags {
    /// Carry Flag
    pub cf_carry: bool, // 0

    /// Always 1.
    #[bits(default = true)]
    _always1: bool, // 1

    /// Parity Flag
    pub pf_parity: bool, // 2

    #[bits(default = false)]
    _rsvd3: bool, // 3

    /// Adjust Flag
    pub af_adjust: bool, // 4

    #[bits(default = false)]
    _rsvd5: bool, // 5

    /// Zero Flag
    pub zf_zero: bool, // 6

    /// Sign Flag
    pub sf_sign: bool, // 7

    /// Trap Flag
    pub tf_trap: bool, // 8

    /// Interrupt Enable Flag
    pub if_interrupt_enable: bool, // 9

    /// Direction Flag
    pub df_direction: bool, // 10

    /// Overflow Flag
    pub of_overflow: bool, // 11

    /// I/O Privilege Level (2 bits)
    #[bits(2)]
    pub iopl: u8, // 12–13

    /// Nested Task
    pub nt_nested: bool, // 14

    #[bits(default = false)]
    _rsvd15: bool, // 15

    /// Resume Flag
    pub rf_resume: bool, // 16

    /// Virtual 8086 mode
    pub vm_virtual_8086: bool, // 17

    /// Alignment Check
    pub ac_alignment_check: bool, // 18

    /// Virtual Interrupt Flag
    pub vif_virtual_interrupt: bool, // 19

    /// Virtual Interrupt Pending
    pub vip_virtual_interrupt_pending: bool, // 20

    /// ID Flag: allows toggling CPUID.
    pub id_cpuid: bool, // 21

    /// Reserved 22–31 (all zero)
    #[bits(10, default = 0)]
    _reserved_rest: u16,
}

#[cfg(all(feature = "asm", target_arch = "x86"))]
impl LoadRegisterUnsafe for Eflags {
    unsafe fn load_unsafe() -> Self {
        let r: u32;
        unsafe { core::arch::asm!("pushfd; pop {}", out(reg) r, options(preserves_flags)) }
        Self::from_bits(r)
    }
}

/// Disables hardware interrupts (`cli`).
///
/// # Safety
/// Must only be called in contexts where `cli` is permitted (ring 0).
#[cfg(all(feature = "asm", target_arch = "x86"))]
#[inline]
pub unsafe fn cli_stop_interrupts() {
    unsafe { core::arch::asm!("cli", options(nomem, nostack)) }
}

/// Enables hardware interrupts (`sti`).
///
/// # Safety
/// Must only be called in contexts where `sti` is permitted (ring 0).
#[cfg(all(feature = "asm", target_arch = "x86"))]
#[inline]
pub unsafe fn sti_enable_interrupts() {
    unsafe { core::arch::asm!("sti", options(nomem, nostack)) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interrupt_flag_is_bit_9() {
        let flags = Eflags::new().with_if_interrupt_enable(true);
        assert_eq!(flags.into_bits(), 0x0000_0202);
        assert!(!Eflags::from_bits(0x0000_0002).if_interrupt_enable());
    }
}
