//! Interrupt-flag management.
//!
//! The kernel's spinlock saves the interrupt flag, disables interrupts
//! for the critical section, and restores the saved state on unlock so
//! nested lock/unlock pairs behave correctly.

/// Checks whether maskable interrupts are enabled (EFLAGS.IF, bit 9).
#[cfg(target_arch = "x86")]
#[inline(always)]
pub fn interrupts_enabled() -> bool {
    let eflags: usize;
    // SAFETY: pushfd/pop only observes EFLAGS.
    unsafe {
        core::arch::asm!(
            "pushfd",
            "pop {}",
            out(reg) eflags,
            options(nomem, preserves_flags)
        );
    }
    eflags & (1 << 9) != 0
}

/// Disables maskable interrupts on the CPU (CLI).
#[cfg(target_arch = "x86")]
#[inline(always)]
pub fn disable_interrupts() {
    // SAFETY: the kernel re-enables interrupts when restoring saved state.
    unsafe {
        core::arch::asm!("cli", options(nomem, nostack));
    }
}

/// Enables maskable interrupts on the CPU (STI).
#[cfg(target_arch = "x86")]
#[inline(always)]
pub fn enable_interrupts() {
    // SAFETY: only called when restoring a previously-enabled state.
    unsafe {
        core::arch::asm!("sti", options(nomem, nostack));
    }
}

#[cfg(not(target_arch = "x86"))]
pub fn interrupts_enabled() -> bool {
    crate::sim::interrupt_flag()
}

#[cfg(not(target_arch = "x86"))]
pub fn disable_interrupts() {
    crate::sim::set_interrupt_flag(false);
}

#[cfg(not(target_arch = "x86"))]
pub fn enable_interrupts() {
    crate::sim::set_interrupt_flag(true);
}

/// Saves the current interrupt state and disables interrupts.
///
/// Returns `true` if interrupts were enabled before the call; pass the
/// value back to [`restore_interrupts`] when leaving the critical section.
#[inline]
pub fn save_and_disable() -> bool {
    let was_enabled = interrupts_enabled();
    disable_interrupts();
    was_enabled
}

/// Restores the interrupt state saved by [`save_and_disable`].
#[inline]
pub fn restore_interrupts(was_enabled: bool) {
    if was_enabled {
        enable_interrupts();
    }
}
