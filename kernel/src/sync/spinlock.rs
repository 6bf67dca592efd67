// =============================================================================
// CoralOS — Interrupt-Saving Spinlock
// =============================================================================
//
// Mutual exclusion for the kernel's shared state. The machine runs one
// cooperative CPU, so the lock never actually spins against another
// core; what it must handle is an interrupt handler touching the same
// data as the code it interrupted. Acquiring therefore saves the
// interrupt flag and disables interrupts, and releasing restores the
// saved state, so nested lock/unlock pairs behave correctly:
//
//   - interrupts enabled on entry  → disabled while held, re-enabled after
//   - interrupts already disabled  → stay disabled after release
//
// =============================================================================

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, Ordering};

/// A spinlock that disables interrupts while held.
///
/// # Examples
/// ```ignore
/// static COUNTER: SpinLock<u64> = SpinLock::new(0);
///
/// {
///     let mut guard = COUNTER.lock();
///     *guard += 1;
/// } // Lock released when the guard goes out of scope
/// ```
pub struct SpinLock<T> {
    locked: AtomicBool,

    /// The protected data. UnsafeCell is required because we mutate
    /// through a shared reference (the lock ensures exclusive access at
    /// runtime).
    data: UnsafeCell<T>,
}

// SAFETY: the lock hands out access to one holder at a time, so sharing
// the lock is as safe as sending T.
unsafe impl<T: Send> Send for SpinLock<T> {}
unsafe impl<T: Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    /// Creates a new unlocked spinlock. `const` so spinlocks can back
    /// statics.
    pub const fn new(value: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            data: UnsafeCell::new(value),
        }
    }

    /// Acquires the lock, disabling interrupts first. The returned guard
    /// gives `Deref`/`DerefMut` access and releases on drop.
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        let irq_was_enabled = khal::irq::save_and_disable();

        // Acquire ordering makes the previous holder's writes visible
        // before we touch the data.
        while self.locked.swap(true, Ordering::Acquire) {
            core::hint::spin_loop();
        }

        SpinLockGuard {
            lock: self,
            irq_was_enabled,
        }
    }

    /// Mutable access without locking; `&mut self` already proves
    /// exclusivity. Useful during single-threaded boot.
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }
}

/// RAII guard for a held spinlock. Dropping it releases the lock and
/// restores the saved interrupt state.
pub struct SpinLockGuard<'a, T> {
    lock: &'a SpinLock<T>,
    irq_was_enabled: bool,
}

impl<T> Deref for SpinLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: we hold the lock, so access is exclusive.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: we hold the lock, so access is exclusive.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for SpinLockGuard<'_, T> {
    fn drop(&mut self) {
        // Release ordering publishes our writes to the next holder.
        self.lock.locked.store(false, Ordering::Release);
        khal::irq::restore_interrupts(self.irq_was_enabled);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guard_gives_exclusive_access() {
        // Locking toggles the simulated interrupt flag, so serialize
        // with the other machine-touching tests.
        let _m = khal::sim::lock();
        let lock = SpinLock::new(7);
        {
            let mut guard = lock.lock();
            *guard += 1;
        }
        assert_eq!(*lock.lock(), 8);
    }

    #[test]
    fn interrupt_state_round_trips() {
        let _m = khal::sim::lock();
        khal::sim::reset();
        let lock = SpinLock::new(());

        khal::irq::enable_interrupts();
        {
            let _guard = lock.lock();
            assert!(!khal::irq::interrupts_enabled());
        }
        assert!(khal::irq::interrupts_enabled());

        khal::irq::disable_interrupts();
        {
            let _guard = lock.lock();
            assert!(!khal::irq::interrupts_enabled());
        }
        assert!(!khal::irq::interrupts_enabled());
    }
}
