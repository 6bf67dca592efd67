//! Threads — the unit of cooperative dispatch.
//!
//! A thread is a stack plus the stack pointer saved the last time it
//! gave up the CPU. Dispatch swaps stacks through the khal primitive;
//! control returns to the suspended point when some later dispatch
//! swaps back. There is no preemption: a thread runs until it yields.

use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

// ── Thread identifiers ──────────────────────────────────────────

/// Monotonically increasing thread id counter.
static NEXT_ID: AtomicUsize = AtomicUsize::new(1);

/// The thread currently executing on the CPU.
static CURRENT: AtomicPtr<Thread> = AtomicPtr::new(ptr::null_mut());

// ── Thread ──────────────────────────────────────────────────────

/// A dispatchable thread of control.
pub struct Thread {
    /// Unique identifier, for logs and diagnostics.
    id: usize,
    /// Saved stack pointer while the thread is not running. Written by
    /// the stack switch when the thread is suspended.
    saved_sp: usize,
}

impl Thread {
    /// Creates a thread that will begin executing `entry` on `stack`
    /// when first dispatched to. `entry` must never return; a finished
    /// thread hands off by terminating itself and yielding.
    pub fn new(entry: extern "C" fn() -> !, stack: &'static mut [u8]) -> Thread {
        let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
        let saved_sp = initial_stack(entry, stack);
        Thread { id, saved_sp }
    }

    pub fn id(&self) -> usize {
        self.id
    }
}

/// Lays the stack out as if the stack switch had suspended the thread on
/// its way into `entry`, so the first dispatch pops four zeroed
/// callee-saved registers and returns into the entry function:
///
///   [sp + 0]   edi
///   [sp + 4]   esi
///   [sp + 8]   ebx
///   [sp + 12]  ebp
///   [sp + 16]  return address -> entry
#[cfg(target_arch = "x86")]
fn initial_stack(entry: extern "C" fn() -> !, stack: &'static mut [u8]) -> usize {
    let top = (stack.as_mut_ptr() as usize + stack.len()) & !0xF;
    let sp = top - 5 * core::mem::size_of::<usize>();
    // SAFETY: the layout above fits any stack the assertion admits.
    assert!(sp > stack.as_ptr() as usize, "thread stack too small");
    unsafe {
        let words = sp as *mut usize;
        for i in 0..4 {
            words.add(i).write(0);
        }
        words.add(4).write(entry as usize);
    }
    sp
}

/// Hosted builds never run on a prepared stack; dispatch is journaled
/// instead of performed.
#[cfg(not(target_arch = "x86"))]
fn initial_stack(_entry: extern "C" fn() -> !, _stack: &'static mut [u8]) -> usize {
    0
}

// ── Current-thread tracking and dispatch ────────────────────────

/// The thread currently on the CPU, if the thread system is up.
pub fn current() -> Option<NonNull<Thread>> {
    NonNull::new(CURRENT.load(Ordering::SeqCst))
}

/// Declares `thread` to be the one executing right now. Boot calls this
/// once for the bootstrap thread before the first dispatch.
///
/// # Safety
///
/// `thread` must stay at this address for as long as it can be the
/// dispatch source or target.
pub unsafe fn make_current(thread: &mut Thread) {
    CURRENT.store(thread, Ordering::SeqCst);
}

/// Transfers the CPU from the current thread to `next`. Returns (in the
/// old thread) when something later dispatches back to it.
///
/// # Panics
///
/// If no current thread has been declared.
pub fn dispatch_to(next: &mut Thread) {
    let new_sp = next.saved_sp;
    let prev = CURRENT.swap(next as *mut Thread, Ordering::SeqCst);
    assert!(!prev.is_null(), "dispatch with no current thread");

    #[cfg(target_arch = "x86")]
    // SAFETY: both thread records are live (scheduler queues only live
    // threads) and the stacks were prepared by `initial_stack` or by an
    // earlier suspension.
    unsafe {
        khal::switch::stack_switch(&mut (*prev).saved_sp, new_sp);
    }

    #[cfg(not(target_arch = "x86"))]
    {
        let _ = (prev, new_sp);
        // Hosted builds record the hand-off instead of switching stacks.
        khal::sim::note_dispatch(next.id);
    }
}

#[cfg(test)]
pub(crate) fn reset_current() {
    CURRENT.store(ptr::null_mut(), Ordering::SeqCst);
}
