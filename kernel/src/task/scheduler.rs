//! The cooperative FIFO scheduler.
//!
//! One ready queue, strict arrival order, no priorities, no preemption.
//! Control moves only at explicit yield points, and a yielding thread is
//! not re-queued automatically: a thread that wants to keep running adds
//! itself back before yielding.

use arrayvec::ArrayVec;

use crate::sync::spinlock::SpinLock;
use crate::task::thread::{self, Thread};

/// Upper bound on simultaneously runnable threads.
const MAX_READY: usize = 32;

/// The ready queue. One instance serves the whole machine; see the
/// module-level entry points below.
pub struct Scheduler {
    ready: ArrayVec<*mut Thread, MAX_READY>,
}

// SAFETY: the queue stores thread addresses, dereferenced only from the
// single cooperative CPU.
unsafe impl Send for Scheduler {}

impl Scheduler {
    pub const fn new() -> Scheduler {
        Scheduler {
            ready: ArrayVec::new_const(),
        }
    }

    /// Appends a newly runnable thread at the tail.
    ///
    /// # Panics
    ///
    /// If the ready queue is full.
    pub fn add(&mut self, thread: *mut Thread) {
        assert!(
            self.ready.try_push(thread).is_ok(),
            "ready queue full ({} threads)",
            MAX_READY
        );
    }

    /// Queues a thread that was running and is runnable again. Same
    /// position as [`add`]; the two names exist because callers
    /// distinguish the cases.
    ///
    /// [`add`]: Scheduler::add
    pub fn resume(&mut self, thread: *mut Thread) {
        self.add(thread);
    }

    /// Removes every queued occurrence of `thread`.
    pub fn terminate(&mut self, thread: *mut Thread) {
        self.ready.retain(|&mut queued| queued != thread);
    }

    fn pop_front(&mut self) -> Option<*mut Thread> {
        if self.ready.is_empty() {
            None
        } else {
            Some(self.ready.remove(0))
        }
    }
}

static SCHEDULER: SpinLock<Scheduler> = SpinLock::new(Scheduler::new());

// ── Module-level entry points over the global queue ─────────────

/// Makes `thread` runnable, at the tail of the ready queue.
pub fn add(thread: &mut Thread) {
    SCHEDULER.lock().add(thread);
}

/// Makes a previously running `thread` runnable again.
pub fn resume(thread: &mut Thread) {
    SCHEDULER.lock().resume(thread);
}

/// Removes `thread` from the ready queue entirely.
pub fn terminate(thread: &mut Thread) {
    SCHEDULER.lock().terminate(thread);
}

/// Gives up the CPU to the head of the ready queue. With an empty queue
/// this simply returns to the caller; an idle machine is an expected
/// condition, not an error.
///
/// The queue lock is dropped before the dispatch so the incoming thread
/// starts with the scheduler available.
pub fn yield_now() {
    let next = SCHEDULER.lock().pop_front();
    if let Some(next) = next {
        // SAFETY: only live threads are queued; the pointer came off the
        // queue under the lock.
        thread::dispatch_to(unsafe { &mut *next });
    }
}

#[cfg(test)]
pub(crate) fn reset_queue() {
    SCHEDULER.lock().ready.clear();
}
