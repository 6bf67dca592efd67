//! The simulated machine used by hosted builds.
//!
//! The kernel core is exercised by `cargo test` on the build host, where
//! none of the x86 privileged state exists. This module stands in for it:
//!
//! - a register file for CR0/CR2/CR3 and the interrupt flag,
//! - a flat port space with a pluggable input hook so tests can model a
//!   device (for example an ATA status register that turns ready after a
//!   few polls),
//! - a journal of port writes and of thread dispatches.
//!
//! State is process-global, so tests that touch the machine serialize
//! through [`lock`] and call [`reset`] before driving it.

use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use spin::{Mutex, MutexGuard};

static CR0: AtomicUsize = AtomicUsize::new(0);
static CR2: AtomicUsize = AtomicUsize::new(0);
static CR3: AtomicUsize = AtomicUsize::new(0);
static INTERRUPT_FLAG: AtomicBool = AtomicBool::new(false);

/// Serializes tests that drive the simulated machine.
static MACHINE: Mutex<()> = Mutex::new(());

/// Acquires the machine for one test. Hold the guard for the whole test
/// body; the global register file and journals are shared process-wide.
pub fn lock() -> MutexGuard<'static, ()> {
    MACHINE.lock()
}

/// Resets every simulated register, port and journal to power-on state.
pub fn reset() {
    CR0.store(0, Ordering::SeqCst);
    CR2.store(0, Ordering::SeqCst);
    CR3.store(0, Ordering::SeqCst);
    INTERRUPT_FLAG.store(false, Ordering::SeqCst);
    let mut ports = PORTS.lock();
    ports.len = 0;
    ports.in_hook = None;
    ports.out_len = 0;
    DISPATCHES.lock().len = 0;
}

pub fn cr0() -> usize {
    CR0.load(Ordering::SeqCst)
}

pub fn set_cr0(value: usize) {
    CR0.store(value, Ordering::SeqCst);
}

pub fn cr2() -> usize {
    CR2.load(Ordering::SeqCst)
}

/// Latches a fault address, as the CPU would on a page fault.
pub fn set_cr2(value: usize) {
    CR2.store(value, Ordering::SeqCst);
}

pub fn cr3() -> usize {
    CR3.load(Ordering::SeqCst)
}

pub fn set_cr3(value: usize) {
    CR3.store(value, Ordering::SeqCst);
}

pub fn interrupt_flag() -> bool {
    INTERRUPT_FLAG.load(Ordering::SeqCst)
}

pub fn set_interrupt_flag(enabled: bool) {
    INTERRUPT_FLAG.store(enabled, Ordering::SeqCst);
}

// ── Port space ──────────────────────────────────────────────────

const PORT_SLOTS: usize = 32;
// Large enough for a full 256-word block transfer plus the register
// programming around it.
const OUT_LOG_CAP: usize = 512;

struct PortSpace {
    /// Sparse (port, value) pairs settable by tests and by writes.
    values: [(u16, u16); PORT_SLOTS],
    len: usize,
    /// Input hook consulted before the value table; lets tests model
    /// devices whose registers change between reads.
    in_hook: Option<fn(u16) -> Option<u16>>,
    /// Journal of (port, value) writes, oldest first.
    out_log: [(u16, u16); OUT_LOG_CAP],
    out_len: usize,
}

static PORTS: Mutex<PortSpace> = Mutex::new(PortSpace {
    values: [(0, 0); PORT_SLOTS],
    len: 0,
    in_hook: None,
    out_log: [(0, 0); OUT_LOG_CAP],
    out_len: 0,
});

/// Installs the input hook consulted on every port read.
pub fn set_in_hook(hook: fn(u16) -> Option<u16>) {
    PORTS.lock().in_hook = Some(hook);
}

/// Presets the value a port reads as (when no hook intercepts it).
pub fn set_port_value(port: u16, value: u16) {
    let mut guard = PORTS.lock();
    let ports = &mut *guard;
    for slot in ports.values[..ports.len].iter_mut() {
        if slot.0 == port {
            slot.1 = value;
            return;
        }
    }
    assert!(ports.len < PORT_SLOTS, "simulated port table full");
    ports.values[ports.len] = (port, value);
    ports.len += 1;
}

pub(crate) fn port_read(port: u16) -> u16 {
    let ports = PORTS.lock();
    if let Some(hook) = ports.in_hook {
        if let Some(value) = hook(port) {
            return value;
        }
    }
    ports.values[..ports.len]
        .iter()
        .find(|(p, _)| *p == port)
        .map(|(_, v)| *v)
        .unwrap_or(0)
}

pub(crate) fn port_write(port: u16, value: u16) {
    // Writes are journaled, not echoed into the read table: a device's
    // command register and status register share a port number, so a
    // write must not disturb what the port reads back as.
    let mut ports = PORTS.lock();
    if ports.out_len < OUT_LOG_CAP {
        let at = ports.out_len;
        ports.out_log[at] = (port, value);
        ports.out_len = at + 1;
    }
}

/// Runs `f` over the journal of port writes made since the last reset.
pub fn with_port_writes<R>(f: impl FnOnce(&[(u16, u16)]) -> R) -> R {
    let ports = PORTS.lock();
    f(&ports.out_log[..ports.out_len])
}

// ── Dispatch journal ────────────────────────────────────────────

const DISPATCH_CAP: usize = 64;

struct DispatchJournal {
    ids: [usize; DISPATCH_CAP],
    len: usize,
}

static DISPATCHES: Mutex<DispatchJournal> = Mutex::new(DispatchJournal {
    ids: [0; DISPATCH_CAP],
    len: 0,
});

/// Records a dispatch target. The thread layer calls this instead of
/// switching stacks, which hosted builds cannot do.
pub fn note_dispatch(thread_id: usize) {
    let mut journal = DISPATCHES.lock();
    assert!(journal.len < DISPATCH_CAP, "dispatch journal full");
    let at = journal.len;
    journal.ids[at] = thread_id;
    journal.len = at + 1;
}

/// Runs `f` over the thread ids dispatched since the last reset,
/// oldest first.
pub fn with_dispatches<R>(f: impl FnOnce(&[usize]) -> R) -> R {
    let journal = DISPATCHES.lock();
    f(&journal.ids[..journal.len])
}
