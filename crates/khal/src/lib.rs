//! Hardware abstraction layer for the CoralOS core.
//!
//! Everything the kernel needs from the machine goes through this crate:
//! port-mapped I/O, control-register access, the interrupt flag, the raw
//! stack-switch primitive behind thread dispatch, and the COM1 text sink.
//!
//! On `target_arch = "x86"` each primitive is a thin inline-assembly
//! wrapper. On every other architecture the crate provides a simulated
//! machine (a register file, a flat port space with a pluggable device
//! hook, and a dispatch journal) so the kernel's own code and tests run
//! unchanged under the host test harness. The simulation lives in [`sim`].

#![no_std]

pub mod cpu;
pub mod irq;
pub mod port;
pub mod serial;

#[cfg(target_arch = "x86")]
pub mod switch;

#[cfg(not(target_arch = "x86"))]
pub mod sim;
