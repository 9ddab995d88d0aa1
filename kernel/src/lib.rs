//! Corvid kernel core
//!
//! The scheduling and virtual-memory heart of the Corvid teaching kernel:
//! a 64-level priority scheduler with nested priority donation and an MLFQS
//! feedback mode, and a VM core built around a frame table with a
//! frame-locking protocol, second-chance page replacement, an interval-tree
//! swap allocator and a shared mmap registry.
//!
//! The crate is `no_std` + `alloc`. On hosted targets the standard library
//! supplies the allocator and the standard `#[test]` harness runs the test
//! suite; nothing here depends on bare-metal services. Boot, interrupt
//! dispatch, the ELF loader and the real filesystem live outside this crate;
//! their interfaces are consumed through the `fs` shims and the explicit
//! subsystem handles ([`sched::Scheduler`], [`mm::Vm`]).

#![no_std]

extern crate alloc;

#[cfg(test)]
extern crate std;

pub mod error;
pub mod fs;
pub mod mm;
pub mod sched;
pub mod sync;

pub use error::KernelError;
