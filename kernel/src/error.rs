//! Error types for the Corvid kernel core.
//!
//! Fallible operations return these instead of panicking; panics are
//! reserved for invariant violations (kernel bugs) and for running out of
//! swap, which has no recovery path in this design.

use core::fmt;

/// Main kernel error type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "kernel errors must be handled, not silently discarded"]
pub enum KernelError {
    /// Kernel memory could not be allocated for a bookkeeping structure.
    OutOfMemory {
        what: &'static str,
    },
    /// A fixed-capacity resource ran dry.
    ResourceExhausted {
        resource: &'static str,
    },
    /// An argument was outside its documented domain.
    InvalidArgument {
        name: &'static str,
    },
    /// The named object does not exist.
    NotFound {
        resource: &'static str,
    },
    /// The operation is not permitted in the current state.
    InvalidState {
        expected: &'static str,
        actual: &'static str,
    },
    /// Simulated user code touched memory it must not touch; the owning
    /// process is to be terminated with exit status -1.
    UserFault {
        addr: u32,
    },
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KernelError::OutOfMemory { what } => write!(f, "out of memory: {}", what),
            KernelError::ResourceExhausted { resource } => {
                write!(f, "resource exhausted: {}", resource)
            }
            KernelError::InvalidArgument { name } => write!(f, "invalid argument: {}", name),
            KernelError::NotFound { resource } => write!(f, "not found: {}", resource),
            KernelError::InvalidState { expected, actual } => {
                write!(f, "invalid state: expected {}, got {}", expected, actual)
            }
            KernelError::UserFault { addr } => write!(f, "user fault at {:#x}", addr),
        }
    }
}
