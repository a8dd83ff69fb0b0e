//! Trusted enclave runtime of an SGX platform adaptation layer.
//!
//! The crate is split along the trust boundary:
//! - [`mem`], [`exception`] and [`event`] run inside the enclave: the heap
//!   page allocator with EDMM, the AEX exception dispatcher, and the
//!   stream-backed counting-semaphore event primitive.
//! - [`host`] runs outside: the signal bridge that re-raises host signals
//!   into the enclave, the raw syscall layer, and the entry trampolines.
//!
//! The LibOS sits on top of this crate: it registers event upcalls, drives
//! the page allocation API, and synchronizes over events.

#![cfg_attr(not(test), no_std)]

#[cfg(not(target_arch = "x86_64"))]
compile_error!("unsupported architecture: SGX exists only on x86-64");

extern crate alloc;

pub mod event;
pub mod exception;
pub mod host;
pub mod logging;
pub mod mem;

#[cfg(test)]
mod test_support;
