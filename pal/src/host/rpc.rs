//! Registry of RPC helper threads.
//!
//! RPC helpers are untrusted threads parked outside the enclave to service
//! blocking host syscalls on behalf of enclave threads. A signal handler
//! must kick every one of them with the dummy signal before re-raising the
//! event, or a helper could stay blocked in a syscall the enclave no
//! longer waits for.

use core::sync::atomic::{AtomicI32, AtomicUsize, Ordering};

use config::host::MAX_RPC_THREADS;
use paltype::{PalError, PalResult};
use signal::HostSignal;

use super::syscall;

struct RpcQueue {
    tids: [AtomicI32; MAX_RPC_THREADS],
    count: AtomicUsize,
}

const TID_SLOT: AtomicI32 = AtomicI32::new(0);

static RPC_QUEUE: RpcQueue = RpcQueue {
    tids: [TID_SLOT; MAX_RPC_THREADS],
    count: AtomicUsize::new(0),
};

/// Registers a helper thread so signal handlers can interrupt it.
pub fn register_rpc_thread(tid: i32) -> PalResult<()> {
    let slot = RPC_QUEUE.count.fetch_add(1, Ordering::AcqRel);
    if slot >= MAX_RPC_THREADS {
        RPC_QUEUE.count.fetch_sub(1, Ordering::AcqRel);
        return Err(PalError::NoMem);
    }
    RPC_QUEUE.tids[slot].store(tid, Ordering::Release);
    Ok(())
}

/// Sends the dummy signal to every registered helper so it bails out of
/// any blocking syscall. Called from signal handlers, so everything here
/// must stay async-signal-safe.
pub fn wake_rpc_threads() {
    let count = RPC_QUEUE.count.load(Ordering::Acquire).min(MAX_RPC_THREADS);
    for slot in &RPC_QUEUE.tids[..count] {
        let tid = slot.load(Ordering::Acquire);
        if tid != 0 {
            syscall::tkill(tid, HostSignal::Usr2.number() as usize).ok();
        }
    }
}

#[cfg(test)]
pub(crate) fn registered_rpc_threads() -> usize {
    RPC_QUEUE.count.load(Ordering::Acquire).min(MAX_RPC_THREADS)
}

#[cfg(test)]
mod tests {
    use super::*;

    // The registry is global, so this only checks monotonic bookkeeping;
    // waking is not exercised here (it would signal real threads).
    #[test]
    fn registration_is_recorded() {
        let before = registered_rpc_threads();
        register_rpc_thread(0x7fff_0001).unwrap();
        assert!(registered_rpc_threads() > before);
    }
}
