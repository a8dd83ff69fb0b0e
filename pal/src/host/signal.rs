//! Host signal bridge.
//!
//! The host kernel delivers every signal aimed at enclave code to these
//! untrusted handlers. Synchronous exceptions are expected to originate
//! from enclave execution via AEX and are re-raised into the enclave as
//! PAL events; asynchronous ones may land at any time and are either
//! re-raised the same way or, when they interrupted untrusted PAL code in
//! a host syscall, turned into a simulated `-EINTR` return.

use bitflags::bitflags;
use paltype::{PalError, PalEvent, PalResult};
use signal::{HostSignal, SigSet};

use super::entry;
use super::rpc::wake_rpc_threads;
use super::syscall;
use super::tcb::get_tcb_urts;
use super::ucontext::{HostSigInfo, Ucontext};

bitflags! {
    #[derive(Clone, Copy, Debug)]
    struct SaFlags: u64 {
        const SIGINFO  = 0x4;
        const RESTORER = 0x0400_0000;
        const ONSTACK  = 0x0800_0000;
    }
}

/// Kernel `struct sigaction` for `rt_sigaction`.
#[repr(C)]
struct KernelSigaction {
    handler: usize,
    flags: u64,
    restorer: usize,
    mask: u64,
}

const SIG_IGN: usize = 1;

const SIG_BLOCK: usize = 0;
const SIG_UNBLOCK: usize = 1;

const SIGSET_SIZE: usize = 8;

const EINTR: i64 = 4;

/// Signals that may arrive at any time, as opposed to exceptions raised by
/// the faulting instruction itself.
const ASYNC_SIGNALS: [HostSignal; 2] = [HostSignal::Term, HostSignal::Cont];

// x86-64 kernels require sigaction to carry a user-provided restorer.
#[cfg(target_arch = "x86_64")]
core::arch::global_asm!(
    r#"
    .text
    .align 16
    .global __restore_rt
    .type __restore_rt, @function
__restore_rt:
    mov rax, 15
    syscall
"#
);

#[cfg(target_arch = "x86_64")]
unsafe extern "C" {
    fn __restore_rt();
}

fn block_signal(sig: HostSignal, block: bool) -> PalResult<()> {
    let how = if block { SIG_BLOCK } else { SIG_UNBLOCK };
    let mask = SigSet::from(sig);
    unsafe {
        syscall::rt_sigprocmask(how, &mask.bits() as *const u64 as usize, 0, SIGSET_SIZE)
            .map_err(PalError::from_unix)?;
    }
    Ok(())
}

/// Blocks or unblocks the asynchronous signal set; the enclave asks for
/// this around its own exception handling to forbid re-entry.
pub fn block_async_signals(block: bool) -> PalResult<()> {
    for sig in ASYNC_SIGNALS {
        block_signal(sig, block)?;
    }
    Ok(())
}

/// The mask every handler runs with: nested asynchronous delivery is
/// forbidden while an enclave exception is being bridged.
fn handler_mask() -> SigSet {
    let mut mask = SigSet::empty();
    for sig in ASYNC_SIGNALS {
        mask |= SigSet::from(sig);
    }
    mask
}

fn set_signal_handler(sig: HostSignal, handler: usize) -> PalResult<()> {
    let action = KernelSigaction {
        handler,
        flags: (SaFlags::SIGINFO | SaFlags::ONSTACK | SaFlags::RESTORER).bits(),
        restorer: __restore_rt as usize,
        mask: handler_mask().bits(),
    };
    unsafe {
        syscall::rt_sigaction(
            sig.number() as usize,
            &action as *const _ as usize,
            0,
            SIGSET_SIZE,
        )
        .map_err(PalError::from_unix)?;
    }
    block_signal(sig, /*block=*/ false)
}

/// Maps a host signal to the PAL event it is bridged as.
pub(crate) fn get_pal_event(sig: HostSignal) -> Option<PalEvent> {
    match sig {
        HostSignal::Fpe => Some(PalEvent::ArithmeticError),
        HostSignal::Segv | HostSignal::Bus => Some(PalEvent::MemFault),
        HostSignal::Ill | HostSignal::Sys => Some(PalEvent::Illegal),
        HostSignal::Term => Some(PalEvent::Quit),
        HostSignal::Cont => Some(PalEvent::Interrupted),
        _ => None,
    }
}

/// On an AEX the instruction pointer lands anywhere inside the AEP/ERESUME
/// trampoline, so an rip in that range means the signal interrupted
/// enclave execution.
pub(crate) fn rip_in_enclave_trampoline(rip: u64, range: (usize, usize)) -> bool {
    (range.0 as u64..range.1 as u64).contains(&rip)
}

fn interrupted_in_enclave(uc: &Ucontext) -> bool {
    rip_in_enclave_trampoline(uc.ip(), entry::aep_range())
}

extern "C" fn handle_sync_signal(signum: i32, _info: *mut HostSigInfo, uc: *mut Ucontext) {
    let Some(sig) = HostSignal::from_number(signum) else {
        return;
    };
    let Some(event) = get_pal_event(sig) else {
        return;
    };
    debug_assert!(sig.is_fault());
    let uc = unsafe { &mut *uc };

    // Break RPC helpers out of any outstanding blocking syscall.
    wake_rpc_threads();

    if interrupted_in_enclave(uc) {
        // The exception happened in app/LibOS/trusted PAL code; handle it
        // inside the enclave.
        let tcb = get_tcb_urts();
        if !tcb.is_null() {
            unsafe { (*tcb).sync_signal_cnt += 1 };
        }
        unsafe { entry::sgx_raise(event.code()) };
        return;
    }

    // The exception happened in untrusted PAL code during syscall
    // handling; that is unrecoverable.
    let rip = uc.ip();
    match sig {
        HostSignal::Segv => {
            log::error!("Segmentation Fault in Untrusted Code (RIP = {:#010x})", rip)
        }
        HostSignal::Ill => {
            log::error!("Illegal Instruction in Untrusted Code (RIP = {:#010x})", rip)
        }
        HostSignal::Fpe => {
            log::error!("Arithmetic Exception in Untrusted Code (RIP = {:#010x})", rip)
        }
        HostSignal::Bus => {
            log::error!("Memory Mapping Exception in Untrusted Code (RIP = {:#010x})", rip)
        }
        _ => {}
    }
    syscall::exit_group(1);
}

extern "C" fn handle_async_signal(signum: i32, _info: *mut HostSigInfo, uc: *mut Ucontext) {
    let Some(sig) = HostSignal::from_number(signum) else {
        return;
    };
    let Some(event) = get_pal_event(sig) else {
        return;
    };
    debug_assert!(!sig.is_fault());
    let uc = unsafe { &mut *uc };

    wake_rpc_threads();

    if interrupted_in_enclave(uc) {
        let tcb = get_tcb_urts();
        if !tcb.is_null() {
            unsafe { (*tcb).async_signal_cnt += 1 };
        }
        unsafe { entry::sgx_raise(event.code()) };
        return;
    }

    // The signal interrupted untrusted PAL code during a host syscall:
    // emulate an interrupted syscall by resuming at
    // sgx_entry_return(-EINTR, event).
    rewrite_for_interrupted_syscall(uc, event);
}

/// Rewrites the host context so the thread resumes at the enclave-return
/// trampoline with `(-EINTR, event)`.
pub(crate) fn rewrite_for_interrupted_syscall(uc: &mut Ucontext, event: PalEvent) {
    uc.set_function_parameters(
        entry::sgx_entry_return as usize,
        (-EINTR) as u64,
        event.code() as u64,
    );
}

extern "C" fn handle_dummy_signal(_signum: i32, _info: *mut HostSigInfo, _uc: *mut Ucontext) {
    // Needed only to interrupt blocking syscalls in RPC helper threads.
}

/// Installs every handler the bridge needs. Call once per process before
/// the first enclave entry.
pub fn sgx_signal_setup() -> PalResult<()> {
    // SIGCHLD and SIGPIPE are emulated completely inside the LibOS.
    set_signal_handler(HostSignal::Pipe, SIG_IGN)?;
    set_signal_handler(HostSignal::Chld, SIG_IGN)?;

    // Synchronous signals (exceptions).
    set_signal_handler(HostSignal::Fpe, handle_sync_signal as usize)?;
    set_signal_handler(HostSignal::Segv, handle_sync_signal as usize)?;
    set_signal_handler(HostSignal::Bus, handle_sync_signal as usize)?;
    set_signal_handler(HostSignal::Ill, handle_sync_signal as usize)?;
    set_signal_handler(HostSignal::Sys, handle_sync_signal as usize)?;

    // Asynchronous signals.
    set_signal_handler(HostSignal::Term, handle_async_signal as usize)?;
    set_signal_handler(HostSignal::Cont, handle_async_signal as usize)?;

    // SIGUSR2 is reserved for interrupting blocking syscalls in RPC helper
    // threads. It stays blocked in enclave-carrying threads; each RPC
    // thread unblocks it explicitly.
    set_signal_handler(HostSignal::Usr2, handle_dummy_signal as usize)?;
    block_signal(HostSignal::Usr2, /*block=*/ true)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signal_to_event_mapping() {
        assert_eq!(get_pal_event(HostSignal::Fpe), Some(PalEvent::ArithmeticError));
        assert_eq!(get_pal_event(HostSignal::Segv), Some(PalEvent::MemFault));
        assert_eq!(get_pal_event(HostSignal::Bus), Some(PalEvent::MemFault));
        assert_eq!(get_pal_event(HostSignal::Ill), Some(PalEvent::Illegal));
        assert_eq!(get_pal_event(HostSignal::Sys), Some(PalEvent::Illegal));
        assert_eq!(get_pal_event(HostSignal::Term), Some(PalEvent::Quit));
        assert_eq!(get_pal_event(HostSignal::Cont), Some(PalEvent::Interrupted));
        assert_eq!(get_pal_event(HostSignal::Usr2), None);
        assert_eq!(get_pal_event(HostSignal::Pipe), None);
        assert_eq!(get_pal_event(HostSignal::Chld), None);
    }

    #[test]
    fn trampoline_range_check_is_half_open() {
        let range = (0x1000, 0x1010);
        assert!(rip_in_enclave_trampoline(0x1000, range));
        assert!(rip_in_enclave_trampoline(0x100f, range));
        assert!(!rip_in_enclave_trampoline(0x1010, range));
        assert!(!rip_in_enclave_trampoline(0xfff, range));
    }

    #[test]
    fn aep_symbols_delimit_a_range() {
        let (start, end) = entry::aep_range();
        assert!(start < end);
    }

    #[test]
    fn interrupted_host_syscall_resumes_at_entry_return() {
        let mut uc = Ucontext::default();
        uc.uc_mcontext.rip = 0xdead_0000; // outside the trampoline
        rewrite_for_interrupted_syscall(&mut uc, PalEvent::Quit);

        assert_eq!(uc.ip(), entry::sgx_entry_return as u64);
        assert_eq!(uc.uc_mcontext.rdi as i64, -EINTR);
        assert_eq!(uc.uc_mcontext.rsi, PalEvent::Quit.code() as u64);
    }

    #[test]
    fn handler_mask_blocks_all_async_signals() {
        let mask = handler_mask();
        assert!(mask.contains(SigSet::TERM));
        assert!(mask.contains(SigSet::CONT));
        assert!(!mask.contains(SigSet::SEGV));
    }
}
