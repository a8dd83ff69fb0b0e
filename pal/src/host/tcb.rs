//! Untrusted per-thread control block.
//!
//! Each host thread driving an enclave thread keeps its bookkeeping in a
//! TCB reachable through the `gs` segment register, so signal handlers can
//! find it without any global lookup.

use paltype::{PalError, PalResult};

use super::syscall;

const ARCH_SET_GS: usize = 0x1001;

#[repr(C)]
pub struct UrtsTcb {
    /// Points back at this TCB; `gs:0` loads it.
    pub self_ptr: *mut UrtsTcb,
    /// TCS page of the enclave thread this host thread drives.
    pub tcs: usize,
    /// Synchronous signals re-raised into the enclave on this thread.
    pub sync_signal_cnt: u64,
    /// Asynchronous signals re-raised into the enclave on this thread.
    pub async_signal_cnt: u64,
}

/// Installs `tcb` as this thread's control block.
///
/// # Safety
/// `tcb` must stay valid and exclusive to this thread for its lifetime;
/// the `gs` base is repointed at it.
pub unsafe fn set_tcb_urts(tcb: *mut UrtsTcb) -> PalResult<()> {
    unsafe {
        (*tcb).self_ptr = tcb;
        syscall::arch_prctl(ARCH_SET_GS, tcb as usize).map_err(PalError::from_unix)?;
    }
    Ok(())
}

/// This thread's control block; null before [`set_tcb_urts`].
#[cfg(target_arch = "x86_64")]
pub fn get_tcb_urts() -> *mut UrtsTcb {
    let tcb: *mut UrtsTcb;
    unsafe {
        core::arch::asm!(
            "mov {tcb}, qword ptr gs:[0]",
            tcb = out(reg) tcb,
            options(nostack, readonly),
        );
    }
    tcb
}
