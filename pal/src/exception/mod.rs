//! In-enclave exception dispatch.
//!
//! An AEX lands here exactly once per event with the exit-info word, the
//! saved hardware context and the saved extended state. The dispatcher
//! classifies the event, emulates the handful of instructions SGX forbids,
//! refuses to survive synchronous faults in its own text, and hands
//! everything else to the upcall the LibOS registered. This code runs in
//! exception context: it must not block and must not fault.

use core::sync::atomic::{AtomicBool, Ordering};

use bitfield_struct::bitfield;
use crate_interface::call_interface;
#[allow(unused_imports)]
use paltype::kinterface::PalPlatform;
use paltype::kinterface::__PalPlatform_mod;
use paltype::{PalError, PalEvent};
use spin::Once;

use crate::host::syscall;

pub mod context;
pub mod insn;
pub mod upcall;

pub use context::{
    restore_pal_context, restore_sgx_context, save_pal_context, write_back_pal_context,
    init_xsave, PalContext, SgxCpuContext, XregsState, PAL_XSTATE_ALIGN,
};
pub use upcall::{event_upcall, set_event_upcall, EventUpcall};

use insn::{UdInstruction, MAX_OPCODE_PEEK};

/// The EXITINFO word the hardware leaves in the SSA on an AEX. With
/// `valid` clear the word is instead a PAL event number injected by the
/// untrusted bridge.
#[bitfield(u32)]
pub struct SgxExitInfo {
    #[bits(8)]
    pub vector: u8,
    /// 0x3 for a hardware exception, 0x6 for a software one.
    #[bits(3)]
    pub exit_type: u8,
    #[bits(20)]
    __: u32,
    pub valid: bool,
}

/// Exception vectors reported in EXITINFO.
mod vector {
    pub const DE: u8 = 0; // divide error
    pub const DB: u8 = 1; // debug
    pub const BP: u8 = 3; // breakpoint
    pub const BR: u8 = 5; // bound range exceeded
    pub const UD: u8 = 6; // invalid opcode
    pub const MF: u8 = 16; // x87 floating-point
    pub const AC: u8 = 17; // alignment check
    pub const XM: u8 = 19; // SIMD floating-point
}

static PAL_TEXT: Once<(usize, usize)> = Once::new();

/// Records the trusted PAL text range; synchronous faults inside it are
/// unrecoverable. Call once at startup.
pub fn init_pal_text(start: usize, end: usize) {
    PAL_TEXT.call_once(|| (start, end));
}

fn addr_in_pal(addr: usize) -> bool {
    PAL_TEXT
        .get()
        .is_some_and(|&(start, end)| addr > start && addr < end)
}

/// What to do with a classified AEX.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Classified {
    /// Marshal and dispatch to the registered upcall.
    Event(PalEvent),
    /// #BR reports past the last real event slot: take the full dispatch
    /// path, where no upcall will be found.
    NumBound,
    /// Resume silently without involving the LibOS.
    Resume,
}

pub(crate) fn classify(exit_info: u32, uc: &mut SgxCpuContext) -> Classified {
    let info = SgxExitInfo::from_bits(exit_info);

    if !info.valid() {
        return match PalEvent::from_u32(exit_info) {
            Some(event) => Classified::Event(event),
            None => Classified::Resume,
        };
    }

    match info.vector() {
        vector::BR => Classified::NumBound,
        vector::UD => {
            if handle_ud(uc) {
                Classified::Resume
            } else {
                Classified::Event(PalEvent::Illegal)
            }
        }
        vector::DE | vector::MF | vector::XM => Classified::Event(PalEvent::ArithmeticError),
        vector::AC => Classified::Event(PalEvent::MemFault),
        vector::DB | vector::BP => Classified::Resume,
        _ => Classified::Resume,
    }
}

/// Returns true if the #UD was handled and execution can continue without
/// propagating it; false if the exception must be raised to the LibOS.
fn handle_ud(uc: &mut SgxCpuContext) -> bool {
    let code = unsafe { core::slice::from_raw_parts(uc.rip as *const u8, MAX_OPCODE_PEEK) };
    let instr = UdInstruction::decode(code);
    match instr {
        UdInstruction::Cpuid => {
            let leaf = (uc.rax & 0xffff_ffff) as u32;
            let subleaf = (uc.rcx & 0xffff_ffff) as u32;
            if let Ok(words) = call_interface!(PalPlatform::cpuid(leaf, subleaf)) {
                uc.rip += instr.emulated_len();
                uc.rax = words[0] as u64;
                uc.rbx = words[1] as u64;
                uc.rcx = words[2] as u64;
                uc.rdx = words[3] as u64;
                return true;
            }
            false
        }
        UdInstruction::Rdtsc => {
            emulate_rdtsc_and_print_warning(uc);
            uc.rip += instr.emulated_len();
            true
        }
        UdInstruction::Rdtscp => {
            emulate_rdtsc_and_print_warning(uc);
            uc.rip += instr.emulated_len();
            // Dummy IA32_TSC_AUX; Linux encodes (numa_id << 12) | cpu_id.
            uc.rcx = 0;
            true
        }
        UdInstruction::FsGsBase => {
            log::error!(
                "[handle_ud] {{RD,WR}}{{FS,GS}}BASE instructions are not permitted on this \
                 platform"
            );
            false
        }
        UdInstruction::Syscall => {
            // The LibOS may know how to handle this.
            false
        }
        UdInstruction::Unknown => {
            log::error!("[handle_ud] unknown or illegal instruction at RIP {:#018x}", uc.rip);
            false
        }
    }
}

fn emulate_rdtsc_and_print_warning(uc: &mut SgxCpuContext) {
    static PRINTED: AtomicBool = AtomicBool::new(false);
    if !PRINTED.swap(true, Ordering::Relaxed) {
        log::warn!(
            "all RDTSC/RDTSCP instructions are emulated (imprecisely) via the system time oracle"
        );
    }

    let usec = match call_interface!(PalPlatform::system_time_us()) {
        Ok(usec) => usec,
        Err(_) => {
            log::error!("[emulate_rdtsc] time query failed in unrecoverable context, exiting");
            syscall::exit_group(1);
        }
    };
    // Scaling microseconds back to TSC cycles is not possible here.
    uc.rdx = usec >> 32;
    uc.rax = usec & 0xffff_ffff;
}

/// Marshals the context, invokes the registered upcall (when any) and
/// returns the possibly handler-modified context.
pub(crate) fn deliver_event(
    event: Option<PalEvent>,
    info: SgxExitInfo,
    uc: &SgxCpuContext,
    xregs: *mut XregsState,
) -> PalContext {
    let mut ctx = save_pal_context(uc, xregs);
    // EXINFO from the MISC region is not captured yet, so the fault
    // details stay zeroed.
    ctx.err = 0;
    ctx.trapno = if info.valid() { info.vector() as u64 } else { 0 };
    ctx.oldmask = 0;
    ctx.cr2 = 0;

    if let Some(event) = event {
        let arg = match event {
            PalEvent::Illegal => uc.rip,
            // SGX1 does not report the faulting address.
            PalEvent::MemFault => 0,
            _ => 0,
        };
        if let Some(upcall) = event_upcall(event) {
            upcall(addr_in_pal(uc.rip as usize), arg, Some(&mut ctx));
        }
    }

    ctx
}

/// Performs exception handling inside the enclave.
///
/// # Safety
/// Must be entered from the AEX path with the hardware context and the
/// 64-byte-aligned extended state the entry stub saved on this thread's
/// enclave stack.
pub unsafe fn handle_exception(exit_info: u32, uc: &mut SgxCpuContext, xregs: *mut XregsState) -> ! {
    debug_assert!(xregs as usize % PAL_XSTATE_ALIGN == 0);

    let info = SgxExitInfo::from_bits(exit_info);
    let event = match classify(exit_info, uc) {
        Classified::Resume => unsafe { restore_sgx_context(uc, Some(xregs)) },
        Classified::Event(event) => Some(event),
        Classified::NumBound => None,
    };

    if addr_in_pal(uc.rip as usize)
        && event.is_none_or(|e| !e.is_async())
    {
        fatal_pal_exception(info, exit_info, uc);
    }

    let ctx = deliver_event(event, info, uc, xregs);
    unsafe { restore_pal_context(uc, &ctx) }
}

/// A synchronous exception hit the trusted runtime itself: dump the state
/// and exit the enclave.
fn fatal_pal_exception(info: SgxExitInfo, raw_exit_info: u32, uc: &SgxCpuContext) -> ! {
    let text_start = PAL_TEXT.get().map_or(0, |&(start, _)| start);
    log::error!(
        "*** Unexpected exception occurred inside PAL at RIP = +{:#010x}! ***",
        uc.rip as usize - text_start
    );
    if info.valid() {
        // vector = exception number, exit_type = 0x3 for HW / 0x6 for SW
        log::error!(
            "(SGX HW reported AEX vector {:#x} with exit_type = {:#x})",
            info.vector(),
            info.exit_type()
        );
    } else {
        log::error!("(untrusted PAL sent PAL event {:#x})", raw_exit_info);
    }
    log::error!(
        "rax: {:#010x} rcx: {:#010x} rdx: {:#010x} rbx: {:#010x}",
        uc.rax,
        uc.rcx,
        uc.rdx,
        uc.rbx
    );
    log::error!(
        "rsp: {:#010x} rbp: {:#010x} rsi: {:#010x} rdi: {:#010x}",
        uc.rsp,
        uc.rbp,
        uc.rsi,
        uc.rdi
    );
    log::error!(
        "r8 : {:#010x} r9 : {:#010x} r10: {:#010x} r11: {:#010x}",
        uc.r8,
        uc.r9,
        uc.r10,
        uc.r11
    );
    log::error!(
        "r12: {:#010x} r13: {:#010x} r14: {:#010x} r15: {:#010x}",
        uc.r12,
        uc.r13,
        uc.r14,
        uc.r15
    );
    log::error!("rflags: {:#010x} rip: {:#010x}", uc.rflags, uc.rip);

    // ocall_exit in a full deployment.
    syscall::exit_group(1);
}

/// Raises a FAILURE upcall so a blocked PAL call can unwind with `err`.
pub fn raise_failure(err: PalError) {
    if let Some(upcall) = event_upcall(PalEvent::Failure) {
        upcall(/*is_in_pal=*/ false, err.code() as u64, None);
    }
}

/// The part of external-event handling that precedes the resume: tell the
/// LibOS the PAL was interrupted, then marshal and dispatch.
pub(crate) fn external_event_context(
    event: PalEvent,
    uc: &SgxCpuContext,
    xregs: *mut XregsState,
) -> PalContext {
    // The thread was interrupted during a host syscall; let any blocked
    // PAL call unwind before the event handler runs.
    raise_failure(PalError::Interrupted);

    let mut ctx = save_pal_context(uc, xregs);
    if let Some(upcall) = event_upcall(event) {
        upcall(addr_in_pal(uc.rip as usize), 0, Some(&mut ctx));
    }
    ctx
}

/// Entered when the untrusted bridge re-enters the enclave with an event
/// number instead of a hardware exception.
///
/// Modifications the handler makes to the marshalled context are
/// DISCARDED: the event may have landed while the thread was in PAL code,
/// whose state must resume unchanged.
///
/// # Safety
/// See [`handle_exception`].
pub unsafe fn handle_external_event(
    event: PalEvent,
    uc: &mut SgxCpuContext,
    xregs: *mut XregsState,
) -> ! {
    debug_assert!(xregs as usize % PAL_XSTATE_ALIGN == 0);

    let _ = external_event_context(event, uc, xregs);
    unsafe { restore_sgx_context(uc, Some(xregs)) }
}
