//! CPU context marshalling between the hardware AEX snapshot and the
//! Linux-signal-frame shape the LibOS consumes.
//!
//! The LibOS hands contexts produced here to application signal handlers
//! and to its own `sigreturn` emulation, so the layout (including the
//! XSAVE software-reserved bytes and the magic sentinels) must match what
//! a Linux kernel would have put in a signal frame.

use spin::Once;

pub const PAL_FP_XSTATE_MAGIC1: u32 = 0x46505853;
pub const PAL_FP_XSTATE_MAGIC2: u32 = 0x46505845;
pub const PAL_FP_XSTATE_MAGIC2_SIZE: usize = core::mem::size_of::<u32>();

/// Alignment the XSAVE family of instructions requires.
pub const PAL_XSTATE_ALIGN: usize = 64;

/// Hardware context as saved on the in-enclave stack by the AEX entry
/// path, in its push order.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SgxCpuContext {
    pub rax: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rbx: u64,
    pub rsp: u64,
    pub rbp: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rflags: u64,
    pub rip: u64,
}

/// Software-reserved bytes of the FXSAVE area, in the format Linux uses to
/// describe the extended state appended to a signal frame.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct FpxSwBytes {
    pub magic1: u32,
    pub extended_size: u32,
    pub xfeatures: u64,
    pub xstate_size: u32,
    pub padding: [u32; 7],
}

/// The 512-byte FXSAVE legacy region.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct FxsaveArea {
    pub cwd: u16,
    pub swd: u16,
    pub twd: u16,
    pub fop: u16,
    pub rip: u64,
    pub rdp: u64,
    pub mxcsr: u32,
    pub mxcsr_mask: u32,
    pub st_space: [u32; 32],
    pub xmm_space: [u32; 64],
    _reserved: [u32; 12],
    pub sw_reserved: FpxSwBytes,
}

/// XSAVE header following the legacy region.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct XsaveHeader {
    pub xstate_bv: u64,
    pub xcomp_bv: u64,
    _reserved: [u64; 6],
}

/// Extended-state area; the component data past the header is
/// CPU-dependent and addressed through the configured xsave size.
#[repr(C, align(64))]
pub struct XregsState {
    pub fpstate: FxsaveArea,
    pub header: XsaveHeader,
}

/// Legacy region size; also the xsave size reported when XSAVE is off.
pub const XSAVE_LEGACY_SIZE: usize = 512;
pub const XSAVE_HEADER_SIZE: usize = 64;

/// x87 and SSE state bits, architecturally always present.
const XFEATURE_MASK_FPSSE: u64 = 0x3;

#[derive(Clone, Copy, Debug)]
pub struct XsaveConfig {
    /// Bytes the CPU writes for the enabled feature set.
    pub size: usize,
    pub features: u64,
    pub enabled: bool,
}

const XSAVE_FXSAVE_ONLY: XsaveConfig = XsaveConfig {
    size: XSAVE_LEGACY_SIZE,
    features: XFEATURE_MASK_FPSSE,
    enabled: false,
};

static XSAVE: Once<XsaveConfig> = Once::new();

/// Records the xsave parameters the loader probed; call once at startup.
pub fn init_xsave(size: usize, features: u64, enabled: bool) {
    XSAVE.call_once(|| XsaveConfig {
        size,
        features,
        enabled,
    });
}

pub fn xsave_config() -> XsaveConfig {
    XSAVE.get().copied().unwrap_or(XSAVE_FXSAVE_ONLY)
}

/// Extended state loaded when an exception path has no saved state to
/// return to: x87 control word 0x37f, MXCSR 0x1f80, everything else clear.
#[repr(C, align(64))]
struct XsaveResetArea([u8; XSAVE_LEGACY_SIZE + XSAVE_HEADER_SIZE]);

const fn xsave_reset_bytes() -> [u8; XSAVE_LEGACY_SIZE + XSAVE_HEADER_SIZE] {
    let mut bytes = [0u8; XSAVE_LEGACY_SIZE + XSAVE_HEADER_SIZE];
    // cwd = 0x037f
    bytes[0] = 0x7f;
    bytes[1] = 0x03;
    // mxcsr = 0x1f80
    bytes[24] = 0x80;
    bytes[25] = 0x1f;
    bytes
}

static XSAVE_RESET_STATE: XsaveResetArea = XsaveResetArea(xsave_reset_bytes());

/// Segment selectors a 64-bit Linux process runs with: `__USER_CS` and
/// `__USER_DS` at RPL 3; fs/gs are zero in the frame (their bases live in
/// MSRs).
const USER_CS: u16 = 0x33;
const USER_SS: u16 = 0x2b;

const fn pack_csgsfs(cs: u16, gs: u16, fs: u16, ss: u16) -> u64 {
    cs as u64 | (gs as u64) << 16 | (fs as u64) << 32 | (ss as u64) << 48
}

/// The context shape the LibOS sees: an x86-64 `mcontext_t` register file
/// plus the extended-state pointer.
#[repr(C)]
#[derive(Debug)]
pub struct PalContext {
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rbp: u64,
    pub rbx: u64,
    pub rdx: u64,
    pub rax: u64,
    pub rcx: u64,
    pub rsp: u64,
    pub rip: u64,
    pub efl: u64,
    pub csgsfsss: u64,
    pub err: u64,
    pub trapno: u64,
    pub oldmask: u64,
    pub cr2: u64,
    pub fpregs: *mut XregsState,
    pub is_fpregs_used: u64,
}

/// Copies the hardware context into the signal-frame shape and stamps the
/// extended-state area with the format Linux sets up for signal frames.
pub fn save_pal_context(uc: &SgxCpuContext, xregs: *mut XregsState) -> PalContext {
    debug_assert!(!xregs.is_null());
    debug_assert!(xregs as usize % PAL_XSTATE_ALIGN == 0);

    let config = xsave_config();
    unsafe {
        let sw = &mut (*xregs).fpstate.sw_reserved;
        sw.magic1 = PAL_FP_XSTATE_MAGIC1;
        sw.extended_size = config.size as u32;
        sw.xfeatures = config.features;
        sw.padding = [0; 7];
        if config.enabled {
            sw.xstate_size = (config.size + PAL_FP_XSTATE_MAGIC2_SIZE) as u32;
            let magic2 = (xregs as *mut u8).add(config.size) as *mut u32;
            magic2.write_unaligned(PAL_FP_XSTATE_MAGIC2);
        } else {
            sw.xstate_size = config.size as u32;
        }
    }

    PalContext {
        r8: uc.r8,
        r9: uc.r9,
        r10: uc.r10,
        r11: uc.r11,
        r12: uc.r12,
        r13: uc.r13,
        r14: uc.r14,
        r15: uc.r15,
        rdi: uc.rdi,
        rsi: uc.rsi,
        rbp: uc.rbp,
        rbx: uc.rbx,
        rdx: uc.rdx,
        rax: uc.rax,
        rcx: uc.rcx,
        rsp: uc.rsp,
        rip: uc.rip,
        efl: uc.rflags,
        csgsfsss: pack_csgsfs(USER_CS, 0, 0, USER_SS),
        err: 0,
        trapno: 0,
        oldmask: 0,
        cr2: 0,
        fpregs: xregs,
        is_fpregs_used: 1,
    }
}

/// Writes the (possibly handler-modified) register file back into the
/// hardware context.
pub fn write_back_pal_context(uc: &mut SgxCpuContext, ctx: &PalContext) {
    uc.rax = ctx.rax;
    uc.rbx = ctx.rbx;
    uc.rcx = ctx.rcx;
    uc.rdx = ctx.rdx;
    uc.rsp = ctx.rsp;
    uc.rbp = ctx.rbp;
    uc.rsi = ctx.rsi;
    uc.rdi = ctx.rdi;
    uc.r8 = ctx.r8;
    uc.r9 = ctx.r9;
    uc.r10 = ctx.r10;
    uc.r11 = ctx.r11;
    uc.r12 = ctx.r12;
    uc.r13 = ctx.r13;
    uc.r14 = ctx.r14;
    uc.r15 = ctx.r15;
    uc.rflags = ctx.efl;
    uc.rip = ctx.rip;
}

#[cfg(target_arch = "x86_64")]
core::arch::global_asm!(
    r#"
    .text
    .align 16
    .global _restore_sgx_context
    .type _restore_sgx_context, @function
    // (rdi = SgxCpuContext*, rsi = XregsState*) Execution continues at the
    // rip stored in the context; never returns here.
_restore_sgx_context:
    // Extended state first, while rsi still holds its address.
    mov eax, -1
    mov edx, -1
    xrstor64 [rsi]

    mov rcx, [rdi + 0x08]
    mov rdx, [rdi + 0x10]
    mov rbx, [rdi + 0x18]
    mov rbp, [rdi + 0x28]
    mov rsi, [rdi + 0x30]
    mov r8,  [rdi + 0x40]
    mov r9,  [rdi + 0x48]
    mov r10, [rdi + 0x50]
    mov r11, [rdi + 0x58]
    mov r12, [rdi + 0x60]
    mov r13, [rdi + 0x68]
    mov r14, [rdi + 0x70]
    mov r15, [rdi + 0x78]

    // Switch to the interrupted stack; the two pushes below scratch its
    // red zone, which the AEX entry path left unused.
    mov rsp, [rdi + 0x20]
    push qword ptr [rdi + 0x88]
    push qword ptr [rdi + 0x80]
    mov rax, [rdi + 0x00]
    mov rdi, [rdi + 0x38]
    popfq
    ret
"#
);

#[cfg(target_arch = "x86_64")]
unsafe extern "C" {
    fn _restore_sgx_context(uc: *const SgxCpuContext, xregs: *const XregsState) -> !;
}

/// Resumes execution as specified by `uc`. A missing extended-state
/// pointer restores from the reset state.
///
/// # Safety
/// `uc` must describe a resumable enclave context and `xregs`, when
/// present, a well-formed extended-state area.
pub unsafe fn restore_sgx_context(uc: &SgxCpuContext, xregs: Option<*const XregsState>) -> ! {
    let xregs =
        xregs.unwrap_or(XSAVE_RESET_STATE.0.as_ptr() as *const XregsState);
    unsafe { _restore_sgx_context(uc, xregs) }
}

/// Writes the register file back and resumes from the marshalled context.
///
/// # Safety
/// See [`restore_sgx_context`].
pub unsafe fn restore_pal_context(uc: &mut SgxCpuContext, ctx: &PalContext) -> ! {
    write_back_pal_context(uc, ctx);
    let xregs = (ctx.is_fpregs_used != 0).then_some(ctx.fpregs as *const XregsState);
    unsafe { restore_sgx_context(uc, xregs) }
}
