//! The host kernel's x86-64 signal-frame layout.
//!
//! Signal handlers receive a pointer to this structure and may edit it;
//! whatever it holds when the handler returns is what `rt_sigreturn`
//! reloads into the thread.

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct SigaltStack {
    pub ss_sp: usize,
    pub ss_flags: i32,
    pub ss_size: usize,
}

/// `struct sigcontext` of the x86-64 kernel ABI.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct Sigcontext {
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
    pub eflags: u64,
    pub cs: u16,
    pub gs: u16,
    pub fs: u16,
    pub ss: u16,
    pub err: u64,
    pub trapno: u64,
    pub oldmask: u64,
    pub cr2: u64,
    pub fpstate: u64,
    _reserved: [u64; 8],
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct Ucontext {
    pub uc_flags: u64,
    pub uc_link: usize,
    pub uc_stack: SigaltStack,
    pub uc_mcontext: Sigcontext,
    pub uc_sigmask: u64,
}

impl Ucontext {
    pub fn ip(&self) -> u64 {
        self.uc_mcontext.rip
    }

    /// Rewrites the interrupted context so that, once the handler returns,
    /// the thread executes `func(arg0, arg1)` instead of resuming where it
    /// was.
    pub fn set_function_parameters(&mut self, func: usize, arg0: u64, arg1: u64) {
        self.uc_mcontext.rip = func as u64;
        self.uc_mcontext.rdi = arg0;
        self.uc_mcontext.rsi = arg1;
    }
}

/// `siginfo_t`; only the leading fields are interpreted here.
#[repr(C)]
pub struct HostSigInfo {
    pub si_signo: i32,
    pub si_errno: i32,
    pub si_code: i32,
    _fields: [u8; 116],
}
