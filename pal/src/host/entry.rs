//! Enclave entry and exit trampolines.
//!
//! The asynchronous exit pointer (AEP) is the address the hardware returns
//! to on every AEX; executing its ENCLU resumes the enclave. A host signal
//! that finds a thread's instruction pointer inside
//! `[async_exit_pointer, async_exit_pointer_end)` therefore interrupted
//! enclave execution, and the bridge re-enters the enclave instead of
//! handling anything on the untrusted side.

#[cfg(target_arch = "x86_64")]
core::arch::global_asm!(
    r#"
    .text
    .align 16

    // AEP: the untrusted return point for every AEX. rbx/rcx still hold
    // the TCS and AEP, so a bare ENCLU[ERESUME] continues the enclave.
    .global async_exit_pointer
    .type async_exit_pointer, @function
async_exit_pointer:
    enclu

    .global async_exit_pointer_end
async_exit_pointer_end:

    // sgx_raise(event): re-enter the enclave so the trusted dispatcher
    // delivers `event`. rdi already carries the event number; EENTER takes
    // the TCS from this thread's control block.
    .global sgx_raise
    .type sgx_raise, @function
sgx_raise:
    mov rbx, qword ptr gs:[8]
    lea rcx, [rip + async_exit_pointer]
    mov rax, 2
    enclu

    // sgx_entry_return(retval, event): resume the enclave as if the
    // outstanding host call returned `retval`, with `event` pending.
    .global sgx_entry_return
    .type sgx_entry_return, @function
sgx_entry_return:
    mov rbx, qword ptr gs:[8]
    lea rcx, [rip + async_exit_pointer]
    mov rax, 2
    enclu
"#
);

#[cfg(target_arch = "x86_64")]
unsafe extern "C" {
    pub fn async_exit_pointer();
    pub fn async_exit_pointer_end();
    pub fn sgx_raise(event: u32);
    pub fn sgx_entry_return(retval: i64, event: u32) -> !;
}

/// The AEP trampoline's text range.
pub fn aep_range() -> (usize, usize) {
    (async_exit_pointer as usize, async_exit_pointer_end as usize)
}
