//! The untrusted half of the runtime: everything here executes outside the
//! enclave and is therefore not trusted by it. The enclave relies on this
//! code only for liveness: a malicious host can refuse service, but the
//! bridged events and streams never carry authority.

pub mod entry;
pub mod pipe;
pub mod rpc;
pub mod signal;
pub mod syscall;
pub mod tcb;
pub mod ucontext;

pub use rpc::register_rpc_thread;
pub use self::signal::{block_async_signals, sgx_signal_setup};
pub use tcb::{get_tcb_urts, set_tcb_urts, UrtsTcb};
