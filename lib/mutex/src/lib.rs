#![cfg_attr(not(test), no_std)]

pub mod mutex;

pub use mutex::{MutexSupport, Spin, SpinLock, SpinMutex};
