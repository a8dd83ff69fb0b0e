pub mod spin_mutex;

pub use spin_mutex::SpinMutex;

pub type SpinLock<T> = SpinMutex<T, Spin>;

/// Low-level support for a mutex flavor.
///
/// Enclave threads have nothing to mask around a critical section (the
/// hardware already defers event delivery until after the AEX), so the only
/// flavor shipped here spins with backoff; a flavor that must run extra
/// code around the critical section supplies its own guard data.
pub trait MutexSupport {
    /// Guard data
    type GuardData;
    /// Called before lock() & try_lock()
    fn before_lock() -> Self::GuardData;
    /// Called when MutexGuard dropping
    fn after_unlock(_: &mut Self::GuardData);
}

/// Spin MutexSupport
#[derive(Debug)]
pub struct Spin;

impl MutexSupport for Spin {
    type GuardData = ();
    #[inline(always)]
    fn before_lock() -> Self::GuardData {}
    #[inline(always)]
    fn after_unlock(_: &mut Self::GuardData) {}
}
