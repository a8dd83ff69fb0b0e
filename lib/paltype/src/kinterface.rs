use crate_interface::def_interface;

use crate::error::PalResult;

/// Oracles the exception dispatcher consults when emulating disallowed
/// instructions. The CPUID/topology probe and the time source live outside
/// the core runtime; whichever layer owns them implements this interface.
#[def_interface]
pub trait PalPlatform {
    /// Returns the four CPUID words `[eax, ebx, ecx, edx]` for the given
    /// leaf/subleaf, from the in-enclave CPUID cache.
    fn cpuid(leaf: u32, subleaf: u32) -> PalResult<[u32; 4]>;

    /// Returns the current system time in microseconds.
    fn system_time_us() -> PalResult<u64>;
}
