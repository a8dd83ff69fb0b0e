use strum::FromRepr;

/// Number of PAL event slots; valid events are `1..PAL_EVENT_NUM_BOUND`.
pub const PAL_EVENT_NUM_BOUND: usize = 8;

/// PAL event numbers.
///
/// The numeric codes cross the trust boundary: the untrusted bridge
/// injects them into the enclave on re-entry and the enclave dispatcher
/// indexes its upcall table with them. Do not renumber.
#[derive(FromRepr, Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u32)]
pub enum PalEvent {
    /// Divide-by-zero, x87 or SIMD floating-point fault
    ArithmeticError = 1,
    /// Memory fault (bad access or alignment check)
    MemFault = 2,
    /// Illegal or disallowed instruction
    Illegal = 3,
    /// Termination request from the host
    Quit = 4,
    /// Suspension request from the host
    Suspend = 5,
    /// A blocked host operation was interrupted
    Interrupted = 6,
    /// A PAL call failed asynchronously
    Failure = 7,
}

impl PalEvent {
    /// Returns the ABI event number.
    pub const fn code(self) -> u32 {
        self as u32
    }

    pub const fn from_u32(value: u32) -> Option<Self> {
        Self::from_repr(value)
    }

    /// Asynchronous events may arrive at any point, including while the
    /// thread executes trusted PAL code; everything else is a synchronous
    /// exception attributable to the faulting instruction.
    pub const fn is_async(self) -> bool {
        matches!(self, Self::Quit | Self::Interrupted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn abi_codes_are_stable() {
        assert_eq!(PalEvent::ArithmeticError.code(), 1);
        assert_eq!(PalEvent::MemFault.code(), 2);
        assert_eq!(PalEvent::Illegal.code(), 3);
        assert_eq!(PalEvent::Quit.code(), 4);
        assert_eq!(PalEvent::Suspend.code(), 5);
        assert_eq!(PalEvent::Interrupted.code(), 6);
        assert_eq!(PalEvent::Failure.code(), 7);
        assert_eq!(PAL_EVENT_NUM_BOUND, 8);
    }

    #[test]
    fn only_host_requests_are_async() {
        for raw in 1..PAL_EVENT_NUM_BOUND as u32 {
            let event = PalEvent::from_u32(raw).unwrap();
            assert_eq!(
                event.is_async(),
                matches!(event, PalEvent::Quit | PalEvent::Interrupted)
            );
        }
        assert_eq!(PalEvent::from_u32(0), None);
        assert_eq!(PalEvent::from_u32(8), None);
    }
}
