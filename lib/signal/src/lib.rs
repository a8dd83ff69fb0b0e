//! Host signal numbers and set bits.
//!
//! Only the signals the untrusted runtime installs handlers for are
//! represented; everything else either never reaches the process (the
//! bridge leaves its disposition alone) or is emulated entirely inside the
//! LibOS and never exists as a host signal.

#![cfg_attr(not(test), no_std)]

use bitflags::bitflags;
use strum::FromRepr;

/// A signal the bridge handles, by Linux number.
#[derive(FromRepr, Clone, Copy, Debug, PartialEq, Eq)]
#[repr(i32)]
pub enum HostSignal {
    /// Illegal instruction, including AEX-reported #UD
    Ill = 4,
    /// Bad memory access through a valid mapping
    Bus = 7,
    /// Arithmetic fault
    Fpe = 8,
    /// Invalid memory reference
    Segv = 11,
    /// Reserved for breaking RPC helper threads out of blocking syscalls
    Usr2 = 12,
    /// Write to a pipe with no readers; the LibOS emulates this itself
    Pipe = 13,
    /// Termination request from the host
    Term = 15,
    /// Child state change; the LibOS emulates this itself
    Chld = 17,
    /// Continuation request from the host
    Cont = 18,
    /// Disallowed system call
    Sys = 31,
}

impl HostSignal {
    /// The Linux signal number.
    pub const fn number(self) -> i32 {
        self as i32
    }

    /// Looks up a signal delivered by the kernel; `None` for any number
    /// the bridge never installed a handler for.
    pub const fn from_number(number: i32) -> Option<Self> {
        Self::from_repr(number)
    }

    /// Faults attributable to the instruction that raised them, as opposed
    /// to requests that may arrive at any time.
    pub const fn is_fault(self) -> bool {
        matches!(
            self,
            Self::Ill | Self::Bus | Self::Fpe | Self::Segv | Self::Sys
        )
    }
}

bitflags! {
    /// Kernel sigset encoding: bit `n - 1` stands for signal number `n`.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct SigSet: u64 {
        const ILL  = 1 << 3;
        const BUS  = 1 << 6;
        const FPE  = 1 << 7;
        const SEGV = 1 << 10;
        const USR2 = 1 << 11;
        const PIPE = 1 << 12;
        const TERM = 1 << 14;
        const CHLD = 1 << 16;
        const CONT = 1 << 17;
        const SYS  = 1 << 30;
    }
}

impl From<HostSignal> for SigSet {
    fn from(sig: HostSignal) -> Self {
        SigSet::from_bits_retain(1 << (sig.number() - 1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_bits_follow_the_kernel_encoding() {
        assert_eq!(SigSet::from(HostSignal::Term), SigSet::TERM);
        assert_eq!(SigSet::from(HostSignal::Segv).bits(), 1 << 10);
        assert_eq!(SigSet::from(HostSignal::Sys).bits(), 1 << 30);
    }

    #[test]
    fn fault_partition() {
        assert!(HostSignal::Segv.is_fault());
        assert!(HostSignal::Sys.is_fault());
        assert!(!HostSignal::Term.is_fault());
        assert!(!HostSignal::Usr2.is_fault());
    }

    #[test]
    fn unhandled_numbers_resolve_to_none() {
        // KILL cannot be caught, USR1 is never installed.
        assert_eq!(HostSignal::from_number(9), None);
        assert_eq!(HostSignal::from_number(10), None);
        assert_eq!(HostSignal::from_number(11), Some(HostSignal::Segv));
    }
}
