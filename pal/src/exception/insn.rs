//! Decoder for the instructions SGX forbids in an enclave.
//!
//! Running such an instruction raises #UD, and the dispatcher either
//! emulates it or propagates an ILLEGAL event. Only the opcode prefix is
//! inspected; anything unrecognized is `Unknown`.

/// Longest opcode pattern the decoder looks at.
pub const MAX_OPCODE_PEEK: usize = 5;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UdInstruction {
    /// `0F A2`: emulated from the CPUID oracle.
    Cpuid,
    /// `0F 31`: emulated from the time oracle.
    Rdtsc,
    /// `0F 01 F9`: RDTSC plus a dummy IA32_TSC_AUX.
    Rdtscp,
    /// `F3 REX.W 0F AE /0-3` with a register operand: {RD,WR}{FS,GS}BASE;
    /// disabled on this platform and never emulated.
    FsGsBase,
    /// `0F 05`: left to the LibOS syscall interception.
    Syscall,
    Unknown,
}

impl UdInstruction {
    pub fn decode(code: &[u8]) -> Self {
        match *code {
            [0x0f, 0xa2, ..] => Self::Cpuid,
            [0x0f, 0x31, ..] => Self::Rdtsc,
            [0x0f, 0x01, 0xf9, ..] => Self::Rdtscp,
            [0xf3, rex, 0x0f, 0xae, modrm, ..]
                if rex & !1 == 0x48 && modrm >> 6 == 0b11 && (modrm >> 3) & 0b111 < 4 =>
            {
                Self::FsGsBase
            }
            [0x0f, 0x05, ..] => Self::Syscall,
            _ => Self::Unknown,
        }
    }

    /// Opcode length to skip when the instruction was emulated.
    pub const fn emulated_len(self) -> u64 {
        match self {
            Self::Cpuid | Self::Rdtsc | Self::Syscall => 2,
            Self::Rdtscp => 3,
            Self::FsGsBase => 5,
            Self::Unknown => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_the_emulated_prefixes() {
        assert_eq!(UdInstruction::decode(&[0x0f, 0xa2]), UdInstruction::Cpuid);
        assert_eq!(UdInstruction::decode(&[0x0f, 0x31]), UdInstruction::Rdtsc);
        assert_eq!(
            UdInstruction::decode(&[0x0f, 0x01, 0xf9]),
            UdInstruction::Rdtscp
        );
        assert_eq!(UdInstruction::decode(&[0x0f, 0x05]), UdInstruction::Syscall);
    }

    #[test]
    fn decodes_fsgsbase_forms() {
        // wrfsbase rax / rdgsbase r9
        assert_eq!(
            UdInstruction::decode(&[0xf3, 0x48, 0x0f, 0xae, 0xd0]),
            UdInstruction::FsGsBase
        );
        assert_eq!(
            UdInstruction::decode(&[0xf3, 0x49, 0x0f, 0xae, 0xc9]),
            UdInstruction::FsGsBase
        );
        // A memory operand (mod != 11) is some other 0F AE instruction.
        assert_eq!(
            UdInstruction::decode(&[0xf3, 0x48, 0x0f, 0xae, 0x10]),
            UdInstruction::Unknown
        );
        // reg >= 4 selects a different opcode extension.
        assert_eq!(
            UdInstruction::decode(&[0xf3, 0x48, 0x0f, 0xae, 0xe8]),
            UdInstruction::Unknown
        );
    }

    #[test]
    fn unknown_bytes_decode_to_unknown() {
        assert_eq!(UdInstruction::decode(&[0x90, 0x90]), UdInstruction::Unknown);
        assert_eq!(UdInstruction::decode(&[0x0f]), UdInstruction::Unknown);
        assert_eq!(UdInstruction::decode(&[]), UdInstruction::Unknown);
    }
}
