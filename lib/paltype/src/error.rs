use strum::FromRepr;

/// Type alias for result of PAL-level functions.
pub type PalResult<T> = Result<T, PalError>;

/// PAL error codes.
///
/// These are internal to the PAL and its direct callers; the LibOS maps
/// them to POSIX errnos at the syscall boundary. Functions report failure
/// as `-code` when crossing an FFI edge, hence the stable `i32` repr.
#[derive(FromRepr, Clone, Copy, Debug, Eq, PartialEq)]
#[repr(i32)]
pub enum PalError {
    /// Function not implemented
    NotImplemented = 1,
    /// Symbol not defined in the PAL
    NotDefined = 2,
    /// Operation not supported
    NotSupport = 3,
    /// Invalid argument
    Inval = 4,
    /// Name or path too long
    TooLong = 5,
    /// Operation denied
    Denied = 6,
    /// Bad handle
    BadHandle = 7,
    /// Stream already exists
    StreamExist = 8,
    /// Stream does not exist
    StreamNotExist = 9,
    /// Operation interrupted by a host signal
    Interrupted = 13,
    /// Value out of range
    Overflow = 14,
    /// Bad address
    BadAddr = 15,
    /// Out of memory
    NoMem = 16,
    /// Internal state is inconsistent
    Inconsist = 18,
    /// Try again
    TryAgain = 19,
    /// End of stream
    EndOfStream = 20,
    /// Connection failed
    ConnFailed = 23,
}

impl PalError {
    /// Returns the error description.
    pub const fn as_str(&self) -> &'static str {
        use self::PalError::*;
        match self {
            NotImplemented => "Function not implemented",
            NotDefined => "Symbol not defined in the PAL",
            NotSupport => "Operation not supported",
            Inval => "Invalid argument",
            TooLong => "Name or path too long",
            Denied => "Operation denied",
            BadHandle => "Bad handle",
            StreamExist => "Stream already exists",
            StreamNotExist => "Stream does not exist",
            Interrupted => "Operation interrupted by a host signal",
            Overflow => "Value out of range",
            BadAddr => "Bad address",
            NoMem => "Out of memory",
            Inconsist => "Internal state is inconsistent",
            TryAgain => "Try again",
            EndOfStream => "End of stream",
            ConnFailed => "Connection failed",
        }
    }

    /// Returns the error code value in `i32`.
    pub const fn code(self) -> i32 {
        self as i32
    }

    /// Maps a host (Linux) errno to a PAL error.
    ///
    /// The mapping covers the errnos the host syscall layer can surface;
    /// anything unrecognized collapses to [`PalError::Denied`].
    pub const fn from_unix(errno: i32) -> Self {
        match errno {
            2 | 3 | 6 => Self::StreamNotExist,   // ENOENT, ESRCH, ENXIO
            4 => Self::Interrupted,              // EINTR
            8 | 22 => Self::Inval,               // ENOEXEC, EINVAL
            9 => Self::BadHandle,                // EBADF
            11 => Self::TryAgain,                // EAGAIN / EWOULDBLOCK
            12 => Self::NoMem,                   // ENOMEM
            13 | 1 => Self::Denied,              // EACCES, EPERM
            14 => Self::BadAddr,                 // EFAULT
            17 => Self::StreamExist,             // EEXIST
            32 => Self::EndOfStream,             // EPIPE
            34 | 75 => Self::Overflow,           // ERANGE, EOVERFLOW
            36 => Self::TooLong,                 // ENAMETOOLONG
            38 => Self::NotImplemented,          // ENOSYS
            111 => Self::ConnFailed,             // ECONNREFUSED
            _ => Self::Denied,
        }
    }
}
