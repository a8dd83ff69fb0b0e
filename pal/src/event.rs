//! Counting-semaphore events over a PAL stream.
//!
//! An event is N zero bytes sitting in a pipe-like stream: `set(n)` writes
//! n bytes, each `wait` consumes one and blocks while the stream is empty.
//! Spending a byte per count is wasteful, but it makes events just another
//! readable stream, so the LibOS can wait on events and I/O handles with
//! one host polling primitive.

use config::host::EVENT_CLEAR_CHUNK;
use paltype::{PalError, PalResult};

use crate::host::pipe::HostPipe;

/// Byte transport under an [`Event`]. Production events ride on a host
/// pipe; tests substitute an in-memory stream.
pub trait EventStream {
    /// Writes from `buf`, returning how many bytes went through.
    fn write(&self, buf: &[u8]) -> PalResult<usize>;

    /// Reads into `buf`, blocking until at least one byte is available.
    fn read(&self, buf: &mut [u8]) -> PalResult<usize>;

    /// Whether a read would make progress. `timeout_us` of -1 blocks
    /// indefinitely, 0 polls.
    fn poll_readable(&self, timeout_us: i64) -> PalResult<bool>;
}

pub struct Event<S: EventStream> {
    stream: S,
}

/// The production event type; dropping it closes the stream.
pub type PalEventHandle = Event<HostPipe>;

/// Opens a new event over a fresh host stream.
pub fn create_event() -> PalResult<PalEventHandle> {
    Ok(Event::open(HostPipe::create()?))
}

impl<S: EventStream> Event<S> {
    pub fn open(stream: S) -> Self {
        Self { stream }
    }

    /// Increments the semaphore by `count`.
    ///
    /// Every byte written is one increment; a `set` that completed before a
    /// `wait` started is guaranteed to wake it (the stream delivers bytes
    /// in FIFO order). Blocks only while the stream is full.
    pub fn set(&self, count: usize) -> PalResult<()> {
        const ZEROS: [u8; 64] = [0; 64];

        let mut left = count;
        while left > 0 {
            let chunk = left.min(ZEROS.len());
            match self.stream.write(&ZEROS[..chunk]) {
                Ok(written) => left -= written,
                Err(PalError::Interrupted | PalError::TryAgain) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Decrements the semaphore by one, blocking while it is zero.
    pub fn wait(&self) -> PalResult<()> {
        let mut token = [0u8; 1];
        loop {
            match self.stream.read(&mut token) {
                Ok(0) => return Err(PalError::EndOfStream),
                Ok(_) => return Ok(()),
                Err(PalError::Interrupted | PalError::TryAgain) => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Drains the semaphore to zero.
    ///
    /// NOT atomic with concurrent `set`/`wait`: a count added while the
    /// drain loop runs may survive it. Callers that need a clean zero must
    /// exclude racing writers themselves.
    pub fn clear(&self) -> PalResult<()> {
        let mut drain = [0u8; EVENT_CLEAR_CHUNK];
        loop {
            match self.stream.poll_readable(0) {
                Ok(false) => break,
                Ok(true) => match self.stream.read(&mut drain) {
                    Ok(_) => continue,
                    // Readiness was spurious; the stream is empty.
                    Err(PalError::TryAgain) => break,
                    Err(PalError::Interrupted) => continue,
                    Err(e) => return Err(e),
                },
                Err(PalError::Interrupted | PalError::TryAgain) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}
