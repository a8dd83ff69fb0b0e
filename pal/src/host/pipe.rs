//! Host pipe used as the transport under an event.

use paltype::{PalError, PalResult};

use crate::event::EventStream;

use super::syscall::{self, PollFd, POLLIN};

const O_CLOEXEC: u32 = 0o2000000;

/// A pipe with both ends held by this process. The event layer writes
/// tokens into one end and reads them back from the other, which lets the
/// host poll events together with every other stream.
pub struct HostPipe {
    read_fd: i32,
    write_fd: i32,
}

impl HostPipe {
    pub fn create() -> PalResult<Self> {
        let mut fds = [0i32; 2];
        syscall::pipe2(&mut fds, O_CLOEXEC).map_err(PalError::from_unix)?;
        Ok(Self {
            read_fd: fds[0],
            write_fd: fds[1],
        })
    }
}

impl EventStream for HostPipe {
    fn write(&self, buf: &[u8]) -> PalResult<usize> {
        syscall::write(self.write_fd, buf).map_err(PalError::from_unix)
    }

    fn read(&self, buf: &mut [u8]) -> PalResult<usize> {
        syscall::read(self.read_fd, buf).map_err(PalError::from_unix)
    }

    fn poll_readable(&self, timeout_us: i64) -> PalResult<bool> {
        let mut fds = [PollFd {
            fd: self.read_fd,
            events: POLLIN,
            revents: 0,
        }];
        let ready = syscall::ppoll(&mut fds, timeout_us).map_err(PalError::from_unix)?;
        Ok(ready > 0 && fds[0].revents & POLLIN != 0)
    }
}

impl Drop for HostPipe {
    fn drop(&mut self) {
        syscall::close(self.read_fd).ok();
        syscall::close(self.write_fd).ok();
    }
}
