//! PAL log sink.
//!
//! Records go to host stderr through the raw write syscall. The sink must
//! be usable from exception context, where allocating is off limits, so a
//! record is formatted into a fixed stack buffer (overlong lines are
//! truncated) and emitted with one write.

use core::fmt::{self, Write};

use log::{Level, LevelFilter};

use crate::host::syscall;

const HOST_STDERR: i32 = 2;

/// Longest emitted line, including the trailing newline.
const MAX_LOG_LINE: usize = 512;

/// One formatted record; whatever does not fit is dropped, the line is
/// never split across writes.
struct LineBuf {
    buf: [u8; MAX_LOG_LINE],
    len: usize,
}

impl LineBuf {
    const fn new() -> Self {
        Self {
            buf: [0; MAX_LOG_LINE],
            len: 0,
        }
    }

    /// Terminates the line and hands it to the host in a single write.
    fn emit(&mut self) {
        let end = self.len.min(MAX_LOG_LINE - 1);
        self.buf[end] = b'\n';
        syscall::write(HOST_STDERR, &self.buf[..end + 1]).ok();
    }
}

impl fmt::Write for LineBuf {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let room = (MAX_LOG_LINE - 1).saturating_sub(self.len);
        let take = s.len().min(room);
        self.buf[self.len..self.len + take].copy_from_slice(&s.as_bytes()[..take]);
        self.len += take;
        Ok(())
    }
}

const fn level_tag(level: Level) -> &'static str {
    match level {
        Level::Error => "error",
        Level::Warn => "warning",
        Level::Info => "info",
        Level::Debug => "debug",
        Level::Trace => "trace",
    }
}

struct PalLogger;

impl log::Log for PalLogger {
    fn enabled(&self, _metadata: &log::Metadata) -> bool {
        // Filtering happens through log::set_max_level.
        true
    }

    fn log(&self, record: &log::Record) {
        let mut line = LineBuf::new();
        write!(line, "(pal) {}: {}", level_tag(record.level()), record.args()).ok();
        line.emit();
    }

    fn flush(&self) {}
}

/// Installs the sink. The level comes from the manifest at load time; pass
/// [`LevelFilter::Warn`] when it names nothing.
pub fn init(level: LevelFilter) {
    static LOGGER: PalLogger = PalLogger;
    log::set_logger(&LOGGER).ok();
    log::set_max_level(level);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overlong_records_are_truncated_not_split() {
        let mut line = LineBuf::new();
        for _ in 0..MAX_LOG_LINE {
            write!(line, "xy").unwrap();
        }
        assert_eq!(line.len, MAX_LOG_LINE - 1);
        // The newline always fits.
        let end = line.len.min(MAX_LOG_LINE - 1);
        assert_eq!(end + 1, MAX_LOG_LINE);
    }

    #[test]
    fn short_records_keep_their_length() {
        let mut line = LineBuf::new();
        write!(line, "(pal) {}: ready", level_tag(Level::Info)).unwrap();
        assert_eq!(&line.buf[..line.len], &b"(pal) info: ready"[..]);
    }
}
