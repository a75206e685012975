//! `log` backend writing one line per record to a byte sink.
//!
//! The sink is a plain function so that the logger can live in a `static`
//! and be installed before anything else is up, typically a PL011 writer:
//!
//! ```ignore
//! static LOGGER: ConsoleLogger = ConsoleLogger::new(uart::write_bytes, LevelFilter::Info);
//! logger::init(&LOGGER)?;
//! ```

use core::fmt::{self, Write};

use log::{LevelFilter, Log, Metadata, Record, SetLoggerError};

/// Longest line emitted; longer messages are cut short.
pub const LINE_MAX: usize = 256;

pub type Sink = fn(&[u8]);

pub struct ConsoleLogger {
    sink: Sink,
    level: LevelFilter,
}

impl ConsoleLogger {
    pub const fn new(sink: Sink, level: LevelFilter) -> Self {
        Self { sink, level }
    }

    pub fn level(&self) -> LevelFilter {
        self.level
    }
}

impl Log for ConsoleLogger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let mut line = LineBuf::new();
        // A full buffer truncates; the line is still emitted.
        let _ = write!(
            line,
            "[FFA] {:<5} {}: {}",
            record.level(),
            record.target(),
            record.args()
        );
        (self.sink)(line.finish());
    }

    fn flush(&self) {}
}

/// Install `logger` as the global `log` backend.
pub fn init(logger: &'static ConsoleLogger) -> Result<(), SetLoggerError> {
    log::set_logger(logger)?;
    log::set_max_level(logger.level());
    Ok(())
}

struct LineBuf {
    buf: [u8; LINE_MAX],
    len: usize,
}

impl LineBuf {
    const fn new() -> Self {
        Self {
            buf: [0; LINE_MAX],
            len: 0,
        }
    }

    /// Terminate with a newline, overwriting the last byte if full.
    fn finish(&mut self) -> &[u8] {
        if self.len == LINE_MAX {
            self.len -= 1;
        }
        self.buf[self.len] = b'\n';
        self.len += 1;
        &self.buf[..self.len]
    }
}

impl Write for LineBuf {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let room = LINE_MAX - self.len;
        let n = s.len().min(room);
        self.buf[self.len..self.len + n].copy_from_slice(&s.as_bytes()[..n]);
        self.len += n;
        if n < s.len() {
            return Err(fmt::Error);
        }
        Ok(())
    }
}
