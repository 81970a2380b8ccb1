//! Logging - `log` Backend on Standard Error
//!
//! Records are written one line each, coloured by level, and tagged with
//! the name of the thread that produced them so bus-worker output can be
//! told apart from producers.

use std::io::Write;
use std::thread;

use log::{set_logger, set_max_level, Level, LevelFilter, Log, Metadata, Record, SetLoggerError};

pub struct Logger;

impl Logger {
    const fn color(level: Level) -> u8 {
        match level {
            Level::Error => 31, // Red
            Level::Warn => 93,  // BrightYellow
            Level::Info => 37,  // White
            Level::Debug => 32, // Green
            Level::Trace => 90, // BrightBlack
        }
    }
}

impl Log for Logger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let current = thread::current();
        let mut stderr = std::io::stderr().lock();
        // Nowhere left to report a failed log write
        let _ = writeln!(
            stderr,
            "\u{1B}[{}m[{:>5}] [{}] {}\u{1B}[0m",
            Self::color(record.level()),
            record.level(),
            current.name().unwrap_or("?"),
            record.args(),
        );
    }

    fn flush(&self) {
        let _ = std::io::stderr().flush();
    }
}

/// Install the logger; fails if another logger is already installed
pub fn init(level: LevelFilter) -> Result<(), SetLoggerError> {
    static LOGGER: Logger = Logger;
    set_logger(&LOGGER)?;
    set_max_level(level);
    Ok(())
}
