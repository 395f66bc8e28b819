//! `log` backend that writes formatted records over serial.
//!
//! A level-tagged line-oriented sink; no per-module filtering since that
//! lives in the outer kernel's config, not in this crate's boot path.

use log::{Level, Log, Metadata, Record};

struct SerialLog;

static SERIAL_LOG: SerialLog = SerialLog;

/// Install the serial logger as the global `log` backend at `max_level`.
/// Call once during bootstrap, before anything calls `log::info!` and
/// friends. Calling it twice panics, matching `log::set_logger`.
pub fn init(max_level: log::LevelFilter) {
    log::set_logger(&SERIAL_LOG).expect("logger already installed");
    log::set_max_level(max_level);
}

impl Log for SerialLog {
    fn enabled(&self, _metadata: &Metadata) -> bool {
        true
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let level_tag = match record.level() {
            Level::Error => "ERROR",
            Level::Warn => "WARN ",
            Level::Info => "INFO ",
            Level::Debug => "DEBUG",
            Level::Trace => "TRACE",
        };
        crate::println!("[{}] {}", level_tag, record.args());
    }

    fn flush(&self) {}
}
