//! Process logging
//!
//! A minimal [`log`] backend, installed once from [`crate::Engine::init`].
//! Kept deliberately simple: the fault handler only ever *emits* through
//! `log::error!` right before a fatal exit, it never configures or locks
//! anything here, so there is no signal-safety concern in the hot path.

use std::sync::Mutex;

use log::{Level, LevelFilter, Metadata, Record, SetLoggerError};

use mmiotrap_config::LOG_LEVEL_ENV;

struct EngineLogger {
    level: Mutex<LevelFilter>,
}

static LOGGER: EngineLogger = EngineLogger {
    level: Mutex::new(LevelFilter::Info),
};

impl log::Log for EngineLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= *self.level.lock().unwrap()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        match record.level() {
            Level::Error => eprintln!("\x1b[31m[mmiotrap] error: {}\x1b[0m", record.args()),
            Level::Warn => eprintln!("\x1b[33m[mmiotrap] warn: {}\x1b[0m", record.args()),
            Level::Info => println!("[mmiotrap] {}", record.args()),
            Level::Debug | Level::Trace => {
                println!("[mmiotrap] {}: {}", record.level(), record.args())
            }
        }
    }

    fn flush(&self) {}
}

/// Installs the global logger, reading the level from `MMIOTRAP_LOG`
/// (`trace`/`debug`/`info`/`warn`/`error`/`off`, default `info`).
///
/// Safe to call more than once; a second call is a no-op, matching the way
/// [`Engine::init`](crate::Engine::init) itself tolerates being the sole
/// initializer in a process that may already have installed a logger for
/// its own purposes.
pub fn init() {
    let level = std::env::var(LOG_LEVEL_ENV)
        .ok()
        .and_then(|s| s.parse::<LevelFilter>().ok())
        .unwrap_or(LevelFilter::Info);

    *LOGGER.level.lock().unwrap() = level;
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(level);
    }
}
