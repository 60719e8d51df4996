// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: `log` backend writing single structured lines to a platform sink
//! OWNERS: @spm-team
//! PUBLIC API: install(sink, level), LOGGER, format_line
//! DEPENDS_ON: log, spin::Mutex
//! INVARIANTS: Debug/Trace only in debug builds; single-line emission; sink access serialised

use core::fmt::{self, Write};

use log::{LevelFilter, Log, Metadata, Record, SetLoggerError};
use spin::Mutex;

/// Platform byte sink (UART, semihosting, test buffer).
pub type Sink = dyn Write + Send;

/// Logger routing `log` records to the installed sink.
pub struct SinkLogger {
    sink: Mutex<Option<&'static mut Sink>>,
}

impl SinkLogger {
    const fn new() -> Self {
        Self { sink: Mutex::new(None) }
    }
}

/// The SPM's global logger.
pub static LOGGER: SinkLogger = SinkLogger::new();

/// Routes the `log` facade to `sink` at `level`. Fails if a logger is already installed.
pub fn install(sink: &'static mut Sink, level: LevelFilter) -> Result<(), SetLoggerError> {
    log::set_logger(&LOGGER)?;
    *LOGGER.sink.lock() = Some(sink);
    log::set_max_level(level);
    Ok(())
}

/// Writes `[LEVEL target] message\n`.
pub fn format_line<W: Write + ?Sized>(w: &mut W, record: &Record<'_>) -> fmt::Result {
    write!(w, "[{} {}] ", record.level(), record.target())?;
    w.write_fmt(*record.args())?;
    w.write_char('\n')
}

impl Log for SinkLogger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() <= log::Level::Info || cfg!(debug_assertions)
    }

    fn log(&self, record: &Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }
        if let Some(sink) = self.sink.lock().as_mut() {
            let _ = format_line(&mut **sink, record);
        }
    }

    fn flush(&self) {}
}
