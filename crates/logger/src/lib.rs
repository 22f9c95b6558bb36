#![no_std]

use core::fmt;
use core::sync::atomic::{AtomicBool, Ordering};

use log::{LevelFilter, Metadata, Record};
use spin::Mutex;

/// Destination of formatted log lines.
pub type Sink = fn(fmt::Arguments);

static LOGGER: LockedLogger = LockedLogger(Mutex::new(Logger { sink: qemu::_print }));
static IS_INITIALIZED: AtomicBool = AtomicBool::new(false);

struct LockedLogger(Mutex<Logger>);

struct Logger {
    sink: Sink,
}

impl log::Log for LockedLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        self.0.lock().log(record)
    }

    fn flush(&self) {}
}

impl Logger {
    fn log(&self, record: &Record) {
        (self.sink)(core::format_args!(
            "[{} | {}] {}\n",
            record.level(),
            record.target(),
            record.args()
        ))
    }
}

/// Logs to the Qemu serial port.
pub fn init(level: LevelFilter) {
    init_with_sink(level, qemu::_print)
}

/// Logs to a custom sink, such as a platform console.
pub fn init_with_sink(level: LevelFilter, sink: Sink) {
    match IS_INITIALIZED.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst) {
        Ok(_) => {
            LOGGER.0.lock().sink = sink;
            if log::set_logger(&LOGGER).is_ok() {
                log::set_max_level(level);
            }
        }
        Err(_) => {
            log::warn!("Logger is already initialized, skipping init");
        }
    };
}
